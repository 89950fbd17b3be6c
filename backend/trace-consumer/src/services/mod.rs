pub mod consumer;
pub mod dedup;
pub mod repository;

pub use consumer::TraceConsumer;
pub use dedup::{Outcome, RetryPolicy, TraceDeduplicator};
pub use repository::TraceRepository;
