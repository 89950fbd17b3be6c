//! Duplicate-trace tracking and the bounded retry policy.
//!
//! The membership set is owned and mutated by the consumer loop alone, so it
//! needs no cross-task synchronization. It is seeded from the most recently
//! recorded trace ids at startup; the durable uniqueness check inside the
//! save transaction remains the authoritative guard, this set only avoids
//! pointless round-trips on redelivery.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Tracks trace ids that have already been processed
#[derive(Debug, Default)]
pub struct TraceDeduplicator {
    processed: HashSet<String>,
}

impl TraceDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the set from trace ids already recorded in the store
    pub fn with_seed(ids: Vec<String>) -> Self {
        Self {
            processed: ids.into_iter().collect(),
        }
    }

    pub fn is_processed(&self, trace_id: &str) -> bool {
        self.processed.contains(trace_id)
    }

    pub fn mark_processed(&mut self, trace_id: impl Into<String>) {
        self.processed.insert(trace_id.into());
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

/// Terminal result of a bounded-retry attempt
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// Every attempt failed; carries the last error for observability
    Failure(AppError),
}

/// Bounded retry with a flat delay between attempts.
///
/// Distinct from the consumer's reconnect backoff: this one never grows its
/// delay and gives up after `max_retries + 1` invocations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Invoke `op` until it reports success or the retry budget is spent.
    ///
    /// An `Err` or an `Ok(false)` both count as a failed attempt.
    pub async fn attempt<F, Fut>(&self, mut op: F) -> Outcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                info!(
                    attempt,
                    backoff_ms = self.backoff.as_millis() as u64,
                    "Retrying message processing"
                );
                tokio::time::sleep(self.backoff).await;
            }

            match op().await {
                Ok(true) => return Outcome::Success,
                Ok(false) => {
                    warn!(attempt, "Handler reported failure");
                    last_error = Some(AppError::Handler("handler returned false".to_string()));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Error processing message");
                    last_error = Some(e);
                }
            }
        }

        Outcome::Failure(
            last_error.unwrap_or_else(|| AppError::Handler("no attempts were made".to_string())),
        )
    }
}
