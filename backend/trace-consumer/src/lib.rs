//! Trace survey ingestion service.
//!
//! Consumes processed trace-survey messages from Kafka, persists each one
//! idempotently into PostgreSQL, and exposes liveness/readiness probes for
//! the orchestrator.

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod services;
