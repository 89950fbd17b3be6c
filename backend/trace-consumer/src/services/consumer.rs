//! Kafka consumption loop for processed trace surveys.
//!
//! Offsets are committed manually, once per message, whatever the outcome:
//! success, duplicate, decode failure, or exhausted retries. Committing the
//! failures too keeps the partition moving during redelivery storms; the
//! failures themselves are surfaced through logs.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::Result;
use crate::health::HealthState;
use crate::models::TraceProcessedMessage;
use crate::services::dedup::{Outcome, RetryPolicy, TraceDeduplicator};
use crate::services::repository::TraceRepository;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 15;
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(30);

/// Next move after a consumer-level poll error
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Rebuild the connection, then sleep this long
    Reconnect(Duration),
    /// Attempt budget spent: sleep this long, counters are already reset
    Cooldown(Duration),
}

/// Reconnect schedule for consecutive poll failures.
///
/// The delay starts at 0.5s and doubles per failure up to a 10s ceiling.
/// After 15 consecutive failures the schedule yields one flat 30s cooldown
/// and starts over. Any successful poll resets it.
#[derive(Debug)]
pub struct ReconnectBackoff {
    attempts: u32,
    delay: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            delay: INITIAL_RECONNECT_DELAY,
        }
    }

    /// Register one more consecutive failure and return what to do next
    pub fn next_failure(&mut self) -> ReconnectStep {
        if self.attempts >= MAX_RECONNECT_ATTEMPTS {
            self.reset();
            return ReconnectStep::Cooldown(RECONNECT_COOLDOWN);
        }

        self.attempts += 1;
        let delay = self.delay;
        self.delay = std::cmp::min(self.delay * 2, MAX_RECONNECT_DELAY);
        ReconnectStep::Reconnect(delay)
    }

    /// Back to the initial state after a successful poll
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = INITIAL_RECONNECT_DELAY;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Consumes trace survey messages and drives them through deduplication,
/// bounded-retry persistence, and offset commits.
pub struct TraceConsumer {
    kafka: KafkaConfig,
    policy: RetryPolicy,
    repository: Arc<TraceRepository>,
    dedup: TraceDeduplicator,
    health: Arc<HealthState>,
    running: Arc<AtomicBool>,
}

impl TraceConsumer {
    pub fn new(
        kafka: KafkaConfig,
        policy: RetryPolicy,
        repository: Arc<TraceRepository>,
        dedup: TraceDeduplicator,
        health: Arc<HealthState>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kafka,
            policy,
            repository,
            dedup,
            health,
            running,
        }
    }

    fn create_consumer(&self) -> Result<StreamConsumer> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.kafka.bootstrap_servers())
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "180000")
            .set("max.poll.interval.ms", "300000");

        if self.kafka.group_id.is_empty() {
            config.set("auto.offset.reset", "latest");
        } else {
            config
                .set("group.id", &self.kafka.group_id)
                .set("auto.offset.reset", "earliest");
        }

        if self.kafka.auth_enabled() {
            info!(username = %self.kafka.username, "Enabling SASL PLAIN authentication");
            config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", &self.kafka.username)
                .set("sasl.password", &self.kafka.password);
        }

        let consumer: StreamConsumer = config.create()?;
        consumer.subscribe(&[self.kafka.topic.as_str()])?;

        info!(
            topic = %self.kafka.topic,
            group = %self.kafka.group_id,
            brokers = %self.kafka.bootstrap_servers(),
            "Subscribed to Kafka topic"
        );
        Ok(consumer)
    }

    /// Run the consumption loop until the shutdown flag flips.
    ///
    /// This is a long-running task and should be spawned on the runtime.
    pub async fn run(mut self) -> Result<()> {
        let mut consumer = self.create_consumer()?;
        self.health.set_kafka_healthy(true);

        let mut backoff = ReconnectBackoff::new();

        while self.running.load(Ordering::Relaxed) {
            let received = match timeout(POLL_TIMEOUT, consumer.recv()).await {
                // poll timeout: nothing to read, re-check the shutdown flag
                Err(_) => continue,
                Ok(received) => received,
            };

            match received {
                Ok(msg) => {
                    backoff.reset();
                    self.handle_message(&consumer, &msg).await;
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    debug!(partition, "Reached end of partition");
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    match backoff.next_failure() {
                        ReconnectStep::Reconnect(delay) => {
                            warn!(
                                attempt = backoff.attempts(),
                                delay_ms = delay.as_millis() as u64,
                                "Reconnecting Kafka consumer"
                            );
                            match self.create_consumer() {
                                Ok(rebuilt) => consumer = rebuilt,
                                Err(e) => {
                                    error!(error = %e, "Failed to recreate Kafka consumer")
                                }
                            }
                            tokio::time::sleep(delay).await;
                        }
                        ReconnectStep::Cooldown(delay) => {
                            error!(
                                cooldown_secs = delay.as_secs(),
                                "Maximum reconnect attempts reached, cooling down"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        info!("Kafka consumer loop stopped");
        Ok(())
    }

    async fn handle_message(&mut self, consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
        let payload = msg.payload().unwrap_or_default();
        debug!(
            topic = msg.topic(),
            partition = msg.partition(),
            offset = msg.offset(),
            length = payload.len(),
            "Received message"
        );

        if payload.is_empty() {
            warn!(offset = msg.offset(), "Message has no payload, skipping");
            self.commit(consumer, msg);
            return;
        }

        let message = match decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(offset = msg.offset(), error = %e, "Dropping undecodable message");
                self.commit(consumer, msg);
                return;
            }
        };

        if self.dedup.is_processed(&message.trace_id) {
            info!(trace_id = %message.trace_id, "Trace already processed, skipping");
            self.commit(consumer, msg);
            return;
        }

        let repository = &self.repository;
        let outcome = self.policy.attempt(|| repository.save_trace(&message)).await;

        match outcome {
            Outcome::Success => {
                self.dedup.mark_processed(message.trace_id.clone());
                info!(trace_id = %message.trace_id, "Successfully processed message");
            }
            Outcome::Failure(e) => {
                error!(
                    trace_id = %message.trace_id,
                    error = %e,
                    "Failed to process message after max retries"
                );
            }
        }

        debug!(offset = msg.offset(), "Committing message");
        self.commit(consumer, msg);
    }

    fn commit(&self, consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
        if let Err(e) = consumer.commit_message(msg, CommitMode::Sync) {
            warn!(
                offset = msg.offset(),
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
}

/// Decode and validate one payload; no persistence is attempted on failure
fn decode_message(payload: &[u8]) -> Result<TraceProcessedMessage> {
    let message: TraceProcessedMessage = serde_json::from_slice(payload)?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_payload_is_a_decode_failure() {
        assert!(decode_message(b"{not json").is_err());
    }

    #[test]
    fn empty_trace_id_is_a_decode_failure() {
        let json = br#"{
            "traceId": "",
            "course": {
                "courseId": "CS101", "courseName": "Intro", "subject": "CS",
                "catalogSection": "01", "semester": "FA24", "year": 2024,
                "enrollment": 120, "responses": 85, "declines": 5,
                "processedAt": "2024-09-01T00:00:00Z",
                "originalFileName": "cs101.pdf", "gcsBucket": "b", "gcsPath": "p"
            },
            "instructor": {"name": "A. Smith"},
            "ratings": [],
            "comments": [],
            "processedAt": "2024-09-01T00:00:00Z"
        }"#;
        assert!(decode_message(json).is_err());
    }

    fn expect_reconnect(step: ReconnectStep) -> Duration {
        match step {
            ReconnectStep::Reconnect(delay) => delay,
            ReconnectStep::Cooldown(_) => panic!("expected reconnect, got cooldown"),
        }
    }

    #[test]
    fn delay_doubles_up_to_ceiling() {
        let mut backoff = ReconnectBackoff::new();

        let delays: Vec<u64> = (0..7)
            .map(|_| expect_reconnect(backoff.next_failure()).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn successful_poll_resets_schedule() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..5 {
            backoff.next_failure();
        }

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            expect_reconnect(backoff.next_failure()),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn cooldown_after_attempt_budget_is_spent() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..15 {
            expect_reconnect(backoff.next_failure());
        }

        // 16th consecutive failure trips the cooldown and resets the schedule
        assert_eq!(
            backoff.next_failure(),
            ReconnectStep::Cooldown(Duration::from_secs(30))
        );
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            expect_reconnect(backoff.next_failure()),
            Duration::from_millis(500)
        );
    }
}
