//! Health state shared between the background loops and the probe server.
//!
//! Three flags, each written by exactly one task and read lock-free by the
//! HTTP handlers: `app_ready` (startup wiring), `db_healthy` (store prober),
//! `kafka_healthy` (consumer, set once on the initial subscribe). Liveness
//! is unconditional; readiness requires all three.

use actix_web::{web, HttpResponse, Responder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::services::repository::TraceRepository;

const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_SLEEP_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct HealthState {
    app_ready: AtomicBool,
    db_healthy: AtomicBool,
    kafka_healthy: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        if self.app_ready.swap(ready, Ordering::Relaxed) != ready {
            info!(ready, "Application readiness changed");
        }
    }

    pub fn set_db_healthy(&self, healthy: bool) {
        if self.db_healthy.swap(healthy, Ordering::Relaxed) != healthy {
            info!(healthy, "Database health changed");
        }
    }

    pub fn set_kafka_healthy(&self, healthy: bool) {
        if self.kafka_healthy.swap(healthy, Ordering::Relaxed) != healthy {
            info!(healthy, "Kafka health changed");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.failing_subsystems().is_empty()
    }

    /// Names of the subsystems currently reporting unhealthy
    pub fn failing_subsystems(&self) -> Vec<&'static str> {
        let mut failing = Vec::new();
        if !self.app_ready.load(Ordering::Relaxed) {
            failing.push("Application not ready");
        }
        if !self.db_healthy.load(Ordering::Relaxed) {
            failing.push("Database not healthy");
        }
        if !self.kafka_healthy.load(Ordering::Relaxed) {
            failing.push("Kafka not healthy");
        }
        failing
    }
}

/// Liveness probe: the process is running, nothing else is checked
pub async fn liveness() -> impl Responder {
    HttpResponse::Ok().content_type("text/plain").body("OK")
}

/// Readiness probe: 200 only when every subsystem reports healthy,
/// otherwise 503 with the failing subsystems listed in the body
pub async fn readiness(health: web::Data<HealthState>) -> HttpResponse {
    let failing = health.failing_subsystems();
    if failing.is_empty() {
        HttpResponse::Ok().content_type("text/plain").body("Ready")
    } else {
        HttpResponse::ServiceUnavailable()
            .content_type("text/plain")
            .body(format!("Not Ready: {}", failing.join(", ")))
    }
}

/// Periodically ping the store on its own connection and refresh the
/// `db_healthy` flag. After a failed probe the next one runs sooner
/// (half the interval, floored at 5s) to recover the flag faster.
pub async fn run_db_health_probe(
    repository: Arc<TraceRepository>,
    health: Arc<HealthState>,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    info!(interval_secs = interval.as_secs(), "Database health probe started");

    while running.load(Ordering::Relaxed) {
        let sleep_for = match repository.ping().await {
            Ok(()) => {
                health.set_db_healthy(true);
                interval
            }
            Err(e) => {
                error!(error = %e, "Database health check failed");
                health.set_db_healthy(false);
                std::cmp::max(MIN_PROBE_INTERVAL, interval / 2)
            }
        };

        // sleep in short ticks so shutdown is observed promptly
        let mut slept = Duration::ZERO;
        while running.load(Ordering::Relaxed) && slept < sleep_for {
            tokio::time::sleep(PROBE_SLEEP_TICK).await;
            slept += PROBE_SLEEP_TICK;
        }
    }

    info!("Database health probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    fn state_with(ready: bool, db: bool, kafka: bool) -> HealthState {
        let state = HealthState::new();
        state.set_ready(ready);
        state.set_db_healthy(db);
        state.set_kafka_healthy(kafka);
        state
    }

    #[::core::prelude::v1::test]
    fn readiness_requires_all_three_flags() {
        for bits in 0..8u8 {
            let ready = bits & 1 != 0;
            let db = bits & 2 != 0;
            let kafka = bits & 4 != 0;

            let state = state_with(ready, db, kafka);
            assert_eq!(state.is_ready(), ready && db && kafka, "flags {bits:#05b}");
        }
    }

    #[::core::prelude::v1::test]
    fn failing_subsystems_are_named_exactly() {
        let state = state_with(true, false, false);
        assert_eq!(
            state.failing_subsystems(),
            vec!["Database not healthy", "Kafka not healthy"]
        );

        let state = state_with(false, true, true);
        assert_eq!(state.failing_subsystems(), vec!["Application not ready"]);

        let state = state_with(true, true, true);
        assert!(state.failing_subsystems().is_empty());
    }

    #[actix_web::test]
    async fn liveness_is_unconditional() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(false, false, false)))
                .route("/healthz/live", web::get().to(liveness)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/healthz/live").to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn readiness_endpoint_reports_failing_subsystems() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(true, true, false)))
                .route("/healthz/ready", web::get().to(readiness)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/healthz/ready").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 503);

        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"Not Ready: Kafka not healthy");
    }

    #[actix_web::test]
    async fn readiness_endpoint_reports_ready() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(true, true, true)))
                .route("/healthz/ready", web::get().to(readiness)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/healthz/ready").to_request(),
        )
        .await;
        assert!(resp.status().is_success());

        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"Ready");
    }
}
