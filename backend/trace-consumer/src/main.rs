use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trace_consumer::config::Config;
use trace_consumer::error::AppError;
use trace_consumer::health::{self, HealthState};
use trace_consumer::services::{RetryPolicy, TraceConsumer, TraceDeduplicator, TraceRepository};

/// How many recently recorded trace ids seed the dedup set on startup
const DEDUP_SEED_LIMIT: i64 = 100;
/// Grace period for background tasks to drain during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trace_consumer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting trace consumer service");

    let config = Config::from_env().context("Failed to load configuration")?;

    let health = Arc::new(HealthState::new());
    let running = Arc::new(AtomicBool::new(true));

    // No ingestion is possible without the store, so a failed initial
    // connection is fatal. Kafka trouble is not: the consumer loop owns
    // its own reconnect policy.
    let repository = Arc::new(
        TraceRepository::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to database")?,
    );

    match repository.ping().await {
        Ok(()) => {
            info!("Database connection test successful");
            health.set_db_healthy(true);
        }
        Err(e) => {
            error!(error = %e, "Database connection test failed");
        }
    }

    let dedup = match repository.recent_trace_ids(DEDUP_SEED_LIMIT).await {
        Ok(ids) => {
            info!(count = ids.len(), "Loaded previously processed trace ids");
            TraceDeduplicator::with_seed(ids)
        }
        Err(e) => {
            error!(error = %e, "Failed to load processed trace ids, starting empty");
            TraceDeduplicator::new()
        }
    };

    // The health probe owns an independent connection so a slow probe and a
    // save in flight never block each other.
    let probe_repository = Arc::new(
        TraceRepository::connect(&config.database.url, 1)
            .await
            .context("Failed to create health probe connection")?,
    );

    let probe_handle = tokio::spawn(health::run_db_health_probe(
        Arc::clone(&probe_repository),
        Arc::clone(&health),
        Duration::from_secs(config.processing.health_check_interval_secs),
        Arc::clone(&running),
    ));

    let consumer = TraceConsumer::new(
        config.kafka.clone(),
        RetryPolicy::new(
            config.processing.max_retries,
            Duration::from_millis(config.processing.retry_backoff_ms),
        ),
        Arc::clone(&repository),
        dedup,
        Arc::clone(&health),
        Arc::clone(&running),
    );

    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!(error = %e, "Kafka consumer loop failed");
        }
    });

    let server_health = Arc::clone(&health);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(Arc::clone(&server_health)))
            .route("/healthz/live", web::get().to(health::liveness))
            .route("/healthz/ready", web::get().to(health::readiness))
    })
    .bind((config.server.host.as_str(), config.server.port))
    .context("Failed to bind health check server")?
    .run();

    info!(port = config.server.port, "Health check server started");

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Everything is initialized; let the orchestrator route traffic.
    health.set_ready(true);

    shutdown_signal().await?;

    info!("Starting graceful shutdown");
    running.store(false, Ordering::Relaxed);
    health.set_ready(false);

    let mut clean = true;

    match timeout(SHUTDOWN_GRACE, async {
        let consumer_res = consumer_handle.await;
        let probe_res = probe_handle.await;
        (consumer_res, probe_res)
    })
    .await
    {
        Ok((consumer_res, probe_res)) => {
            if let Err(e) = consumer_res {
                error!(error = %e, "Consumer task ended abnormally");
                clean = false;
            }
            if let Err(e) = probe_res {
                error!(error = %e, "Health probe task ended abnormally");
                clean = false;
            }
        }
        Err(_) => {
            error!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Background tasks did not stop within the grace period"
            );
            clean = false;
        }
    }

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Health check server error");
            clean = false;
        }
        Err(e) => {
            error!(error = %e, "Health check server task ended abnormally");
            clean = false;
        }
    }

    info!("Closing database connections");
    repository.close().await;
    probe_repository.close().await;

    if !clean {
        return Err(
            AppError::Shutdown("background tasks did not stop cleanly".to_string()).into(),
        );
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    Ok(())
}
