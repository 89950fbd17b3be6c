//! PostgreSQL persistence for processed trace surveys.
//!
//! All rows for one trace are written in a single transaction. A trace whose
//! `trace_id` is already recorded in `processed_traces` is a no-op that still
//! reports success, so redelivered messages never duplicate data.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::TraceProcessedMessage;

pub struct TraceRepository {
    pool: PgPool,
}

impl TraceRepository {
    /// Connect to PostgreSQL, establishing at least one connection eagerly.
    ///
    /// Startup calls this twice: once for the ingestion pool and once for a
    /// single-connection pool owned by the health prober, so a slow probe
    /// never contends with a save in flight.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Test the connection with a lightweight query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Probe the connection before a save; one failed probe gets a single
    /// retry so the pool can re-establish a dropped connection.
    async fn ensure_connection(&self) -> Result<()> {
        if self.ping().await.is_ok() {
            return Ok(());
        }
        warn!("Database connection lost, attempting to reconnect");
        self.ping().await
    }

    /// Trace ids most recently recorded, newest first, bounded by `limit`.
    ///
    /// Used to seed the in-memory deduplication set after a restart.
    pub async fn recent_trace_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT trace_id FROM processed_traces
             ORDER BY processed_at DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Persist every entity of one processed trace atomically.
    ///
    /// Returns `Ok(true)` on success or when the trace was already recorded.
    /// Any error aborts the transaction without partial writes and is
    /// retryable by the caller.
    pub async fn save_trace(&self, message: &TraceProcessedMessage) -> Result<bool> {
        self.ensure_connection().await?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM processed_traces WHERE trace_id = $1")
                .bind(&message.trace_id)
                .fetch_optional(tx.as_mut())
                .await?;

        if existing.is_some() {
            info!(trace_id = %message.trace_id, "Trace already recorded, skipping");
            return Ok(true);
        }

        let instructor_id = self.upsert_instructor(&mut tx, message).await?;
        let course_id = self.upsert_course(&mut tx, message).await?;

        sqlx::query(
            "INSERT INTO course_instructors (course_id, instructor_id)
             VALUES ($1, $2)
             ON CONFLICT (course_id, instructor_id) DO NOTHING",
        )
        .bind(course_id)
        .bind(instructor_id)
        .execute(tx.as_mut())
        .await?;

        for rating in &message.ratings {
            sqlx::query(
                "INSERT INTO ratings
                 (course_id, question_text, category, responses, response_rate,
                  course_mean, dept_mean, univ_mean, course_median, dept_median, univ_median)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(course_id)
            .bind(&rating.question_text)
            .bind(&rating.category)
            .bind(rating.responses)
            .bind(rating.response_rate)
            .bind(rating.course_mean)
            .bind(rating.dept_mean)
            .bind(rating.univ_mean)
            .bind(rating.course_median)
            .bind(rating.dept_median)
            .bind(rating.univ_median)
            .execute(tx.as_mut())
            .await?;
        }

        for comment in &message.comments {
            sqlx::query(
                "INSERT INTO comments
                 (course_id, category, question_text, response_number, comment_text)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(course_id)
            .bind(&comment.category)
            .bind(&comment.question_text)
            .bind(comment.response_number)
            .bind(&comment.comment_text)
            .execute(tx.as_mut())
            .await?;
        }

        let status = if message.error.is_some() { "error" } else { "success" };
        sqlx::query(
            "INSERT INTO processed_traces
             (trace_id, course_id, processed_at, status, error_message)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&message.trace_id)
        .bind(course_id)
        .bind(message.processed_at)
        .bind(status)
        .bind(&message.error)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        info!(trace_id = %message.trace_id, "Saved trace to database");
        Ok(true)
    }

    async fn upsert_instructor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &TraceProcessedMessage,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO instructors (name)
             VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id",
        )
        .bind(&message.instructor.name)
        .fetch_one(tx.as_mut())
        .await?;

        Ok(id)
    }

    /// Insert the course, or update its descriptive fields when the
    /// (course_id, semester, year) key already exists. The row id is stable
    /// across re-ingestions.
    async fn upsert_course(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &TraceProcessedMessage,
    ) -> Result<i64> {
        let course = &message.course;
        let id = sqlx::query_scalar(
            "INSERT INTO courses
             (course_id, course_name, subject, catalog_section, semester, year,
              enrollment, responses, declines, processed_at, original_file_name,
              gcs_bucket, gcs_path)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (course_id, semester, year)
             DO UPDATE SET
                 course_name = EXCLUDED.course_name,
                 subject = EXCLUDED.subject,
                 catalog_section = EXCLUDED.catalog_section,
                 enrollment = EXCLUDED.enrollment,
                 responses = EXCLUDED.responses,
                 declines = EXCLUDED.declines,
                 processed_at = EXCLUDED.processed_at,
                 original_file_name = EXCLUDED.original_file_name,
                 gcs_bucket = EXCLUDED.gcs_bucket,
                 gcs_path = EXCLUDED.gcs_path
             RETURNING id",
        )
        .bind(&course.course_id)
        .bind(&course.course_name)
        .bind(&course.subject)
        .bind(&course.catalog_section)
        .bind(&course.semester)
        .bind(course.year)
        .bind(course.enrollment)
        .bind(course.responses)
        .bind(course.declines)
        .bind(course.processed_at)
        .bind(&course.original_file_name)
        .bind(&course.gcs_bucket)
        .bind(&course.gcs_path)
        .fetch_one(tx.as_mut())
        .await?;

        Ok(id)
    }

    /// Close the underlying pool, waiting for checked-out connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
