//! Message and database models for processed trace surveys.
//!
//! Wire models mirror the JSON published on the trace topic (camelCase
//! fields, RFC 3339 timestamps). Timestamps are parsed strictly: a trailing
//! `Z` or an explicit numeric offset is accepted, anything else is a decode
//! failure. Db* models are the relational projections read back from
//! PostgreSQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, Result};

/// A message received from the trace survey topic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceProcessedMessage {
    /// Unique trace identifier, used as the idempotency key
    pub trace_id: String,
    pub course: Course,
    pub instructor: Instructor,
    pub ratings: Vec<Rating>,
    pub comments: Vec<Comment>,
    pub processed_at: DateTime<Utc>,
    /// Set when the upstream producer already flagged this trace as failed
    #[serde(default)]
    pub error: Option<String>,
}

impl TraceProcessedMessage {
    /// Validate the decoded message before any persistence is attempted
    pub fn validate(&self) -> Result<()> {
        if self.trace_id.is_empty() {
            return Err(AppError::Validation("Trace ID is empty".to_string()));
        }
        Ok(())
    }
}

/// A course section from a trace survey
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub course_id: String,
    pub course_name: String,
    pub subject: String,
    pub catalog_section: String,
    pub semester: String,
    pub year: i32,
    pub enrollment: i32,
    pub responses: i32,
    pub declines: i32,
    pub processed_at: DateTime<Utc>,
    pub original_file_name: String,
    pub gcs_bucket: String,
    pub gcs_path: String,
}

/// An instructor from a trace survey
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instructor {
    pub name: String,
}

/// A rating question and its aggregated responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub question_text: String,
    pub category: String,
    pub responses: i32,
    pub response_rate: f64,
    pub course_mean: f64,
    pub dept_mean: f64,
    pub univ_mean: f64,
    pub course_median: f64,
    pub dept_median: f64,
    pub univ_median: f64,
}

/// A free-text student comment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub category: String,
    pub question_text: String,
    pub response_number: i32,
    pub comment_text: String,
}

/// A course row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DbCourse {
    pub id: i64,
    pub course_id: String,
    pub course_name: String,
    pub subject: String,
    pub catalog_section: String,
    pub semester: String,
    pub year: i32,
    pub enrollment: i32,
    pub responses: i32,
    pub declines: i32,
    pub processed_at: DateTime<Utc>,
    pub original_file_name: String,
    pub gcs_bucket: String,
    pub gcs_path: String,
    pub created_at: DateTime<Utc>,
}

/// An instructor row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DbInstructor {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A rating row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DbRating {
    pub id: i64,
    pub course_id: i64,
    pub question_text: String,
    pub category: String,
    pub responses: i32,
    pub response_rate: f64,
    pub course_mean: f64,
    pub dept_mean: f64,
    pub univ_mean: f64,
    pub course_median: f64,
    pub dept_median: f64,
    pub univ_median: f64,
    pub created_at: DateTime<Utc>,
}

/// A comment row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DbComment {
    pub id: i64,
    pub course_id: i64,
    pub category: String,
    pub question_text: String,
    pub response_number: i32,
    pub comment_text: String,
    pub created_at: DateTime<Utc>,
}

/// A processed trace record as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DbProcessedTrace {
    pub id: i64,
    pub trace_id: String,
    pub course_id: i64,
    pub processed_at: DateTime<Utc>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "traceId": "T1",
            "course": {
                "courseId": "CS101",
                "courseName": "Intro to Computer Science",
                "subject": "CS",
                "catalogSection": "01",
                "semester": "FA24",
                "year": 2024,
                "enrollment": 120,
                "responses": 85,
                "declines": 5,
                "processedAt": "2024-09-01T00:00:00Z",
                "originalFileName": "cs101_fa24.pdf",
                "gcsBucket": "trace-uploads",
                "gcsPath": "surveys/cs101_fa24.pdf"
            },
            "instructor": {"name": "A. Smith"},
            "ratings": [
                {
                    "questionText": "Overall rating of the course",
                    "category": "Course",
                    "responses": 85,
                    "responseRate": 0.71,
                    "courseMean": 4.2,
                    "deptMean": 4.0,
                    "univMean": 3.9,
                    "courseMedian": 4.0,
                    "deptMedian": 4.0,
                    "univMedian": 4.0
                }
            ],
            "comments": [
                {
                    "category": "Course",
                    "questionText": "What did you like best?",
                    "responseNumber": 1,
                    "commentText": "Great lectures"
                }
            ],
            "processedAt": "2024-09-01T00:00:00Z"
        }"#
        .to_string()
    }

    #[test]
    fn decodes_full_message() {
        let message: TraceProcessedMessage = serde_json::from_str(&sample_json()).unwrap();

        assert_eq!(message.trace_id, "T1");
        assert_eq!(message.course.course_id, "CS101");
        assert_eq!(message.course.year, 2024);
        assert_eq!(message.instructor.name, "A. Smith");
        assert_eq!(message.ratings.len(), 1);
        assert_eq!(message.comments.len(), 1);
        assert!(message.error.is_none());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn accepts_numeric_offset_timestamps() {
        let json = sample_json().replace("2024-09-01T00:00:00Z", "2024-09-01T00:00:00+05:00");
        let message: TraceProcessedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            message.processed_at,
            "2024-08-31T19:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn rejects_timestamp_without_offset() {
        let json = sample_json().replace("2024-09-01T00:00:00Z", "2024-09-01 00:00:00");
        assert!(serde_json::from_str::<TraceProcessedMessage>(&json).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(serde_json::from_str::<TraceProcessedMessage>("{not json").is_err());
    }

    #[test]
    fn rejects_missing_course() {
        let json = r#"{"traceId": "T1", "processedAt": "2024-09-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<TraceProcessedMessage>(json).is_err());
    }

    #[test]
    fn decodes_upstream_error_field() {
        let json = sample_json().replace(
            "\"processedAt\": \"2024-09-01T00:00:00Z\"\n        }",
            "\"processedAt\": \"2024-09-01T00:00:00Z\", \"error\": \"parse failure\"}",
        );
        let message: TraceProcessedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message.error.as_deref(), Some("parse failure"));
    }

    #[test]
    fn empty_trace_id_fails_validation() {
        let json = sample_json().replace("\"traceId\": \"T1\"", "\"traceId\": \"\"");
        let message: TraceProcessedMessage = serde_json::from_str(&json).unwrap();
        assert!(message.validate().is_err());
    }
}
