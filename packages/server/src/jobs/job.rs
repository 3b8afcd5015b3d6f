//! Job model for background execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Cancelling,
}

impl JobStatus {
    /// Terminal states admit no further transitions except delete.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scrape,
    Crawl,
    Extract,
    Report,
    Dedup,
}

impl JobType {
    /// Every claimable type, for scheduler loop setup.
    pub fn all() -> [JobType; 5] {
        [
            JobType::Scrape,
            JobType::Crawl,
            JobType::Extract,
            JobType::Report,
            JobType::Dedup,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scrape => "scrape",
            JobType::Crawl => "crawl",
            JobType::Extract => "extract",
            JobType::Report => "report",
            JobType::Dedup => "dedup",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// One persistent job record.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_type: JobType,

    #[builder(default)]
    pub status: JobStatus,

    /// Higher claims first within a type.
    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default = false)]
    pub cancellation_requested: bool,

    /// Claimant id for audit of reclaims.
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,

    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Deserialize the payload into a typed command.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| anyhow::anyhow!("failed to deserialize job {} payload: {e}", self.id))
    }
}

/// Columns selected for every job read, kept in one place so queries
/// stay in sync with the model.
pub const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, result, error, \
     cancellation_requested, claimed_by, last_heartbeat_at, created_at, started_at, \
     completed_at, updated_at";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_builder_defaults() {
        let job = Job::builder().job_type(JobType::Extract).build();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 0);
        assert!(!job.cancellation_requested);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_payload_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Cmd {
            url: String,
        }
        let job = Job::builder()
            .job_type(JobType::Scrape)
            .payload(serde_json::to_value(Cmd { url: "https://a.com".into() }).unwrap())
            .build();
        let cmd: Cmd = job.payload_as().unwrap();
        assert_eq!(cmd.url, "https://a.com");
    }
}
