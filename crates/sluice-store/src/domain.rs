use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// An event ready for insertion. `payload` is compact-serialized JSON; the
/// database column casts it to `jsonb`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: String,
    pub timestamp_ms: i64,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown checkpoint status `{other}`"),
        }
    }
}

/// Durable progress record for one worker. Mutated only inside the same
/// transaction as the batch it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCheckpoint {
    pub worker_id: i32,
    pub chunk_start_ts: i64,
    pub chunk_end_ts: i64,
    pub cursor: Option<String>,
    pub last_ts: Option<i64>,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub status: CheckpointStatus,
}

impl WorkerCheckpoint {
    pub fn new(worker_id: i32, chunk_start_ts: i64, chunk_end_ts: i64) -> Self {
        Self {
            worker_id,
            chunk_start_ts,
            chunk_end_ts,
            cursor: None,
            last_ts: None,
            fetched_count: 0,
            inserted_count: 0,
            status: CheckpointStatus::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CheckpointStatus;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            CheckpointStatus::Running,
            CheckpointStatus::Completed,
            CheckpointStatus::Failed,
        ] {
            assert_eq!(
                CheckpointStatus::parse(status.as_str()).expect("parse"),
                status
            );
        }
    }

    #[test]
    fn status_parse_rejects_unknown_values() {
        assert!(CheckpointStatus::parse("paused").is_err());
    }
}
