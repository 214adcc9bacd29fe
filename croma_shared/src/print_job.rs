use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type JobId = u64;
pub type FileId = u64;

/// Persisted lifecycle of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Printing,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Printing => "printing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Cooperative control surface of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSignal {
    #[default]
    Run,
    Paused,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub file_id: FileId,
    pub filename: String,
    pub status: JobStatus,
    /// 0..=100, only exactly 100 once completed.
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_commands: u64,
    pub commands_sent: u64,
    pub failed_commands: u64,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(id: JobId, file: &FileRecord, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            file_id: file.id,
            filename: file.name.clone(),
            status: JobStatus::Queued,
            progress: 0.0,
            started_at,
            completed_at: None,
            total_commands: 0,
            commands_sent: 0,
            failed_commands: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub path: PathBuf,
    /// Declared print time, replaced by the measured duration after a completed print.
    pub estimated_duration_secs: Option<u64>,
    pub print_count: u32,
    pub last_printed: Option<DateTime<Utc>>,
}
