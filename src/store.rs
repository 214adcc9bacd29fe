//! Job and file records.
//!
//! The executor reaches the store synchronously from its checkpoints, so the trait is
//! blocking and implementations keep their critical sections short.

use chrono::{DateTime, Utc};
use croma_shared::print_job::{FileId, FileRecord, JobId, JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("unknown file {0}")]
    UnknownFile(FileId),
}

pub trait JobStore: Send + Sync {
    fn create_job(&self, file: &FileRecord, started_at: DateTime<Utc>) -> Result<JobRecord, StoreError>;
    fn update_job(&self, id: JobId, change: &mut dyn FnMut(&mut JobRecord)) -> Result<JobRecord, StoreError>;
    fn job(&self, id: JobId) -> Option<JobRecord>;
    /// All jobs, newest first.
    fn jobs(&self) -> Vec<JobRecord>;

    fn register_file(&self, name: &str, path: &Path, estimated_duration_secs: Option<u64>) -> Result<FileRecord, StoreError>;
    fn update_file(&self, id: FileId, change: &mut dyn FnMut(&mut FileRecord)) -> Result<FileRecord, StoreError>;
    fn file(&self, id: FileId) -> Option<FileRecord>;
    fn files(&self) -> Vec<FileRecord>;

    /// Progress checkpoint of a streaming job.
    fn checkpoint(&self, id: JobId, progress: f64, commands_sent: u64, failed_commands: u64) -> Result<JobRecord, StoreError> {
        self.update_job(id, &mut |job| {
            job.progress = progress;
            job.commands_sent = commands_sent;
            job.failed_commands = failed_commands;
        })
    }

    /// Moves a job to a terminal state unless it already is in one.
    fn finish_job(&self, id: JobId, status: JobStatus, error: Option<String>) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        self.update_job(id, &mut |job| {
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.completed_at = Some(now);
            job.error = error.clone();
            if status == JobStatus::Completed {
                job.progress = 100.0;
            }
        })
    }

    fn printing_job(&self) -> Option<JobRecord> {
        self.jobs().into_iter().find(|job| job.status == JobStatus::Printing)
    }

    /// Cancels jobs left in `printing`, e.g. by a crash. Returns their ids.
    fn cancel_stale_printing(&self) -> Result<Vec<JobId>, StoreError> {
        let stale: Vec<JobId> = self
            .jobs()
            .into_iter()
            .filter(|job| job.status == JobStatus::Printing)
            .map(|job| job.id)
            .collect();
        for id in &stale {
            tracing::warn!(job_id = id, "Cancelling job left in printing state");
            self.finish_job(*id, JobStatus::Cancelled, Some("interrupted".to_string()))?;
        }
        Ok(stale)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    jobs: BTreeMap<JobId, JobRecord>,
    files: BTreeMap<FileId, FileRecord>,
    next_job_id: JobId,
    next_file_id: FileId,
}

/// In-memory records, optionally mirrored to a JSON state file after every change.
pub struct RecordStore {
    records: Mutex<Records>,
    state_file: Option<PathBuf>,
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Records::default()),
            state_file: None,
        }
    }

    /// Loads `path` if it exists. Jobs a previous run left printing become cancelled.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Records::default()
        };
        tracing::info!(path = %path.display(), jobs = records.jobs.len(), files = records.files.len(), "Loaded record store");
        let store = Self {
            records: Mutex::new(records),
            state_file: Some(path),
        };
        store.cancel_stale_printing()?;
        Ok(store)
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl JobStore for RecordStore {
    fn create_job(&self, file: &FileRecord, started_at: DateTime<Utc>) -> Result<JobRecord, StoreError> {
        let mut records = self.records();
        records.next_job_id += 1;
        let job = JobRecord::new(records.next_job_id, file, started_at);
        records.jobs.insert(job.id, job.clone());
        self.persist(&records)?;
        Ok(job)
    }

    fn update_job(&self, id: JobId, change: &mut dyn FnMut(&mut JobRecord)) -> Result<JobRecord, StoreError> {
        let mut records = self.records();
        let job = records.jobs.get_mut(&id).ok_or(StoreError::UnknownJob(id))?;
        change(job);
        let updated = job.clone();
        self.persist(&records)?;
        Ok(updated)
    }

    fn job(&self, id: JobId) -> Option<JobRecord> {
        self.records().jobs.get(&id).cloned()
    }

    fn jobs(&self) -> Vec<JobRecord> {
        self.records().jobs.values().rev().cloned().collect()
    }

    fn register_file(&self, name: &str, path: &Path, estimated_duration_secs: Option<u64>) -> Result<FileRecord, StoreError> {
        let mut records = self.records();
        if let Some(existing) = records.files.values().find(|f| f.path == path) {
            return Ok(existing.clone());
        }
        records.next_file_id += 1;
        let file = FileRecord {
            id: records.next_file_id,
            name: name.to_string(),
            path: path.to_path_buf(),
            estimated_duration_secs,
            print_count: 0,
            last_printed: None,
        };
        records.files.insert(file.id, file.clone());
        self.persist(&records)?;
        Ok(file)
    }

    fn update_file(&self, id: FileId, change: &mut dyn FnMut(&mut FileRecord)) -> Result<FileRecord, StoreError> {
        let mut records = self.records();
        let file = records.files.get_mut(&id).ok_or(StoreError::UnknownFile(id))?;
        change(file);
        let updated = file.clone();
        self.persist(&records)?;
        Ok(updated)
    }

    fn file(&self, id: FileId) -> Option<FileRecord> {
        self.records().files.get(&id).cloned()
    }

    fn files(&self) -> Vec<FileRecord> {
        self.records().files.values().cloned().collect()
    }
}
