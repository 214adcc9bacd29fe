// src/printer.rs - PrinterController: the one owner of link, active job and status sources
use crate::communication::{SendOptions, SerialTransport};
use crate::hardware::{FilamentHandle, StatusReader};
use crate::print_job::{send_shutdown_sequence, JobControl, JobError, JobExecutor};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use croma_shared::api_models::{
    format_hms, ActiveJobView, FilamentStatusResponse, GcodeCommandResponse, PrinterState, PrinterStatusResponse,
    Temperatures,
};
use croma_shared::config::Config;
use croma_shared::print_job::{FileId, FileRecord, JobId, JobRecord, JobSignal, JobStatus};
use croma_shared::serial_interface::TransportError;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Progress (percent) where the extrapolated estimate starts to take over.
const ETA_BLEND_START: f64 = 5.0;
/// Progress (percent) from which only the extrapolated estimate is used.
const ETA_BLEND_END: f64 = 50.0;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("file {0} not found")]
    FileNotFound(FileId),
    #[error("no active print job")]
    NoActiveJob,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("empty command")]
    EmptyCommand,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ControllerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Transport(e) | ControllerError::Job(JobError::Transport(e)) => e.kind(),
            ControllerError::Job(JobError::SourceMissing(_)) => "source_missing",
            ControllerError::Job(_) => "job_error",
            ControllerError::FileNotFound(_) => "file_not_found",
            ControllerError::NoActiveJob => "no_active_job",
            ControllerError::InvalidTransition(_) => "invalid_transition",
            ControllerError::EmptyCommand => "empty_command",
            ControllerError::Store(_) => "store_error",
        }
    }
}

/// What a pause/resume/stop request acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ControlTarget {
    /// A job streamed by this host.
    Job { job_id: JobId },
    /// No host job was running; the command went to the printer's own SD print.
    SdCard,
}

struct ActiveJob {
    id: JobId,
    control: JobControl,
    handle: JoinHandle<JobStatus>,
}

impl ActiveJob {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct PrinterController {
    config: Config,
    transport: Arc<SerialTransport>,
    status: StatusReader,
    store: Arc<dyn JobStore>,
    filament: FilamentHandle,
    active: Mutex<Option<ActiveJob>>,
    /// Control of the newest job, readable while `active` is held through a job swap.
    latest_control: RwLock<Option<(JobId, JobControl)>>,
}

impl PrinterController {
    pub fn new(
        config: Config,
        transport: Arc<SerialTransport>,
        store: Arc<dyn JobStore>,
        filament: FilamentHandle,
    ) -> Self {
        let status = StatusReader::new(Arc::clone(&transport));
        Self {
            config,
            transport,
            status,
            store,
            filament,
            active: Mutex::new(None),
            latest_control: RwLock::new(None),
        }
    }

    pub async fn connect(&self) -> Result<(), ControllerError> {
        self.transport.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Interactive console command, sent with the class timeout and no retries.
    pub async fn send_raw(&self, command: &str) -> Result<GcodeCommandResponse, ControllerError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ControllerError::EmptyCommand);
        }
        let response = self.transport.send(command, SendOptions::default()).await?;
        Ok(GcodeCommandResponse {
            command: command.to_string(),
            response: response.lines,
            elapsed_ms: response.elapsed.as_millis() as u64,
        })
    }

    /// Starts streaming `file_id`. A job that is still running is stopped first and
    /// forced to a terminal state before the new one is created.
    pub async fn start_job(&self, file_id: FileId) -> Result<JobId, ControllerError> {
        let file = self.store.file(file_id).ok_or(ControllerError::FileNotFound(file_id))?;
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.retire(previous).await;
        }
        self.store.cancel_stale_printing()?;

        let job = self.store.create_job(&file, Utc::now())?;
        tracing::info!(job_id = job.id, file = %file.name, "Print job queued");
        if let Err(e) = self.transport.connect().await {
            self.store.finish_job(job.id, JobStatus::Error, Some(e.to_string()))?;
            return Err(e.into());
        }
        if !tokio::fs::try_exists(&file.path).await.unwrap_or(false) {
            let missing = JobError::SourceMissing(file.path.clone());
            self.store.finish_job(job.id, JobStatus::Error, Some(missing.to_string()))?;
            return Err(missing.into());
        }

        let now = Utc::now();
        self.store.update_job(job.id, &mut |j| {
            j.status = JobStatus::Printing;
            j.started_at = now;
        })?;
        let file = self.store.update_file(file.id, &mut |f| {
            f.print_count += 1;
            f.last_printed = Some(now);
        })?;

        let control = JobControl::new();
        let executor = JobExecutor::new(
            job.id,
            file,
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            control.clone(),
            self.config.job.clone(),
        )
        .watch_filament(self.filament.subscribe());
        let handle = tokio::spawn(executor.run());
        *self.latest_control.write().unwrap_or_else(|p| p.into_inner()) = Some((job.id, control.clone()));
        *active = Some(ActiveJob {
            id: job.id,
            control,
            handle,
        });
        Ok(job.id)
    }

    async fn retire(&self, mut previous: ActiveJob) {
        if previous.is_running() {
            tracing::info!(job_id = previous.id, "Stopping running job before starting a new one");
            previous.control.stop();
        }
        let limit = Duration::from_millis(self.config.job.replace_timeout_ms);
        match tokio::time::timeout(limit, &mut previous.handle).await {
            Ok(Ok(status)) => tracing::debug!(job_id = previous.id, status = status.as_str(), "Previous job ended"),
            Ok(Err(e)) => tracing::warn!(job_id = previous.id, error = %e, "Previous job task failed"),
            Err(_) => {
                tracing::warn!(job_id = previous.id, "Previous job did not stop in time, aborting it");
                previous.handle.abort();
                // The aborted task gives up the serial link once it has been dropped.
                let _ = (&mut previous.handle).await;
                previous
                    .control
                    .shutdown(Arc::clone(&self.transport), self.config.job.clone())
                    .await;
            }
        }
        // Covers an aborted or panicked task; a no-op for jobs that already finished.
        if let Err(e) = self.store.finish_job(previous.id, JobStatus::Cancelled, Some("replaced".to_string())) {
            tracing::warn!(job_id = previous.id, error = %e, "Failed to record replaced job");
        }
    }

    pub async fn pause(&self) -> Result<ControlTarget, ControllerError> {
        let active = self.active.lock().await;
        if let Some(job) = active.as_ref().filter(|j| j.is_running()) {
            if !job.control.pause() {
                return Err(Self::rejected("pause", job.control.signal()));
            }
            tracing::info!(job_id = job.id, "Pause requested");
            return Ok(ControlTarget::Job { job_id: job.id });
        }
        self.sd_command("M25").await
    }

    pub async fn resume(&self) -> Result<ControlTarget, ControllerError> {
        let active = self.active.lock().await;
        if let Some(job) = active.as_ref().filter(|j| j.is_running()) {
            if !job.control.resume() {
                return Err(Self::rejected("resume", job.control.signal()));
            }
            tracing::info!(job_id = job.id, "Resume requested");
            return Ok(ControlTarget::Job { job_id: job.id });
        }
        self.sd_command("M24").await
    }

    /// Requests a cooperative stop. The job loop sends the shutdown sequence once it
    /// observes the request; without a host job the sequence is sent right away.
    pub async fn stop(&self) -> Result<ControlTarget, ControllerError> {
        let active = self.active.lock().await;
        if let Some(job) = active.as_ref().filter(|j| j.is_running()) {
            if job.control.stop() {
                tracing::info!(job_id = job.id, "Stop requested");
            }
            return Ok(ControlTarget::Job { job_id: job.id });
        }
        if !self.transport.is_open() {
            return Err(ControllerError::NoActiveJob);
        }
        send_shutdown_sequence(&self.transport, &self.config.job).await;
        Ok(ControlTarget::SdCard)
    }

    async fn sd_command(&self, command: &str) -> Result<ControlTarget, ControllerError> {
        if !self.transport.is_open() {
            return Err(ControllerError::NoActiveJob);
        }
        self.transport.send(command, SendOptions::retries(1)).await?;
        Ok(ControlTarget::SdCard)
    }

    fn rejected(action: &str, signal: JobSignal) -> ControllerError {
        let state = match signal {
            JobSignal::Run => "running",
            JobSignal::Paused => "paused",
            JobSignal::StopRequested => "stopping",
        };
        ControllerError::InvalidTransition(format!("cannot {action} a job that is {state}"))
    }

    /// While a job is printing, progress comes from its record and only temperatures are
    /// read live; an SD query would race the streaming loop. Otherwise the idle snapshot
    /// is used as is.
    pub async fn get_status(&self) -> PrinterStatusResponse {
        let Some(job) = self.store.printing_job() else {
            let snapshot = self.status.poll_status(false).await;
            return PrinterStatusResponse {
                connected: snapshot.connected,
                state: if snapshot.connected { PrinterState::Idle } else { PrinterState::Offline },
                temperatures: Temperatures {
                    nozzle: snapshot.nozzle,
                    bed: snapshot.bed,
                },
                job: None,
                progress: snapshot.sd_progress,
                sd_printing: snapshot.sd_printing,
                elapsed_secs: 0,
                remaining_secs: None,
                elapsed: format_hms(0),
                remaining: format_hms(0),
            };
        };

        let snapshot = self.status.poll_temperatures().await;
        let paused = self
            .latest_control
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(id, control)| *id == job.id && control.signal() == JobSignal::Paused);
        let elapsed_secs = (Utc::now() - job.started_at).num_seconds().max(0) as u64;
        let declared = self.store.file(job.file_id).and_then(|f| f.estimated_duration_secs);
        let remaining_secs = estimate_remaining(job.progress, elapsed_secs, declared);
        PrinterStatusResponse {
            connected: snapshot.connected,
            state: if paused { PrinterState::Paused } else { PrinterState::Printing },
            temperatures: Temperatures {
                nozzle: snapshot.nozzle,
                bed: snapshot.bed,
            },
            job: Some(ActiveJobView {
                id: job.id,
                file_id: job.file_id,
                filename: job.filename.clone(),
            }),
            progress: job.progress,
            sd_printing: false,
            elapsed_secs,
            remaining_secs,
            elapsed: format_hms(elapsed_secs),
            remaining: remaining_secs.map(format_hms).unwrap_or_else(|| "--:--:--".to_string()),
        }
    }

    pub fn filament_status(&self) -> FilamentStatusResponse {
        let state = self.filament.state();
        FilamentStatusResponse {
            has_filament: state.present,
            sensor_enabled: state.sensor_enabled,
            last_check: state.last_check,
        }
    }

    /// Reads the sensor now instead of reporting the last published state.
    pub async fn check_filament(&self) -> FilamentStatusResponse {
        let state = self.filament.check().await;
        FilamentStatusResponse {
            has_filament: state.present,
            sensor_enabled: state.sensor_enabled,
            last_check: state.last_check,
        }
    }

    pub fn list_jobs(&self) -> Vec<JobRecord> {
        self.store.jobs()
    }

    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.store.job(id)
    }

    pub fn files(&self) -> Vec<FileRecord> {
        let mut files = self.store.files();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Waits for the current job task to end and returns its final status.
    pub async fn join_active_job(&self) -> Option<JobStatus> {
        let job = self.active.lock().await.take()?;
        match job.handle.await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Job task failed");
                self.store.job(job.id).map(|j| j.status)
            }
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down printer controller");
        if let Some(job) = self.active.lock().await.take() {
            self.retire(job).await;
        }
        self.transport.disconnect().await;
    }
}

fn smoothstep(edge0: f64, edge1: f64, x: f64) -> f64 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Remaining seconds, blending the declared print time (trusted early) with
/// extrapolation from elapsed time (trusted once enough progress has been made).
pub fn estimate_remaining(progress: f64, elapsed_secs: u64, declared_secs: Option<u64>) -> Option<u64> {
    let progress = progress.clamp(0.0, 100.0);
    if progress >= 100.0 {
        return Some(0);
    }
    let left = 100.0 - progress;
    let declared = declared_secs.map(|d| d as f64 * left / 100.0);
    let extrapolated = (progress > 0.0).then(|| elapsed_secs as f64 * left / progress);
    let remaining = match (declared, extrapolated) {
        (Some(d), Some(x)) => {
            let weight = smoothstep(ETA_BLEND_START, ETA_BLEND_END, progress);
            d * (1.0 - weight) + x * weight
        }
        (Some(d), None) => d,
        (None, Some(x)) => x,
        (None, None) => return None,
    };
    Some(remaining.max(0.0).round() as u64)
}
