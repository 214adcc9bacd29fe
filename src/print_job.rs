//! Streams a G-code file to the printer as one print job.
//!
//! Phases: `Preparing` (readiness probe and unit/positioning setup) then `Streaming`,
//! ending in `Completed`, `Error` or `Cancelled`. Pause and stop are cooperative: the
//! loop looks at its [`JobControl`] between commands, never in the middle of one.

use crate::communication::{SendOptions, SerialTransport};
use crate::hardware::FilamentState;
use crate::store::JobStore;
use async_stream::try_stream;
use croma_shared::config::JobConfig;
use croma_shared::gcode_utils::{strip_comment, Command, CommandClass};
use croma_shared::print_job::{FileRecord, JobId, JobSignal, JobStatus};
use croma_shared::serial_interface::TransportError;
use futures_core::stream::Stream;
use futures_util::{pin_mut, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::Instant;

const SETUP_COMMANDS: [&str; 3] = ["G21", "G90", "M82"];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job aborted before streaming: {0}")]
    JobAborted(String),
    #[error("line {line} '{command}' failed: {source}")]
    CommandFailed {
        line: u64,
        command: String,
        #[source]
        source: TransportError,
    },
    #[error("G-code file missing: {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Pause/resume/stop surface shared between request handlers, the filament logic and
/// the streaming loop of one job.
#[derive(Debug, Clone)]
pub struct JobControl {
    signal: Arc<watch::Sender<JobSignal>>,
    shutdown_claimed: Arc<AtomicBool>,
    shutdown_done: Arc<watch::Sender<bool>>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(JobSignal::Run);
        let (shutdown_done, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            shutdown_claimed: Arc::new(AtomicBool::new(false)),
            shutdown_done: Arc::new(shutdown_done),
        }
    }

    pub fn signal(&self) -> JobSignal {
        *self.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSignal> {
        self.signal.subscribe()
    }

    /// `Run -> Paused`; false when the job is not running.
    pub fn pause(&self) -> bool {
        self.signal.send_if_modified(|s| match s {
            JobSignal::Run => {
                *s = JobSignal::Paused;
                true
            }
            _ => false,
        })
    }

    /// `Paused -> Run`; false when the job is not paused.
    pub fn resume(&self) -> bool {
        self.signal.send_if_modified(|s| match s {
            JobSignal::Paused => {
                *s = JobSignal::Run;
                true
            }
            _ => false,
        })
    }

    /// Requests a stop from any state; false if one was already requested.
    pub fn stop(&self) -> bool {
        self.signal.send_if_modified(|s| {
            if *s == JobSignal::StopRequested {
                return false;
            }
            *s = JobSignal::StopRequested;
            true
        })
    }

    /// True for exactly one caller, who then owns sending the shutdown sequence.
    fn claim_shutdown(&self) -> bool {
        !self.shutdown_claimed.swap(true, Ordering::AcqRel)
    }

    /// Sends the shutdown sequence at most once per job and waits until it has gone out.
    /// It runs in its own task, so aborting the job task that started it does not cut it
    /// short.
    pub async fn shutdown(&self, transport: Arc<SerialTransport>, settings: JobConfig) {
        if self.claim_shutdown() {
            let done = Arc::clone(&self.shutdown_done);
            tokio::spawn(async move {
                send_shutdown_sequence(&transport, &settings).await;
                done.send_replace(true);
            });
        }
        let mut done = self.shutdown_done.subscribe();
        if done.wait_for(|sent| *sent).await.is_err() {
            tracing::warn!("Shutdown sequence task went away");
        }
    }
}

/// Commands that leave the printer safe after an abandoned print.
pub fn shutdown_sequence(z_lift_mm: f64) -> Vec<String> {
    vec![
        "M108".to_string(),
        "M104 S0".to_string(),
        "M140 S0".to_string(),
        "M107".to_string(),
        "G91".to_string(),
        format!("G1 Z{}", z_lift_mm),
        "G90".to_string(),
        "G28 X Y".to_string(),
    ]
}

/// Best effort: each command gets one short attempt and failures are only logged.
pub async fn send_shutdown_sequence(transport: &SerialTransport, settings: &JobConfig) {
    tracing::info!("Sending shutdown sequence");
    let options = SendOptions::retries(0).with_timeout(Duration::from_millis(settings.shutdown_ack_timeout_ms));
    for command in shutdown_sequence(settings.z_lift_mm) {
        if let Err(e) = transport.send(&command, options).await {
            tracing::debug!(command, error = %e, "Shutdown command not acknowledged");
        }
    }
}

/// Non-empty, comment-stripped commands of a G-code file with their 1-based line numbers.
pub fn command_stream(path: PathBuf) -> impl Stream<Item = Result<(u64, String), std::io::Error>> + Send {
    try_stream! {
        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0u64;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            line_no += 1;
            let text = String::from_utf8_lossy(&buf);
            let command = strip_comment(&text);
            if !command.is_empty() {
                yield (line_no, command.to_string());
            }
        }
    }
}

pub async fn count_commands(path: &Path) -> std::io::Result<u64> {
    let commands = command_stream(path.to_path_buf());
    pin_mut!(commands);
    let mut total = 0;
    while let Some(item) = commands.next().await {
        item?;
        total += 1;
    }
    Ok(total)
}

/// Checkpoint value: one decimal, never 100 before completion, never below `previous`.
pub fn checkpoint_progress(sent: u64, total: u64, previous: f64) -> f64 {
    if total == 0 {
        return previous;
    }
    let raw = sent as f64 / total as f64 * 100.0;
    let rounded = ((raw * 10.0).round() / 10.0).min(99.9);
    rounded.max(previous)
}

enum Finish {
    Completed,
    Cancelled,
}

enum Gate {
    Go,
    Stop,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    sent: u64,
    failed: u64,
    progress: f64,
}

pub struct JobExecutor {
    job_id: JobId,
    file: FileRecord,
    transport: Arc<SerialTransport>,
    store: Arc<dyn JobStore>,
    control: JobControl,
    signal_rx: watch::Receiver<JobSignal>,
    filament: Option<watch::Receiver<FilamentState>>,
    runouts_seen: u64,
    settings: JobConfig,
    counters: Counters,
}

impl JobExecutor {
    pub fn new(
        job_id: JobId,
        file: FileRecord,
        transport: Arc<SerialTransport>,
        store: Arc<dyn JobStore>,
        control: JobControl,
        settings: JobConfig,
    ) -> Self {
        let signal_rx = control.subscribe();
        Self {
            job_id,
            file,
            transport,
            store,
            control,
            signal_rx,
            filament: None,
            runouts_seen: 0,
            settings,
            counters: Counters::default(),
        }
    }

    /// Pause the job on every runout published after this point.
    pub fn watch_filament(mut self, mut filament: watch::Receiver<FilamentState>) -> Self {
        self.runouts_seen = filament.borrow_and_update().runouts;
        self.filament = Some(filament);
        self
    }

    /// Drives the job to a terminal state and records it.
    pub async fn run(mut self) -> JobStatus {
        let started = Instant::now();
        tracing::info!(job_id = self.job_id, file = %self.file.name, "Preparing print job");
        let result = self.execute().await;
        let Counters { sent, failed, progress } = self.counters;
        let (status, error) = match result {
            Ok(Finish::Completed) => (JobStatus::Completed, None),
            Ok(Finish::Cancelled) => {
                self.control
                    .shutdown(Arc::clone(&self.transport), self.settings.clone())
                    .await;
                (JobStatus::Cancelled, None)
            }
            Err(e) => {
                tracing::error!(job_id = self.job_id, error = %e, "Print job failed");
                (JobStatus::Error, Some(e.to_string()))
            }
        };
        if let Err(e) = self.store.checkpoint(self.job_id, progress, sent, failed) {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to store final counters");
        }
        if let Err(e) = self.store.finish_job(self.job_id, status, error) {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to store final job state");
        }
        let elapsed = started.elapsed();
        if status == JobStatus::Completed {
            let secs = elapsed.as_secs();
            if let Err(e) = self.store.update_file(self.file.id, &mut |f| f.estimated_duration_secs = Some(secs)) {
                tracing::warn!(file_id = self.file.id, error = %e, "Failed to store measured print time");
            }
        }
        tracing::info!(
            job_id = self.job_id,
            status = status.as_str(),
            sent,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Print job finished"
        );
        status
    }

    async fn execute(&mut self) -> Result<Finish, JobError> {
        tokio::time::sleep(Duration::from_millis(self.settings.prepare_delay_ms)).await;
        if matches!(self.gate().await, Gate::Stop) {
            return Ok(Finish::Cancelled);
        }
        self.prepare().await?;

        let total = count_commands(&self.file.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => JobError::SourceMissing(self.file.path.clone()),
            _ => JobError::Io(e),
        })?;
        self.store
            .update_job(self.job_id, &mut |job| job.total_commands = total)
            .map_err(|e| JobError::JobAborted(e.to_string()))?;
        tracing::info!(job_id = self.job_id, total, "Streaming print job");

        let commands = command_stream(self.file.path.clone());
        pin_mut!(commands);
        while let Some(item) = commands.next().await {
            let (line, text) = item?;
            if matches!(self.gate().await, Gate::Stop) {
                tracing::info!(job_id = self.job_id, line, "Stop requested");
                return Ok(Finish::Cancelled);
            }
            let command = Command::new(&text);
            let options = SendOptions::retries(self.settings.command_retries);
            match self.transport.send(command.text(), options).await {
                Ok(_) => {}
                Err(e) if e.is_link_fault() => return Err(JobError::Transport(e)),
                Err(e) => {
                    self.counters.failed += 1;
                    let failure = JobError::CommandFailed {
                        line,
                        command: command.text().to_string(),
                        source: e,
                    };
                    tracing::warn!(job_id = self.job_id, error = %failure, "Skipping failed command");
                }
            }
            self.counters.sent += 1;
            if let Some(delay) = self.settle_delay(command.class()) {
                tokio::time::sleep(delay).await;
            }
            if self.counters.sent % self.settings.checkpoint_interval == 0 {
                self.checkpoint(total);
            }
        }
        Ok(Finish::Completed)
    }

    /// Readiness probe, then unit and positioning setup. Any failure aborts the job before
    /// file content reaches the printer.
    async fn prepare(&mut self) -> Result<(), JobError> {
        let options = SendOptions::retries(self.settings.setup_retries);
        self.transport
            .send("M115", options)
            .await
            .map_err(|e| JobError::JobAborted(format!("printer did not answer readiness probe: {e}")))?;
        for setup in SETUP_COMMANDS {
            self.transport
                .send(setup, options)
                .await
                .map_err(|e| JobError::JobAborted(format!("setup command {setup} failed: {e}")))?;
        }
        Ok(())
    }

    fn checkpoint(&mut self, total: u64) {
        let Counters { sent, failed, progress } = self.counters;
        let progress = checkpoint_progress(sent, total, progress);
        self.counters.progress = progress;
        tracing::debug!(job_id = self.job_id, sent, total, progress, "Progress checkpoint");
        if let Err(e) = self.store.checkpoint(self.job_id, progress, sent, failed) {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to store progress checkpoint");
        }
    }

    fn settle_delay(&self, class: CommandClass) -> Option<Duration> {
        let ms = match class {
            CommandClass::HeatAndWait => self.settings.heat_settle_ms,
            CommandClass::Homing | CommandClass::BedLeveling | CommandClass::ToolChange => self.settings.tool_settle_ms,
            _ => return None,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Applies runouts published since the last boundary, including ones whose filament
    /// was already reloaded while a long command was in flight.
    fn observe_filament(&mut self) {
        let Some(filament) = self.filament.as_mut() else {
            return;
        };
        if !filament.has_changed().unwrap_or(false) {
            return;
        }
        let runouts = filament.borrow_and_update().runouts;
        if runouts > self.runouts_seen {
            self.runouts_seen = runouts;
            if self.control.pause() {
                tracing::warn!(job_id = self.job_id, "Filament runout, job paused");
            }
        }
    }

    /// Blocks while paused. Returns at the next boundary where the job may proceed or
    /// must stop.
    async fn gate(&mut self) -> Gate {
        let mut paused_logged = false;
        loop {
            self.observe_filament();
            let signal = *self.signal_rx.borrow_and_update();
            match signal {
                JobSignal::Run => {
                    if paused_logged {
                        tracing::info!(job_id = self.job_id, "Job resumed");
                    }
                    return Gate::Go;
                }
                JobSignal::StopRequested => return Gate::Stop,
                JobSignal::Paused => {
                    if !paused_logged {
                        tracing::info!(job_id = self.job_id, sent = self.counters.sent, "Job paused");
                        paused_logged = true;
                    }
                    let poll = Duration::from_millis(self.settings.pause_poll_ms);
                    tokio::select! {
                        changed = self.signal_rx.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep(poll).await;
                            }
                        }
                        () = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
    }
}
