// Shared rig for integration tests: a virtual printer behind the real transport and controller.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croma_rs::communication::SerialTransport;
use croma_rs::config::Config;
use croma_rs::hardware::{FilamentHandle, FilamentMonitor, FilamentSensor};
use croma_rs::store::{JobStore, RecordStore, StoreError};
use croma_rs::PrinterController;
use croma_shared::print_job::{FileId, FileRecord, JobId, JobRecord};
use croma_simulator::{VirtualPrinter, DEFAULT_PORT};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Record store that also remembers every progress checkpoint.
pub struct RecordingStore {
    inner: RecordStore,
    checkpoints: Mutex<Vec<(JobId, f64, u64)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: RecordStore::in_memory(),
            checkpoints: Mutex::new(Vec::new()),
        }
    }

    /// Progress values checkpointed for `job`, in order.
    pub fn checkpoints(&self, job: JobId) -> Vec<f64> {
        self.checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == job)
            .map(|(_, progress, _)| *progress)
            .collect()
    }
}

impl JobStore for RecordingStore {
    fn create_job(&self, file: &FileRecord, started_at: DateTime<Utc>) -> Result<JobRecord, StoreError> {
        self.inner.create_job(file, started_at)
    }

    fn update_job(&self, id: JobId, change: &mut dyn FnMut(&mut JobRecord)) -> Result<JobRecord, StoreError> {
        self.inner.update_job(id, change)
    }

    fn job(&self, id: JobId) -> Option<JobRecord> {
        self.inner.job(id)
    }

    fn jobs(&self) -> Vec<JobRecord> {
        self.inner.jobs()
    }

    fn register_file(&self, name: &str, path: &Path, estimated_duration_secs: Option<u64>) -> Result<FileRecord, StoreError> {
        self.inner.register_file(name, path, estimated_duration_secs)
    }

    fn update_file(&self, id: FileId, change: &mut dyn FnMut(&mut FileRecord)) -> Result<FileRecord, StoreError> {
        self.inner.update_file(id, change)
    }

    fn file(&self, id: FileId) -> Option<FileRecord> {
        self.inner.file(id)
    }

    fn files(&self) -> Vec<FileRecord> {
        self.inner.files()
    }

    fn checkpoint(&self, id: JobId, progress: f64, commands_sent: u64, failed_commands: u64) -> Result<JobRecord, StoreError> {
        self.checkpoints.lock().unwrap().push((id, progress, commands_sent));
        self.inner.checkpoint(id, progress, commands_sent, failed_commands)
    }
}

/// Filament switch the test flips by hand.
pub struct FakeSensor {
    present: AtomicBool,
}

impl FakeSensor {
    pub fn new(present: bool) -> Arc<Self> {
        Arc::new(Self {
            present: AtomicBool::new(present),
        })
    }

    pub fn set(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }
}

#[async_trait]
impl FilamentSensor for FakeSensor {
    async fn read_present(&self) -> io::Result<bool> {
        Ok(self.present.load(Ordering::SeqCst))
    }
}

/// Defaults with short start-up delays; tests run on paused time anyway.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.serial.port = DEFAULT_PORT.to_string();
    config.serial.settle_ms = 10;
    config.job.prepare_delay_ms = 10;
    config.job.pause_poll_ms = 100;
    config
}

/// `count` printable moves `G1 X<i> Y<i>` (1-based), mixed with comments and blank lines.
pub fn gcode_moves(count: usize) -> String {
    let mut text = String::from(";FLAVOR:Marlin\n;Generated for tests\n\n");
    for i in 1..=count {
        text.push_str(&format!("G1 X{i} Y{i} ; move {i}\n"));
        if i % 10 == 0 {
            text.push_str("; layer change\n\n");
        }
    }
    text
}

pub struct Rig {
    pub printer: VirtualPrinter,
    pub transport: Arc<SerialTransport>,
    pub store: Arc<RecordingStore>,
    pub filament: FilamentHandle,
    pub controller: Arc<PrinterController>,
    pub config: Config,
    pub dir: TempDir,
}

impl Rig {
    pub async fn new() -> Self {
        Self::build(test_config(), None).await
    }

    pub async fn with_sensor(sensor: Arc<dyn FilamentSensor>) -> Self {
        Self::build(test_config(), Some(sensor)).await
    }

    pub async fn build(config: Config, sensor: Option<Arc<dyn FilamentSensor>>) -> Self {
        let printer = VirtualPrinter::new();
        let transport = Arc::new(SerialTransport::new(Arc::new(printer.clone()), config.serial.clone()));
        let store = Arc::new(RecordingStore::new());
        let filament = match sensor {
            Some(sensor) => FilamentMonitor::spawn(Arc::clone(&transport), &config.filament, Some(sensor)).await.0,
            None => FilamentHandle::disabled(),
        };
        let controller = Arc::new(PrinterController::new(
            config.clone(),
            Arc::clone(&transport),
            store.clone(),
            filament.clone(),
        ));
        Self {
            printer,
            transport,
            store,
            filament,
            controller,
            config,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Writes a G-code file into the rig's directory and registers it.
    pub fn gcode_file(&self, name: &str, content: &str) -> FileRecord {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        self.store.register_file(name, &path, None).unwrap()
    }

    /// Moves sent to the printer so far, in order, as their X value.
    pub fn moves_sent(&self) -> Vec<usize> {
        self.printer
            .commands()
            .iter()
            .filter_map(|c| c.strip_prefix("G1 X"))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|x| x.parse().ok())
            .collect()
    }
}

/// Polls `condition` on (paused) time until it holds; panics after a minute.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..3000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
