//! Filament runout detection.
//!
//! A platform edge detector (or [`spawn_sensor_poller`]) pushes raw presence readings
//! into a channel. The monitor task debounces them, publishes [`FilamentState`] and, on
//! runout, pauses the printer's SD queue and shows a message on its display.

use crate::communication::{SendOptions, SerialTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croma_shared::config::FilamentConfig;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilamentState {
    pub present: bool,
    pub sensor_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    /// Present-to-absent transitions since start. Survives a reload that lands before a
    /// reader looks, unlike `present`.
    pub runouts: u64,
}

impl FilamentState {
    fn without_sensor() -> Self {
        Self {
            present: true,
            sensor_enabled: false,
            last_check: None,
            runouts: 0,
        }
    }
}

#[async_trait]
pub trait FilamentSensor: Send + Sync {
    /// True when filament is loaded.
    async fn read_present(&self) -> io::Result<bool>;
}

/// Reads a sysfs-style GPIO value file. The switch pulls the line high while filament
/// is present, so `1` means present.
pub struct GpioValueSensor {
    path: PathBuf,
}

impl GpioValueSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FilamentSensor for GpioValueSensor {
    async fn read_present(&self) -> io::Result<bool> {
        let value = tokio::fs::read_to_string(&self.path).await?;
        match value.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected GPIO value {:?} in {}", other, self.path.display()),
            )),
        }
    }
}

/// Cheap handle to the monitor: event input, state output and on-demand checks.
#[derive(Clone)]
pub struct FilamentHandle {
    events: Option<mpsc::Sender<bool>>,
    state: watch::Receiver<FilamentState>,
    state_tx: Arc<watch::Sender<FilamentState>>,
    sensor: Option<Arc<dyn FilamentSensor>>,
}

impl FilamentHandle {
    /// Handle for a printer without a runout sensor; filament always reads present.
    pub fn disabled() -> Self {
        let (state_tx, state) = watch::channel(FilamentState::without_sensor());
        Self {
            events: None,
            state,
            state_tx: Arc::new(state_tx),
            sensor: None,
        }
    }

    pub fn state(&self) -> FilamentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FilamentState> {
        self.state.clone()
    }

    /// Sender for raw sensor readings, `None` when monitoring is disabled.
    pub fn events(&self) -> Option<mpsc::Sender<bool>> {
        self.events.clone()
    }

    /// Reads the sensor now. A reading that disagrees with the published state is fed to
    /// the monitor so it goes through the same debounce and runout handling.
    pub async fn check(&self) -> FilamentState {
        let Some(sensor) = &self.sensor else {
            return self.state();
        };
        match sensor.read_present().await {
            Ok(present) => {
                let now = Utc::now();
                self.state_tx.send_modify(|s| s.last_check = Some(now));
                if present != self.state().present {
                    if let Some(events) = &self.events {
                        if events.send(present).await.is_err() {
                            tracing::warn!("Filament monitor is not running");
                        }
                    }
                }
                FilamentState {
                    present,
                    last_check: Some(now),
                    ..self.state()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Filament sensor read failed");
                self.state()
            }
        }
    }
}

pub struct FilamentMonitor {
    transport: Arc<SerialTransport>,
    state_tx: Arc<watch::Sender<FilamentState>>,
    debounce: Duration,
    runout_message: String,
}

impl FilamentMonitor {
    /// Starts the monitor task. The initial state comes from one sensor read, or is
    /// "present" when there is no sensor.
    pub async fn spawn(
        transport: Arc<SerialTransport>,
        settings: &FilamentConfig,
        sensor: Option<Arc<dyn FilamentSensor>>,
    ) -> (FilamentHandle, JoinHandle<()>) {
        let mut initial = FilamentState {
            present: true,
            sensor_enabled: sensor.is_some(),
            last_check: None,
            runouts: 0,
        };
        if let Some(sensor) = &sensor {
            match sensor.read_present().await {
                Ok(present) => {
                    initial.present = present;
                    initial.last_check = Some(Utc::now());
                }
                Err(e) => tracing::warn!(error = %e, "Initial filament sensor read failed"),
            }
        }
        let (state_tx, state) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);
        let (events_tx, events_rx) = mpsc::channel(32);
        let monitor = FilamentMonitor {
            transport,
            state_tx: Arc::clone(&state_tx),
            debounce: settings.debounce(),
            runout_message: settings.runout_message.clone(),
        };
        tracing::info!(present = initial.present, sensor = initial.sensor_enabled, "Filament monitor started");
        let task = tokio::spawn(monitor.run(events_rx));
        let handle = FilamentHandle {
            events: Some(events_tx),
            state,
            state_tx,
            sensor,
        };
        (handle, task)
    }

    /// Applies the first reading of a burst right away; readings arriving within the
    /// debounce window after it are coalesced and only the last one is applied once the
    /// window closes.
    async fn run(self, mut events: mpsc::Receiver<bool>) {
        let window = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(window);
        let mut window_open = false;
        let mut pending: Option<bool> = None;
        loop {
            tokio::select! {
                reading = events.recv() => {
                    let Some(present) = reading else { break };
                    if window_open && Instant::now() < window.deadline() {
                        pending = Some(present);
                        continue;
                    }
                    pending = None;
                    self.apply(present).await;
                    window.as_mut().reset(Instant::now() + self.debounce);
                    window_open = true;
                }
                () = &mut window, if window_open => {
                    window_open = false;
                    if let Some(present) = pending.take() {
                        self.apply(present).await;
                        window.as_mut().reset(Instant::now() + self.debounce);
                        window_open = true;
                    }
                }
            }
        }
        tracing::debug!("Filament monitor stopped");
    }

    async fn apply(&self, present: bool) {
        let now = Utc::now();
        let previous = *self.state_tx.borrow();
        if previous.present == present {
            self.state_tx.send_modify(|s| s.last_check = Some(now));
            return;
        }
        // Publish first so a streaming job pauses at its next boundary.
        self.state_tx.send_modify(|s| {
            s.present = present;
            s.last_check = Some(now);
            if !present {
                s.runouts += 1;
            }
        });
        if present {
            tracing::info!("Filament loaded");
            return;
        }
        tracing::warn!("Filament runout detected");
        // Sent whether or not a job is streaming; a closed link is reopened by the send.
        let message = format!("M117 {}", self.runout_message);
        for command in ["M25", message.as_str()] {
            if let Err(e) = self.transport.send(command, SendOptions::retries(1)).await {
                tracing::warn!(command, error = %e, "Runout command failed");
            }
        }
    }
}

/// Periodically reads `sensor` and forwards changes to the monitor, for platforms
/// without edge notification.
pub fn spawn_sensor_poller(
    sensor: Arc<dyn FilamentSensor>,
    events: mpsc::Sender<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<bool> = None;
        loop {
            ticker.tick().await;
            match sensor.read_present().await {
                Ok(present) if last != Some(present) => {
                    last = Some(present);
                    if events.send(present).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Filament sensor poll failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn gpio_value_file_reading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1").unwrap();
        let sensor = GpioValueSensor::new(file.path());
        assert!(sensor.read_present().await.unwrap());

        std::fs::write(file.path(), "0").unwrap();
        assert!(!sensor.read_present().await.unwrap());

        std::fs::write(file.path(), "x").unwrap();
        assert!(sensor.read_present().await.is_err());
    }

    #[tokio::test]
    async fn disabled_handle_reports_present() {
        let handle = FilamentHandle::disabled();
        let state = handle.check().await;
        assert!(state.present);
        assert!(!state.sensor_enabled);
        assert!(handle.events().is_none());
    }
}
