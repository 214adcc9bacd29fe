use crate::communication::{SendOptions, SerialTransport};
use chrono::{DateTime, Utc};
use croma_shared::telemetry::{parse_sd_progress, parse_temperatures, HeaterReading, TemperatureReport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Point-in-time printer telemetry. Fields the printer did not report keep their
/// previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrinterSnapshot {
    pub connected: bool,
    pub nozzle: HeaterReading,
    pub bed: HeaterReading,
    pub sd_progress: f64,
    pub sd_printing: bool,
    pub polled_at: Option<DateTime<Utc>>,
}

impl PrinterSnapshot {
    fn apply(&mut self, report: TemperatureReport) {
        if let Some(nozzle) = report.nozzle {
            self.nozzle = nozzle;
        }
        if let Some(bed) = report.bed {
            self.bed = bed;
        }
    }
}

/// Polls temperatures (`M105`) and SD progress (`M27`) through the shared transport.
pub struct StatusReader {
    transport: Arc<SerialTransport>,
    last: Mutex<PrinterSnapshot>,
}

impl StatusReader {
    pub fn new(transport: Arc<SerialTransport>) -> Self {
        Self {
            transport,
            last: Mutex::new(PrinterSnapshot::default()),
        }
    }

    fn last(&self) -> PrinterSnapshot {
        self.last.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn remember(&self, snapshot: &PrinterSnapshot) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
    }

    /// Never fails: a closed link yields a disconnected, zeroed snapshot and unparsable
    /// replies leave fields untouched. With `job_active` the SD query is skipped so it
    /// cannot race the streaming loop.
    pub async fn poll_status(&self, job_active: bool) -> PrinterSnapshot {
        if !self.transport.is_open() {
            return PrinterSnapshot::default();
        }
        let mut snapshot = self.last();
        if let Some(report) = self.read_temperatures().await {
            snapshot.apply(report);
        }
        if !job_active && self.transport.is_open() {
            match self.transport.send("M27", SendOptions::default()).await {
                Ok(response) => match parse_sd_progress(&response.text()) {
                    Ok(sd) => {
                        snapshot.sd_progress = sd.percent();
                        snapshot.sd_printing = true;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "No SD print in progress");
                        snapshot.sd_progress = 0.0;
                        snapshot.sd_printing = false;
                    }
                },
                Err(e) => tracing::warn!(error = %e, "SD progress poll failed"),
            }
        }
        snapshot.connected = self.transport.is_open();
        snapshot.polled_at = Some(Utc::now());
        self.remember(&snapshot);
        snapshot
    }

    /// Live temperatures merged into the last snapshot. Safe while a job is streaming.
    pub async fn poll_temperatures(&self) -> PrinterSnapshot {
        let mut snapshot = self.last();
        if !self.transport.is_open() {
            snapshot.connected = false;
            return snapshot;
        }
        if let Some(report) = self.read_temperatures().await {
            snapshot.apply(report);
            snapshot.polled_at = Some(Utc::now());
        }
        snapshot.connected = self.transport.is_open();
        self.remember(&snapshot);
        snapshot
    }

    async fn read_temperatures(&self) -> Option<TemperatureReport> {
        // One retry in total; the transport itself does not retry here.
        for attempt in 1..=2u32 {
            match self.transport.send("M105", SendOptions::default()).await {
                Ok(response) => match parse_temperatures(&response.text()) {
                    Ok(report) => return Some(report),
                    Err(e) => tracing::debug!(attempt, error = %e, "Temperature reply not recognised"),
                },
                Err(e) if e.is_link_fault() => {
                    tracing::warn!(error = %e, "Temperature poll failed");
                    return None;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Temperature poll timed out"),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }
}
