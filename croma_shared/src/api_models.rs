//! Shared data models for API requests and responses (host/simulator/web).

use crate::print_job::{FileId, JobId};
use crate::telemetry::HeaterReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Printer state reported by the status endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    Offline,
    Idle,
    Printing,
    Paused,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Temperatures {
    pub nozzle: HeaterReading,
    pub bed: HeaterReading,
}

/// Job part of a status response, present while a job is printing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActiveJobView {
    pub id: JobId,
    pub file_id: FileId,
    pub filename: String,
}

/// Response for `GET /api/v1/printer/status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrinterStatusResponse {
    pub connected: bool,
    pub state: PrinterState,
    pub temperatures: Temperatures,
    pub job: Option<ActiveJobView>,
    pub progress: f64,
    /// True when the firmware reports printing from its own SD card.
    pub sd_printing: bool,
    pub elapsed_secs: u64,
    pub remaining_secs: Option<u64>,
    pub elapsed: String,
    pub remaining: String,
}

/// Response for `GET /api/v1/filament`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilamentStatusResponse {
    pub has_filament: bool,
    pub sensor_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Represents a request to execute a G-code command.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GcodeCommandRequest {
    pub command: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GcodeCommandResponse {
    pub command: String,
    pub response: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartJobResponse {
    pub job_id: JobId,
}

/// Formats seconds as `HH:MM:SS`; hours grow past two digits.
pub fn format_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(3725), "01:02:05");
        assert_eq!(format_hms(360_000), "100:00:00");
    }
}
