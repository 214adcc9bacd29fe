//! Parsers for the free-form telemetry printers send back (`M105`, `M27`).
//!
//! Firmware output is loosely specified, so these only look for the fragments they need
//! and ignore everything else on the line.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TelemetryError {
    #[error("unrecognised {expected} reply: {reply:?}")]
    ParseFailure { expected: &'static str, reply: String },
}

static NOZZLE_RE: LazyLock<Regex> = LazyLock::new(|| heater_regex("T"));
static BED_RE: LazyLock<Regex> = LazyLock::new(|| heater_regex("B"));
static SD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSD printing\b\D*?(\d+)\s*/\s*(\d+)").expect("SD progress pattern")
});

fn heater_regex(tag: &str) -> Regex {
    let pattern = format!(r"\b{tag}:\s*(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)");
    Regex::new(&pattern).expect("heater pattern")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    pub current: f64,
    pub target: f64,
}

/// Heater readings found in a reply. A missing heater stays `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureReport {
    pub nozzle: Option<HeaterReading>,
    pub bed: Option<HeaterReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdProgress {
    pub done: u64,
    pub total: u64,
}

impl SdProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.done as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

fn heater(re: &Regex, text: &str) -> Option<HeaterReading> {
    let caps = re.captures(text)?;
    Some(HeaterReading {
        current: caps.get(1)?.as_str().parse().ok()?,
        target: caps.get(2)?.as_str().parse().ok()?,
    })
}

/// Extracts `T:<cur>/<target>` and `B:<cur>/<target>` from one or more reply lines.
pub fn parse_temperatures(text: &str) -> Result<TemperatureReport, TelemetryError> {
    let report = TemperatureReport {
        nozzle: heater(&NOZZLE_RE, text),
        bed: heater(&BED_RE, text),
    };
    if report.nozzle.is_none() && report.bed.is_none() {
        return Err(TelemetryError::ParseFailure {
            expected: "temperature",
            reply: text.to_string(),
        });
    }
    Ok(report)
}

/// Extracts the `<done>/<total>` byte counters of an `SD printing` reply.
pub fn parse_sd_progress(text: &str) -> Result<SdProgress, TelemetryError> {
    let failure = || TelemetryError::ParseFailure {
        expected: "SD progress",
        reply: text.to_string(),
    };
    let caps = SD_RE.captures(text).ok_or_else(failure)?;
    let done = caps[1].parse().map_err(|_| failure())?;
    let total = caps[2].parse().map_err(|_| failure())?;
    Ok(SdProgress { done, total })
}
