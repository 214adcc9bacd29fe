//! Shared configuration logic for host, simulator, and tests.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 250000
//!
//! [job]
//! checkpoint_interval = 25
//!
//! [filament]
//! sensor_path = "/sys/class/gpio/gpio17/value"
//! debounce_ms = 300
//! ```
//!
//! Every section and field is optional; anything left out takes the default below.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub filament: FilamentConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Delay after opening the port; most boards reset when the USB link comes up.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_true")]
    pub probe_on_connect: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            settle_ms: default_settle_ms(),
            probe_on_connect: true,
            probe_timeout_ms: default_probe_timeout_ms(),
            default_timeout_ms: default_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl SerialConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Persist progress every N streamed commands.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
    #[serde(default = "default_setup_retries")]
    pub setup_retries: u32,
    #[serde(default = "default_prepare_delay_ms")]
    pub prepare_delay_ms: u64,
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    #[serde(default = "default_heat_settle_ms")]
    pub heat_settle_ms: u64,
    #[serde(default = "default_tool_settle_ms")]
    pub tool_settle_ms: u64,
    #[serde(default = "default_z_lift_mm")]
    pub z_lift_mm: f64,
    #[serde(default = "default_shutdown_ack_timeout_ms")]
    pub shutdown_ack_timeout_ms: u64,
    /// How long a replaced job may take to reach a terminal state before it is aborted.
    #[serde(default = "default_replace_timeout_ms")]
    pub replace_timeout_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            command_retries: default_command_retries(),
            setup_retries: default_setup_retries(),
            prepare_delay_ms: default_prepare_delay_ms(),
            pause_poll_ms: default_pause_poll_ms(),
            heat_settle_ms: default_heat_settle_ms(),
            tool_settle_ms: default_tool_settle_ms(),
            z_lift_mm: default_z_lift_mm(),
            shutdown_ack_timeout_ms: default_shutdown_ack_timeout_ms(),
            replace_timeout_ms: default_replace_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilamentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// GPIO value file; `1` means filament present.
    #[serde(default)]
    pub sensor_path: Option<PathBuf>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_runout_message")]
    pub runout_message: String,
}

impl Default for FilamentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            sensor_path: None,
            poll_interval_ms: None,
            runout_message: default_runout_message(),
        }
    }
}

impl FilamentConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_gcode_dir")]
    pub gcode_dir: PathBuf,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gcode_dir: default_gcode_dir(),
            state_file: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Invalid("serial.port must not be empty".to_string()));
        }
        if self.serial.baud == 0 {
            return Err(ConfigError::Invalid("serial.baud must be > 0".to_string()));
        }
        if self.job.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid("job.checkpoint_interval must be > 0".to_string()));
        }
        if self.filament.debounce_ms == 0 {
            return Err(ConfigError::Invalid("filament.debounce_ms must be > 0".to_string()));
        }
        if self.web.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!("web.bind '{}' is not a socket address", self.web.bind)));
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud() -> u32 { 115200 }
fn default_settle_ms() -> u64 { 2000 }
fn default_probe_timeout_ms() -> u64 { 500 }
fn default_timeout_ms() -> u64 { 5000 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_checkpoint_interval() -> u64 { 50 }
fn default_command_retries() -> u32 { 2 }
fn default_setup_retries() -> u32 { 3 }
fn default_prepare_delay_ms() -> u64 { 1000 }
fn default_pause_poll_ms() -> u64 { 1000 }
fn default_heat_settle_ms() -> u64 { 2000 }
fn default_tool_settle_ms() -> u64 { 500 }
fn default_z_lift_mm() -> f64 { 10.0 }
fn default_shutdown_ack_timeout_ms() -> u64 { 2000 }
fn default_replace_timeout_ms() -> u64 { 10_000 }
fn default_debounce_ms() -> u64 { 300 }
fn default_runout_message() -> String { "Filament runout!".to_string() }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }
fn default_gcode_dir() -> PathBuf { PathBuf::from("gcode_files") }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
