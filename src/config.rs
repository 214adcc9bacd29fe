// src/config.rs - command line flags layered over the TOML configuration
use clap::Parser;
use std::path::{Path, PathBuf};

pub use croma_shared::config::{
    load_config, Config, ConfigError, FilamentConfig, JobConfig, SerialConfig, StorageConfig, WebConfig,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "croma-host", version, about = "Serial G-code host for 3D printers")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "printer.toml")]
    pub config: PathBuf,

    /// Address for the HTTP API, overrides `[web] bind`
    #[arg(long)]
    pub bind: Option<String>,

    /// Serial device, overrides `[serial] port`
    #[arg(long)]
    pub port: Option<String>,

    /// Talk to the built-in virtual printer instead of a serial device
    #[cfg(feature = "sim-in-host")]
    #[arg(long)]
    pub simulate: bool,
}

impl Args {
    /// Loads the configuration file, falling back to defaults when it does not exist,
    /// then applies the command line overrides and validates the result.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut config = load_or_default(&self.config)?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.web.bind = bind.clone();
        }
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        #[cfg(feature = "sim-in-host")]
        if self.simulate {
            config.serial.port = croma_simulator::DEFAULT_PORT.to_string();
        }
    }
}

fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Configuration file not found, using defaults");
        return Ok(Config::default());
    }
    load_config(&path.to_string_lossy())
}
