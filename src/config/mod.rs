//! Configuration management
//!
//! Handles loading and validation of the doctor's settings from a TOML
//! file. Every field has a default, so a missing or partial file is fine;
//! CLI flags override the loaded values where they overlap.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeTimeouts;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Optional directory for the log file (stderr only when unset)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Screencast probe budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Budget for each portal round trip
    pub step_timeout_secs: u64,
    /// Budget for the whole negotiation
    pub overall_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 10,
            overall_timeout_secs: 30,
        }
    }
}

/// Fix engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixesConfig {
    /// Where backup records live; defaults to the XDG config dir
    pub backup_dir: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Screencast probe configuration
    pub probe: ProbeConfig,
    /// Fix engine configuration
    pub fixes: FixesConfig,
}

/// Default config file location (`~/.config/lamco-portal-doctor/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lamco-portal-doctor/config.toml"))
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load the given file, or the default location, or fall back to
    /// defaults when no file exists.
    ///
    /// An explicitly named file must exist; the default location is
    /// allowed to be absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {other}"),
        }

        if self.probe.step_timeout_secs == 0 {
            anyhow::bail!("probe.step_timeout_secs must be at least 1");
        }
        if self.probe.overall_timeout_secs < self.probe.step_timeout_secs {
            anyhow::bail!(
                "probe.overall_timeout_secs ({}) cannot be smaller than step_timeout_secs ({})",
                self.probe.overall_timeout_secs,
                self.probe.step_timeout_secs
            );
        }

        Ok(())
    }

    /// Probe budgets as the probe driver wants them
    pub fn probe_timeouts(&self) -> ProbeTimeouts {
        ProbeTimeouts {
            per_step: std::time::Duration::from_secs(self.probe.step_timeout_secs),
            overall: std::time::Duration::from_secs(self.probe.overall_timeout_secs),
        }
    }
}
