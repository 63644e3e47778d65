//! Configuration for the HA and idle engines.
//!
//! Loaded from TOML. Every field has a default so a partial (or missing)
//! file yields a usable configuration.
//!
//! ```toml
//! [ha]
//! symmetric_read_check = "report"
//! max_devices = 8
//!
//! [idle]
//! default_sweep_period_ms = 100
//! dr_buffer_size = 4096
//! dr_buffer_count = 16
//! ```

use pipe_mgr_types::{DevId, PipeMgrError, PipeResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::registry::DEFAULT_MAX_DEVICES;

/// Size of one idle notification message word.
pub const DR_MSG_SIZE: usize = 8;

/// What to do when pipes of a symmetric table read back different bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetricReadCheck {
    /// Skip the comparison.
    Off,
    /// Record and log mismatches, continue the restore.
    Report,
    /// Fail the hardware-read phase on the first mismatch.
    Fail,
}

/// Hitless HA settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    #[serde(default = "default_symmetric_read_check")]
    pub symmetric_read_check: SymmetricReadCheck,

    /// Upper bound on device ids accepted by the HA registry.
    #[serde(default = "default_max_devices")]
    pub max_devices: DevId,
}

/// Idle-time engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Sweep period used when a stage does not set its own.
    #[serde(default = "default_sweep_period_ms")]
    pub default_sweep_period_ms: u64,

    /// Bytes per notification buffer handed to the free-memory ring.
    #[serde(default = "default_dr_buffer_size")]
    pub dr_buffer_size: usize,

    /// Buffers kept on the free-memory ring per sub-device.
    #[serde(default = "default_dr_buffer_count")]
    pub dr_buffer_count: usize,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeMgrConfig {
    #[serde(default)]
    pub ha: HaConfig,

    #[serde(default)]
    pub idle: IdleConfig,
}

fn default_symmetric_read_check() -> SymmetricReadCheck {
    SymmetricReadCheck::Report
}

fn default_max_devices() -> DevId {
    DEFAULT_MAX_DEVICES
}

fn default_sweep_period_ms() -> u64 {
    100
}

fn default_dr_buffer_size() -> usize {
    4096
}

fn default_dr_buffer_count() -> usize {
    16
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            symmetric_read_check: default_symmetric_read_check(),
            max_devices: default_max_devices(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            default_sweep_period_ms: default_sweep_period_ms(),
            dr_buffer_size: default_dr_buffer_size(),
            dr_buffer_count: default_dr_buffer_count(),
        }
    }
}

impl IdleConfig {
    pub fn default_sweep_period(&self) -> Duration {
        Duration::from_millis(self.default_sweep_period_ms)
    }
}

impl PipeMgrConfig {
    pub fn from_toml_str(content: &str) -> PipeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipeMgrError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> PipeResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map_err(|e| {
                PipeMgrError::config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(PipeMgrError::config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PipeResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipeMgrError::config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content).map_err(|e| {
            PipeMgrError::config(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> PipeResult<()> {
        if self.ha.max_devices == 0 {
            return Err(PipeMgrError::config("ha.max_devices must be > 0"));
        }
        if self.idle.dr_buffer_size == 0 || self.idle.dr_buffer_size % DR_MSG_SIZE != 0 {
            return Err(PipeMgrError::config(format!(
                "idle.dr_buffer_size must be a non-zero multiple of {}",
                DR_MSG_SIZE
            )));
        }
        if self.idle.dr_buffer_count == 0 {
            return Err(PipeMgrError::config("idle.dr_buffer_count must be > 0"));
        }
        Ok(())
    }
}
