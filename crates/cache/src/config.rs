//! Residency configuration
//!
//! Configuration can be created programmatically, loaded from environment
//! variables, or loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::MemoryInfo;
use crate::error::ConfigError;
use crate::memory_budget::{self, PressureThresholds};

const MB: usize = 1024 * 1024;
const KB: usize = 1024;

/// Configuration for the residency cache.
///
/// # Example
///
/// ```
/// use lumen_cache::ResidencyConfig;
///
/// let config = ResidencyConfig::default()
///     .with_budget_mb(256)
///     .with_device_fraction(0.5);
/// assert_eq!(config.budget_bytes(), 256 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// Residency budget in megabytes
    pub vram_budget_mb: usize,
    /// Optional cap as a fraction of dedicated device memory (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_budget_fraction: Option<f64>,
    /// Size of one sparse texture page in kilobytes
    pub sparse_page_kb: usize,
    /// Memory pressure thresholds
    pub pressure: PressureThresholds,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            vram_budget_mb: 512,
            device_budget_fraction: None,
            sparse_page_kb: 64,
            pressure: PressureThresholds::default(),
        }
    }
}

impl ResidencyConfig {
    /// Sets the budget in megabytes.
    pub fn with_budget_mb(mut self, mb: usize) -> Self {
        self.vram_budget_mb = mb;
        self
    }

    /// Caps the budget by a fraction of dedicated device memory.
    pub fn with_device_fraction(mut self, fraction: f64) -> Self {
        self.device_budget_fraction = Some(fraction.clamp(0.0, 1.0));
        self
    }

    /// Sets the sparse page size in kilobytes (at least 1).
    pub fn with_sparse_page_kb(mut self, kb: usize) -> Self {
        self.sparse_page_kb = kb.max(1);
        self
    }

    /// Sets the memory pressure thresholds.
    pub fn with_pressure(mut self, pressure: PressureThresholds) -> Self {
        self.pressure = pressure.normalized();
        self
    }

    /// Configured budget in bytes, ignoring device memory
    pub fn budget_bytes(&self) -> usize {
        self.vram_budget_mb * MB
    }

    /// Sparse page size in bytes
    pub fn sparse_page_bytes(&self) -> usize {
        self.sparse_page_kb * KB
    }

    /// Budget in bytes after applying the device memory cap, if any
    pub fn effective_budget(&self, info: &MemoryInfo) -> usize {
        match self.device_budget_fraction {
            Some(fraction) => memory_budget::cap_budget(self.budget_bytes(), info, fraction),
            None => self.budget_bytes(),
        }
    }

    /// Returns the default configuration file path for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/lumen/residency.toml
    /// - Linux: ~/.config/lumen/residency.toml
    /// - Windows: %APPDATA%\lumen\residency.toml
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("lumen").join("residency.toml"),
            None => PathBuf::from("residency.toml"),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LUMEN_VRAM_BUDGET_MB`: budget in MB (default: 512)
    /// - `LUMEN_DEVICE_BUDGET_FRACTION`: cap as a fraction of dedicated memory
    /// - `LUMEN_SPARSE_PAGE_KB`: sparse page size in KB (default: 64)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_value::<usize>("LUMEN_VRAM_BUDGET_MB")? {
            config.vram_budget_mb = mb;
        }
        if let Some(fraction) = env_value::<f64>("LUMEN_DEVICE_BUDGET_FRACTION")? {
            check_fraction("LUMEN_DEVICE_BUDGET_FRACTION", fraction)?;
            config.device_budget_fraction = Some(fraction);
        }
        if let Some(kb) = env_value::<usize>("LUMEN_SPARSE_PAGE_KB")? {
            check_page_kb("LUMEN_SPARSE_PAGE_KB", kb)?;
            config.sparse_page_kb = kb;
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// vram_budget_mb = 512
    /// device_budget_fraction = 0.6
    /// sparse_page_kb = 64
    ///
    /// [pressure]
    /// moderate = 0.5
    /// high = 0.75
    /// critical = 0.9
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string. Missing keys keep defaults.
    ///
    /// # Errors
    /// `InvalidValue` for a zero page size or a device fraction outside
    /// 0.0 to 1.0.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        if let Some(fraction) = config.device_budget_fraction {
            check_fraction("device_budget_fraction", fraction)?;
        }
        check_page_kb("sparse_page_kb", config.sparse_page_kb)?;
        config.pressure = config.pressure.normalized();
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn check_fraction(key: &str, fraction: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&fraction) {
        return Ok(());
    }
    Err(ConfigError::InvalidValue {
        key: key.to_string(),
        value: fraction.to_string(),
    })
}

// A zero page size would make every sparse texture free to page in.
fn check_page_kb(key: &str, kb: usize) -> Result<(), ConfigError> {
    if kb > 0 {
        return Ok(());
    }
    Err(ConfigError::InvalidValue {
        key: key.to_string(),
        value: kb.to_string(),
    })
}

fn env_value<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}
