use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::oscillator::OscillatorConfig;
use crate::orchestration::retry::RetryPolicy;
use crate::{clog_debug, Error, Result};

/// Tuning for the orchestrator loop itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval between ticks when driven by `run_until_idle`.
    pub tick_ms: u64,
    /// Per-chunk processing timeout; expiry counts as a failed attempt.
    pub processing_timeout_ms: u64,
    /// How long a chunk may wait for a capable agent before a warning is logged.
    pub unroutable_warn_ms: u64,
    /// Capacity of the optional event channel.
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            processing_timeout_ms: 30_000,
            unroutable_warn_ms: 10_000,
            event_buffer: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn unroutable_warn_after(&self) -> Duration {
        Duration::from_millis(self.unroutable_warn_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Directory for the file-backed record store. Defaults to ~/.cadence/store.
    pub data_dir: Option<String>,
    #[serde(default)]
    pub oscillator: OscillatorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("store")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: cycle_ms={}, max_retries={}, tick_ms={}",
            config.oscillator.cycle_ms,
            config.retry.max_retries,
            config.orchestrator.tick_ms
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::cadence_dir()?;
        if !dir.exists() {
            clog_debug!("Creating cadence directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.oscillator.validate()?;
        if self.retry.multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.orchestrator.tick_ms == 0 {
            return Err(Error::Validation(
                "orchestrator.tick_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
