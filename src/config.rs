use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::estimate::DEFAULT_EFFORT_MINUTES;
use crate::orchestration::ExecutorConfig;
use crate::{wlog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimatorConfig {
    /// Minutes assumed for subtasks without an effort estimate.
    #[serde(default = "default_minutes")]
    pub default_minutes: u32,
}

fn default_minutes() -> u32 {
    DEFAULT_EFFORT_MINUTES
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_minutes(),
        }
    }
}

impl Config {
    pub fn wavefront_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".wavefront"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::wavefront_dir()?.join("config.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.executor.validate()?;
        wlog_debug!(
            "Config loaded: max_concurrency={}, failure_mode={}, timeout_ms={}",
            config.executor.max_concurrency,
            config.executor.failure_mode,
            config.executor.subtask_timeout_ms
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                wlog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
