//! Pipeline configuration: installation layout, timings, automation.
//!
//! Values come from defaults, then an optional TOML file, then CLI flags.

use crate::engine::automation::AutomationParams;
use crate::orchestrator::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "BIOQUANT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Installation root holding the engine folder and the report.
    pub root: PathBuf,
    /// Engine folder name under `root`.
    pub engine_dir: String,
    /// Executable file name inside the engine folder.
    pub executable: String,
    /// Report file stem; `.csv` is appended.
    pub report_name: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub automation: AutomationParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            engine_dir: "GelNestOrganoidV3".to_string(),
            executable: default_executable().to_string(),
            report_name: "BioQuant_Final_Report".to_string(),
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            automation: AutomationParams::default(),
        }
    }
}

fn default_executable() -> &'static str {
    if cfg!(windows) {
        "GelNestOrganoidV3.exe"
    } else {
        "GelNestOrganoidV3"
    }
}

impl PipelineConfig {
    pub fn engine_path(&self) -> PathBuf {
        self.root.join(&self.engine_dir)
    }

    pub fn executable_path(&self) -> PathBuf {
        self.engine_path().join(&self.executable)
    }

    pub fn image_dir(&self) -> PathBuf {
        self.engine_path().join("img")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.engine_path().join("outputs")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join(format!("{}.csv", self.report_name))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_factor must be a finite number >= 1".into(),
            ));
        }
        let c = self.automation.confidence;
        if !c.is_finite() || c < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "automation.confidence must be a non-negative number, got {c}"
            )));
        }
        if self.engine_dir.trim().is_empty() || self.executable.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "engine_dir and executable must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Config file search order: explicit path, `$BIOQUANT_CONFIG`, user config dir.
    /// Only the explicit path is required to exist.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            let p = PathBuf::from(p);
            if p.exists() {
                return Some(p);
            }
            tracing::warn!(path = %p.display(), "{CONFIG_ENV} points to a missing file, ignoring");
        }
        dirs::config_dir()
            .map(|d| d.join("bioquant").join("config.toml"))
            .filter(|p| p.exists())
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::locate(explicit) {
            Some(path) => {
                let cfg = Self::load_from_file(&path)?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
