//! Tuning configuration for the dynamic sleep algorithm.
//!
//! This module handles loading, saving, and validating the settings that
//! shape the controller: whether it is enabled, where new buses start, how
//! often and over what window the baseline is re-tuned, and the thresholds
//! that classify a window as troubled or clean.

use crate::error::ConfigError;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::persistence::write_atomic;
use crate::steps::{multiplier_to_step, Step};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Directory name used below the XDG config and cache homes.
pub const APP_DIR: &str = "ddc-dsa";

/// Where `retry_loop_step` returns after an operation fails outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReset {
    /// Back to the bus's own tuned baseline.
    #[default]
    CurrentStep,
    /// Back to the global initial step, discarding per-bus tuning for the
    /// next operation.
    InitialStep,
}

/// Limits used to judge a window of recent operations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// A window whose worst operation needed more tries than this is troubled.
    pub greatest_tries_upper_bound: u32,
    /// A window averaging more tries per operation than this is troubled.
    pub average_tries_upper_bound: f64,
    /// A successful operation needing more tries than this promotes the
    /// escalated step to the baseline immediately.
    pub promote_above_tries: u32,
    /// A successful operation needing more tries than this (but not enough to
    /// promote) only counts down the adjustment interval. Operations at or
    /// below it re-tune immediately; 0 routes every operation through the
    /// interval countdown.
    pub gate_above_tries: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            greatest_tries_upper_bound: 3,
            average_tries_upper_bound: 1.4,
            promote_above_tries: 3,
            gate_above_tries: 2,
        }
    }
}

impl Thresholds {
    /// Average bound scaled by 10 for integer comparison.
    pub fn average_upper_bound_10(&self) -> u32 {
        (self.average_tries_upper_bound * 10.0).round() as u32
    }
}

/// Dynamic sleep configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    pub enabled: bool,
    /// Multiplier new buses start from.
    pub initial_multiplier: f64,
    /// Qualifying operations between baseline re-tuning passes.
    pub adjustment_interval: u32,
    /// Records examined by each re-tuning pass.
    pub lookback: usize,
    /// Records retained per bus.
    pub history_capacity: usize,
    pub thresholds: Thresholds,
    pub failure_reset: FailureReset,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_multiplier: 1.0,
            adjustment_interval: 3,
            lookback: 5,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            thresholds: Thresholds::default(),
            failure_reset: FailureReset::default(),
        }
    }
}

impl TuningConfig {
    /// Step corresponding to `initial_multiplier`.
    pub fn initial_step(&self) -> Step {
        multiplier_to_step(self.initial_multiplier)
    }

    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.initial_multiplier.is_finite() || self.initial_multiplier < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "initial_multiplier ({}) must be a non-negative number",
                self.initial_multiplier
            )));
        }

        if self.adjustment_interval == 0 {
            return Err(ConfigError::ValidationError(
                "adjustment_interval must be at least 1".to_string(),
            ));
        }

        if self.lookback == 0 {
            return Err(ConfigError::ValidationError(
                "lookback must be at least 1".to_string(),
            ));
        }

        if self.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "history_capacity must be at least 1".to_string(),
            ));
        }

        if self.lookback > self.history_capacity {
            return Err(ConfigError::ValidationError(format!(
                "lookback ({}) cannot be greater than history_capacity ({})",
                self.lookback, self.history_capacity
            )));
        }

        let t = &self.thresholds;
        if !t.average_tries_upper_bound.is_finite() || t.average_tries_upper_bound < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "average_tries_upper_bound ({}) must be at least 1.0",
                t.average_tries_upper_bound
            )));
        }

        if t.greatest_tries_upper_bound == 0 || t.promote_above_tries == 0 {
            return Err(ConfigError::ValidationError(
                "greatest_tries_upper_bound and promote_above_tries must be at least 1".to_string(),
            ));
        }

        if t.gate_above_tries > t.promote_above_tries {
            return Err(ConfigError::ValidationError(format!(
                "gate_above_tries ({}) cannot be greater than promote_above_tries ({})",
                t.gate_above_tries, t.promote_above_tries
            )));
        }

        Ok(())
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<TuningConfig>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: TuningConfig = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            TuningConfig::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let json = {
            let config = self.config.read().map_err(|_| {
                ConfigError::ValidationError("Failed to acquire read lock".to_string())
            })?;
            serde_json::to_string_pretty(&*config).map_err(|e| {
                ConfigError::ParseError(format!("Failed to serialize config: {}", e))
            })?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        write_atomic(&self.path, &temp_path, json.as_bytes())?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> TuningConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| TuningConfig::default())
    }

    /// Update configuration with validation, then persist it.
    pub fn update(&self, config: TuningConfig) -> Result<(), ConfigError> {
        config.validate()?;

        {
            let mut current = self.config.write().map_err(|_| {
                ConfigError::ValidationError("Failed to acquire write lock".to_string())
            })?;
            *current = config;
        }

        self.save()
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default config path (`$XDG_CONFIG_HOME/ddc-dsa/config.json`).
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("config.json"))
            .ok_or(ConfigError::PathUnavailable)
    }
}
