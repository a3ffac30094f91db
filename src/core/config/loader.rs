#![allow(clippy::result_large_err)]

use super::ChatflowConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from a workspace root (`<root>/chatflow.toml`).
    /// Environment variables override config file values. Missing file
    /// means defaults plus env vars.
    pub fn load_from_workspace(workspace_path: &Path) -> Result<ChatflowConfig, AppError> {
        let config_path = workspace_path.join("chatflow.toml");
        let config_file = Self::load_from_file(&config_path)?;
        let mut config = config_file.unwrap_or_default();
        Self::apply_env_overrides(&mut config);
        super::validation::validate(&config)?;
        Ok(config)
    }

    /// Load config from a specific file path. Returns Ok(None) if the file
    /// does not exist.
    pub fn load_from_file(path: &Path) -> Result<Option<ChatflowConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;
        let config: ChatflowConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
        })?;
        Ok(Some(config))
    }

    /// Environment variables take precedence over config file values.
    fn apply_env_overrides(config: &mut ChatflowConfig) {
        if let Ok(dir) = env::var("CHATFLOW_FLOWS_DIR") {
            config.flows.dir = PathBuf::from(dir);
        }
        if let Ok(level) = env::var("CHATFLOW_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(raw) = env::var("CHATFLOW_MAX_STEPS_PER_TURN") {
            if let Ok(value) = raw.parse::<usize>() {
                config.engine.max_steps_per_turn = value;
            }
        }
        if let Ok(raw) = env::var("CHATFLOW_DEFAULT_MAX_RETRIES") {
            if let Ok(value) = raw.parse::<u32>() {
                config.engine.default_max_retries = value;
            }
        }
        if let Ok(raw) = env::var("CHATFLOW_IDLE_TIMEOUT") {
            config.sweeper.idle_timeout = raw;
        }
        if let Ok(raw) = env::var("CHATFLOW_SWEEP_INTERVAL") {
            config.sweeper.interval = raw;
        }
    }

    /// Documentation for supported environment variables.
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "CHATFLOW_FLOWS_DIR - Override the flow definitions directory",
            "CHATFLOW_LOG_LEVEL - Override the tracing level filter",
            "CHATFLOW_MAX_STEPS_PER_TURN - Override the per-turn step cap",
            "CHATFLOW_DEFAULT_MAX_RETRIES - Override the default reply retry budget",
            "CHATFLOW_IDLE_TIMEOUT - Override the stale-state window (e.g. 30m)",
            "CHATFLOW_SWEEP_INTERVAL - Override the sweep cadence (e.g. 5m)",
        ]
    }
}
