#![allow(clippy::result_large_err)]

use super::ChatflowConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::time::Duration;

/// Validate a loaded configuration.
pub fn validate(config: &ChatflowConfig) -> Result<(), AppError> {
    if config.engine.max_steps_per_turn == 0 {
        return Err(validation_error("engine.max_steps_per_turn must be >= 1"));
    }
    parse_duration(&config.sweeper.idle_timeout, "sweeper.idle_timeout")?;
    parse_duration(&config.sweeper.interval, "sweeper.interval")?;
    Ok(())
}

/// Parse a humantime duration string from the config.
pub fn parse_duration(raw: &str, field: &str) -> Result<Duration, AppError> {
    humantime::parse_duration(raw).map_err(|err| {
        validation_error(format!("{} is not a valid duration ({}): {}", field, raw, err))
    })
}

fn validation_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("FLOW-CFG-001")
}
