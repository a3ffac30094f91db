pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;

use crate::core::flow_graph::engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `chatflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatflowConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub flows: FlowsSection,
    #[serde(default)]
    pub sweeper: SweeperSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub redaction: RedactionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    pub max_steps_per_turn: usize,
    pub default_max_retries: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineSettings::default();
        EngineSection {
            max_steps_per_turn: defaults.max_steps_per_turn,
            default_max_retries: defaults.default_max_retries,
        }
    }
}

impl ChatflowConfig {
    /// Resolve the engine settings from the engine and redaction sections.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_steps_per_turn: self.engine.max_steps_per_turn,
            default_max_retries: self.engine.default_max_retries,
            redact_keys: self.redaction.keys.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowsSection {
    /// Directory of flow definition files (.json/.yaml/.yml).
    pub dir: PathBuf,
}

impl Default for FlowsSection {
    fn default() -> Self {
        FlowsSection {
            dir: PathBuf::from("flows"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSection {
    /// Inactivity window after which an active flow is reset, humantime form.
    pub idle_timeout: String,
    /// Sweep cadence, humantime form.
    pub interval: String,
}

impl Default for SweeperSection {
    fn default() -> Self {
        SweeperSection {
            idle_timeout: "30m".to_string(),
            interval: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    pub file_enabled: bool,
    pub file_path: PathBuf,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: "info".to_string(),
            file_enabled: false,
            file_path: PathBuf::from("logs/chatflow.log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionSection {
    pub keys: Vec<String>,
}

impl Default for RedactionSection {
    fn default() -> Self {
        RedactionSection {
            keys: vec!["token".into(), "password".into(), "secret".into()],
        }
    }
}
