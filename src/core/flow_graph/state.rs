#![allow(clippy::result_large_err)] // State APIs return AppError to preserve structured diagnostic context.

use crate::core::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Version embedded in persisted contact flow state rows.
pub const CONTACT_FLOW_STATE_FORMAT_VERSION: &str = "1";

fn default_context_value() -> Value {
    Value::Object(Map::new())
}

/// Durable per-contact flow position: which flow, which step, what context.
/// One row per contact — at most one active flow at a time. "Waiting for a
/// reply" is this row pointing at a question step; no task blocks on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactFlowState {
    #[serde(default)]
    pub format_version: String,
    pub contact_id: String,
    pub flow: Option<String>,
    pub current_step: Option<String>,
    #[serde(default = "default_context_value")]
    pub context: Value,
    /// Failed validation attempts on the current question step.
    #[serde(default)]
    pub retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl ContactFlowState {
    pub fn idle(contact_id: impl Into<String>) -> Self {
        ContactFlowState {
            format_version: CONTACT_FLOW_STATE_FORMAT_VERSION.to_string(),
            contact_id: contact_id.into(),
            flow: None,
            current_step: None,
            context: default_context_value(),
            retries: 0,
            started_at: None,
            last_updated_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.flow.is_none()
    }

    /// Return to idle, dropping the flow position and accumulated context.
    pub fn reset(&mut self) {
        self.flow = None;
        self.current_step = None;
        self.context = default_context_value();
        self.retries = 0;
        self.started_at = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Seam to the state persistence collaborator.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the contact's state, creating an idle row when none exists.
    async fn load(&self, contact_id: &str) -> Result<ContactFlowState, AppError>;

    async fn save(&self, state: &ContactFlowState) -> Result<(), AppError>;

    async fn reset(&self, contact_id: &str) -> Result<(), AppError>;

    /// Contacts with an active flow untouched for at least `idle_for`.
    async fn list_stale(&self, idle_for: Duration) -> Result<Vec<String>, AppError>;
}

/// In-memory state store used by tests and the simulator.
#[derive(Default)]
pub struct MemoryStateStore {
    states: DashMap<String, ContactFlowState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, contact_id: &str) -> Result<ContactFlowState, AppError> {
        Ok(self
            .states
            .get(contact_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| ContactFlowState::idle(contact_id)))
    }

    async fn save(&self, state: &ContactFlowState) -> Result<(), AppError> {
        self.states
            .insert(state.contact_id.clone(), state.clone());
        Ok(())
    }

    async fn reset(&self, contact_id: &str) -> Result<(), AppError> {
        let mut state = self.load(contact_id).await?;
        state.reset();
        self.save(&state).await
    }

    async fn list_stale(&self, idle_for: Duration) -> Result<Vec<String>, AppError> {
        let cutoff = Utc::now() - idle_for;
        Ok(self
            .states
            .iter()
            .filter(|entry| !entry.is_idle() && entry.last_updated_at < cutoff)
            .map(|entry| entry.contact_id.clone())
            .collect())
    }
}

/// Redact sensitive keys in the given JSON value before it is logged.
pub fn redact_value(value: &mut Value, redact_keys: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if should_redact(key, redact_keys) {
                    *child = Value::String("[REDACTED]".to_string());
                    continue;
                }
                redact_value(child, redact_keys);
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, redact_keys);
            }
        }
        _ => {}
    }
}

fn should_redact(key: &str, redact_keys: &[String]) -> bool {
    let key_lower = key.to_lowercase();
    redact_keys
        .iter()
        .any(|pattern| key_lower.contains(&pattern.to_lowercase()))
}

/// Compute the SHA-256 hash encoded as lowercase hex; used to fingerprint
/// loaded flow definitions.
pub fn compute_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
