use serde::{Deserialize, Serialize};

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    ValidationError,
    TemplateError,
    ActionExecutionError,
    StoreError,
    NotificationError,
    StateError,
    TimeoutError,
    SerializationError,
    IoError,
    InternalError,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error severity enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Error,
    Warning,
    Info,
    Debug,
}

/// Contact flag set through the CRM store when a conversation needs a person.
pub const FLAG_NEEDS_HUMAN: &str = "needs_human_intervention";

/// Context key set when a native WhatsApp Flow submission has been processed.
pub const KEY_FLOW_RESPONSE_RECEIVED: &str = "whatsapp_flow_response_received";
