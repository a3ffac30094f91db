use crate::core::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

/// One inbound WhatsApp event as delivered by the webhook-handling collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub contact_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: InboundPayload,
}

impl InboundMessage {
    pub fn text(contact_id: impl Into<String>, body: impl Into<String>) -> Self {
        InboundMessage {
            contact_id: contact_id.into(),
            timestamp: Utc::now(),
            payload: InboundPayload::Text { body: body.into() },
        }
    }

    pub fn interactive_reply(
        contact_id: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        InboundMessage {
            contact_id: contact_id.into(),
            timestamp: Utc::now(),
            payload: InboundPayload::InteractiveReply {
                id: id.into(),
                title: title.into(),
            },
        }
    }

    pub fn flow_response(contact_id: impl Into<String>, payload: Value) -> Self {
        InboundMessage {
            contact_id: contact_id.into(),
            timestamp: Utc::now(),
            payload: InboundPayload::FlowResponse { payload },
        }
    }

    /// Free-text body, if this message carries one.
    pub fn body(&self) -> Option<&str> {
        match &self.payload {
            InboundPayload::Text { body } => Some(body.as_str()),
            _ => None,
        }
    }

    /// Button/list reply id, if this message is an interactive reply.
    pub fn interactive_reply_id(&self) -> Option<&str> {
        match &self.payload {
            InboundPayload::InteractiveReply { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPayload {
    Text {
        body: String,
    },
    InteractiveReply {
        id: String,
        title: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        name: Option<String>,
    },
    /// Structured submission from WhatsApp's native Flow UI.
    FlowResponse {
        payload: Value,
    },
}

/// Outbound message request handed to the WhatsApp-sending collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to_contact: String,
    pub payload: OutboundPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        body: String,
    },
    Buttons {
        body: String,
        buttons: Vec<Button>,
    },
    List {
        body: String,
        button: String,
        sections: Vec<ListSection>,
    },
}

impl OutboundPayload {
    pub fn body(&self) -> &str {
        match self {
            OutboundPayload::Text { body } => body,
            OutboundPayload::Buttons { body, .. } => body,
            OutboundPayload::List { body, .. } => body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Seam to the message-delivery collaborator.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), AppError>;
}

/// Sender that records every message; used by tests and the simulator.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("sender lock poisoned").clone()
    }

    pub fn last_body(&self) -> Option<String> {
        self.sent
            .lock()
            .expect("sender lock poisoned")
            .last()
            .map(|m| m.payload.body().to_string())
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), AppError> {
        self.sent.lock().expect("sender lock poisoned").push(message);
        Ok(())
    }
}
