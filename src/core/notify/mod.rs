use crate::core::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// One enqueued notification, as handed to the notification collaborator.
#[derive(Debug, Clone)]
pub struct Notification {
    pub template_name: String,
    pub recipients: Recipients,
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Admins,
    Group(String),
}

/// Seam to the notification collaborator. Fire-and-forget from the flow
/// engine's point of view; delivery retries belong to the collaborator.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_admins(&self, template_name: &str, context: Value) -> Result<(), AppError>;

    async fn notify_group(
        &self,
        group: &str,
        template_name: &str,
        context: Value,
    ) -> Result<(), AppError>;
}

/// Sink that records every notification; used by tests and the simulator.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .expect("sink lock poisoned")
            .clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify_admins(&self, template_name: &str, context: Value) -> Result<(), AppError> {
        self.notifications
            .lock()
            .expect("sink lock poisoned")
            .push(Notification {
                template_name: template_name.to_string(),
                recipients: Recipients::Admins,
                context,
            });
        Ok(())
    }

    async fn notify_group(
        &self,
        group: &str,
        template_name: &str,
        context: Value,
    ) -> Result<(), AppError> {
        self.notifications
            .lock()
            .expect("sink lock poisoned")
            .push(Notification {
                template_name: template_name.to_string(),
                recipients: Recipients::Group(group.to_string()),
                context,
            });
        Ok(())
    }
}
