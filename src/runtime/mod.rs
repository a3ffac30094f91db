pub mod sweeper;

pub use sweeper::IdleSweeper;

use crate::core::flow_graph::engine::FlowEngine;
use crate::core::message::InboundMessage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;

/// Dispatch one inbound message as its own task: one message, one turn. The
/// engine's per-contact mutex serializes turns for the same contact, so
/// concurrent dispatch is safe.
pub fn spawn_turn(engine: Arc<FlowEngine>, message: InboundMessage) -> JoinHandle<()> {
    tokio::spawn(async move {
        let contact_id = message.contact_id.clone();
        if let Err(err) = engine.handle_inbound(message).await {
            error!(contact = %contact_id, error = %err, "turn processing failed");
        }
    })
}
