use crate::core::error::AppError;
use crate::core::flow_graph::state::StateStore;
use crate::core::types::ErrorCategory;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Periodically resets contacts whose active flow has gone quiet: a stalled
/// conversation should not hold its flow state forever.
pub struct IdleSweeper {
    states: Arc<dyn StateStore>,
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(states: Arc<dyn StateStore>, idle_timeout: Duration, interval: Duration) -> Self {
        IdleSweeper {
            states,
            idle_timeout,
            interval,
        }
    }

    /// One sweep pass; returns how many contacts were reset.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let idle_for = chrono::Duration::from_std(self.idle_timeout).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("idle_timeout out of range: {}", err),
            )
        })?;
        let stale = self.states.list_stale(idle_for).await?;
        let resets = stale.iter().map(|contact_id| self.states.reset(contact_id));
        for (contact_id, result) in stale.iter().zip(join_all(resets).await) {
            match result {
                Ok(()) => info!(contact = %contact_id, "reset stale flow state"),
                Err(err) => warn!(contact = %contact_id, error = %err, "failed to reset stale state"),
            }
        }
        Ok(stale.len())
    }

    /// Run sweep passes forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                warn!(error = %err, "idle sweep failed");
            }
        }
    }
}
