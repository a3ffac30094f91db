#![allow(clippy::result_large_err)] // Engine APIs return AppError to preserve full turn diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::flow_graph::action::{ActionExecutor, ActionsOutcome};
use crate::core::flow_graph::condition;
use crate::core::flow_graph::context::FlowContext;
use crate::core::flow_graph::registry::{CompiledFlow, FlowRegistry};
use crate::core::flow_graph::schema::{
    ExpectedReply, FallbackAction, FallbackConfig, FlowStep, MessageSpec, ReplyConfig, StepConfig,
};
use crate::core::flow_graph::state::{redact_value, ContactFlowState, StateStore};
use crate::core::flow_graph::template::render_str;
use crate::core::message::{
    Button, InboundMessage, InboundPayload, ListRow, ListSection, MessageSender, OutboundMessage,
    OutboundPayload,
};
use crate::core::notify::NotificationSink;
use crate::core::store::CrmStore;
use crate::core::types::{ErrorCategory, FLAG_NEEDS_HUMAN, KEY_FLOW_RESPONSE_RECEIVED};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{json, Number, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Engine tuning knobs; loaded from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bound on synchronous step advances within one inbound-message turn.
    pub max_steps_per_turn: usize,
    /// Retry budget for question steps that define no fallback of their own.
    pub default_max_retries: u32,
    /// Context keys masked before state is logged.
    pub redact_keys: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_steps_per_turn: 25,
            default_max_retries: 2,
            redact_keys: vec!["token".into(), "password".into(), "secret".into()],
        }
    }
}

/// How an inbound-message turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Idle contact, no trigger matched; nothing happened.
    NoActiveFlow,
    /// A question was sent; the flow waits for the next inbound message.
    AwaitingReply,
    /// No transition matched; the contact stays parked on the current step.
    Parked,
    FlowCompleted,
    /// An action with `on_failure: abort_flow` failed.
    FlowAborted,
    HandedOver,
}

/// Summary of one processed inbound message.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub contact_id: String,
    pub flow: Option<String>,
    pub status: TurnStatus,
    pub steps_visited: Vec<String>,
    pub messages_sent: usize,
}

struct TurnState {
    state: ContactFlowState,
    context: FlowContext,
    steps_visited: Vec<String>,
    messages_sent: usize,
}

impl TurnState {
    fn from_state(state: ContactFlowState) -> Self {
        let context = FlowContext::from_value(state.context.clone());
        TurnState {
            state,
            context,
            steps_visited: Vec::new(),
            messages_sent: 0,
        }
    }

    fn outcome(&self, status: TurnStatus) -> TurnOutcome {
        TurnOutcome {
            contact_id: self.state.contact_id.clone(),
            flow: self.state.flow.clone(),
            status,
            steps_visited: self.steps_visited.clone(),
            messages_sent: self.messages_sent,
        }
    }
}

/// The flow interpreter's orchestrator: one call per inbound message. Loads
/// the contact's durable state, advances the active flow, and persists the
/// new position. A per-contact mutex is held for the whole turn so rapid
/// messages from one contact serialize instead of racing the state row.
pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    states: Arc<dyn StateStore>,
    store: Arc<dyn CrmStore>,
    notifier: Arc<dyn NotificationSink>,
    sender: Arc<dyn MessageSender>,
    executor: ActionExecutor,
    settings: EngineSettings,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FlowEngine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        states: Arc<dyn StateStore>,
        store: Arc<dyn CrmStore>,
        notifier: Arc<dyn NotificationSink>,
        sender: Arc<dyn MessageSender>,
        settings: EngineSettings,
    ) -> Self {
        let executor = ActionExecutor::new(Arc::clone(&store), Arc::clone(&notifier));
        FlowEngine {
            registry,
            states,
            store,
            notifier,
            sender,
            executor,
            settings,
            turn_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    fn turn_lock(&self, contact_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(contact_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one inbound message for its contact.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<TurnOutcome, AppError> {
        let lock = self.turn_lock(&message.contact_id);
        let _guard = lock.lock().await;

        let state = self.states.load(&message.contact_id).await?;
        let outcome = if state.is_idle() {
            self.handle_idle(&message, state).await?
        } else {
            self.handle_running(&message, state).await?
        };
        info!(
            contact = %outcome.contact_id,
            flow = outcome.flow.as_deref().unwrap_or("-"),
            status = ?outcome.status,
            steps = outcome.steps_visited.len(),
            "turn finished"
        );
        Ok(outcome)
    }

    async fn handle_idle(
        &self,
        message: &InboundMessage,
        state: ContactFlowState,
    ) -> Result<TurnOutcome, AppError> {
        let mut turn = TurnState::from_state(state);
        let Some(text) = message.body() else {
            return Ok(turn.outcome(TurnStatus::NoActiveFlow));
        };
        let Some(flow) = self.registry.match_trigger(text) else {
            debug!(contact = %message.contact_id, "no trigger matched");
            return Ok(turn.outcome(TurnStatus::NoActiveFlow));
        };
        info!(contact = %message.contact_id, flow = flow.name(), "flow triggered");
        turn.state.flow = Some(flow.name().to_string());
        turn.state.started_at = Some(chrono::Utc::now());
        turn.context = FlowContext::new();
        turn.context.set(
            "contact_id",
            Value::String(message.contact_id.clone()),
        );
        let entry = flow.entry_step.clone();
        let status = self.run_steps(&flow, &mut turn, message, &entry).await?;
        Ok(turn.outcome(status))
    }

    async fn handle_running(
        &self,
        message: &InboundMessage,
        state: ContactFlowState,
    ) -> Result<TurnOutcome, AppError> {
        let flow_name = state.flow.clone().unwrap_or_default();
        let Some(flow) = self.registry.get(&flow_name) else {
            warn!(flow = %flow_name, contact = %state.contact_id, "active flow no longer loaded, resetting");
            return self.reset_to_idle(state).await;
        };
        let Some(step_name) = state.current_step.clone() else {
            warn!(flow = %flow_name, contact = %state.contact_id, "running state without a current step, resetting");
            return self.reset_to_idle(state).await;
        };
        let Some(step) = flow.step(&step_name) else {
            warn!(flow = %flow_name, step = %step_name, "current step no longer in flow definition, resetting");
            return self.reset_to_idle(state).await;
        };

        let mut turn = TurnState::from_state(state);

        if let InboundPayload::FlowResponse { payload } = &message.payload {
            if let Err(err) = self
                .store
                .record_flow_response(&message.contact_id, payload)
                .await
            {
                warn!(error = %err, "failed to record flow response");
            }
            turn.context.set("flow_response", payload.clone());
            turn.context
                .set(KEY_FLOW_RESPONSE_RECEIVED, Value::Bool(true));
            return match self.next_transition(step, &turn, message) {
                Some(target) => {
                    let status = self.run_steps(&flow, &mut turn, message, &target).await?;
                    Ok(turn.outcome(status))
                }
                None => self.park(&mut turn, &step_name).await,
            };
        }

        match &step.config {
            StepConfig::Question {
                message: prompt,
                reply,
                fallback,
            } => match capture_reply(reply, message) {
                Ok(value) => {
                    turn.context.set(&reply.save_to_variable, value);
                    turn.state.retries = 0;
                    match self.next_transition(step, &turn, message) {
                        Some(target) => {
                            let status =
                                self.run_steps(&flow, &mut turn, message, &target).await?;
                            Ok(turn.outcome(status))
                        }
                        None => self.park(&mut turn, &step_name).await,
                    }
                }
                Err(reason) => {
                    self.handle_validation_failure(
                        &flow,
                        &step_name,
                        prompt,
                        fallback.as_ref(),
                        &mut turn,
                        message,
                        &reason.to_string(),
                    )
                    .await
                }
            },
            // Parked on a non-question step: re-evaluate transitions only.
            // Actions are not re-executed, so replaying a message cannot
            // duplicate side effects.
            _ => match self.next_transition(step, &turn, message) {
                Some(target) => {
                    let status = self.run_steps(&flow, &mut turn, message, &target).await?;
                    Ok(turn.outcome(status))
                }
                None => self.park(&mut turn, &step_name).await,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_validation_failure(
        &self,
        flow: &Arc<CompiledFlow>,
        step_name: &str,
        prompt: &MessageSpec,
        fallback: Option<&FallbackConfig>,
        turn: &mut TurnState,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<TurnOutcome, AppError> {
        let max_retries = fallback
            .map(|f| f.max_retries)
            .unwrap_or(self.settings.default_max_retries);
        turn.state.retries += 1;
        debug!(
            step = %step_name,
            attempt = turn.state.retries,
            max_retries,
            reason,
            "reply failed validation"
        );
        if turn.state.retries <= max_retries {
            match fallback.and_then(|f| f.reprompt_message.as_deref()) {
                Some(reprompt) => {
                    let body = self.render_or_raw(reprompt, &turn.context);
                    self.send(turn, OutboundPayload::Text { body }).await;
                }
                None => self.send_spec(prompt, turn).await,
            }
            turn.state.current_step = Some(step_name.to_string());
            self.persist(turn).await?;
            return Ok(turn.outcome(TurnStatus::AwaitingReply));
        }

        turn.state.retries = 0;
        match fallback.map(|f| f.action.clone()) {
            Some(FallbackAction::Branch { to_step }) => {
                let status = self.run_steps(flow, turn, message, &to_step).await?;
                Ok(turn.outcome(status))
            }
            Some(FallbackAction::EndFlow) => {
                turn.state.reset();
                self.persist(turn).await?;
                Ok(turn.outcome(TurnStatus::FlowCompleted))
            }
            // No fallback configured: escalate to a person rather than
            // re-prompting forever.
            Some(FallbackAction::HumanHandover) | None => {
                self.do_handover(flow, step_name, None, turn).await
            }
        }
    }

    /// Advance through steps starting at `start`, sending messages and
    /// running actions, until the flow needs input or terminates.
    async fn run_steps(
        &self,
        flow: &Arc<CompiledFlow>,
        turn: &mut TurnState,
        message: &InboundMessage,
        start: &str,
    ) -> Result<TurnStatus, AppError> {
        let mut current = start.to_string();
        loop {
            if turn.steps_visited.len() >= self.settings.max_steps_per_turn {
                turn.state.current_step = Some(current.clone());
                self.persist(turn).await?;
                return Err(AppError::new(
                    ErrorCategory::InternalError,
                    format!(
                        "flow '{}' exceeded max_steps_per_turn at step '{}'",
                        flow.name(),
                        current
                    ),
                )
                .with_code("FLOW-ENG-001"));
            }
            let Some(step) = flow.step(&current) else {
                warn!(flow = flow.name(), step = %current, "step vanished from flow, resetting");
                turn.state.reset();
                self.persist(turn).await?;
                return Ok(TurnStatus::NoActiveFlow);
            };
            turn.steps_visited.push(current.clone());
            debug!(
                flow = flow.name(),
                step = %current,
                step_type = step.config.type_name(),
                "entering step"
            );

            match &step.config {
                StepConfig::Question {
                    message: prompt, ..
                } => {
                    self.send_spec(prompt, turn).await;
                    turn.state.current_step = Some(current);
                    turn.state.retries = 0;
                    self.persist(turn).await?;
                    return Ok(TurnStatus::AwaitingReply);
                }
                StepConfig::Action {
                    actions,
                    message: after,
                } => {
                    let outcome = self
                        .executor
                        .run_all(actions, &mut turn.context)
                        .await;
                    if outcome == ActionsOutcome::FlowAborted {
                        turn.state.reset();
                        self.persist(turn).await?;
                        return Ok(TurnStatus::FlowAborted);
                    }
                    if let Some(spec) = after {
                        self.send_spec(spec, turn).await;
                    }
                }
                StepConfig::SendMessage { message: spec } => {
                    self.send_spec(spec, turn).await;
                }
                StepConfig::Condition => {}
                StepConfig::EndFlow { message: spec } => {
                    if let Some(spec) = spec {
                        self.send_spec(spec, turn).await;
                    }
                    turn.state.reset();
                    self.persist(turn).await?;
                    return Ok(TurnStatus::FlowCompleted);
                }
                StepConfig::HumanHandover { message: spec } => {
                    let outcome = self
                        .do_handover(flow, &current, spec.as_ref(), turn)
                        .await?;
                    return Ok(outcome.status);
                }
            }

            match self.next_transition(step, turn, message) {
                Some(target) => current = target,
                None => {
                    turn.state.current_step = Some(current);
                    self.persist(turn).await?;
                    return Ok(TurnStatus::Parked);
                }
            }
        }
    }

    /// First transition whose condition holds, in ascending priority order.
    fn next_transition(
        &self,
        step: &FlowStep,
        turn: &TurnState,
        message: &InboundMessage,
    ) -> Option<String> {
        let mut transitions = step.transitions.clone();
        transitions.sort_by_key(|t| t.priority);
        for transition in transitions {
            if condition::evaluate(&transition.condition, &turn.context, message) {
                return Some(transition.to_step);
            }
        }
        None
    }

    async fn do_handover(
        &self,
        flow: &Arc<CompiledFlow>,
        step_name: &str,
        spec: Option<&MessageSpec>,
        turn: &mut TurnState,
    ) -> Result<TurnOutcome, AppError> {
        if let Some(spec) = spec {
            self.send_spec(spec, turn).await;
        }
        let contact_id = turn.state.contact_id.clone();
        if let Err(err) = self
            .store
            .set_contact_flag(&contact_id, FLAG_NEEDS_HUMAN, true)
            .await
        {
            warn!(error = %err, "failed to flag contact for human intervention");
        }
        if let Err(err) = self
            .notifier
            .notify_admins(
                "human_handover",
                json!({
                    "contact_id": contact_id,
                    "flow": flow.name(),
                    "step": step_name,
                }),
            )
            .await
        {
            warn!(error = %err, "failed to notify admins of handover");
        }
        info!(contact = %contact_id, flow = flow.name(), step = %step_name, "handed over to a person");
        turn.state.reset();
        self.persist(turn).await?;
        Ok(turn.outcome(TurnStatus::HandedOver))
    }

    async fn park(
        &self,
        turn: &mut TurnState,
        step_name: &str,
    ) -> Result<TurnOutcome, AppError> {
        debug!(step = %step_name, "no transition matched, contact stays parked");
        turn.state.current_step = Some(step_name.to_string());
        self.persist(turn).await?;
        Ok(turn.outcome(TurnStatus::Parked))
    }

    async fn reset_to_idle(
        &self,
        mut state: ContactFlowState,
    ) -> Result<TurnOutcome, AppError> {
        state.reset();
        self.states.save(&state).await?;
        let turn = TurnState::from_state(state);
        Ok(turn.outcome(TurnStatus::NoActiveFlow))
    }

    async fn persist(&self, turn: &mut TurnState) -> Result<(), AppError> {
        turn.state.context = turn.context.as_value().clone();
        turn.state.touch();
        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut redacted = turn.state.context.clone();
            redact_value(&mut redacted, &self.settings.redact_keys);
            debug!(
                contact = %turn.state.contact_id,
                step = turn.state.current_step.as_deref().unwrap_or("-"),
                context = %redacted,
                "persisting flow state"
            );
        }
        self.states.save(&turn.state).await
    }

    async fn send_spec(&self, spec: &MessageSpec, turn: &mut TurnState) {
        let payload = self.render_message(spec, &turn.context);
        self.send(turn, payload).await;
    }

    async fn send(&self, turn: &mut TurnState, payload: OutboundPayload) {
        let message = OutboundMessage {
            to_contact: turn.state.contact_id.clone(),
            payload,
        };
        match self.sender.send(message).await {
            Ok(()) => turn.messages_sent += 1,
            Err(err) => warn!(error = %err, "outbound message delivery failed"),
        }
    }

    fn render_message(&self, spec: &MessageSpec, context: &FlowContext) -> OutboundPayload {
        match spec {
            MessageSpec::Text { body } => OutboundPayload::Text {
                body: self.render_or_raw(body, context),
            },
            MessageSpec::Buttons { body, buttons } => OutboundPayload::Buttons {
                body: self.render_or_raw(body, context),
                buttons: buttons
                    .iter()
                    .map(|b| Button {
                        id: self.render_or_raw(&b.id, context),
                        title: self.render_or_raw(&b.title, context),
                    })
                    .collect(),
            },
            MessageSpec::List {
                body,
                button,
                sections,
            } => OutboundPayload::List {
                body: self.render_or_raw(body, context),
                button: self.render_or_raw(button, context),
                sections: sections
                    .iter()
                    .map(|section| ListSection {
                        title: self.render_or_raw(&section.title, context),
                        rows: section
                            .rows
                            .iter()
                            .map(|row| ListRow {
                                id: self.render_or_raw(&row.id, context),
                                title: self.render_or_raw(&row.title, context),
                                description: row
                                    .description
                                    .as_deref()
                                    .map(|d| self.render_or_raw(d, context)),
                            })
                            .collect(),
                    })
                    .collect(),
            },
        }
    }

    /// Templates are compiled at load, so render errors here mean the flow
    /// changed underneath us; fall back to the raw source rather than
    /// dropping the message.
    fn render_or_raw(&self, source: &str, context: &FlowContext) -> String {
        match render_str(source, context.as_value()) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(error = %err, "template render failed, sending raw text");
                source.to_string()
            }
        }
    }
}

/// Why a reply failed capture. Logged for operators, never shown to the
/// contact; the contact only ever sees the configured re-prompt.
#[derive(Debug, Error)]
enum CaptureError {
    #[error("expected a button or list selection")]
    ExpectedInteractive,
    #[error("expected a shared location")]
    ExpectedLocation,
    #[error("expected a text reply")]
    ExpectedText,
    #[error("empty reply")]
    EmptyReply,
    #[error("expected a numeric reply")]
    ExpectedNumber,
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("expected an email reply")]
    ExpectedEmail,
    #[error("'{0}' is not an email address")]
    NotAnEmail(String),
    #[error("reply did not match {0}")]
    RegexMismatch(String),
}

/// Capture and validate a reply per the question's `reply` config.
fn capture_reply(config: &ReplyConfig, message: &InboundMessage) -> Result<Value, CaptureError> {
    let (raw, value) = match config.expected_type {
        ExpectedReply::InteractiveId => match message.interactive_reply_id() {
            Some(id) => (id.to_string(), Value::String(id.to_string())),
            None => return Err(CaptureError::ExpectedInteractive),
        },
        ExpectedReply::Location => match &message.payload {
            InboundPayload::Location {
                latitude,
                longitude,
                name,
            } => (
                format!("{},{}", latitude, longitude),
                json!({
                    "latitude": latitude,
                    "longitude": longitude,
                    "name": name,
                }),
            ),
            _ => return Err(CaptureError::ExpectedLocation),
        },
        ExpectedReply::Text => {
            let text = match &message.payload {
                InboundPayload::Text { body } => body.trim().to_string(),
                InboundPayload::InteractiveReply { id, .. } => id.trim().to_string(),
                _ => return Err(CaptureError::ExpectedText),
            };
            if text.is_empty() {
                return Err(CaptureError::EmptyReply);
            }
            (text.clone(), Value::String(text))
        }
        ExpectedReply::Number => {
            let text = message
                .body()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(CaptureError::ExpectedNumber)?;
            let value = if let Ok(int) = text.parse::<i64>() {
                Value::Number(Number::from(int))
            } else if let Ok(float) = text.parse::<f64>() {
                Number::from_f64(float)
                    .map(Value::Number)
                    .ok_or(CaptureError::ExpectedNumber)?
            } else {
                return Err(CaptureError::NotANumber(text.to_string()));
            };
            (text.to_string(), value)
        }
        ExpectedReply::Email => {
            let text = message
                .body()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(CaptureError::ExpectedEmail)?;
            let looks_like_email = match Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$") {
                Ok(re) => re.is_match(text),
                Err(_) => true,
            };
            if !looks_like_email {
                return Err(CaptureError::NotAnEmail(text.to_string()));
            }
            (text.to_string(), Value::String(text.to_lowercase()))
        }
    };

    if let Some(pattern) = &config.validation_regex {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(&raw) {
                    return Err(CaptureError::RegexMismatch(pattern.clone()));
                }
            }
            Err(err) => {
                // Validated at load; a failure here means the definition
                // changed underneath us. Accept the reply rather than trap
                // the contact.
                warn!(error = %err, "validation_regex no longer compiles, skipping check");
            }
        }
    }
    Ok(value)
}
