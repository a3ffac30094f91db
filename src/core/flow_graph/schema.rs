#![allow(clippy::result_large_err)] // Schema APIs return AppError to keep structured validation context without boxing.

use crate::core::error::AppError;
use crate::core::flow_graph::action::ActionSpec;
use crate::core::flow_graph::condition::ConditionConfig;
use crate::core::flow_graph::template::Template;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const SUPPORTED_VERSION: &str = "1";

/// Context names the engine itself provides; always allowed even when a flow
/// declares its variables.
const BUILTIN_VARIABLES: &[&str] = &[
    "contact_id",
    "whatsapp_flow_response_received",
    "flow_response",
    "loop",
];

fn default_version() -> String {
    SUPPORTED_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_trigger_priority() -> i32 {
    100
}

fn default_transition_priority() -> i32 {
    100
}

fn default_max_retries() -> u32 {
    2
}

/// One named, versioned conversation definition: a graph of steps joined by
/// prioritized, condition-guarded transitions. Read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub friendly_name: String,
    /// Keywords that activate this flow from an idle conversation.
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    /// Tie-break when several active flows share a keyword: lower wins,
    /// then flow name.
    #[serde(default = "default_trigger_priority")]
    pub trigger_priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// When present, every context variable the flow touches must appear
    /// here; catches template typos at load time.
    #[serde(default)]
    pub declared_variables: Option<Vec<String>>,
    pub steps: Vec<FlowStep>,
}

/// One node in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    #[serde(default)]
    pub is_entry_point: bool,
    #[serde(flatten)]
    pub config: StepConfig,
    #[serde(default)]
    pub transitions: Vec<FlowTransition>,
}

/// Step behavior, keyed by `step_type`. Closed set: an unknown tag fails at
/// flow load rather than at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Send a prompt, then wait for and capture the contact's reply.
    Question {
        message: MessageSpec,
        reply: ReplyConfig,
        #[serde(default)]
        fallback: Option<FallbackConfig>,
    },
    /// Run side effects, optionally sending a message afterwards.
    Action {
        #[serde(default)]
        actions: Vec<ActionSpec>,
        #[serde(default)]
        message: Option<MessageSpec>,
    },
    SendMessage {
        message: MessageSpec,
    },
    /// Pure branch node: evaluates transitions only.
    Condition,
    HumanHandover {
        #[serde(default)]
        message: Option<MessageSpec>,
    },
    EndFlow {
        #[serde(default)]
        message: Option<MessageSpec>,
    },
}

impl StepConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepConfig::Question { .. } => "question",
            StepConfig::Action { .. } => "action",
            StepConfig::SendMessage { .. } => "send_message",
            StepConfig::Condition => "condition",
            StepConfig::HumanHandover { .. } => "human_handover",
            StepConfig::EndFlow { .. } => "end_flow",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepConfig::HumanHandover { .. } | StepConfig::EndFlow { .. }
        )
    }

    pub fn actions(&self) -> &[ActionSpec] {
        match self {
            StepConfig::Action { actions, .. } => actions,
            _ => &[],
        }
    }

    pub fn message_specs(&self) -> Vec<&MessageSpec> {
        match self {
            StepConfig::Question { message, .. } | StepConfig::SendMessage { message } => {
                vec![message]
            }
            StepConfig::Action { message, .. }
            | StepConfig::HumanHandover { message }
            | StepConfig::EndFlow { message } => message.iter().collect(),
            StepConfig::Condition => Vec::new(),
        }
    }
}

/// Outbound message shape; every string is a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageSpec {
    Text {
        body: String,
    },
    Buttons {
        body: String,
        buttons: Vec<ButtonSpec>,
    },
    List {
        body: String,
        button: String,
        sections: Vec<SectionSpec>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    pub title: String,
    pub rows: Vec<RowSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl MessageSpec {
    /// All template strings in this message, for load-time compilation.
    pub fn template_strings(&self) -> Vec<&str> {
        match self {
            MessageSpec::Text { body } => vec![body.as_str()],
            MessageSpec::Buttons { body, buttons } => {
                let mut out = vec![body.as_str()];
                for button in buttons {
                    out.push(button.id.as_str());
                    out.push(button.title.as_str());
                }
                out
            }
            MessageSpec::List {
                body,
                button,
                sections,
            } => {
                let mut out = vec![body.as_str(), button.as_str()];
                for section in sections {
                    out.push(section.title.as_str());
                    for row in &section.rows {
                        out.push(row.id.as_str());
                        out.push(row.title.as_str());
                        if let Some(description) = &row.description {
                            out.push(description.as_str());
                        }
                    }
                }
                out
            }
        }
    }
}

/// How a question step captures the contact's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    pub save_to_variable: String,
    #[serde(default)]
    pub expected_type: ExpectedReply,
    #[serde(default)]
    pub validation_regex: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReply {
    #[default]
    Text,
    Number,
    Email,
    InteractiveId,
    Location,
}

/// What to do when a reply keeps failing validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Sent instead of the question message on a failed attempt. When
    /// absent the question message is repeated.
    #[serde(default)]
    pub reprompt_message: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub action: FallbackAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackAction {
    Branch { to_step: String },
    HumanHandover,
    EndFlow,
}

/// Guarded edge between steps. Lower priority evaluates first; the first
/// condition that holds is taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTransition {
    pub to_step: String,
    #[serde(default = "default_transition_priority")]
    pub priority: i32,
    #[serde(default)]
    pub condition: ConditionConfig,
}

impl FlowDocument {
    /// Load and validate a flow document. JSON and YAML files are accepted,
    /// keyed off the file extension.
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read {}: {}", path.display(), err),
            )
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let doc: FlowDocument = if is_yaml {
            serde_yaml::from_str(&text).map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("failed to parse {}: {}", path.display(), err),
                )
            })?
        } else {
            serde_json::from_str(&text).map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("failed to parse {}: {}", path.display(), err),
                )
            })?
        };
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_json_str(text: &str) -> Result<Self, AppError> {
        let doc: FlowDocument = serde_json::from_str(text).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("failed to parse flow document: {}", err),
            )
        })?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn entry_step(&self) -> Option<&FlowStep> {
        self.steps.iter().find(|step| step.is_entry_point)
    }

    /// Validate the flow against schema requirements.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.version != SUPPORTED_VERSION {
            return Err(validation_error(format!(
                "unsupported flow version {}, expected {}",
                self.version, SUPPORTED_VERSION
            )));
        }
        if self.name.trim().is_empty() {
            return Err(validation_error("flow name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(validation_error(format!(
                "flow '{}' must define at least one step",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(validation_error(format!(
                    "flow '{}' has a step with an empty name",
                    self.name
                )));
            }
            if !names.insert(step.name.clone()) {
                return Err(validation_error(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
        }

        let entry_count = self.steps.iter().filter(|s| s.is_entry_point).count();
        if entry_count != 1 {
            return Err(validation_error(format!(
                "flow '{}' must have exactly one entry point step, found {}",
                self.name, entry_count
            )));
        }

        for step in &self.steps {
            for transition in &step.transitions {
                if !names.contains(&transition.to_step) {
                    return Err(validation_error(format!(
                        "transition from '{}' references unknown step: {}",
                        step.name, transition.to_step
                    )));
                }
            }
            if let StepConfig::Question { reply, fallback, .. } = &step.config {
                if reply.save_to_variable.trim().is_empty() {
                    return Err(validation_error(format!(
                        "question step '{}' has an empty save_to_variable",
                        step.name
                    )));
                }
                if let Some(pattern) = &reply.validation_regex {
                    regex::Regex::new(pattern).map_err(|err| {
                        validation_error(format!(
                            "step '{}' has an invalid validation_regex: {}",
                            step.name, err
                        ))
                    })?;
                }
                if let Some(FallbackConfig {
                    action: FallbackAction::Branch { to_step },
                    ..
                }) = fallback
                {
                    if !names.contains(to_step) {
                        return Err(validation_error(format!(
                            "fallback of step '{}' references unknown step: {}",
                            step.name, to_step
                        )));
                    }
                }
            }
        }

        self.compile_templates()?;
        self.check_declared_variables()?;
        Ok(())
    }

    /// Compile every template string so syntax errors surface at load time.
    fn compile_templates(&self) -> Result<Vec<Template>, AppError> {
        let mut compiled = Vec::new();
        for step in &self.steps {
            for source in self.step_template_strings(step) {
                let template = Template::compile(source).map_err(|err| {
                    validation_error(format!(
                        "step '{}' has an invalid template: {}",
                        step.name, err.message
                    ))
                })?;
                compiled.push(template);
            }
        }
        Ok(compiled)
    }

    fn step_template_strings<'a>(&self, step: &'a FlowStep) -> Vec<&'a str> {
        let mut out = Vec::new();
        for spec in step.config.message_specs() {
            out.extend(spec.template_strings());
        }
        for action in step.config.actions() {
            out.extend(action.template_strings());
        }
        if let StepConfig::Question {
            fallback: Some(fallback),
            ..
        } = &step.config
        {
            if let Some(reprompt) = &fallback.reprompt_message {
                out.push(reprompt.as_str());
            }
        }
        out
    }

    /// When `declared_variables` is present, every variable the flow reads
    /// or writes must be declared (builtins aside).
    fn check_declared_variables(&self) -> Result<(), AppError> {
        let declared = match &self.declared_variables {
            Some(declared) => declared,
            None => return Ok(()),
        };
        let allowed: HashSet<&str> = declared
            .iter()
            .map(String::as_str)
            .chain(BUILTIN_VARIABLES.iter().copied())
            .collect();

        let check = |variable: &str, step: &str| -> Result<(), AppError> {
            let root = variable.split('.').next().unwrap_or(variable);
            if allowed.contains(root) {
                Ok(())
            } else {
                Err(validation_error(format!(
                    "step '{}' references undeclared variable '{}'",
                    step, root
                )))
            }
        };

        for step in &self.steps {
            for source in self.step_template_strings(step) {
                let template = Template::compile(source).map_err(|err| {
                    validation_error(format!(
                        "step '{}' has an invalid template: {}",
                        step.name, err.message
                    ))
                })?;
                for variable in template.referenced_variables() {
                    check(&variable, &step.name)?;
                }
            }
            for transition in &step.transitions {
                for variable in transition.condition.read_variables() {
                    check(&variable, &step.name)?;
                }
            }
            for action in step.config.actions() {
                for variable in action.read_variables() {
                    check(&variable, &step.name)?;
                }
                for variable in action.written_variables() {
                    check(&variable, &step.name)?;
                }
            }
            if let StepConfig::Question { reply, .. } = &step.config {
                check(&reply.save_to_variable, &step.name)?;
            }
        }
        Ok(())
    }
}

fn validation_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("FLOW-SCHEMA-001")
}

/// Load and validate a flow document from a file path.
pub fn load_flow(path: &Path) -> Result<FlowDocument, AppError> {
    FlowDocument::load_from_file(path)
}
