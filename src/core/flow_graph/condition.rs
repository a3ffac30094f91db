use crate::core::flow_graph::context::{stringify, FlowContext};
use crate::core::message::InboundMessage;
use crate::core::types::KEY_FLOW_RESPONSE_RECEIVED;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guard attached to a transition. A closed set: an unrecognized tag fails
/// at flow load, never at evaluation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    #[default]
    AlwaysTrue,
    /// Context holds a non-empty value at the dotted path.
    VariableExists { variable: String },
    /// Stringified context value at the path equals the literal.
    VariableEquals { variable: String, value: String },
    /// Latest inbound button/list reply id equals the literal.
    InteractiveReplyIdEquals { value: String },
    /// Latest inbound free text equals the keyword, trimmed, case-insensitive.
    UserReplyMatchesKeyword { keyword: String },
    /// A native WhatsApp Flow submission was processed this conversation.
    WhatsappFlowResponseReceived,
}

impl ConditionConfig {
    /// Root context variables this condition reads; feeds the
    /// declared-variable check at flow load.
    pub fn read_variables(&self) -> Vec<String> {
        match self {
            ConditionConfig::VariableExists { variable }
            | ConditionConfig::VariableEquals { variable, .. } => {
                vec![root_segment(variable)]
            }
            _ => Vec::new(),
        }
    }

    /// Short human-readable form used by DOT export and logs.
    pub fn summary(&self) -> String {
        match self {
            ConditionConfig::AlwaysTrue => "always".to_string(),
            ConditionConfig::VariableExists { variable } => format!("exists({})", variable),
            ConditionConfig::VariableEquals { variable, value } => {
                format!("{} == {:?}", variable, value)
            }
            ConditionConfig::InteractiveReplyIdEquals { value } => {
                format!("reply_id == {:?}", value)
            }
            ConditionConfig::UserReplyMatchesKeyword { keyword } => {
                format!("reply ~= {:?}", keyword)
            }
            ConditionConfig::WhatsappFlowResponseReceived => "flow_response".to_string(),
        }
    }
}

fn root_segment(path: &str) -> String {
    path.split('.').next().unwrap_or(path).to_string()
}

/// Evaluate one condition against the context and the turn's inbound message.
pub fn evaluate(
    condition: &ConditionConfig,
    context: &FlowContext,
    inbound: &InboundMessage,
) -> bool {
    match condition {
        ConditionConfig::AlwaysTrue => true,
        ConditionConfig::VariableExists { variable } => context.has_non_empty(variable),
        ConditionConfig::VariableEquals { variable, value } => {
            let current = context
                .get(variable)
                .map(stringify)
                .unwrap_or_default();
            current == *value
        }
        ConditionConfig::InteractiveReplyIdEquals { value } => inbound
            .interactive_reply_id()
            .map(|id| id == value)
            .unwrap_or(false),
        ConditionConfig::UserReplyMatchesKeyword { keyword } => inbound
            .body()
            .map(|body| body.trim().eq_ignore_ascii_case(keyword.trim()))
            .unwrap_or(false),
        ConditionConfig::WhatsappFlowResponseReceived => context
            .get(KEY_FLOW_RESPONSE_RECEIVED)
            .map(|value| matches!(value, Value::Bool(true)))
            .unwrap_or(false),
    }
}
