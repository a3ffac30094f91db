use chatflow::core::flow_graph::condition::{evaluate, ConditionConfig};
use chatflow::core::flow_graph::context::FlowContext;
use chatflow::core::message::InboundMessage;
use serde_json::json;

fn ctx(value: serde_json::Value) -> FlowContext {
    FlowContext::from_value(value)
}

#[test]
fn always_true_matches_anything() {
    let inbound = InboundMessage::text("c1", "whatever");
    assert!(evaluate(&ConditionConfig::AlwaysTrue, &ctx(json!({})), &inbound));
}

#[test]
fn variable_exists_requires_a_non_empty_value() {
    let inbound = InboundMessage::text("c1", "x");
    let condition = ConditionConfig::VariableExists {
        variable: "cart_items".to_string(),
    };
    assert!(!evaluate(&condition, &ctx(json!({})), &inbound));
    assert!(!evaluate(&condition, &ctx(json!({"cart_items": []})), &inbound));
    assert!(!evaluate(&condition, &ctx(json!({"cart_items": ""})), &inbound));
    assert!(evaluate(
        &condition,
        &ctx(json!({"cart_items": [{"name": "Panel"}]})),
        &inbound
    ));
}

#[test]
fn variable_exists_follows_dotted_paths() {
    let inbound = InboundMessage::text("c1", "x");
    let condition = ConditionConfig::VariableExists {
        variable: "found_product.name".to_string(),
    };
    assert!(evaluate(
        &condition,
        &ctx(json!({"found_product": {"name": "Panel"}})),
        &inbound
    ));
    assert!(!evaluate(
        &condition,
        &ctx(json!({"found_product": {}})),
        &inbound
    ));
}

#[test]
fn variable_equals_uses_string_comparison() {
    let inbound = InboundMessage::text("c1", "x");
    let condition = ConditionConfig::VariableEquals {
        variable: "delivery.city".to_string(),
        value: "Harare".to_string(),
    };
    assert!(evaluate(
        &condition,
        &ctx(json!({"delivery": {"city": "Harare"}})),
        &inbound
    ));
    assert!(!evaluate(
        &condition,
        &ctx(json!({"delivery": {"city": "Bulawayo"}})),
        &inbound
    ));
}

#[test]
fn user_reply_keyword_is_trimmed_and_case_insensitive() {
    let condition = ConditionConfig::UserReplyMatchesKeyword {
        keyword: "done".to_string(),
    };
    assert!(evaluate(
        &condition,
        &ctx(json!({})),
        &InboundMessage::text("c1", "  Done  ")
    ));
    assert!(!evaluate(
        &condition,
        &ctx(json!({})),
        &InboundMessage::text("c1", "done please")
    ));
}

#[test]
fn interactive_reply_id_matches_only_interactive_messages() {
    let condition = ConditionConfig::InteractiveReplyIdEquals {
        value: "confirm_install".to_string(),
    };
    assert!(evaluate(
        &condition,
        &ctx(json!({})),
        &InboundMessage::interactive_reply("c1", "confirm_install", "Confirm")
    ));
    assert!(!evaluate(
        &condition,
        &ctx(json!({})),
        &InboundMessage::text("c1", "confirm_install")
    ));
}

#[test]
fn flow_response_flag_must_be_true() {
    let condition = ConditionConfig::WhatsappFlowResponseReceived;
    let inbound = InboundMessage::text("c1", "x");
    assert!(!evaluate(&condition, &ctx(json!({})), &inbound));
    assert!(!evaluate(
        &condition,
        &ctx(json!({"whatsapp_flow_response_received": false})),
        &inbound
    ));
    assert!(evaluate(
        &condition,
        &ctx(json!({"whatsapp_flow_response_received": true})),
        &inbound
    ));
}
