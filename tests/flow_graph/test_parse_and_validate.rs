use chatflow::core::flow_graph::schema::{self, FlowDocument, StepConfig};
use std::fs;
use tempfile::TempDir;

const VALID_FLOW: &str = r#"{
    "name": "warranty_claim",
    "friendly_name": "Warranty Claim",
    "trigger_keywords": ["warranty", "claim"],
    "steps": [
        {
            "name": "ask_order_number",
            "is_entry_point": true,
            "step_type": "question",
            "message": {"message_type": "text", "body": "What is your order number?"},
            "reply": {"save_to_variable": "order_number"},
            "transitions": [
                {"to_step": "confirm", "priority": 10}
            ]
        },
        {
            "name": "confirm",
            "step_type": "end_flow",
            "message": {"message_type": "text", "body": "Thanks, we logged {{ order_number }}."}
        }
    ]
}"#;

#[test]
fn valid_flow_parses_and_validates() {
    let flow = FlowDocument::from_json_str(VALID_FLOW);
    assert!(flow.is_ok());
    let flow = flow.unwrap();
    assert_eq!(flow.entry_step().unwrap().name, "ask_order_number");
}

#[test]
fn yaml_flow_loads_from_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("greeting.yaml");
    fs::write(
        &path,
        r#"
name: greeting
trigger_keywords: [hello]
steps:
  - name: say_hello
    is_entry_point: true
    step_type: end_flow
    message:
      message_type: text
      body: "Hello there"
"#,
    )
    .unwrap();
    let flow = schema::load_flow(&path);
    assert!(flow.is_ok());
}

#[test]
fn unknown_transition_target_reports_error() {
    let raw = VALID_FLOW.replace("\"to_step\": \"confirm\"", "\"to_step\": \"missing\"");
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("unknown step"));
}

#[test]
fn two_entry_points_are_rejected() {
    let raw = VALID_FLOW.replace(
        "\"name\": \"confirm\",",
        "\"name\": \"confirm\", \"is_entry_point\": true,",
    );
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("exactly one entry point"));
}

#[test]
fn no_entry_point_is_rejected() {
    let raw = VALID_FLOW.replace("\"is_entry_point\": true,", "");
    assert!(FlowDocument::from_json_str(&raw).is_err());
}

#[test]
fn unknown_step_type_tag_is_rejected() {
    let raw = VALID_FLOW.replace("\"step_type\": \"end_flow\"", "\"step_type\": \"teleport\"");
    assert!(FlowDocument::from_json_str(&raw).is_err());
}

#[test]
fn unknown_condition_tag_is_rejected() {
    let raw = VALID_FLOW.replace(
        "{\"to_step\": \"confirm\", \"priority\": 10}",
        "{\"to_step\": \"confirm\", \"condition\": {\"type\": \"phase_of_moon\"}}",
    );
    assert!(FlowDocument::from_json_str(&raw).is_err());
}

#[test]
fn invalid_template_syntax_is_rejected_at_load() {
    let raw = VALID_FLOW.replace("{{ order_number }}", "{% for x %}");
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("invalid template"));
}

#[test]
fn invalid_validation_regex_is_rejected_at_load() {
    let raw = VALID_FLOW.replace(
        "\"reply\": {\"save_to_variable\": \"order_number\"}",
        "\"reply\": {\"save_to_variable\": \"order_number\", \"validation_regex\": \"([\"}",
    );
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("validation_regex"));
}

#[test]
fn undeclared_variables_are_caught_when_declared_list_present() {
    let raw = VALID_FLOW.replace(
        "\"trigger_keywords\": [\"warranty\", \"claim\"],",
        "\"trigger_keywords\": [\"warranty\", \"claim\"], \"declared_variables\": [\"order_number\"],",
    );
    assert!(FlowDocument::from_json_str(&raw).is_ok());

    let raw = raw.replace("{{ order_number }}", "{{ order_numbr }}");
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("undeclared variable 'order_numbr'"));
}

#[test]
fn fallback_branch_target_must_exist() {
    let raw = VALID_FLOW.replace(
        "\"reply\": {\"save_to_variable\": \"order_number\"}",
        concat!(
            "\"reply\": {\"save_to_variable\": \"order_number\"},",
            "\"fallback\": {\"max_retries\": 1, \"action\": {\"type\": \"branch\", \"to_step\": \"nowhere\"}}"
        ),
    );
    let err = FlowDocument::from_json_str(&raw).err().unwrap();
    assert!(err.message.contains("unknown step"));
}

#[test]
fn step_types_expose_their_names() {
    let flow = FlowDocument::from_json_str(VALID_FLOW).unwrap();
    let types: Vec<&str> = flow.steps.iter().map(|s| s.config.type_name()).collect();
    assert_eq!(types, vec!["question", "end_flow"]);
    assert!(matches!(
        flow.steps[1].config,
        StepConfig::EndFlow { .. }
    ));
}
