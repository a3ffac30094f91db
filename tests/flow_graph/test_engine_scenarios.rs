use chatflow::core::flow_graph::engine::{EngineSettings, FlowEngine, TurnOutcome, TurnStatus};
use chatflow::core::flow_graph::registry::FlowRegistry;
use chatflow::core::flow_graph::schema::FlowDocument;
use chatflow::core::flow_graph::state::{MemoryStateStore, StateStore};
use chatflow::core::message::{InboundMessage, RecordingSender};
use chatflow::core::notify::RecordingSink;
use chatflow::core::store::MemoryCrmStore;
use serde_json::json;
use std::sync::Arc;

const LEAD_GENERATION: &str = r#"{
    "name": "lead_generation",
    "friendly_name": "Lead Generation",
    "trigger_keywords": ["buy", "order"],
    "steps": [
        {
            "name": "start_purchase_flow",
            "is_entry_point": true,
            "step_type": "action",
            "actions": [
                {"type": "set_context_variable", "variable": "cart_items", "value": []},
                {"type": "query_model", "model": "product", "result_variable": "products", "limit": 5}
            ],
            "transitions": [
                {"to_step": "show_products"}
            ]
        },
        {
            "name": "show_products",
            "step_type": "question",
            "message": {
                "message_type": "text",
                "body": "Reply with a product number, or 'done' to finish:\n{% for p in products %}{{ loop.index }}. {{ p.name }} (${{ p.price }})\n{% endfor %}"
            },
            "reply": {"save_to_variable": "product_selection"},
            "transitions": [
                {"to_step": "check_cart", "priority": 10,
                 "condition": {"type": "user_reply_matches_keyword", "keyword": "done"}},
                {"to_step": "get_product_from_selection", "priority": 100}
            ]
        },
        {
            "name": "get_product_from_selection",
            "step_type": "action",
            "actions": [
                {"type": "set_context_variable", "variable": "found_product", "value": ""},
                {"type": "select_list_item", "list_variable": "products",
                 "index_variable": "product_selection", "result_variable": "found_product",
                 "on_failure": "abort_step"}
            ],
            "transitions": [
                {"to_step": "ask_for_quantity", "priority": 10,
                 "condition": {"type": "variable_exists", "variable": "found_product"}},
                {"to_step": "show_products", "priority": 100}
            ]
        },
        {
            "name": "ask_for_quantity",
            "step_type": "question",
            "message": {"message_type": "text", "body": "How many {{ found_product.name }}?"},
            "reply": {"save_to_variable": "quantity", "expected_type": "number",
                      "validation_regex": "^[0-9]+$"},
            "fallback": {"reprompt_message": "Please reply with a whole number.",
                         "max_retries": 2,
                         "action": {"type": "branch", "to_step": "show_products"}},
            "transitions": [
                {"to_step": "add_item_to_cart"}
            ]
        },
        {
            "name": "add_item_to_cart",
            "step_type": "action",
            "actions": [
                {"type": "add_cart_item", "cart_variable": "cart_items",
                 "product_variable": "found_product", "quantity_variable": "quantity"}
            ],
            "message": {
                "message_type": "text",
                "body": "Added. Cart so far:\n{% for item in cart_items %}- {{ item.name }} x{{ item.quantity }} = ${{ item.line_total }}\n{% endfor %}"
            },
            "transitions": [
                {"to_step": "show_products"}
            ]
        },
        {
            "name": "check_cart",
            "step_type": "condition",
            "transitions": [
                {"to_step": "ask_delivery_name", "priority": 10,
                 "condition": {"type": "variable_exists", "variable": "cart_items"}},
                {"to_step": "end_flow_cancelled", "priority": 100}
            ]
        },
        {
            "name": "ask_delivery_name",
            "step_type": "question",
            "message": {"message_type": "text", "body": "Great! What full name should we deliver to?"},
            "reply": {"save_to_variable": "delivery_name", "validation_regex": "^.{10,}"},
            "fallback": {"reprompt_message": "Please give the full delivery name (at least 10 characters).",
                         "max_retries": 2,
                         "action": {"type": "human_handover"}},
            "transitions": [
                {"to_step": "create_order"}
            ]
        },
        {
            "name": "create_order",
            "step_type": "action",
            "actions": [
                {"type": "create_order_from_cart", "cart_variable": "cart_items",
                 "result_variable": "order_number",
                 "fields": {"customer_name": "{{ delivery_name }}", "contact_id": "{{ contact_id }}"},
                 "on_failure": "abort_flow"}
            ],
            "transitions": [
                {"to_step": "end_flow_confirmed"}
            ]
        },
        {
            "name": "end_flow_confirmed",
            "step_type": "end_flow",
            "message": {"message_type": "text",
                        "body": "Order {{ order_number }} confirmed for {{ delivery_name|title }}. Thank you!"}
        },
        {
            "name": "end_flow_cancelled",
            "step_type": "end_flow",
            "message": {"message_type": "text",
                        "body": "No items selected, cancelling. Send 'buy' to start again."}
        }
    ]
}"#;

const INSTALLATION_BOOKING: &str = r#"{
    "name": "installation_booking",
    "trigger_keywords": ["install"],
    "steps": [
        {
            "name": "send_form",
            "is_entry_point": true,
            "step_type": "question",
            "message": {"message_type": "text", "body": "Please fill in the installation form."},
            "reply": {"save_to_variable": "form_ack"},
            "transitions": [
                {"to_step": "create_request",
                 "condition": {"type": "whatsapp_flow_response_received"}}
            ]
        },
        {
            "name": "create_request",
            "step_type": "action",
            "actions": [
                {"type": "create_model_instance", "model": "installation_request",
                 "fields": {"contact_id": "{{ contact_id }}",
                            "details": "{{ flow_response.site_details }}"}}
            ],
            "transitions": [
                {"to_step": "done"}
            ]
        },
        {
            "name": "done",
            "step_type": "end_flow",
            "message": {"message_type": "text", "body": "Installation request received."}
        }
    ]
}"#;

struct Harness {
    engine: FlowEngine,
    states: Arc<MemoryStateStore>,
    store: Arc<MemoryCrmStore>,
    sender: Arc<RecordingSender>,
    notifier: Arc<RecordingSink>,
}

fn harness() -> Harness {
    let documents = [LEAD_GENERATION, INSTALLATION_BOOKING]
        .iter()
        .map(|raw| {
            let document = FlowDocument::from_json_str(raw).expect("fixture flow parses");
            (document, raw.as_bytes().to_vec(), None)
        })
        .collect();
    let registry = Arc::new(FlowRegistry::from_documents(documents).expect("registry builds"));
    let states = Arc::new(MemoryStateStore::new());
    let store = Arc::new(MemoryCrmStore::new());
    store.seed(
        "product",
        vec![
            json!({"id": "p1", "name": "Solar Panel 450W", "price": 120}),
            json!({"id": "p2", "name": "Hybrid Inverter", "price": 300}),
            json!({"id": "p3", "name": "Starlink Kit", "price": 450}),
        ],
    );
    let sender = Arc::new(RecordingSender::new());
    let notifier = Arc::new(RecordingSink::new());
    let engine = FlowEngine::new(
        registry,
        states.clone(),
        store.clone(),
        notifier.clone(),
        sender.clone(),
        EngineSettings::default(),
    );
    Harness {
        engine,
        states,
        store,
        sender,
        notifier,
    }
}

impl Harness {
    async fn text(&self, contact: &str, body: &str) -> TurnOutcome {
        self.engine
            .handle_inbound(InboundMessage::text(contact, body))
            .await
            .expect("turn succeeds")
    }
}

#[tokio::test]
async fn scenario_buy_activates_flow_and_initializes_cart() {
    let h = harness();
    let outcome = h.text("c1", "buy").await;
    assert_eq!(outcome.flow.as_deref(), Some("lead_generation"));
    assert_eq!(outcome.status, TurnStatus::AwaitingReply);
    assert_eq!(outcome.steps_visited[0], "start_purchase_flow");

    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("show_products"));
    assert_eq!(state.context["cart_items"], json!([]));
    let body = h.sender.last_body().unwrap();
    assert!(body.contains("1. Solar Panel 450W ($120)"), "got: {}", body);
}

#[tokio::test]
async fn scenario_product_selection_sets_found_product() {
    let h = harness();
    h.text("c1", "buy").await;
    let outcome = h.text("c1", "1").await;
    assert!(outcome
        .steps_visited
        .contains(&"get_product_from_selection".to_string()));

    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("ask_for_quantity"));
    assert_eq!(state.context["found_product"]["name"], "Solar Panel 450W");
    let body = h.sender.last_body().unwrap();
    assert_eq!(body, "How many Solar Panel 450W?");
}

#[tokio::test]
async fn scenario_done_with_items_skips_selection_lookup() {
    let h = harness();
    h.text("c1", "buy").await;
    h.text("c1", "2").await;
    h.text("c1", "3").await; // quantity
    let cart_summary = h.sender.sent()[h.sender.sent().len() - 2]
        .payload
        .body()
        .to_string();
    assert!(
        cart_summary.contains("- Hybrid Inverter x3 = $900"),
        "got: {}",
        cart_summary
    );

    let outcome = h.text("c1", "done").await;
    assert_eq!(
        outcome.steps_visited,
        vec!["check_cart".to_string(), "ask_delivery_name".to_string()]
    );
    assert!(!outcome
        .steps_visited
        .contains(&"get_product_from_selection".to_string()));
    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("ask_delivery_name"));
}

#[tokio::test]
async fn scenario_done_with_empty_cart_cancels_and_resets() {
    let h = harness();
    h.text("c1", "buy").await;
    let outcome = h.text("c1", "done").await;
    assert_eq!(outcome.status, TurnStatus::FlowCompleted);
    assert!(outcome
        .steps_visited
        .contains(&"end_flow_cancelled".to_string()));

    let state = h.states.load("c1").await.unwrap();
    assert!(state.is_idle());
    assert!(state.current_step.is_none());
    let body = h.sender.last_body().unwrap();
    assert!(body.contains("cancelling"));
}

#[tokio::test]
async fn scenario_retry_budget_escalates_after_max_retries() {
    let h = harness();
    h.text("c1", "buy").await;
    h.text("c1", "1").await;
    h.text("c1", "2").await;
    h.text("c1", "done").await; // now at ask_delivery_name (regex ^.{10,})

    let first = h.text("c1", "abc").await;
    assert_eq!(first.status, TurnStatus::AwaitingReply);
    assert_eq!(
        h.sender.last_body().unwrap(),
        "Please give the full delivery name (at least 10 characters)."
    );
    let second = h.text("c1", "xy").await;
    assert_eq!(second.status, TurnStatus::AwaitingReply);
    assert_eq!(h.states.load("c1").await.unwrap().retries, 2);

    let third = h.text("c1", "no").await;
    assert_eq!(third.status, TurnStatus::HandedOver);
    assert!(h.store.flag("c1", "needs_human_intervention"));
    let notifications = h.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].template_name, "human_handover");
    assert!(h.states.load("c1").await.unwrap().is_idle());
}

#[tokio::test]
async fn invalid_quantity_reprompts_then_branches_back() {
    let h = harness();
    h.text("c1", "buy").await;
    h.text("c1", "1").await;

    let first = h.text("c1", "lots").await;
    assert_eq!(first.status, TurnStatus::AwaitingReply);
    assert_eq!(
        h.sender.last_body().unwrap(),
        "Please reply with a whole number."
    );
    h.text("c1", "many").await;
    let third = h.text("c1", "all of them").await;
    // Fallback branches back to the product list.
    assert_eq!(third.status, TurnStatus::AwaitingReply);
    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("show_products"));
}

#[tokio::test]
async fn full_purchase_creates_order_and_completes() {
    let h = harness();
    h.text("c1", "buy").await;
    h.text("c1", "1").await;
    h.text("c1", "2").await;
    h.text("c1", "done").await;
    let outcome = h.text("c1", "Rudo Ncube Household").await;
    assert_eq!(outcome.status, TurnStatus::FlowCompleted);

    let orders = h.store.records("order");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["total"], json!(240));
    assert_eq!(orders[0]["customer_name"], "Rudo Ncube Household");
    assert_eq!(h.store.records("order_item").len(), 1);

    let body = h.sender.last_body().unwrap();
    assert!(body.contains("confirmed for Rudo Ncube Household"), "got: {}", body);
    assert!(h.states.load("c1").await.unwrap().is_idle());
}

#[tokio::test]
async fn unrecognized_message_when_idle_is_a_no_op() {
    let h = harness();
    let outcome = h.text("c1", "good morning").await;
    assert_eq!(outcome.status, TurnStatus::NoActiveFlow);
    assert!(h.sender.sent().is_empty());
    assert!(h.states.load("c1").await.unwrap().is_idle());
}

#[tokio::test]
async fn trigger_keywords_do_not_restart_a_running_flow() {
    let h = harness();
    h.text("c1", "buy").await;
    let outcome = h.text("c1", "buy").await;
    // "buy" is treated as a (failed) product selection, not a new trigger.
    assert_eq!(outcome.flow.as_deref(), Some("lead_generation"));
    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("show_products"));
}

#[tokio::test]
async fn replaying_a_message_from_the_same_state_is_idempotent() {
    let h = harness();
    h.text("c1", "buy").await;
    let before = h.states.load("c1").await.unwrap();

    h.text("c1", "1").await;
    let first_state = h.states.load("c1").await.unwrap();
    let first_count = h.sender.sent().len();
    let first_body = h.sender.last_body().unwrap();

    h.states.save(&before).await.unwrap();
    h.text("c1", "1").await;
    let second_state = h.states.load("c1").await.unwrap();
    let second_body = h.sender.last_body().unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(first_state.current_step, second_state.current_step);
    assert_eq!(first_state.context, second_state.context);
    assert_eq!(h.sender.sent().len(), first_count + 1);
}

#[tokio::test]
async fn unmatched_reply_parks_the_contact() {
    let h = harness();
    h.text("c1", "install").await;
    let outcome = h.text("c1", "hello?").await;
    assert_eq!(outcome.status, TurnStatus::Parked);
    let state = h.states.load("c1").await.unwrap();
    assert_eq!(state.current_step.as_deref(), Some("send_form"));
}

#[tokio::test]
async fn native_flow_response_advances_and_is_recorded() {
    let h = harness();
    h.text("c1", "install").await;
    let outcome = h
        .engine
        .handle_inbound(InboundMessage::flow_response(
            "c1",
            json!({"site_details": "12 Ridge Rd, flat roof"}),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.status, TurnStatus::FlowCompleted);

    let requests = h.store.records("installation_request");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["details"], "12 Ridge Rd, flat roof");
    assert_eq!(h.store.flow_responses("c1").len(), 1);
    assert!(h.states.load("c1").await.unwrap().is_idle());
}
