use chatflow::core::flow_graph::action::{
    normalize_order_number, ActionExecutor, ActionSpec, ActionsOutcome,
};
use chatflow::core::flow_graph::context::FlowContext;
use chatflow::core::notify::{RecordingSink, Recipients};
use chatflow::core::store::{CrmStore, FailingCrmStore, MemoryCrmStore};
use serde_json::{json, Value};
use std::sync::Arc;

fn specs(raw: Value) -> Vec<ActionSpec> {
    serde_json::from_value(raw).expect("action fixture parses")
}

fn executor(store: Arc<dyn CrmStore>) -> (ActionExecutor, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (ActionExecutor::new(store, sink.clone()), sink)
}

#[tokio::test]
async fn set_context_variable_renders_templates() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({"contact_id": "c9"}));
    let actions = specs(json!([
        {"type": "set_context_variable", "variable": "greeting", "value": "hi {{ contact_id }}"},
        {"type": "set_context_variable", "variable": "cart_items", "value": []}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::Completed);
    assert_eq!(ctx.get("greeting"), Some(&json!("hi c9")));
    assert_eq!(ctx.get("cart_items"), Some(&json!([])));
}

#[tokio::test]
async fn select_list_item_is_one_based() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({
        "products": [{"name": "Panel"}, {"name": "Battery"}],
        "selection": "2",
    }));
    let actions = specs(json!([
        {"type": "select_list_item", "list_variable": "products",
         "index_variable": "selection", "result_variable": "found_product"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    assert_eq!(ctx.get("found_product.name"), Some(&json!("Battery")));
}

#[tokio::test]
async fn select_list_item_out_of_range_leaves_result_unset() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({
        "products": [{"name": "Panel"}],
        "selection": "5",
    }));
    let actions = specs(json!([
        {"type": "select_list_item", "list_variable": "products",
         "index_variable": "selection", "result_variable": "found_product",
         "on_failure": "abort_step"}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::Completed);
    assert!(ctx.get("found_product").is_none());
}

#[tokio::test]
async fn add_cart_item_computes_line_total() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({
        "found_product": {"id": "p1", "name": "Solar Panel", "price": 120.5},
        "quantity": 2,
    }));
    let actions = specs(json!([
        {"type": "add_cart_item", "cart_variable": "cart_items",
         "product_variable": "found_product", "quantity_variable": "quantity"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    assert_eq!(ctx.get("cart_items.0.line_total"), Some(&json!(241)));
    assert_eq!(ctx.get("cart_items.0.name"), Some(&json!("Solar Panel")));
    assert_eq!(ctx.get("cart_items.0.quantity"), Some(&json!(2)));
}

#[tokio::test]
async fn query_failure_yields_empty_result_and_continues() {
    let (executor, _) = executor(Arc::new(FailingCrmStore));
    let mut ctx = FlowContext::new();
    let actions = specs(json!([
        {"type": "query_model", "model": "product", "result_variable": "products"},
        {"type": "set_context_variable", "variable": "after", "value": "ran"}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::Completed);
    assert_eq!(ctx.get("products"), Some(&json!([])));
    assert_eq!(ctx.get("after"), Some(&json!("ran")));
}

#[tokio::test]
async fn abort_step_skips_remaining_actions() {
    let (executor, _) = executor(Arc::new(FailingCrmStore));
    let mut ctx = FlowContext::new();
    let actions = specs(json!([
        {"type": "create_model_instance", "model": "order", "fields": {}, "on_failure": "abort_step"},
        {"type": "set_context_variable", "variable": "after", "value": "ran"}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::Completed);
    assert!(ctx.get("after").is_none());
}

#[tokio::test]
async fn abort_flow_reports_the_abort() {
    let (executor, _) = executor(Arc::new(FailingCrmStore));
    let mut ctx = FlowContext::new();
    let actions = specs(json!([
        {"type": "create_model_instance", "model": "order", "fields": {}, "on_failure": "abort_flow"}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::FlowAborted);
}

#[tokio::test]
async fn failure_default_is_continue() {
    let (executor, _) = executor(Arc::new(FailingCrmStore));
    let mut ctx = FlowContext::new();
    let actions = specs(json!([
        {"type": "update_model_instance", "model": "order", "instance_id": "o1", "fields": {}},
        {"type": "set_context_variable", "variable": "after", "value": "ran"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    assert_eq!(ctx.get("after"), Some(&json!("ran")));
}

#[tokio::test]
async fn create_model_instance_stores_record_in_context() {
    let store = Arc::new(MemoryCrmStore::new());
    let (executor, _) = executor(store.clone());
    let mut ctx = FlowContext::from_value(json!({"contact_id": "c3", "issue": "panel cracked"}));
    let actions = specs(json!([
        {"type": "create_model_instance", "model": "warranty_claim",
         "fields": {"contact_id": "{{ contact_id }}", "description": "{{ issue }}"},
         "result_variable": "claim"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    let rows = store.records("warranty_claim");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["description"], "panel cracked");
    assert_eq!(ctx.get("claim.contact_id"), Some(&json!("c3")));
}

#[tokio::test]
async fn notifications_reach_the_sink() {
    let (executor, sink) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({"contact_id": "c3", "order_number": "ORD-1"}));
    let actions = specs(json!([
        {"type": "send_admin_notification", "template_name": "new_order",
         "context": {"order": "{{ order_number }}"}},
        {"type": "send_group_notification", "group": "installers",
         "template_name": "install_scheduled", "context": {}}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    let notifications = sink.notifications();
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].template_name, "new_order");
    assert_eq!(notifications[0].recipients, Recipients::Admins);
    assert_eq!(notifications[0].context["order"], "ORD-1");
    assert_eq!(
        notifications[1].recipients,
        Recipients::Group("installers".to_string())
    );
}

#[tokio::test]
async fn generate_unique_order_number_respects_prefix() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::new();
    let actions = specs(json!([
        {"type": "generate_unique_order_number", "result_variable": "order_number", "prefix": "INV"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    let number = ctx.get("order_number").and_then(Value::as_str).unwrap().to_string();
    assert!(number.starts_with("INV-"), "got {}", number);
    assert_eq!(number.len(), "INV-".len() + 6);
}

#[tokio::test]
async fn create_order_from_cart_writes_order_and_items() {
    let store = Arc::new(MemoryCrmStore::new());
    let (executor, _) = executor(store.clone());
    let mut ctx = FlowContext::from_value(json!({
        "delivery_name": "Rudo Ncube Household",
        "cart_items": [
            {"product_id": "p1", "name": "Panel", "unit_price": 120, "quantity": 2, "line_total": 240},
            {"product_id": "p2", "name": "Inverter", "unit_price": 300, "quantity": 1, "line_total": 300}
        ]
    }));
    let actions = specs(json!([
        {"type": "create_order_from_cart", "cart_variable": "cart_items",
         "result_variable": "order_number",
         "fields": {"customer_name": "{{ delivery_name }}"}}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::Completed);

    let orders = store.records("order");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["total"], json!(540));
    assert_eq!(orders[0]["item_count"], json!(2));
    assert_eq!(orders[0]["customer_name"], "Rudo Ncube Household");
    let items = store.records("order_item");
    assert_eq!(items.len(), 2);
    let number = ctx.get("order_number").and_then(Value::as_str).unwrap();
    assert_eq!(orders[0]["order_number"], json!(number));
}

#[tokio::test]
async fn create_order_from_empty_cart_fails() {
    let store = Arc::new(MemoryCrmStore::new());
    let (executor, _) = executor(store.clone());
    let mut ctx = FlowContext::from_value(json!({"cart_items": []}));
    let actions = specs(json!([
        {"type": "create_order_from_cart", "cart_variable": "cart_items",
         "result_variable": "order_number", "on_failure": "abort_flow"}
    ]));
    let outcome = executor.run_all(&actions, &mut ctx).await;
    assert_eq!(outcome, ActionsOutcome::FlowAborted);
    assert!(store.records("order").is_empty());
}

#[tokio::test]
async fn normalize_order_number_in_place() {
    let (executor, _) = executor(Arc::new(MemoryCrmStore::new()));
    let mut ctx = FlowContext::from_value(json!({"order_number": " ord 12 34 "}));
    let actions = specs(json!([
        {"type": "normalize_order_number", "variable": "order_number"}
    ]));
    executor.run_all(&actions, &mut ctx).await;
    assert_eq!(ctx.get("order_number"), Some(&json!("ORD-1234")));
}

#[test]
fn normalize_is_stable_for_canonical_input() {
    assert_eq!(normalize_order_number("ORD-1234"), "ORD-1234");
}
