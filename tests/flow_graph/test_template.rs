use chatflow::core::flow_graph::template::{render_str, Template};
use serde_json::json;

#[test]
fn renders_variables_and_filters() {
    let ctx = json!({
        "customer": {"name": "tendai moyo"},
        "order_number": "ord-123",
    });
    let rendered = render_str(
        "Hello {{ customer.name|title }}, your order {{ order_number|upper }} shipped.",
        &ctx,
    )
    .unwrap();
    assert_eq!(
        rendered,
        "Hello Tendai Moyo, your order ORD-123 shipped."
    );
}

#[test]
fn replace_and_date_filters() {
    let ctx = json!({
        "phone": "263-77-000",
        "installed_on": "2026-08-07",
    });
    assert_eq!(
        render_str(r#"{{ phone|replace:"-","" }}"#, &ctx).unwrap(),
        "26377000"
    );
    assert_eq!(
        render_str(r#"{{ installed_on|date:"%d %b %Y" }}"#, &ctx).unwrap(),
        "07 Aug 2026"
    );
}

#[test]
fn missing_keys_render_as_empty_string() {
    let rendered = render_str("Balance: {{ account.balance }} USD", &json!({})).unwrap();
    assert_eq!(rendered, "Balance:  USD");
}

#[test]
fn numeric_segments_index_lists() {
    let ctx = json!({"products": [{"name": "Panel"}, {"name": "Battery"}]});
    assert_eq!(
        render_str("First: {{ products.0.name }}", &ctx).unwrap(),
        "First: Panel"
    );
    assert_eq!(
        render_str("Tenth: {{ products.9.name }}", &ctx).unwrap(),
        "Tenth: "
    );
}

#[test]
fn if_blocks_branch_on_truthiness() {
    let template = "{% if cart_items %}Cart has items{% else %}Cart is empty{% endif %}";
    assert_eq!(
        render_str(template, &json!({"cart_items": [1]})).unwrap(),
        "Cart has items"
    );
    assert_eq!(
        render_str(template, &json!({"cart_items": []})).unwrap(),
        "Cart is empty"
    );
    assert_eq!(render_str(template, &json!({})).unwrap(), "Cart is empty");
}

#[test]
fn for_blocks_enumerate_with_loop_index() {
    let ctx = json!({
        "cart_items": [
            {"name": "Solar Panel", "line_total": 240},
            {"name": "Inverter", "line_total": 300}
        ]
    });
    let rendered = render_str(
        "{% for item in cart_items %}{{ loop.index }}. {{ item.name }}: {{ item.line_total }}\n{% endfor %}",
        &ctx,
    )
    .unwrap();
    assert_eq!(rendered, "1. Solar Panel: 240\n2. Inverter: 300\n");
}

#[test]
fn set_then_render_round_trip() {
    use chatflow::core::flow_graph::context::FlowContext;
    let mut ctx = FlowContext::new();
    ctx.set("cart_items", json!([]));
    assert_eq!(
        render_str(
            "{% if cart_items %}full{% else %}empty{% endif %}",
            ctx.as_value()
        )
        .unwrap(),
        "empty"
    );
    ctx.set(
        "cart_items",
        json!([{"name": "Panel", "quantity": 2, "line_total": 240}]),
    );
    let rendered = render_str(
        "{% for item in cart_items %}{{ item.name }} x{{ item.quantity }} = {{ item.line_total }}{% endfor %}",
        ctx.as_value(),
    )
    .unwrap();
    assert_eq!(rendered, "Panel x2 = 240");
}

#[test]
fn nested_blocks_render() {
    let ctx = json!({
        "sections": [
            {"title": "Solar", "items": [{"name": "Panel"}]},
            {"title": "Starlink", "items": []}
        ]
    });
    let rendered = render_str(
        "{% for s in sections %}{{ s.title }}:{% for i in s.items %} {{ i.name }}{% endfor %};{% endfor %}",
        &ctx,
    )
    .unwrap();
    assert_eq!(rendered, "Solar: Panel;Starlink:;");
}

#[test]
fn unclosed_blocks_fail_to_compile() {
    assert!(Template::compile("{% if x %}never closed").is_err());
    assert!(Template::compile("{% for a in b %}body").is_err());
    assert!(Template::compile("{{ broken").is_err());
    assert!(Template::compile("{{ x|frobnicate }}").is_err());
}
