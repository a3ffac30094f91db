use crate::core::error::AppError;
use crate::core::flow_graph::context::{stringify, FlowContext};
use crate::core::flow_graph::template::render_str;
use crate::core::notify::NotificationSink;
use crate::core::store::CrmStore;
use crate::core::types::ErrorCategory;
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use tracing::{error, warn};

const MAX_ORDER_NUMBER_ATTEMPTS: usize = 10;

fn default_query_limit() -> usize {
    10
}

fn default_order_prefix() -> String {
    "ORD".to_string()
}

/// What happens to the rest of the turn when an action fails. The default
/// matches the original log-and-skip behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Continue,
    AbortStep,
    AbortFlow,
}

/// One step-level action. Closed set: an unknown `type` tag fails at flow
/// load. String values are templates rendered against the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Read records into a context variable. A store failure logs and yields
    /// an empty result instead of failing the turn.
    QueryModel {
        model: String,
        #[serde(default)]
        filters: IndexMap<String, String>,
        result_variable: String,
        #[serde(default = "default_query_limit")]
        limit: usize,
    },
    CreateModelInstance {
        model: String,
        #[serde(default)]
        fields: IndexMap<String, Value>,
        #[serde(default)]
        result_variable: Option<String>,
    },
    UpdateModelInstance {
        model: String,
        instance_id: String,
        #[serde(default)]
        fields: IndexMap<String, Value>,
    },
    SetContextVariable {
        variable: String,
        value: Value,
    },
    AppendToList {
        variable: String,
        value: Value,
    },
    /// Pick one element of a list variable by a (1-based) index held in
    /// another variable, e.g. resolving "reply 2" against a product listing.
    SelectListItem {
        list_variable: String,
        index_variable: String,
        result_variable: String,
    },
    /// Append a priced cart line: unit price times quantity, rounded to
    /// cents, stored as `line_total` alongside the product fields.
    AddCartItem {
        cart_variable: String,
        product_variable: String,
        quantity_variable: String,
    },
    SendAdminNotification {
        template_name: String,
        #[serde(default)]
        context: IndexMap<String, String>,
    },
    SendGroupNotification {
        group: String,
        template_name: String,
        #[serde(default)]
        context: IndexMap<String, String>,
    },
    CreateOpportunity {
        name: String,
        #[serde(default)]
        fields: IndexMap<String, Value>,
        #[serde(default)]
        result_variable: Option<String>,
    },
    /// Create an order plus one order_item per cart line and store the order
    /// number in the context.
    CreateOrderFromCart {
        cart_variable: String,
        result_variable: String,
        #[serde(default)]
        fields: IndexMap<String, Value>,
    },
    NormalizeOrderNumber {
        variable: String,
        #[serde(default)]
        result_variable: Option<String>,
    },
    GenerateUniqueOrderNumber {
        result_variable: String,
        #[serde(default = "default_order_prefix")]
        prefix: String,
    },
}

impl ActionSpec {
    /// Template strings this action renders; compiled at flow load.
    pub fn template_strings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match &self.kind {
            ActionKind::QueryModel { filters, .. } => {
                out.extend(filters.values().map(String::as_str));
            }
            ActionKind::CreateModelInstance { fields, .. }
            | ActionKind::CreateOrderFromCart { fields, .. } => {
                for value in fields.values() {
                    collect_string_leaves(value, &mut out);
                }
            }
            ActionKind::UpdateModelInstance {
                instance_id,
                fields,
                ..
            } => {
                out.push(instance_id.as_str());
                for value in fields.values() {
                    collect_string_leaves(value, &mut out);
                }
            }
            ActionKind::SetContextVariable { value, .. }
            | ActionKind::AppendToList { value, .. } => {
                collect_string_leaves(value, &mut out);
            }
            ActionKind::SendAdminNotification { context, .. }
            | ActionKind::SendGroupNotification { context, .. } => {
                out.extend(context.values().map(String::as_str));
            }
            ActionKind::CreateOpportunity { name, fields, .. } => {
                out.push(name.as_str());
                for value in fields.values() {
                    collect_string_leaves(value, &mut out);
                }
            }
            ActionKind::SelectListItem { .. }
            | ActionKind::AddCartItem { .. }
            | ActionKind::NormalizeOrderNumber { .. }
            | ActionKind::GenerateUniqueOrderNumber { .. } => {}
        }
        out
    }

    /// Root context variables this action writes.
    pub fn written_variables(&self) -> Vec<String> {
        match &self.kind {
            ActionKind::QueryModel {
                result_variable, ..
            }
            | ActionKind::SelectListItem {
                result_variable, ..
            }
            | ActionKind::CreateOrderFromCart {
                result_variable, ..
            }
            | ActionKind::GenerateUniqueOrderNumber {
                result_variable, ..
            } => vec![root_segment(result_variable)],
            ActionKind::CreateModelInstance {
                result_variable, ..
            }
            | ActionKind::CreateOpportunity {
                result_variable, ..
            } => result_variable
                .as_deref()
                .map(|v| vec![root_segment(v)])
                .unwrap_or_default(),
            ActionKind::SetContextVariable { variable, .. }
            | ActionKind::AppendToList { variable, .. } => vec![root_segment(variable)],
            ActionKind::AddCartItem { cart_variable, .. } => vec![root_segment(cart_variable)],
            ActionKind::NormalizeOrderNumber {
                variable,
                result_variable,
            } => vec![root_segment(
                result_variable.as_deref().unwrap_or(variable),
            )],
            ActionKind::UpdateModelInstance { .. }
            | ActionKind::SendAdminNotification { .. }
            | ActionKind::SendGroupNotification { .. } => Vec::new(),
        }
    }

    /// Root context variables this action reads directly (template reads are
    /// collected separately via the compiled templates).
    pub fn read_variables(&self) -> Vec<String> {
        match &self.kind {
            ActionKind::SelectListItem {
                list_variable,
                index_variable,
                ..
            } => vec![root_segment(list_variable), root_segment(index_variable)],
            ActionKind::AddCartItem {
                cart_variable,
                product_variable,
                quantity_variable,
            } => vec![
                root_segment(cart_variable),
                root_segment(product_variable),
                root_segment(quantity_variable),
            ],
            ActionKind::AppendToList { variable, .. } => vec![root_segment(variable)],
            ActionKind::CreateOrderFromCart { cart_variable, .. } => {
                vec![root_segment(cart_variable)]
            }
            ActionKind::NormalizeOrderNumber { variable, .. } => vec![root_segment(variable)],
            _ => Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ActionKind::QueryModel { .. } => "query_model",
            ActionKind::CreateModelInstance { .. } => "create_model_instance",
            ActionKind::UpdateModelInstance { .. } => "update_model_instance",
            ActionKind::SetContextVariable { .. } => "set_context_variable",
            ActionKind::AppendToList { .. } => "append_to_list",
            ActionKind::SelectListItem { .. } => "select_list_item",
            ActionKind::AddCartItem { .. } => "add_cart_item",
            ActionKind::SendAdminNotification { .. } => "send_admin_notification",
            ActionKind::SendGroupNotification { .. } => "send_group_notification",
            ActionKind::CreateOpportunity { .. } => "create_opportunity",
            ActionKind::CreateOrderFromCart { .. } => "create_order_from_cart",
            ActionKind::NormalizeOrderNumber { .. } => "normalize_order_number",
            ActionKind::GenerateUniqueOrderNumber { .. } => "generate_unique_order_number",
        }
    }
}

fn root_segment(path: &str) -> String {
    path.split('.').next().unwrap_or(path).to_string()
}

fn collect_string_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s.as_str()),
        Value::Array(items) => {
            for item in items {
                collect_string_leaves(item, out);
            }
        }
        Value::Object(map) => {
            for child in map.values() {
                collect_string_leaves(child, out);
            }
        }
        _ => {}
    }
}

/// Outcome of running a step's action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionsOutcome {
    Completed,
    FlowAborted,
}

/// Runs a step's actions strictly in sequence against the context. Failures
/// do not roll back earlier actions; they are routed by each action's
/// `on_failure` policy.
pub struct ActionExecutor {
    store: Arc<dyn CrmStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn CrmStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        ActionExecutor { store, notifier }
    }

    pub async fn run_all(
        &self,
        actions: &[ActionSpec],
        context: &mut FlowContext,
    ) -> ActionsOutcome {
        for action in actions {
            if let Err(err) = self.run_one(&action.kind, context).await {
                match action.on_failure {
                    FailurePolicy::Continue => {
                        warn!(action = action.type_name(), error = %err, "action failed, continuing");
                    }
                    FailurePolicy::AbortStep => {
                        warn!(action = action.type_name(), error = %err, "action failed, aborting step");
                        break;
                    }
                    FailurePolicy::AbortFlow => {
                        error!(action = action.type_name(), error = %err, "action failed, aborting flow");
                        return ActionsOutcome::FlowAborted;
                    }
                }
            }
        }
        ActionsOutcome::Completed
    }

    async fn run_one(&self, kind: &ActionKind, context: &mut FlowContext) -> Result<(), AppError> {
        match kind {
            ActionKind::QueryModel {
                model,
                filters,
                result_variable,
                limit,
            } => {
                let mut rendered = IndexMap::new();
                for (field, template) in filters {
                    rendered.insert(field.clone(), render_str(template, context.as_value())?);
                }
                let rows = match self.store.query(model, &rendered, *limit).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(model = %model, error = %err, "query failed, storing empty result");
                        Vec::new()
                    }
                };
                context.set(result_variable, Value::Array(rows));
                Ok(())
            }
            ActionKind::CreateModelInstance {
                model,
                fields,
                result_variable,
            } => {
                let record = self
                    .store
                    .create(model, render_fields(fields, context)?)
                    .await?;
                if let Some(variable) = result_variable {
                    context.set(variable, record);
                }
                Ok(())
            }
            ActionKind::UpdateModelInstance {
                model,
                instance_id,
                fields,
            } => {
                let id = render_str(instance_id, context.as_value())?;
                self.store
                    .update(model, &id, render_fields(fields, context)?)
                    .await
            }
            ActionKind::SetContextVariable { variable, value } => {
                let rendered = render_value(value, context)?;
                context.set(variable, rendered);
                Ok(())
            }
            ActionKind::AppendToList { variable, value } => {
                let rendered = render_value(value, context)?;
                let mut items = match context.get(variable) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.push(rendered);
                context.set(variable, Value::Array(items));
                Ok(())
            }
            ActionKind::SelectListItem {
                list_variable,
                index_variable,
                result_variable,
            } => {
                let items = match context.get(list_variable) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => {
                        return Err(action_error(format!(
                            "'{}' does not hold a list",
                            list_variable
                        )));
                    }
                };
                let raw = context
                    .get(index_variable)
                    .map(stringify)
                    .unwrap_or_default();
                let index: usize = raw.trim().parse().map_err(|_| {
                    action_error(format!("'{}' is not a valid selection", raw.trim()))
                })?;
                let item = index
                    .checked_sub(1)
                    .and_then(|i| items.get(i))
                    .ok_or_else(|| {
                        action_error(format!("selection {} is out of range", index))
                    })?;
                context.set(result_variable, item.clone());
                Ok(())
            }
            ActionKind::AddCartItem {
                cart_variable,
                product_variable,
                quantity_variable,
            } => {
                let product = context.get(product_variable).cloned().ok_or_else(|| {
                    action_error(format!("'{}' is not set", product_variable))
                })?;
                let quantity = context
                    .get(quantity_variable)
                    .and_then(value_as_f64)
                    .ok_or_else(|| {
                        action_error(format!("'{}' is not a number", quantity_variable))
                    })?;
                let unit_price = product
                    .get("price")
                    .or_else(|| product.get("unit_price"))
                    .and_then(value_as_f64)
                    .ok_or_else(|| {
                        action_error(format!("'{}' has no price field", product_variable))
                    })?;
                let line_total = round_money(unit_price * quantity);
                let mut item = Map::new();
                item.insert(
                    "product_id".to_string(),
                    product.get("id").cloned().unwrap_or(Value::Null),
                );
                item.insert(
                    "name".to_string(),
                    product.get("name").cloned().unwrap_or(Value::Null),
                );
                item.insert("unit_price".to_string(), number_value(unit_price));
                item.insert("quantity".to_string(), number_value(quantity));
                item.insert("line_total".to_string(), number_value(line_total));
                let mut items = match context.get(cart_variable) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.push(Value::Object(item));
                context.set(cart_variable, Value::Array(items));
                Ok(())
            }
            ActionKind::SendAdminNotification {
                template_name,
                context: extra,
            } => {
                let payload = render_notification_context(extra, context)?;
                self.notifier.notify_admins(template_name, payload).await
            }
            ActionKind::SendGroupNotification {
                group,
                template_name,
                context: extra,
            } => {
                let payload = render_notification_context(extra, context)?;
                self.notifier
                    .notify_group(group, template_name, payload)
                    .await
            }
            ActionKind::CreateOpportunity {
                name,
                fields,
                result_variable,
            } => {
                let mut record = match render_fields(fields, context)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                record.insert(
                    "name".to_string(),
                    Value::String(render_str(name, context.as_value())?),
                );
                record.insert("stage".to_string(), Value::String("new".to_string()));
                let created = self.store.create("opportunity", Value::Object(record)).await?;
                if let Some(variable) = result_variable {
                    context.set(
                        variable,
                        created.get("id").cloned().unwrap_or(Value::Null),
                    );
                }
                Ok(())
            }
            ActionKind::CreateOrderFromCart {
                cart_variable,
                result_variable,
                fields,
            } => {
                let items = match context.get(cart_variable) {
                    Some(Value::Array(items)) if !items.is_empty() => items.clone(),
                    _ => {
                        return Err(action_error(format!(
                            "cart '{}' is empty",
                            cart_variable
                        )));
                    }
                };
                let total = round_money(
                    items
                        .iter()
                        .filter_map(|item| item.get("line_total").and_then(value_as_f64))
                        .sum(),
                );
                let order_number = self.unique_order_number("ORD").await?;
                let mut order = match render_fields(fields, context)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                order.insert(
                    "order_number".to_string(),
                    Value::String(order_number.clone()),
                );
                order.insert("total".to_string(), number_value(total));
                order.insert("item_count".to_string(), Value::Number(items.len().into()));
                let created = self.store.create("order", Value::Object(order)).await?;
                let order_id = created.get("id").cloned().unwrap_or(Value::Null);
                for item in &items {
                    let mut line = match item {
                        Value::Object(map) => map.clone(),
                        other => {
                            let mut map = Map::new();
                            map.insert("value".to_string(), other.clone());
                            map
                        }
                    };
                    line.insert("order_id".to_string(), order_id.clone());
                    self.store.create("order_item", Value::Object(line)).await?;
                }
                context.set(result_variable, Value::String(order_number));
                Ok(())
            }
            ActionKind::NormalizeOrderNumber {
                variable,
                result_variable,
            } => {
                let raw = context.get(variable).map(stringify).unwrap_or_default();
                let normalized = normalize_order_number(&raw);
                let target = result_variable.as_deref().unwrap_or(variable);
                context.set(target, Value::String(normalized));
                Ok(())
            }
            ActionKind::GenerateUniqueOrderNumber {
                result_variable,
                prefix,
            } => {
                let number = self.unique_order_number(prefix).await?;
                context.set(result_variable, Value::String(number));
                Ok(())
            }
        }
    }

    async fn unique_order_number(&self, prefix: &str) -> Result<String, AppError> {
        for _ in 0..MAX_ORDER_NUMBER_ATTEMPTS {
            let candidate = {
                let mut rng = rand::thread_rng();
                format!("{}-{:06}", prefix, rng.gen_range(0..1_000_000))
            };
            if !self.store.order_number_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(action_error("could not generate a unique order number"))
    }
}

fn action_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ActionExecutionError, message).with_code("FLOW-ACT-001")
}

/// Render every string leaf of a value against the context; other leaves
/// pass through untouched.
pub fn render_value(value: &Value, context: &FlowContext) -> Result<Value, AppError> {
    match value {
        Value::String(template) => Ok(Value::String(render_str(
            template,
            context.as_value(),
        )?)),
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_value(item, context)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (key, child) in map {
                rendered.insert(key.clone(), render_value(child, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_fields(
    fields: &IndexMap<String, Value>,
    context: &FlowContext,
) -> Result<Value, AppError> {
    let mut rendered = Map::new();
    for (field, value) in fields {
        rendered.insert(field.clone(), render_value(value, context)?);
    }
    Ok(Value::Object(rendered))
}

fn render_notification_context(
    extra: &IndexMap<String, String>,
    context: &FlowContext,
) -> Result<Value, AppError> {
    let mut payload = Map::new();
    if let Some(contact) = context.get("contact_id") {
        payload.insert("contact_id".to_string(), contact.clone());
    }
    for (key, template) in extra {
        payload.insert(
            key.clone(),
            Value::String(render_str(template, context.as_value())?),
        );
    }
    Ok(Value::Object(payload))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Canonical order-number form: uppercase alphanumerics with a single hyphen
/// between the alpha prefix and the digits, e.g. "ord 12 34" -> "ORD-1234".
pub fn normalize_order_number(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    match cleaned.find(|c: char| c.is_ascii_digit()) {
        Some(pos) if pos > 0 => format!("{}-{}", &cleaned[..pos], &cleaned[pos..]),
        _ => cleaned,
    }
}
