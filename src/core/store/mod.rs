use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{json, Value};
use uuid::Uuid;

/// Seam to the CRM's data collaborator. The flow engine only ever touches
/// records as untyped field maps; schema enforcement belongs to the store.
#[async_trait]
pub trait CrmStore: Send + Sync {
    /// Equality-filter query, bounded by `limit`. Filter values are compared
    /// against the stringified field value.
    async fn query(
        &self,
        model: &str,
        filters: &IndexMap<String, String>,
        limit: usize,
    ) -> Result<Vec<Value>, AppError>;

    /// Create one record and return it, including the assigned `id`.
    async fn create(&self, model: &str, fields: Value) -> Result<Value, AppError>;

    /// Merge `fields` into the record with the given id.
    async fn update(&self, model: &str, id: &str, fields: Value) -> Result<(), AppError>;

    async fn order_number_exists(&self, number: &str) -> Result<bool, AppError>;

    async fn set_contact_flag(
        &self,
        contact_id: &str,
        flag: &str,
        value: bool,
    ) -> Result<(), AppError>;

    /// Persist a structured WhatsApp Flow submission for the processing audit.
    async fn record_flow_response(
        &self,
        contact_id: &str,
        payload: &Value,
    ) -> Result<(), AppError>;
}

/// In-memory store used by the test suites and the CLI simulator.
#[derive(Default)]
pub struct MemoryCrmStore {
    records: DashMap<String, Vec<Value>>,
    flags: DashMap<String, bool>,
    flow_responses: DashMap<String, Vec<Value>>,
}

impl MemoryCrmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records for a model; used by tests to stand in for CRM fixtures.
    pub fn seed(&self, model: &str, records: Vec<Value>) {
        self.records.insert(model.to_string(), records);
    }

    pub fn records(&self, model: &str) -> Vec<Value> {
        self.records
            .get(model)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn flag(&self, contact_id: &str, flag: &str) -> bool {
        self.flags
            .get(&flag_key(contact_id, flag))
            .map(|v| *v)
            .unwrap_or(false)
    }

    pub fn flow_responses(&self, contact_id: &str) -> Vec<Value> {
        self.flow_responses
            .get(contact_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

fn flag_key(contact_id: &str, flag: &str) -> String {
    format!("{}:{}", contact_id, flag)
}

fn field_matches(record: &Value, field: &str, expected: &str) -> bool {
    match record.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        Some(Value::Null) | None => expected.is_empty(),
        Some(_) => false,
    }
}

#[async_trait]
impl CrmStore for MemoryCrmStore {
    async fn query(
        &self,
        model: &str,
        filters: &IndexMap<String, String>,
        limit: usize,
    ) -> Result<Vec<Value>, AppError> {
        let rows = self.records(model);
        Ok(rows
            .into_iter()
            .filter(|row| {
                filters
                    .iter()
                    .all(|(field, expected)| field_matches(row, field, expected))
            })
            .take(limit)
            .collect())
    }

    async fn create(&self, model: &str, fields: Value) -> Result<Value, AppError> {
        let mut record = match fields {
            Value::Object(map) => map,
            other => {
                return Err(AppError::new(
                    ErrorCategory::StoreError,
                    format!("create on '{}' requires an object, got {}", model, other),
                )
                .with_code("FLOW-STORE-001"));
            }
        };
        record
            .entry("id".to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        let value = Value::Object(record);
        self.records
            .entry(model.to_string())
            .or_default()
            .push(value.clone());
        Ok(value)
    }

    async fn update(&self, model: &str, id: &str, fields: Value) -> Result<(), AppError> {
        let mut rows = self.records.entry(model.to_string()).or_default();
        let row = rows
            .iter_mut()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| {
                AppError::new(
                    ErrorCategory::StoreError,
                    format!("no '{}' record with id {}", model, id),
                )
                .with_code("FLOW-STORE-002")
            })?;
        if let (Value::Object(target), Value::Object(patch)) = (row, &fields) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn order_number_exists(&self, number: &str) -> Result<bool, AppError> {
        Ok(self
            .records("order")
            .iter()
            .any(|row| row.get("order_number").and_then(Value::as_str) == Some(number)))
    }

    async fn set_contact_flag(
        &self,
        contact_id: &str,
        flag: &str,
        value: bool,
    ) -> Result<(), AppError> {
        self.flags.insert(flag_key(contact_id, flag), value);
        Ok(())
    }

    async fn record_flow_response(
        &self,
        contact_id: &str,
        payload: &Value,
    ) -> Result<(), AppError> {
        self.flow_responses
            .entry(contact_id.to_string())
            .or_default()
            .push(json!({
                "payload": payload,
                "processed": true,
            }));
        Ok(())
    }
}

/// Store whose calls always fail; used to exercise failure policies.
#[derive(Default)]
pub struct FailingCrmStore;

#[async_trait]
impl CrmStore for FailingCrmStore {
    async fn query(
        &self,
        model: &str,
        _filters: &IndexMap<String, String>,
        _limit: usize,
    ) -> Result<Vec<Value>, AppError> {
        Err(store_unreachable(model))
    }

    async fn create(&self, model: &str, _fields: Value) -> Result<Value, AppError> {
        Err(store_unreachable(model))
    }

    async fn update(&self, model: &str, _id: &str, _fields: Value) -> Result<(), AppError> {
        Err(store_unreachable(model))
    }

    async fn order_number_exists(&self, _number: &str) -> Result<bool, AppError> {
        Err(store_unreachable("order"))
    }

    async fn set_contact_flag(
        &self,
        _contact_id: &str,
        _flag: &str,
        _value: bool,
    ) -> Result<(), AppError> {
        Err(store_unreachable("contact"))
    }

    async fn record_flow_response(
        &self,
        _contact_id: &str,
        _payload: &Value,
    ) -> Result<(), AppError> {
        Err(store_unreachable("flow_response"))
    }
}

fn store_unreachable(model: &str) -> AppError {
    AppError::new(
        ErrorCategory::StoreError,
        format!("store unreachable for model '{}'", model),
    )
    .with_code("FLOW-STORE-003")
}
