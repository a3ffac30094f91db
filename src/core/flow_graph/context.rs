use serde_json::{Map, Value};

/// Per-contact execution context: the flat, untyped key-value state a flow
/// accumulates across steps. Keys are dotted paths; numeric segments index
/// into lists.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    data: Value,
}

impl FlowContext {
    pub fn new() -> Self {
        FlowContext {
            data: Value::Object(Map::new()),
        }
    }

    /// Wrap an existing context value. Non-object values are replaced by an
    /// empty object so the context is always a map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => FlowContext {
                data: Value::Object(map),
            },
            _ => FlowContext::new(),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.data
    }

    pub fn into_value(self) -> Value {
        self.data
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path)
    }

    /// Set a value at a dotted path, creating intermediate objects as needed.
    /// An intermediate segment that exists but is not an object is replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut current = &mut self.data;
        let segments: Vec<&str> = path.split('.').collect();
        for (index, segment) in segments.iter().enumerate() {
            let is_last = index == segments.len() - 1;
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = match current.as_object_mut() {
                Some(map) => map,
                None => return,
            };
            if is_last {
                map.insert(segment.to_string(), value);
                return;
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    /// True when the path holds a non-empty value: null, missing, empty
    /// strings, empty lists and empty maps all count as absent.
    pub fn has_non_empty(&self, path: &str) -> bool {
        self.get(path).map(is_non_empty).unwrap_or(false)
    }

    /// Merge the keys of an object into the context at top level.
    pub fn merge_object(&mut self, value: &Value) {
        if let (Some(target), Some(patch)) = (self.data.as_object_mut(), value.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Resolve a dotted path against a JSON value. Numeric segments index lists.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Truthiness used by condition checks and `{% if %}` blocks.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Non-empty check for `variable_exists`: stricter than truthiness in that
/// `false` and `0` still count as present values.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(_) | Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Render a JSON value into message text. Scalars render bare; composites
/// render as compact JSON so unexpected shapes stay debuggable.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
