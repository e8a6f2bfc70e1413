use std::collections::BTreeMap;

use serde_json::{Number, Value as JsonValue};

/// One of the process's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamHandle {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamHandle {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamHandle::Stdin => "stdin",
            StreamHandle::Stdout => "stdout",
            StreamHandle::Stderr => "stderr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stdin" => Some(StreamHandle::Stdin),
            "stdout" => Some(StreamHandle::Stdout),
            "stderr" => Some(StreamHandle::Stderr),
            _ => None,
        }
    }

    /// Command-line token standing for this stream, e.g. `{stdin}`.
    pub fn token(self) -> String {
        format!("{{{}}}", self.as_str())
    }
}

/// Argument and result values: JSON plus stream handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Stream(StreamHandle),
}

impl Value {
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON projection. Stream handles project to their `{name}` token.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Stream(handle) => JsonValue::String(handle.token()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Stream(_) => "stream",
        }
    }

    /// Text form used when writing or concatenating: strings verbatim,
    /// everything else as compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}
