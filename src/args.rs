//! Command-line argument tokens.
//!
//! `{stdin}` and `{stdout}` are checked first and bind to the standard
//! streams; every other token must be a JSON document.

use crate::value::{StreamHandle, Value};

pub const STDIN_TOKEN: &str = "{stdin}";
pub const STDOUT_TOKEN: &str = "{stdout}";

#[derive(Debug, thiserror::Error)]
#[error("argument '{token}' is neither {{stdin}}, {{stdout}} nor valid JSON")]
pub struct ArgumentDecodeError {
    pub token: String,
    #[source]
    pub source: serde_json::Error,
}

pub fn decode_argument(token: &str) -> Result<Value, ArgumentDecodeError> {
    match token {
        STDIN_TOKEN => Ok(Value::Stream(StreamHandle::Stdin)),
        STDOUT_TOKEN => Ok(Value::Stream(StreamHandle::Stdout)),
        _ => serde_json::from_str::<serde_json::Value>(token)
            .map(Value::from_json)
            .map_err(|source| ArgumentDecodeError {
                token: token.to_string(),
                source,
            }),
    }
}

/// Decodes every token, failing on the first bad one.
pub fn decode_arguments<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Value>, ArgumentDecodeError> {
    tokens.iter().map(|t| decode_argument(t.as_ref())).collect()
}

/// Inverse of [`decode_argument`] for values it can produce.
pub fn encode_argument(value: &Value) -> String {
    match value {
        Value::Stream(handle) => handle.token(),
        other => other.to_json().to_string(),
    }
}
