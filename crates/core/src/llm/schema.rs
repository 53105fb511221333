//! Response shapes for structured model calls.
//!
//! The JSON schema is derived with `schemars` and sent to the endpoint as the
//! requested output format; the payload that comes back is decoded with
//! `serde`, and any mismatch (string where a list was expected, missing
//! field) is a [`SchemaError`] the invoker retries like a transport failure.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SchemaError;

/// A typed model output with a declared response shape
pub trait StructuredOutput: DeserializeOwned + JsonSchema + Send + 'static {
    /// Short name used in logs and errors
    fn output_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// JSON schema sent to the endpoint as the output format
    fn response_schema() -> Value {
        serde_json::to_value(schemars::schema_for!(Self)).unwrap_or(Value::Null)
    }

    /// Validate and decode a payload
    fn decode(payload: Value) -> Result<Self, SchemaError> {
        serde_json::from_value(payload).map_err(|e| {
            SchemaError::new(format!("$ ({})", Self::output_name()), "matching shape", e.to_string())
        })
    }
}

/// Short description of a JSON value's type, for error messages
pub fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
