//! Typed result values produced by a successful task.

use serde::{Deserialize, Serialize};

/// One result value with its type tag (e.g. `"string"`, `"int64"`, `"float64"`).
///
/// `value` keeps numbers in their original textual precision, so a value
/// of unknown numeric type survives an encode/decode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub value: serde_json::Value,
}

impl TaskResult {
    pub fn new(type_tag: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new("string", serde_json::Value::String(value.into()))
    }
}
