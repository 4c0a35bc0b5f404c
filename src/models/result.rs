use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One value produced by a task invocation.
///
/// The `type_tag` is an informational runtime type label for consumers
/// that rehydrate heterogeneous payloads; it follows the JSON kind names
/// produced by [`type_tag_of`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Runtime type label of `value`.
    pub type_tag: String,
    /// The payload itself.
    pub value: Value,
}

impl TaskResult {
    /// Creates a result with an explicit type tag.
    #[must_use]
    pub fn new(type_tag: impl Into<String>, value: Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
        }
    }

    /// Creates a result whose tag is inferred from the JSON kind of `value`.
    #[must_use]
    pub fn of(value: Value) -> Self {
        Self {
            type_tag: type_tag_of(&value).to_string(),
            value,
        }
    }

    /// Creates a null result, the rendering of an empty return slot.
    #[must_use]
    pub fn null() -> Self {
        Self::of(Value::Null)
    }
}

/// Returns the runtime type label for a JSON value.
///
/// Numbers distinguish integer and floating-point representations, the
/// same distinction the argument coercion rules care about.
#[must_use]
pub fn type_tag_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() {
                "i64"
            } else if n.is_u64() {
                "u64"
            } else {
                "f64"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
