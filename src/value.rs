//! Values exchanged with scripts.
//!
//! Arguments and results cross the engine boundary as ordered sequences of
//! [`ScriptValue`]s. The connector never inspects them; the types here only
//! give hosts and gateways a common vocabulary.

use crate::engine::handle::HandleId;
use serde::{Deserialize, Serialize};

/// A value passed to or returned from a script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum ScriptValue {
    /// Null / undefined
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Number(f64),
    /// String value
    String(String),
    /// Nested sequence of values
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as number, widening integers
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Int(n as i64)
    }
}

impl From<i64> for ScriptValue {
    fn from(n: i64) -> Self {
        ScriptValue::Int(n)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl<T: Into<ScriptValue>> From<Vec<T>> for ScriptValue {
    fn from(v: Vec<T>) -> Self {
        ScriptValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ScriptValue::Null, Into::into)
    }
}

/// Build an argument list from anything convertible to [`ScriptValue`]
pub fn args<I, T>(values: I) -> Vec<ScriptValue>
where
    I: IntoIterator<Item = T>,
    T: Into<ScriptValue>,
{
    values.into_iter().map(Into::into).collect()
}

/// Successful result of one script invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutput {
    /// Non-negative status reported by the engine
    pub status: i32,
    /// Value produced by the entry point (null if none)
    pub value: ScriptValue,
    /// Handle that served the call
    pub handle: HandleId,
    /// Whether the handle was created for this call
    pub created: bool,
}
