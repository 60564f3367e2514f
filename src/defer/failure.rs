use std::any::Any;
use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rejection payload of a [`Deferred`](super::Deferred).
///
/// Crosses the V8 boundary by value. `message` is always populated;
/// `value` carries the original thrown value so it can be re-raised
/// as-is on the other side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    kind:    Kind,
    message: String,
    #[serde(default)]
    value:   Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// An `Error` instance or host error, re-raised as `new Error(message)`.
    Error,
    /// Any other thrown value, re-raised unchanged.
    Thrown,
    /// A host continuation panicked.
    Panic,
}

impl Failure {
    pub fn new(kind: Kind, message: impl Into<String>, value: Value) -> Self {
        Self {
            kind:    kind,
            message: message.into(),
            value:   value,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let value   = Value::String(message.clone());
        Self::new(Kind::Error, message, value)
    }

    pub fn thrown(value: Value) -> Self {
        let message = match &value {
            Value::String(s) => s.clone(),
            value            => value.to_string(),
        };
        Self::new(Kind::Thrown, message, value)
    }

    pub(crate) fn panic(payload: &(dyn Any + Send)) -> Self {
        let message = describe(payload);
        let value   = Value::String(message.clone());
        Self::new(Kind::Panic, message, value)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::error(format!("{error:#}"))
    }
}

pub(crate) fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    match payload.downcast_ref::<String>() {
        Some(s) => s.clone(),
        None    => "panic".to_owned(),
    }
}
