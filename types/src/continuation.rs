//! The continuation envelope: a deferred method call with a slot for a future result.
//!
//! A continuation is captured when an origin actor offloads a fetch and is carried
//! with the request: across the boundary to the execution context, and inside the
//! persisted wake-up record that must survive an actor restart. Once the outcome is
//! known, [`Continuation::resolve`] substitutes it into the placeholder slot and
//! yields an [`Invocation`] the owning actor can execute.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ValidationError;

/// One positional argument of a continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    /// A concrete value bound at capture time.
    Value(Value),
    /// Marker for "substitute the eventual result here".
    ResultPlaceholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    method: String,
    args: Vec<Arg>,
}

impl Continuation {
    /// Start a continuation targeting `method` on the origin actor.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Append a concrete argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Arg::Value(value.into()));
        self
    }

    /// Append the result placeholder.
    pub fn result(mut self) -> Self {
        self.args.push(Arg::ResultPlaceholder);
        self
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    #[must_use]
    pub fn placeholder_index(&self) -> Option<usize> {
        self.args
            .iter()
            .position(|arg| matches!(arg, Arg::ResultPlaceholder))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.method.trim().is_empty() {
            return Err(ValidationError::Empty { field: "method" });
        }
        let placeholders = self
            .args
            .iter()
            .filter(|arg| matches!(arg, Arg::ResultPlaceholder))
            .count();
        if placeholders > 1 {
            return Err(ValidationError::TooManyPlaceholders(placeholders));
        }
        Ok(())
    }

    /// Encode for transport to another execution context.
    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode a continuation received from another execution context.
    pub fn from_wire(value: Value) -> Result<Self, ValidationError> {
        let continuation: Self = serde_json::from_value(value)
            .map_err(|e| ValidationError::MalformedContinuation(e.to_string()))?;
        continuation.validate()?;
        Ok(continuation)
    }

    /// Bind the eventual result into the placeholder slot.
    ///
    /// Without a placeholder the result is dropped and the call runs with the
    /// captured arguments only.
    #[must_use]
    pub fn resolve(self, result: Value) -> Invocation {
        let mut result = Some(result);
        let args = self
            .args
            .into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => value,
                Arg::ResultPlaceholder => result.take().unwrap_or(Value::Null),
            })
            .collect();
        Invocation {
            method: self.method,
            args,
        }
    }
}

/// A fully bound call, ready to run against the owning actor.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    method: String,
    args: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("{method}: missing argument {index}")]
    MissingArg { method: String, index: usize },
    #[error("{method}: argument {index} has unexpected shape: {source}")]
    BadArg {
        method: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl Invocation {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Decode argument `index` into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, InvocationError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| InvocationError::MissingArg {
                method: self.method.clone(),
                index,
            })?;
        serde_json::from_value(value.clone()).map_err(|source| InvocationError::BadArg {
            method: self.method.clone(),
            index,
            source,
        })
    }
}
