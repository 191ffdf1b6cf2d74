//! Shared deterministic types for the contract loop.
//!
//! These types define the stable contracts between the loop steps and the
//! external tools. They must not depend on I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of the Decide step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The contract is satisfied. Terminal.
    Success,
    /// Validation failed and attempts remain.
    Retry,
    /// Validation failed on the last permitted attempt. Terminal.
    Escalate,
}

impl Decision {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Decision::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Success => "success",
            Decision::Retry => "retry",
            Decision::Escalate => "escalate",
        }
    }
}

/// The three external tools the loop delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Generator,
    Executor,
    Validator,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Generator => "generator",
            ToolKind::Executor => "executor",
            ToolKind::Validator => "validator",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized response of a tool invocation.
///
/// A successful tool's JSON is passed through untouched, so the payload is
/// kept as a raw [`Value`]. Accessors are fail-closed: a missing or
/// non-boolean `success` flag reads as `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolResult(Value);

impl ToolResult {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Failure shape shared by timeouts, spawn errors and nonzero exits.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("success".to_string(), Value::Bool(false));
        map.insert("error".to_string(), Value::String(error.into()));
        Self(Value::Object(map))
    }

    /// Failure that keeps the tool's stdout for diagnostics.
    pub fn failure_with_stdout(error: impl Into<String>, stdout: impl Into<String>) -> Self {
        let mut result = Self::failure(error);
        if let Value::Object(map) = &mut result.0 {
            map.insert("stdout".to_string(), Value::String(stdout.into()));
        }
        result
    }

    /// Success wrapper for tools that print plain text instead of JSON.
    pub fn raw_output(text: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("success".to_string(), Value::Bool(true));
        map.insert("raw_output".to_string(), Value::String(text.into()));
        Self(Value::Object(map))
    }

    pub fn success(&self) -> bool {
        self.0
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn error(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}
