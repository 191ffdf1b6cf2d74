//! Run identity and progress threaded through the loop.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::feedback::INITIAL_FEEDBACK;

/// Caller-supplied inputs of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Path to the contract handed to the generator and validator.
    pub contract: PathBuf,
    /// Natural-language description of the artifact to generate.
    pub task: String,
    /// JSON input passed to the generated artifact by the executor.
    #[serde(default = "empty_input")]
    pub input: Value,
    pub max_attempts: u32,
}

fn empty_input() -> Value {
    Value::Object(Default::default())
}

impl RunRequest {
    pub fn new(contract: impl Into<PathBuf>, task: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            contract: contract.into(),
            task: task.into(),
            input: empty_input(),
            max_attempts,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Reject requests the loop cannot honor before any workspace is created.
    pub fn check(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.task.trim().is_empty() {
            return Err("task must not be empty".to_string());
        }
        if self.contract.as_os_str().is_empty() {
            return Err("contract path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Identity and progress of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub trace_id: String,
    pub work_dir: PathBuf,
    /// Number of Generate invocations issued so far (0 before the first).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Feedback injected into the next Generate request.
    pub feedback: String,
}

impl RunState {
    /// State right after Init.
    pub fn initial(trace_id: impl Into<String>, work_dir: impl Into<PathBuf>, max_attempts: u32) -> Self {
        Self {
            trace_id: trace_id.into(),
            work_dir: work_dir.into(),
            attempt: 0,
            max_attempts,
            feedback: INITIAL_FEEDBACK.to_string(),
        }
    }

    /// Whether another Generate may be issued without exceeding `max_attempts`.
    pub fn can_generate(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Label sent to the generator, e.g. `"2/5"`.
    pub fn attempt_label(attempt: u32, max_attempts: u32) -> String {
        format!("{attempt}/{max_attempts}")
    }
}

/// Self-sufficient input for the next attempt of a run.
///
/// Carries the run's identity, the last attempt number and the freshly
/// synthesized feedback. No other memory of earlier attempts is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub request: RunRequest,
    pub trace_id: String,
    pub work_dir: PathBuf,
    /// Attempt that just failed; the next Generate uses `attempt + 1`.
    pub attempt: u32,
    pub feedback: String,
}

impl RetryState {
    pub fn into_parts(self) -> (RunRequest, RunState) {
        let state = RunState {
            trace_id: self.trace_id,
            work_dir: self.work_dir,
            attempt: self.attempt,
            max_attempts: self.request.max_attempts,
            feedback: self.feedback,
        };
        (self.request, state)
    }
}
