//! Caller-visible terminal results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed escalation message for the human picking up an exhausted run.
pub const ESCALATION_MESSAGE: &str = "AI failed to satisfy contract after max attempts. FIX THE PROMPT OR CONTRACT, NOT THE GENERATED TOOL.";

/// Terminal outcome of a run. There is no "retrying" variant: retries are
/// internal transitions and never reach the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Success {
        output_path: PathBuf,
        tool_path: PathBuf,
        attempts: u32,
    },
    Escalated {
        message: String,
        attempts: u32,
        /// Validation result of the final attempt.
        last_error: Value,
    },
}

impl RunResult {
    pub fn success(output_path: PathBuf, tool_path: PathBuf, attempts: u32) -> Self {
        RunResult::Success {
            output_path,
            tool_path,
            attempts,
        }
    }

    pub fn escalated(attempts: u32, last_error: Value) -> Self {
        RunResult::Escalated {
            message: ESCALATION_MESSAGE.to_string(),
            attempts,
            last_error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RunResult::Success { attempts, .. } | RunResult::Escalated { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }
}
