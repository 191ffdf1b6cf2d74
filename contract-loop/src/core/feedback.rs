//! Feedback synthesis for self-healing retries.
//!
//! Feedback for attempt N+1 is built from attempt N's validation result and
//! produced output only. Nothing from earlier attempts is carried forward.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;

/// Feedback sent with the first Generate request of a run.
pub const INITIAL_FEEDBACK: &str = "Initial generation";

const FEEDBACK_TEMPLATE: &str = include_str!("../templates/feedback.txt");

/// Inputs for a single feedback message.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackInputs<'a> {
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Full validation result of the failed attempt.
    pub validation: &'a Value,
    /// Content of the produced output file, if it could be read.
    pub output: Option<&'a str>,
}

/// Render the retry feedback message.
///
/// Layout: attempt counter, the labeled validation dump, the produced output
/// (when available), then the fix instruction as the last line.
pub fn synthesize_feedback(inputs: &FeedbackInputs<'_>) -> Result<String> {
    let errors =
        serde_json::to_string_pretty(inputs.validation).context("serialize validation result")?;
    let env = Environment::new();
    let rendered = env
        .render_str(
            FEEDBACK_TEMPLATE,
            context! {
                attempt => inputs.attempt,
                max_attempts => inputs.max_attempts,
                errors => errors,
                output => inputs.output,
            },
        )
        .context("render feedback template")?;
    Ok(rendered)
}
