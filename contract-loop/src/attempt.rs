//! One Generate → Execute → Validate → Decide pass of a run.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{decide, is_valid};
use crate::core::feedback::{FeedbackInputs, synthesize_feedback};
use crate::core::state::{RunRequest, RunState};
use crate::core::types::{Decision, ToolKind, ToolResult};
use crate::error::LoopError;
use crate::io::attempt_log::{AttemptMeta, AttemptWriteRequest, write_attempt};
use crate::io::config::LoopConfig;
use crate::io::tool::ToolInvoker;
use crate::io::workspace::Workspace;

#[derive(Debug, Serialize)]
struct ToolContext<'a> {
    trace_id: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contract_path: &'a Path,
    task: &'a str,
    feedback: &'a str,
    attempt: String,
    output_path: &'a Path,
    context: ToolContext<'a>,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    tool_path: &'a Path,
    tool_input: &'a Value,
    output_path: &'a Path,
    logs_path: &'a Path,
    context: ToolContext<'a>,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    contract_path: &'a Path,
    output_path: &'a Path,
    server: &'a str,
    context: ToolContext<'a>,
}

/// What the loop does after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success,
    /// Feedback for the next Generate, built from this attempt only.
    Retry { feedback: String },
    /// Validation result of the last permitted attempt.
    Escalate { last_error: Value },
}

impl Verdict {
    pub fn decision(&self) -> Decision {
        match self {
            Verdict::Success => Decision::Success,
            Verdict::Retry { .. } => Decision::Retry,
            Verdict::Escalate { .. } => Decision::Escalate,
        }
    }
}

/// Step results of one attempt. Each is produced once and never revised.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Attempt number just executed (1-based).
    pub attempt: u32,
    pub generate: ToolResult,
    pub execute: ToolResult,
    pub validate: ToolResult,
    pub verdict: Verdict,
}

/// Execute the attempt that follows `state.attempt`.
///
/// The caller guarantees `state.can_generate()`. A generator that reports
/// failure ends the run with [`LoopError::GenerationFailed`]; executor and
/// validator failures flow into the decision as ordinary results.
#[instrument(skip_all, fields(trace_id = %state.trace_id, attempt = state.attempt + 1))]
pub fn run_attempt<I: ToolInvoker + ?Sized>(
    invoker: &I,
    config: &LoopConfig,
    request: &RunRequest,
    state: &RunState,
    workspace: &Workspace,
) -> Result<AttemptOutcome> {
    let attempt = state.attempt + 1;
    let max_attempts = state.max_attempts;
    let started = Instant::now();
    let started_at = timestamp();
    let context = || ToolContext {
        trace_id: &state.trace_id,
    };

    let generate = invoker.invoke(
        ToolKind::Generator,
        &to_payload(ToolKind::Generator, &GenerateRequest {
            contract_path: &request.contract,
            task: &request.task,
            feedback: &state.feedback,
            attempt: RunState::attempt_label(attempt, max_attempts),
            output_path: &workspace.tool_path,
            context: context(),
        })?,
    );
    if !generate.success() {
        let error = generate
            .error()
            .unwrap_or("generator did not report success")
            .to_string();
        warn!(%error, "generation failed");
        return Err(LoopError::GenerationFailed {
            trace_id: state.trace_id.clone(),
            attempt,
            max_attempts,
            error,
        }
        .into());
    }

    let execute = invoker.invoke(
        ToolKind::Executor,
        &to_payload(ToolKind::Executor, &ExecuteRequest {
            tool_path: &workspace.tool_path,
            tool_input: &request.input,
            output_path: &workspace.output_path,
            logs_path: &workspace.logs_path,
            context: context(),
        })?,
    );
    if !execute.success() {
        debug!(error = execute.error(), "execution failed; validating anyway");
    }

    let validate = invoker.invoke(
        ToolKind::Validator,
        &to_payload(ToolKind::Validator, &ValidateRequest {
            contract_path: &request.contract,
            output_path: &workspace.output_path,
            server: &config.validator_server,
            context: context(),
        })?,
    );

    let valid = is_valid(validate.as_value());
    let verdict = match decide(valid, attempt, max_attempts) {
        Decision::Success => Verdict::Success,
        Decision::Escalate => Verdict::Escalate {
            last_error: validate.as_value().clone(),
        },
        Decision::Retry => {
            let output = read_output(&workspace.output_path);
            let feedback = synthesize_feedback(&FeedbackInputs {
                attempt,
                max_attempts,
                validation: validate.as_value(),
                output: output.as_deref(),
            })?;
            Verdict::Retry { feedback }
        }
    };
    info!(decision = verdict.decision().as_str(), valid, "attempt decided");

    let outcome = AttemptOutcome {
        attempt,
        generate,
        execute,
        validate,
        verdict,
    };
    let meta = AttemptMeta {
        trace_id: state.trace_id.clone(),
        attempt,
        max_attempts,
        decision: outcome.verdict.decision(),
        valid,
        started_at: Some(started_at),
        ended_at: Some(timestamp()),
        duration_ms: Some(started.elapsed().as_millis() as u64),
    };
    let feedback = match &outcome.verdict {
        Verdict::Retry { feedback } => Some(feedback.as_str()),
        _ => None,
    };
    if let Err(err) = write_attempt(&AttemptWriteRequest {
        attempts_dir: &workspace.attempts_dir,
        meta: &meta,
        generate: outcome.generate.as_value(),
        execute: outcome.execute.as_value(),
        validate: outcome.validate.as_value(),
        feedback,
    }) {
        warn!(error = %format!("{err:#}"), "failed to write attempt log");
    }

    Ok(outcome)
}

fn to_payload<T: Serialize>(tool: ToolKind, request: &T) -> Result<Value> {
    serde_json::to_value(request).with_context(|| format!("serialize {tool} request"))
}

fn read_output(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no readable output for feedback");
            None
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
