//! The contract loop: Init, the Retry Dispatcher and the run entry points.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::attempt::{AttemptOutcome, Verdict, run_attempt};
use crate::core::report::RunResult;
use crate::core::state::{RetryState, RunRequest, RunState};
use crate::error::LoopError;
use crate::io::checkpoint::{clear_checkpoint, write_checkpoint, write_result};
use crate::io::config::{LoopConfig, RetryMode};
use crate::io::tool::ToolInvoker;
use crate::io::workspace::{Workspace, allocate};

/// Output of the Retry Dispatcher for one loop entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The run reached a terminal result.
    Complete(RunResult),
    /// Spawn mode: the host must schedule `resume` with this state.
    /// The same state has been written to the workspace checkpoint.
    SpawnNext(RetryState),
}

/// A self-healing generate, execute and validate loop over one tool invoker.
#[derive(Debug)]
pub struct ContractLoop<I> {
    invoker: I,
    config: LoopConfig,
}

impl<I: ToolInvoker> ContractLoop<I> {
    pub fn new(invoker: I, config: LoopConfig) -> Self {
        Self { invoker, config }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Init: validate the request, assign a trace id and allocate the workspace.
    pub fn start(&self, request: &RunRequest) -> Result<RunState> {
        request.check().map_err(LoopError::InvalidRequest)?;
        let trace_id = Uuid::new_v4().to_string();
        let workspace = allocate(
            &self.config.workspace_base(),
            &trace_id,
            &self.config.artifact_file_name,
        )?;
        info!(
            trace_id = %trace_id,
            work_dir = %workspace.root.display(),
            max_attempts = request.max_attempts,
            "run initialized"
        );
        Ok(RunState::initial(
            trace_id,
            workspace.root,
            request.max_attempts,
        ))
    }

    /// Run to a terminal result on the calling thread.
    ///
    /// In spawn mode every attempt still passes through the checkpoint, so the
    /// workspace looks the same as for a host-scheduled run.
    pub fn run(&self, request: RunRequest) -> Result<RunResult> {
        let state = self.start(&request)?;
        self.complete(request, state)
    }

    /// Continue a run from a retry state produced by an earlier dispatch.
    pub fn resume(&self, retry: RetryState) -> Result<Dispatch> {
        self.resume_with(retry, |_| {})
    }

    /// [`ContractLoop::resume`], calling `on_attempt` after every attempt.
    pub fn resume_with<F: FnMut(&AttemptOutcome)>(
        &self,
        retry: RetryState,
        on_attempt: F,
    ) -> Result<Dispatch> {
        retry
            .request
            .check()
            .map_err(LoopError::InvalidRequest)?;
        if retry.attempt > retry.request.max_attempts {
            return Err(LoopError::InvalidRequest(format!(
                "checkpoint attempt {} exceeds max_attempts {}",
                retry.attempt, retry.request.max_attempts
            ))
            .into());
        }
        if !retry.work_dir.is_dir() {
            return Err(anyhow!(
                "workspace {} no longer exists",
                retry.work_dir.display()
            ));
        }
        let (request, state) = retry.into_parts();
        self.dispatch_with(&request, state, on_attempt)
    }

    /// Drive attempts from `state` until a terminal result or, in spawn mode,
    /// until the first retry.
    pub fn dispatch(&self, request: &RunRequest, state: RunState) -> Result<Dispatch> {
        self.dispatch_with(request, state, |_| {})
    }

    /// [`ContractLoop::dispatch`], calling `on_attempt` after every attempt.
    #[instrument(skip_all, fields(trace_id = %state.trace_id))]
    pub fn dispatch_with<F: FnMut(&AttemptOutcome)>(
        &self,
        request: &RunRequest,
        mut state: RunState,
        mut on_attempt: F,
    ) -> Result<Dispatch> {
        let workspace = Workspace::at(&state.work_dir, &self.config.artifact_file_name);
        loop {
            if !state.can_generate() {
                warn!(
                    attempt = state.attempt,
                    max_attempts = state.max_attempts,
                    "attempt ceiling reached before generate"
                );
                let attempts = state.attempt.min(state.max_attempts);
                let result = RunResult::escalated(attempts, Value::Null);
                return Ok(Dispatch::Complete(self.finish(&workspace, result)));
            }

            let outcome = run_attempt(&self.invoker, &self.config, request, &state, &workspace)?;
            on_attempt(&outcome);
            let result = match outcome.verdict {
                Verdict::Success => RunResult::success(
                    workspace.output_path.clone(),
                    workspace.tool_path.clone(),
                    outcome.attempt,
                ),
                Verdict::Escalate { last_error } => {
                    RunResult::escalated(outcome.attempt, last_error)
                }
                Verdict::Retry { feedback } => {
                    state.attempt = outcome.attempt;
                    state.feedback = feedback;
                    match self.config.retry_mode {
                        RetryMode::Inline => continue,
                        RetryMode::Spawn => {
                            let retry = RetryState {
                                request: request.clone(),
                                trace_id: state.trace_id,
                                work_dir: state.work_dir,
                                attempt: state.attempt,
                                feedback: state.feedback,
                            };
                            write_checkpoint(&workspace.checkpoint_path, &retry)?;
                            info!(attempt = retry.attempt, "next attempt handed to host");
                            return Ok(Dispatch::SpawnNext(retry));
                        }
                    }
                }
            };
            return Ok(Dispatch::Complete(self.finish(&workspace, result)));
        }
    }

    /// Run the loop on a dedicated thread.
    ///
    /// Init happens before this returns, so the handle already knows the
    /// trace id and workspace.
    pub fn spawn(self: Arc<Self>, request: RunRequest) -> Result<RunHandle>
    where
        I: Send + Sync + 'static,
    {
        let state = self.start(&request)?;
        let trace_id = state.trace_id.clone();
        let work_dir = state.work_dir.clone();
        let thread_name: String = trace_id.chars().take(8).collect();
        let handle = thread::Builder::new()
            .name(format!("contract-loop-{thread_name}"))
            .spawn(move || self.complete(request, state))
            .context("spawn run thread")?;
        Ok(RunHandle {
            trace_id,
            work_dir,
            handle,
        })
    }

    fn complete(&self, request: RunRequest, state: RunState) -> Result<RunResult> {
        let mut next = self.dispatch(&request, state)?;
        loop {
            match next {
                Dispatch::Complete(result) => return Ok(result),
                Dispatch::SpawnNext(retry) => {
                    let (request, state) = retry.into_parts();
                    next = self.dispatch(&request, state)?;
                }
            }
        }
    }

    fn finish(&self, workspace: &Workspace, result: RunResult) -> RunResult {
        if let Err(err) = write_result(&workspace.result_path, &result) {
            warn!(error = %format!("{err:#}"), "failed to write result");
        }
        if let Err(err) = clear_checkpoint(&workspace.checkpoint_path) {
            warn!(error = %format!("{err:#}"), "failed to clear checkpoint");
        }
        info!(
            status = if result.is_success() { "success" } else { "escalated" },
            attempts = result.attempts(),
            "run finished"
        );
        result
    }
}

/// A run executing on its own thread.
#[derive(Debug)]
pub struct RunHandle {
    pub trace_id: String,
    pub work_dir: PathBuf,
    handle: JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the terminal result.
    pub fn join(self) -> Result<RunResult> {
        self.handle
            .join()
            .map_err(|_| anyhow!("run {} panicked", self.trace_id))?
    }
}
