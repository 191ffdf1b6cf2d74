//! Runs contract loops on tokio's blocking pool.
//!
//! In spawn mode every attempt is its own blocking task and the `RetryState`
//! returned by one task seeds the next. In both modes the registry learns
//! about each retry from the attempt thread as soon as it is decided.

use std::sync::Arc;

use anyhow::{Context, Result};
use contract_loop::attempt::{AttemptOutcome, Verdict};
use contract_loop::core::report::RunResult;
use contract_loop::core::state::{RunRequest, RunState};
use contract_loop::io::tool::ToolInvoker;
use contract_loop::run::{ContractLoop, Dispatch};
use tokio::task::{self, JoinHandle};
use tracing::{info, warn};

use crate::state::{Registry, RunRecord, RunStatus};

pub type SharedInvoker = Arc<dyn ToolInvoker + Send + Sync>;
type SharedLoop = Arc<ContractLoop<SharedInvoker>>;

pub struct Scheduler {
    contract_loop: SharedLoop,
    registry: Registry,
}

impl Scheduler {
    pub fn new(contract_loop: ContractLoop<SharedInvoker>) -> Self {
        Self::with_registry(contract_loop, Registry::default())
    }

    pub fn with_registry(contract_loop: ContractLoop<SharedInvoker>, registry: Registry) -> Self {
        Self {
            contract_loop: Arc::new(contract_loop),
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn max_attempts_default(&self) -> u32 {
        self.contract_loop.config().max_attempts_default
    }

    /// Init the run and schedule it in the background.
    ///
    /// The returned record already carries the trace id and workspace.
    pub async fn submit(&self, request: RunRequest) -> Result<(RunRecord, JoinHandle<()>)> {
        let (request, state) = self.init(request).await?;
        let record = RunRecord::running(state.trace_id.clone(), state.work_dir.clone(), &request);
        self.registry.insert(record.clone()).await;

        let contract_loop = Arc::clone(&self.contract_loop);
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            // Failures are recorded in the registry by `drive`.
            let _ = drive(contract_loop, registry, request, state).await;
        });
        Ok((record, handle))
    }

    /// Init the run and wait for its terminal result.
    ///
    /// The run is driven by its own task, so dropping the returned future
    /// (a client hanging up) does not stop the run or its registry updates.
    pub async fn run_to_completion(&self, request: RunRequest) -> Result<RunResult> {
        let (request, state) = self.init(request).await?;
        let record = RunRecord::running(state.trace_id.clone(), state.work_dir.clone(), &request);
        self.registry.insert(record).await;
        tokio::spawn(drive(
            Arc::clone(&self.contract_loop),
            self.registry.clone(),
            request,
            state,
        ))
        .await
        .context("run task panicked")?
    }

    async fn init(&self, request: RunRequest) -> Result<(RunRequest, RunState)> {
        let contract_loop = Arc::clone(&self.contract_loop);
        task::spawn_blocking(move || -> Result<(RunRequest, RunState)> {
            let state = contract_loop.start(&request)?;
            Ok((request, state))
        })
        .await
        .context("init task panicked")?
    }
}

async fn drive(
    contract_loop: SharedLoop,
    registry: Registry,
    request: RunRequest,
    state: RunState,
) -> Result<RunResult> {
    let trace_id = state.trace_id.clone();
    let outcome = chain(&contract_loop, &registry, request, state).await;
    match &outcome {
        Ok(result) => {
            info!(%trace_id, attempts = result.attempts(), "run finished");
            registry
                .update(&trace_id, RunStatus::from(result.clone()))
                .await;
        }
        Err(err) => {
            let error = format!("{err:#}");
            warn!(%trace_id, %error, "run failed");
            registry.update(&trace_id, RunStatus::Failed { error }).await;
        }
    }
    outcome
}

async fn chain(
    contract_loop: &SharedLoop,
    registry: &Registry,
    request: RunRequest,
    state: RunState,
) -> Result<RunResult> {
    let trace_id = state.trace_id.clone();
    let first = Arc::clone(contract_loop);
    let progress = registry.clone();
    let id = trace_id.clone();
    let mut next = task::spawn_blocking(move || {
        first.dispatch_with(&request, state, |outcome| {
            record_attempt(&progress, &id, outcome);
        })
    })
    .await
    .context("attempt task panicked")??;
    loop {
        match next {
            Dispatch::Complete(result) => return Ok(result),
            Dispatch::SpawnNext(retry) => {
                let contract_loop = Arc::clone(contract_loop);
                let progress = registry.clone();
                let id = trace_id.clone();
                next = task::spawn_blocking(move || {
                    contract_loop.resume_with(retry, |outcome| {
                        record_attempt(&progress, &id, outcome);
                    })
                })
                .await
                .context("attempt task panicked")??;
            }
        }
    }
}

/// Runs on the attempt's blocking thread.
fn record_attempt(registry: &Registry, trace_id: &str, outcome: &AttemptOutcome) {
    if let Verdict::Retry { .. } = outcome.verdict {
        registry.blocking_update(
            trace_id,
            RunStatus::Running {
                attempt: outcome.attempt + 1,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contract_loop::core::types::{ToolKind, ToolResult};
    use contract_loop::error::LoopError;
    use contract_loop::io::config::RetryMode;
    use contract_loop::test_support::{ScriptedInvoker, test_config, validation};
    use serde_json::{Value, json};
    use std::time::Duration;

    /// Delays every generator call so a run stays in flight for a while.
    struct SlowGenerator {
        inner: ScriptedInvoker,
        delay: Duration,
    }

    impl ToolInvoker for SlowGenerator {
        fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
            if tool == ToolKind::Generator {
                std::thread::sleep(self.delay);
            }
            self.inner.invoke(tool, request)
        }
    }

    async fn wait_for<F: Fn(&RunStatus) -> bool>(
        registry: &Registry,
        trace_id: Option<&str>,
        done: F,
    ) -> RunRecord {
        for _ in 0..500 {
            let record = match trace_id {
                Some(id) => registry.get(id).await,
                None => registry.list().await.into_iter().next(),
            };
            if let Some(record) = record
                && done(&record.status)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached the expected status");
    }

    fn scheduler(
        invoker: ScriptedInvoker,
        base: &std::path::Path,
        mode: RetryMode,
    ) -> (Scheduler, Arc<ScriptedInvoker>) {
        let invoker = Arc::new(invoker);
        let shared: SharedInvoker = invoker.clone();
        let mut config = test_config(base);
        config.retry_mode = mode;
        (Scheduler::new(ContractLoop::new(shared, config)), invoker)
    }

    fn ok() -> serde_json::Value {
        json!({"success": true})
    }

    #[tokio::test]
    async fn submitted_run_is_recorded_until_terminal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (scheduler, _) = scheduler(
            ScriptedInvoker::new()
                .generator(ok())
                .executor(ok())
                .validator(validation(true)),
            temp.path(),
            RetryMode::Inline,
        );

        let (record, handle) = scheduler
            .submit(RunRequest::new("c.yaml", "task", 2))
            .await
            .expect("submit");
        assert_eq!(record.status, RunStatus::Running { attempt: 1 });
        assert!(record.work_dir.is_dir());

        handle.await.expect("join");
        let stored = scheduler.registry().get(&record.trace_id).await.expect("stored");
        assert!(matches!(stored.status, RunStatus::Success { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn spawn_mode_chains_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (scheduler, invoker) = scheduler(
            ScriptedInvoker::new()
                .generator(ok())
                .executor(ok())
                .validator(validation(false))
                .generator(ok())
                .executor(ok())
                .validator(validation(true)),
            temp.path(),
            RetryMode::Spawn,
        );

        let result = scheduler
            .run_to_completion(RunRequest::new("c.yaml", "task", 3))
            .await
            .expect("run");
        assert_eq!(result.attempts(), 2);
        assert_eq!(invoker.calls(ToolKind::Generator), 2);

        let runs = scheduler.registry().list().await;
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].work_dir.join("checkpoint.json").exists());
        invoker.assert_drained();
    }

    #[tokio::test]
    async fn generation_failure_is_recorded_as_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (scheduler, _) = scheduler(
            ScriptedInvoker::new().generator(json!({"success": false, "error": "offline"})),
            temp.path(),
            RetryMode::Inline,
        );

        let err = scheduler
            .run_to_completion(RunRequest::new("c.yaml", "task", 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::GenerationFailed { .. })
        ));
        let runs = scheduler.registry().list().await;
        match &runs[0].status {
            RunStatus::Failed { error } => assert!(error.contains("offline")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_wait_still_records_the_terminal_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker: SharedInvoker = Arc::new(SlowGenerator {
            inner: ScriptedInvoker::new()
                .generator(ok())
                .executor(ok())
                .validator(validation(true)),
            delay: Duration::from_millis(300),
        });
        let scheduler = Arc::new(Scheduler::new(ContractLoop::new(
            invoker,
            test_config(temp.path()),
        )));

        let waiting = Arc::clone(&scheduler);
        let request = tokio::spawn(async move {
            waiting
                .run_to_completion(RunRequest::new("c.yaml", "task", 2))
                .await
        });
        let running = wait_for(scheduler.registry(), None, |status| {
            matches!(status, RunStatus::Running { .. })
        })
        .await;
        request.abort();

        let record = wait_for(scheduler.registry(), Some(&running.trace_id), |status| {
            !matches!(status, RunStatus::Running { .. })
        })
        .await;
        assert!(matches!(record.status, RunStatus::Success { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn inline_retries_are_reported_while_the_run_is_in_flight() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker: SharedInvoker = Arc::new(SlowGenerator {
            inner: ScriptedInvoker::new()
                .generator(ok())
                .executor(ok())
                .validator(validation(false))
                .generator(ok())
                .executor(ok())
                .validator(validation(true)),
            delay: Duration::from_millis(300),
        });
        let scheduler = Scheduler::new(ContractLoop::new(invoker, test_config(temp.path())));

        let (record, handle) = scheduler
            .submit(RunRequest::new("c.yaml", "task", 3))
            .await
            .expect("submit");
        wait_for(scheduler.registry(), Some(&record.trace_id), |status| {
            *status == RunStatus::Running { attempt: 2 }
        })
        .await;

        handle.await.expect("join");
        let stored = scheduler.registry().get(&record.trace_id).await.expect("stored");
        assert!(matches!(stored.status, RunStatus::Success { attempts: 2, .. }));
    }

    #[test]
    fn only_retries_advance_the_running_attempt() {
        let registry = Registry::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let request = RunRequest::new("c.yaml", "task", 3);
        runtime.block_on(registry.insert(RunRecord::running(
            "t1".to_string(),
            std::path::PathBuf::from("/w"),
            &request,
        )));
        let outcome = |attempt, verdict| AttemptOutcome {
            attempt,
            generate: ToolResult::new(ok()),
            execute: ToolResult::new(ok()),
            validate: ToolResult::new(validation(false)),
            verdict,
        };

        let retry = Verdict::Retry {
            feedback: "fix".to_string(),
        };
        record_attempt(&registry, "t1", &outcome(1, retry));
        record_attempt(&registry, "t1", &outcome(2, Verdict::Success));

        let stored = runtime.block_on(registry.get("t1")).expect("stored");
        assert_eq!(stored.status, RunStatus::Running { attempt: 2 });
    }

    #[tokio::test]
    async fn invalid_request_is_not_registered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (scheduler, _) = scheduler(ScriptedInvoker::new(), temp.path(), RetryMode::Inline);

        assert!(
            scheduler
                .submit(RunRequest::new("c.yaml", "", 3))
                .await
                .is_err()
        );
        assert!(scheduler.registry().list().await.is_empty());
    }
}
