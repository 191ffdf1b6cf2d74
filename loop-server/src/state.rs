//! Shared application state and the in-memory run registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use contract_loop::core::report::RunResult;
use contract_loop::core::state::RunRequest;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::scheduler::Scheduler;

/// Where a run stands, as reported by `GET /api/runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    /// `attempt` is the attempt currently being worked on.
    Running { attempt: u32 },
    Success {
        output_path: PathBuf,
        tool_path: PathBuf,
        attempts: u32,
    },
    Escalated {
        message: String,
        attempts: u32,
        last_error: Value,
    },
    /// Run-level failure (generation failed, workspace lost, ...).
    Failed { error: String },
}

impl From<RunResult> for RunStatus {
    fn from(result: RunResult) -> Self {
        match result {
            RunResult::Success {
                output_path,
                tool_path,
                attempts,
            } => RunStatus::Success {
                output_path,
                tool_path,
                attempts,
            },
            RunResult::Escalated {
                message,
                attempts,
                last_error,
            } => RunStatus::Escalated {
                message,
                attempts,
                last_error,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub trace_id: String,
    pub work_dir: PathBuf,
    pub contract: PathBuf,
    pub task: String,
    pub max_attempts: u32,
    pub started_at: String,
    pub updated_at: String,
    #[serde(flatten)]
    pub status: RunStatus,
}

impl RunRecord {
    pub fn running(trace_id: String, work_dir: PathBuf, request: &RunRequest) -> Self {
        let now = now();
        Self {
            trace_id,
            work_dir,
            contract: request.contract.clone(),
            task: request.task.clone(),
            max_attempts: request.max_attempts,
            started_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running { attempt: 1 },
        }
    }
}

/// Finished runs kept in memory when no limit is configured.
pub const DEFAULT_RETAINED_RUNS: usize = 1000;

/// Host-side bookkeeping of runs started by this server.
///
/// Once more than `limit` runs are known, the oldest finished runs are
/// forgotten. Running runs are never evicted.
#[derive(Debug, Clone)]
pub struct Registry {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    limit: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_limit(DEFAULT_RETAINED_RUNS)
    }
}

impl Registry {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            runs: Arc::default(),
            limit,
        }
    }

    pub async fn insert(&self, record: RunRecord) {
        let mut runs = self.runs.write().await;
        runs.insert(record.trace_id.clone(), record);
        evict_finished(&mut runs, self.limit);
    }

    pub async fn update(&self, trace_id: &str, status: RunStatus) {
        let mut runs = self.runs.write().await;
        set_status(&mut runs, trace_id, status);
    }

    /// [`Registry::update`] for callers on a blocking thread.
    ///
    /// Panics when called from within an async context.
    pub fn blocking_update(&self, trace_id: &str, status: RunStatus) {
        set_status(&mut self.runs.blocking_write(), trace_id, status);
    }

    pub async fn get(&self, trace_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(trace_id).cloned()
    }

    /// All runs, oldest first.
    pub async fn list(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });
        runs
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
        }
    }
}

fn set_status(runs: &mut HashMap<String, RunRecord>, trace_id: &str, status: RunStatus) {
    if let Some(record) = runs.get_mut(trace_id) {
        record.status = status;
        record.updated_at = now();
    }
}

fn evict_finished(runs: &mut HashMap<String, RunRecord>, limit: usize) {
    let excess = runs.len().saturating_sub(limit);
    if excess == 0 {
        return;
    }
    let mut finished: Vec<(String, String)> = runs
        .values()
        .filter(|record| !matches!(record.status, RunStatus::Running { .. }))
        .map(|record| (record.started_at.clone(), record.trace_id.clone()))
        .collect();
    finished.sort();
    for (_, trace_id) in finished.into_iter().take(excess) {
        runs.remove(&trace_id);
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
