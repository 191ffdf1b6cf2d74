//! Per-run workspace allocation.
//!
//! Each run owns one scratch directory holding the generated artifact, the
//! execution output and logs, and the loop's own bookkeeping. The directory is
//! reused across retries of the same run and is never deleted by the loop.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use crate::error::LoopError;

pub const WORKSPACE_PREFIX: &str = "contract-loop";
const TRACE_PREFIX_LEN: usize = 8;

/// Canonical paths of a run workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub tool_path: PathBuf,
    pub output_path: PathBuf,
    pub logs_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub result_path: PathBuf,
    pub attempts_dir: PathBuf,
}

impl Workspace {
    /// Paths for an existing workspace directory.
    pub fn at(root: impl Into<PathBuf>, artifact_file_name: &str) -> Self {
        let root = root.into();
        Self {
            tool_path: root.join(artifact_file_name),
            output_path: root.join("output.json"),
            logs_path: root.join("logs.json"),
            checkpoint_path: root.join("checkpoint.json"),
            result_path: root.join("result.json"),
            attempts_dir: root.join("attempts"),
            root,
        }
    }

    pub fn attempt_dir(&self, attempt: u32) -> PathBuf {
        self.attempts_dir.join(attempt.to_string())
    }
}

/// Directory name prefix derived from a trace id, e.g. `contract-loop-1a2b3c4d-`.
pub fn workspace_prefix(trace_id: &str) -> String {
    let short: String = trace_id.chars().take(TRACE_PREFIX_LEN).collect();
    format!("{WORKSPACE_PREFIX}-{short}-")
}

/// Create a fresh workspace directory under `base` for `trace_id`.
///
/// Uniqueness comes from `tempfile`'s random suffix, not from the trace id
/// prefix. Failure is a [`LoopError::WorkspaceAllocation`].
pub fn allocate(base: &Path, trace_id: &str, artifact_file_name: &str) -> Result<Workspace> {
    debug!(base = %base.display(), trace_id, "allocating workspace");
    let root = create_dir(base, trace_id).map_err(|source| LoopError::WorkspaceAllocation {
        base: base.to_path_buf(),
        source,
    })?;
    info!(trace_id, work_dir = %root.display(), "workspace allocated");
    Ok(Workspace::at(root, artifact_file_name))
}

fn create_dir(base: &Path, trace_id: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(base)?;
    let dir = tempfile::Builder::new()
        .prefix(&workspace_prefix(trace_id))
        .tempdir_in(base)?;
    Ok(dir.keep())
}
