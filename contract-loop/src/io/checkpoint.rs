//! Durable bookkeeping inside the run workspace.
//!
//! `checkpoint.json` holds the [`RetryState`] for the next attempt when the
//! loop hands retries back to its host. `result.json` holds the terminal
//! [`RunResult`] so detached runs can be polled from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::report::RunResult;
use crate::core::state::RetryState;

/// Load a retry checkpoint from disk.
pub fn load_checkpoint(path: &Path) -> Result<RetryState> {
    debug!(path = %path.display(), "loading checkpoint");
    let state: RetryState = read_json(path)?;
    debug!(trace_id = %state.trace_id, attempt = state.attempt, "checkpoint loaded");
    Ok(state)
}

/// Atomically write a retry checkpoint (temp file + rename).
pub fn write_checkpoint(path: &Path, state: &RetryState) -> Result<()> {
    debug!(path = %path.display(), trace_id = %state.trace_id, attempt = state.attempt, "writing checkpoint");
    write_json_atomic(path, state)
}

/// Remove a checkpoint once the run has reached a terminal result.
pub fn clear_checkpoint(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

pub fn load_result(path: &Path) -> Result<RunResult> {
    read_json(path)
}

/// Atomically write the terminal result.
pub fn write_result(path: &Path, result: &RunResult) -> Result<()> {
    debug!(path = %path.display(), attempts = result.attempts(), "writing result");
    write_json_atomic(path, result)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RunRequest;
    use serde_json::json;
    use std::path::PathBuf;

    /// Verifies a checkpoint written by one process can seed the next attempt.
    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        let state = RetryState {
            request: RunRequest::new("contracts/echo.yaml", "echo", 3).with_input(json!({"x": 1})),
            trace_id: "trace-1".to_string(),
            work_dir: temp.path().to_path_buf(),
            attempt: 1,
            feedback: "ATTEMPT 1/3 FAILED.".to_string(),
        };

        write_checkpoint(&path, &state).expect("write");
        let loaded = load_checkpoint(&path).expect("load");
        assert_eq!(loaded, state);
        assert!(!temp.path().join("checkpoint.json.tmp").exists());

        clear_checkpoint(&path).expect("clear");
        assert!(!path.exists());
        clear_checkpoint(&path).expect("clear again");
    }

    #[test]
    fn result_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("result.json");
        let result = RunResult::success(PathBuf::from("/w/output.json"), PathBuf::from("/w/tool.nu"), 1);
        write_result(&path, &result).expect("write");
        assert_eq!(load_result(&path).expect("load"), result);
    }
}
