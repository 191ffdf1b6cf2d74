//! Attempt logging helpers for `<work_dir>/attempts/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::core::types::Decision;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub trace_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub decision: Decision,
    pub valid: bool,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub generate_path: PathBuf,
    pub execute_path: PathBuf,
    pub validate_path: PathBuf,
    pub feedback_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, attempt: u32) -> Self {
        let dir = attempts_dir.join(attempt.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            generate_path: dir.join("generate.json"),
            execute_path: dir.join("execute.json"),
            validate_path: dir.join("validate.json"),
            feedback_path: dir.join("feedback.txt"),
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub attempts_dir: &'a Path,
    pub meta: &'a AttemptMeta,
    pub generate: &'a Value,
    pub execute: &'a Value,
    pub validate: &'a Value,
    /// Feedback synthesized for the next attempt (retries only).
    pub feedback: Option<&'a str>,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(request.attempts_dir, request.meta.attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    // meta.json first so a partially written attempt is still identifiable.
    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.generate_path, request.generate)?;
    write_json(&paths.execute_path, request.execute)?;
    write_json(&paths.validate_path, request.validate)?;
    if let Some(feedback) = request.feedback {
        write_text(&paths.feedback_path, feedback)?;
    }

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(&temp.path().join("attempts"), 3);

        assert!(paths.dir.ends_with(Path::new("attempts/3")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.generate_path.ends_with("generate.json"));
        assert!(paths.execute_path.ends_with("execute.json"));
        assert!(paths.validate_path.ends_with("validate.json"));
        assert!(paths.feedback_path.ends_with("feedback.txt"));
    }

    #[test]
    fn writes_retry_attempt_with_feedback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = AttemptMeta {
            trace_id: "trace-9".to_string(),
            attempt: 1,
            max_attempts: 3,
            decision: Decision::Retry,
            valid: false,
            started_at: None,
            ended_at: None,
            duration_ms: Some(12),
        };

        let paths = write_attempt(&AttemptWriteRequest {
            attempts_dir: &temp.path().join("attempts"),
            meta: &meta,
            generate: &json!({"success": true}),
            execute: &json!({"success": false, "error": "exit code 1"}),
            validate: &json!({"data": {"valid": false}}),
            feedback: Some("ATTEMPT 1/3 FAILED."),
        })
        .expect("write logs");

        assert!(paths.meta_path.is_file());
        assert!(paths.generate_path.is_file());
        assert!(paths.execute_path.is_file());
        assert!(paths.validate_path.is_file());
        let meta_json: Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read")).expect("json");
        assert_eq!(meta_json["decision"], "retry");
        assert_eq!(
            fs::read_to_string(&paths.feedback_path).expect("feedback"),
            "ATTEMPT 1/3 FAILED."
        );
    }

    #[test]
    fn terminal_attempt_has_no_feedback_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = AttemptMeta {
            trace_id: "trace-9".to_string(),
            attempt: 2,
            max_attempts: 2,
            decision: Decision::Success,
            valid: true,
            started_at: None,
            ended_at: None,
            duration_ms: None,
        };
        let paths = write_attempt(&AttemptWriteRequest {
            attempts_dir: temp.path(),
            meta: &meta,
            generate: &json!({}),
            execute: &json!({}),
            validate: &json!({"data": {"valid": true}}),
            feedback: None,
        })
        .expect("write logs");
        assert!(!paths.feedback_path.exists());
    }
}
