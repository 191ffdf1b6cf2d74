//! Tool invocation adapter for the generator, executor and validator.
//!
//! The [`ToolInvoker`] trait decouples the loop from the actual tool backend.
//! Tests use scripted invokers that return predetermined results without
//! spawning processes. [`ScriptInvoker`] runs each tool as a subprocess that
//! reads a JSON request on stdin and prints a JSON response on stdout.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ToolKind, ToolResult};
use crate::io::config::{LoopConfig, ToolCommands};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Synchronous request/response access to the external tools.
///
/// Implementations must never fail: every transport problem (spawn error,
/// timeout, nonzero exit, garbage output) is folded into the returned
/// [`ToolResult`] so the loop never branches on process-level error types.
pub trait ToolInvoker {
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult;
}

impl<T: ToolInvoker + ?Sized> ToolInvoker for &T {
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
        (**self).invoke(tool, request)
    }
}

impl<T: ToolInvoker + ?Sized> ToolInvoker for Box<T> {
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
        (**self).invoke(tool, request)
    }
}

impl<T: ToolInvoker + ?Sized> ToolInvoker for Arc<T> {
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
        (**self).invoke(tool, request)
    }
}

/// Invoker that runs each tool as an external script process.
#[derive(Debug, Clone)]
pub struct ScriptInvoker {
    pub commands: ToolCommands,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ScriptInvoker {
    pub fn from_config(cfg: &LoopConfig) -> Self {
        Self {
            commands: cfg.tools.clone(),
            timeout: Duration::from_secs(cfg.tool_timeout_secs),
            output_limit_bytes: cfg.tool_output_limit_bytes,
        }
    }

    fn command_for(&self, tool: ToolKind) -> Option<Command> {
        let argv = self.commands.argv(tool);
        let (program, args) = argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Some(cmd)
    }
}

impl ToolInvoker for ScriptInvoker {
    #[instrument(skip_all, fields(tool = %tool, timeout_secs = self.timeout.as_secs()))]
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
        let Some(cmd) = self.command_for(tool) else {
            warn!("no command configured");
            return ToolResult::failure(format!("no command configured for {tool}"));
        };
        let payload = match serde_json::to_vec(request) {
            Ok(payload) => payload,
            Err(e) => return ToolResult::failure(format!("serialize {tool} request: {e}")),
        };

        info!("invoking tool");
        match run_command_with_timeout(cmd, Some(payload), self.timeout, self.output_limit_bytes) {
            Ok(output) => normalize_output(&output),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "tool could not be run");
                ToolResult::failure(format!("failed to start {tool}: {e:#}"))
            }
        }
    }
}

/// Fold a finished process into the single tool-result shape.
///
/// - timeout → `{success:false, error:"timeout"}`
/// - nonzero exit → `{success:false, error:<stderr or "exit code N">, stdout}`
/// - zero exit with JSON stdout → that JSON, unwrapped
/// - zero exit with truncated, unparseable stdout → `{success:false, error, stdout}`
/// - zero exit with other stdout → `{success:true, raw_output}`
pub fn normalize_output(output: &CommandOutput) -> ToolResult {
    if output.timed_out {
        return ToolResult::failure("timeout");
    }

    let stdout = output.stdout_lossy();
    if !output.status.success() {
        let stderr = output.stderr_lossy();
        let error = if !stderr.trim().is_empty() {
            stderr
        } else {
            match output.status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        debug!(exit_code = ?output.status.code(), "tool exited with failure");
        return ToolResult::failure_with_stdout(error, stdout);
    }

    match serde_json::from_str::<Value>(&stdout) {
        Ok(value) => ToolResult::new(value),
        Err(_) if output.stdout_truncated > 0 => {
            warn!(
                kept = stdout.len(),
                discarded = output.stdout_truncated,
                "tool output truncated"
            );
            ToolResult::failure_with_stdout(
                format!(
                    "output truncated after {} bytes ({} bytes discarded)",
                    output.stdout.len(),
                    output.stdout_truncated
                ),
                stdout,
            )
        }
        Err(_) => {
            debug!(bytes = stdout.len(), "tool printed non-JSON output");
            ToolResult::raw_output(stdout)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str, timed_out: bool) -> CommandOutput {
        CommandOutput {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out,
        }
    }

    fn sh_invoker(script: &str, timeout: Duration) -> ScriptInvoker {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        ScriptInvoker {
            commands: ToolCommands {
                generator: argv.clone(),
                executor: argv.clone(),
                validator: argv,
            },
            timeout,
            output_limit_bytes: 100_000,
        }
    }

    #[test]
    fn json_stdout_is_passed_through_unwrapped() {
        let result = normalize_output(&output(0, r#"{"data":{"valid":true}}"#, "", false));
        assert_eq!(result.into_value(), json!({"data": {"valid": true}}));
    }

    #[test]
    fn plain_text_stdout_is_wrapped_as_success() {
        let result = normalize_output(&output(0, "hello\n", "", false));
        assert!(result.success());
        assert_eq!(result.get("raw_output"), Some(&json!("hello\n")));
    }

    #[test]
    fn truncated_json_is_a_failure_not_raw_output() {
        let mut cut = output(0, r#"{"success": false, ""#, "", false);
        cut.stdout_truncated = 512;
        let result = normalize_output(&cut);
        assert!(!result.success());
        assert_eq!(
            result.error(),
            Some("output truncated after 20 bytes (512 bytes discarded)")
        );
        assert_eq!(result.get("stdout"), Some(&json!(r#"{"success": false, ""#)));
    }

    #[test]
    fn oversized_generator_failure_is_not_reported_as_success() {
        let mut invoker = sh_invoker(
            r#"printf '{"success": false, "error": "%s"}' "$(head -c 300 /dev/zero | tr '\0' x)""#,
            Duration::from_secs(10),
        );
        invoker.output_limit_bytes = 20;
        let result = invoker.invoke(ToolKind::Generator, &json!({}));
        assert!(!result.success());
        assert!(result.error().is_some_and(|e| e.starts_with("output truncated after 20 bytes")));
    }

    #[test]
    fn nonzero_exit_uses_stderr_and_keeps_stdout() {
        let result = normalize_output(&output(2, "partial", "bad contract\n", false));
        assert!(!result.success());
        assert_eq!(result.error(), Some("bad contract\n"));
        assert_eq!(result.get("stdout"), Some(&json!("partial")));
    }

    #[test]
    fn nonzero_exit_with_blank_stderr_reports_exit_code() {
        let result = normalize_output(&output(3, "", "  \n", false));
        assert_eq!(result.error(), Some("exit code 3"));
    }

    #[test]
    fn timeout_is_a_failure() {
        let result = normalize_output(&output(0, "{}", "", true));
        assert_eq!(
            result.into_value(),
            json!({"success": false, "error": "timeout"})
        );
    }

    #[test]
    fn script_invoker_sends_request_on_stdin() {
        // The tool echoes its request back, so the response is the request.
        let invoker = sh_invoker("cat", Duration::from_secs(10));
        let request = json!({"success": true, "task": "echo"});
        let result = invoker.invoke(ToolKind::Generator, &request);
        assert_eq!(result.into_value(), request);
    }

    #[test]
    fn script_invoker_times_out_instead_of_hanging() {
        let invoker = sh_invoker("exec sleep 30", Duration::from_millis(200));
        let result = invoker.invoke(ToolKind::Executor, &json!({}));
        assert_eq!(result.error(), Some("timeout"));
    }

    #[test]
    fn background_child_does_not_extend_the_call() {
        let invoker = sh_invoker(r#"sleep 6 & echo '{"success": true}'"#, Duration::from_secs(1));
        let start = std::time::Instant::now();
        let result = invoker.invoke(ToolKind::Generator, &json!({}));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(result.into_value(), json!({"success": true}));
    }

    #[test]
    fn unreachable_tool_is_normalized() {
        let mut invoker = sh_invoker("true", Duration::from_secs(1));
        invoker.commands.validator = vec!["definitely-not-a-real-binary-contract-loop".to_string()];
        let result = invoker.invoke(ToolKind::Validator, &json!({}));
        assert!(!result.success());
        assert!(
            result
                .error()
                .is_some_and(|e| e.starts_with("failed to start validator"))
        );
    }

    #[test]
    fn empty_command_is_normalized() {
        let mut invoker = sh_invoker("true", Duration::from_secs(1));
        invoker.commands.executor = Vec::new();
        let result = invoker.invoke(ToolKind::Executor, &json!({}));
        assert_eq!(result.error(), Some("no command configured for executor"));
    }
}
