//! Loop configuration stored as TOML (default `contract-loop.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::ToolKind;

pub const DEFAULT_CONFIG_PATH: &str = "contract-loop.toml";

/// Names the loop itself owns inside a run workspace.
const RESERVED_FILE_NAMES: &[&str] = &[
    "output.json",
    "logs.json",
    "checkpoint.json",
    "checkpoint.json.tmp",
    "result.json",
    "result.json.tmp",
    "attempts",
];

/// How the Retry Dispatcher re-enters Generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Bounded in-process loop until a terminal result.
    #[default]
    Inline,
    /// One attempt per unit of work; retries hand a checkpoint back to the host.
    Spawn,
}

impl std::str::FromStr for RetryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(RetryMode::Inline),
            "spawn" => Ok(RetryMode::Spawn),
            other => Err(anyhow!("unknown retry mode '{other}' (expected inline|spawn)")),
        }
    }
}

/// Loop configuration (TOML).
///
/// Missing fields default to the values the bundled tools expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// `max_attempts` used when a caller does not pass one.
    pub max_attempts_default: u32,

    /// Hard wall-clock limit for each tool invocation, in seconds.
    pub tool_timeout_secs: u64,

    /// Keep at most this many bytes of each tool's stdout/stderr.
    pub tool_output_limit_bytes: usize,

    /// `server` field sent to the validator.
    pub validator_server: String,

    /// File name of the generated artifact inside the workspace.
    pub artifact_file_name: String,

    pub retry_mode: RetryMode,

    /// Parent directory for run workspaces. Defaults to the OS temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,

    pub tools: ToolCommands,
}

/// Argv for each external tool. The JSON request is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolCommands {
    pub generator: Vec<String>,
    pub executor: Vec<String>,
    pub validator: Vec<String>,
}

impl ToolCommands {
    pub fn argv(&self, tool: ToolKind) -> &[String] {
        match tool {
            ToolKind::Generator => &self.generator,
            ToolKind::Executor => &self.executor,
            ToolKind::Validator => &self.validator,
        }
    }
}

impl Default for ToolCommands {
    fn default() -> Self {
        let nu = |script: &str| vec!["nu".to_string(), format!("tools/{script}")];
        Self {
            generator: nu("generate.nu"),
            executor: nu("run-tool.nu"),
            validator: nu("validate.nu"),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts_default: 5,
            tool_timeout_secs: 300,
            tool_output_limit_bytes: 1_000_000,
            validator_server: "local".to_string(),
            artifact_file_name: "tool.nu".to_string(),
            retry_mode: RetryMode::Inline,
            workspace_dir: None,
            tools: ToolCommands::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts_default == 0 {
            return Err(anyhow!("max_attempts_default must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.tool_output_limit_bytes == 0 {
            return Err(anyhow!("tool_output_limit_bytes must be > 0"));
        }
        let name = self.artifact_file_name.trim();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(anyhow!("artifact_file_name must be a bare file name"));
        }
        if RESERVED_FILE_NAMES.contains(&name) {
            return Err(anyhow!("artifact_file_name '{name}' collides with a workspace file"));
        }
        for tool in [ToolKind::Generator, ToolKind::Executor, ToolKind::Validator] {
            let argv = self.tools.argv(tool);
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!("tools.{tool} must be a non-empty array"));
            }
        }
        Ok(())
    }

    /// Directory under which run workspaces are allocated.
    pub fn workspace_base(&self) -> PathBuf {
        self.workspace_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
        assert_eq!(cfg.tool_timeout_secs, 300);
        assert_eq!(cfg.max_attempts_default, 5);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("contract-loop.toml");
        let cfg = LoopConfig {
            retry_mode: RetryMode::Spawn,
            workspace_dir: Some(temp.path().join("runs")),
            ..LoopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("contract-loop.toml");
        fs::write(
            &path,
            "tool_timeout_secs = 10\nretry_mode = \"spawn\"\n\n[tools]\nvalidator = [\"./validate.sh\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.tool_timeout_secs, 10);
        assert_eq!(cfg.retry_mode, RetryMode::Spawn);
        assert_eq!(cfg.tools.validator, vec!["./validate.sh"]);
        assert_eq!(cfg.tools.generator, ToolCommands::default().generator);
    }

    #[test]
    fn validate_rejects_empty_tool_command() {
        let mut cfg = LoopConfig::default();
        cfg.tools.executor = Vec::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tools.executor"));
    }

    #[test]
    fn validate_rejects_artifact_path() {
        let cfg = LoopConfig {
            artifact_file_name: "../tool.nu".to_string(),
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_names_that_escape_or_clobber_the_workspace() {
        for name in [
            ".",
            "..",
            "output.json",
            "checkpoint.json",
            "result.json",
            "logs.json",
            "attempts",
        ] {
            let cfg = LoopConfig {
                artifact_file_name: name.to_string(),
                ..LoopConfig::default()
            };
            assert!(cfg.validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn retry_mode_parses_from_cli_strings() {
        assert_eq!("inline".parse::<RetryMode>().expect("parse"), RetryMode::Inline);
        assert_eq!("spawn".parse::<RetryMode>().expect("parse"), RetryMode::Spawn);
        assert!("later".parse::<RetryMode>().is_err());
    }
}
