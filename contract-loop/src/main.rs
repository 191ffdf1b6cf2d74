use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};

use contract_loop::core::report::RunResult;
use contract_loop::core::state::{RetryState, RunRequest};
use contract_loop::error::LoopError;
use contract_loop::exit_codes;
use contract_loop::io::checkpoint::{load_checkpoint, load_result};
use contract_loop::io::config::{DEFAULT_CONFIG_PATH, LoopConfig, RetryMode, load_config};
use contract_loop::io::tool::ScriptInvoker;
use contract_loop::io::workspace::Workspace;
use contract_loop::logging;
use contract_loop::run::{ContractLoop, Dispatch};

#[derive(Debug, Parser)]
#[command(
    name = "contract-loop",
    version,
    about = "Self-healing generate/execute/validate loop over a contract"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new run and drive it to a terminal result.
    Run {
        /// Contract handed to the generator and validator.
        #[arg(long)]
        contract: PathBuf,
        /// Natural-language description of the tool to generate.
        #[arg(long)]
        task: String,
        /// JSON input passed to the generated tool.
        #[arg(long, value_parser = parse_json)]
        input: Option<Value>,
        /// Overrides `max_attempts_default` from the config.
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// `inline` loops in-process; `spawn` stops after each failed attempt.
        #[arg(long)]
        retry_mode: Option<RetryMode>,
    },
    /// Continue a run from its `checkpoint.json`.
    Resume {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print the result or pending checkpoint of a workspace.
    Status {
        work_dir: PathBuf,
    },
}

fn main() {
    logging::init();
    let code = match dispatch(Cli::parse()) {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            contract,
            task,
            input,
            max_attempts,
            config,
            retry_mode,
        } => {
            let mut cfg = load_config(&config)?;
            if let Some(mode) = retry_mode {
                cfg.retry_mode = mode;
            }
            let mut request = RunRequest::new(
                contract,
                task,
                max_attempts.unwrap_or(cfg.max_attempts_default),
            );
            if let Some(input) = input {
                request = request.with_input(input);
            }
            let contract_loop = build_loop(cfg);
            let state = contract_loop.start(&request)?;
            let outcome = contract_loop.dispatch(&request, state)?;
            print_dispatch(&outcome)
        }
        Command::Resume { checkpoint, config } => {
            let cfg = load_config(&config)?;
            let retry = load_checkpoint(&checkpoint)?;
            let contract_loop = build_loop(cfg);
            let outcome = contract_loop.resume(retry)?;
            print_dispatch(&outcome)
        }
        Command::Status { work_dir } => cmd_status(&work_dir),
    }
}

fn build_loop(cfg: LoopConfig) -> ContractLoop<ScriptInvoker> {
    ContractLoop::new(ScriptInvoker::from_config(&cfg), cfg)
}

fn cmd_status(work_dir: &Path) -> Result<i32> {
    // Only the fixed bookkeeping files are read, so the artifact name is irrelevant.
    let workspace = Workspace::at(work_dir, "");
    if workspace.result_path.exists() {
        let result = load_result(&workspace.result_path)?;
        print_json(&result)?;
        return Ok(result_code(&result));
    }
    if workspace.checkpoint_path.exists() {
        let retry = load_checkpoint(&workspace.checkpoint_path)?;
        print_json(&pending(&retry, &workspace.checkpoint_path))?;
        return Ok(exit_codes::RETRY_PENDING);
    }
    Err(anyhow!(
        "no result.json or checkpoint.json in {}",
        work_dir.display()
    ))
}

fn print_dispatch(outcome: &Dispatch) -> Result<i32> {
    match outcome {
        Dispatch::Complete(result) => {
            print_json(result)?;
            Ok(result_code(result))
        }
        Dispatch::SpawnNext(retry) => {
            let checkpoint = retry.work_dir.join("checkpoint.json");
            print_json(&pending(retry, &checkpoint))?;
            Ok(exit_codes::RETRY_PENDING)
        }
    }
}

fn pending(retry: &RetryState, checkpoint: &Path) -> Value {
    json!({
        "status": "pending",
        "trace_id": retry.trace_id,
        "work_dir": retry.work_dir,
        "checkpoint": checkpoint,
        "next_attempt": retry.attempt + 1,
        "max_attempts": retry.request.max_attempts,
    })
}

fn result_code(result: &RunResult) -> i32 {
    if result.is_success() {
        exit_codes::OK
    } else {
        exit_codes::ESCALATED
    }
}

fn report_error(err: &anyhow::Error) -> i32 {
    if let Some(LoopError::GenerationFailed {
        trace_id,
        attempt,
        max_attempts,
        error,
    }) = err.downcast_ref::<LoopError>()
    {
        let failure = json!({
            "status": "failed",
            "trace_id": trace_id,
            "attempt": attempt,
            "max_attempts": max_attempts,
            "error": error,
        });
        if let Ok(text) = serde_json::to_string_pretty(&failure) {
            println!("{text}");
        }
    }
    eprintln!("{err:#}");
    exit_codes::FAILED
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid JSON: {err}"))
}
