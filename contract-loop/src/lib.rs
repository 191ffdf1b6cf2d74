//! Self-healing generate, execute and validate loop over a declarative contract.
//!
//! A run asks an external generator for an artifact, executes it, validates
//! the produced output against the contract and, on failure, feeds a
//! structured account of the failure back into the next generation. After
//! `max_attempts` failed attempts it escalates to a human.
//!
//! - **[`core`]**: pure logic (decision policy, feedback, run state, results).
//! - **[`io`]**: side effects (workspaces, tool processes, config, checkpoints).
//!
//! [`attempt`] runs a single pass; [`run`] holds [`run::ContractLoop`], which
//! owns Init and the Retry Dispatcher.

pub mod attempt;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::report::RunResult;
pub use crate::core::state::{RetryState, RunRequest};
pub use crate::error::LoopError;
pub use crate::io::config::{LoopConfig, RetryMode};
pub use crate::io::tool::{ScriptInvoker, ToolInvoker};
pub use crate::run::{ContractLoop, Dispatch, RunHandle};
