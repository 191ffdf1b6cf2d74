//! Run-level failures.
//!
//! Everything else (tool transport errors, contract violations, exhaustion)
//! is captured into structured results and never surfaces here.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    /// The request was rejected before Init.
    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    /// The per-run workspace could not be created. Retrying cannot help.
    #[error("allocate workspace under {}", base.display())]
    WorkspaceAllocation {
        base: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The generator could not produce an artifact. The validation feedback
    /// loop cannot repair a generator that does not run, so the run stops.
    #[error("generation failed for run {trace_id} (attempt {attempt}/{max_attempts}): {error}")]
    GenerationFailed {
        trace_id: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
}
