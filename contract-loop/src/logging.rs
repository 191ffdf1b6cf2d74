//! Diagnostic tracing for the contract loop.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is not
//! part of the run record: attempt logs under `<work_dir>/attempts/` are
//! written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=contract_loop=debug contract-loop run --contract c.yaml --task "..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call (e.g. from a host that already installed one) is a no-op.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
