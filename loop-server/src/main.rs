//! Loop server - HTTP host that schedules contract loop runs.

mod routes;
mod scheduler;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use contract_loop::io::config::{DEFAULT_CONFIG_PATH, RetryMode, load_config};
use contract_loop::io::tool::ScriptInvoker;
use contract_loop::run::ContractLoop;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::scheduler::{Scheduler, SharedInvoker};
use crate::state::{AppState, DEFAULT_RETAINED_RUNS, Registry};

#[derive(Parser)]
#[command(name = "loop-server")]
#[command(about = "HTTP scheduler for contract loop runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3002")]
    port: u16,

    /// Loop configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `retry_mode` from the config (inline|spawn)
    #[arg(long)]
    retry_mode: Option<RetryMode>,

    /// Finished runs kept in memory before the oldest are forgotten
    #[arg(long, default_value_t = DEFAULT_RETAINED_RUNS)]
    retain_runs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loop_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(mode) = args.retry_mode {
        config.retry_mode = mode;
    }
    info!(
        config = %args.config.display(),
        retry_mode = ?config.retry_mode,
        workspace_base = %config.workspace_base().display(),
        "starting loop-server"
    );

    let invoker: SharedInvoker = Arc::new(ScriptInvoker::from_config(&config));
    let state = AppState::new(Scheduler::with_registry(
        ContractLoop::new(invoker, config),
        Registry::with_limit(args.retain_runs),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
