//! oi-sandbox daemon
//!
//! MCP server that compiles, runs, debugs and judges C++ code inside
//! per-request confined workspaces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oi_sandbox::config::{Config, EngineConfig};
use oi_sandbox::engine::Engine;
use oi_sandbox::mcp;

#[derive(Parser, Debug)]
#[command(name = "oi-sandbox")]
#[command(about = "MCP server for sandboxed C++ compile, run, debug and output comparison")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file (falls back to OI_SANDBOX_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let config = EngineConfig::resolve(config).context("Invalid configuration")?;

    info!(
        workspace_root = %config.workspace_root.display(),
        compiler = %config.compiler.executable.display(),
        ceilings = ?config.ceilings,
        "Loaded configuration"
    );

    let engine = Arc::new(Engine::new(config).context("Failed to initialize engine")?);

    // Sweep leftovers from a previous run, then keep sweeping.
    let swept = engine.workspaces().cleanup_expired();
    if swept > 0 {
        info!(swept, "Removed stale workspaces");
    }
    let reaper = engine.workspaces().start_reaper();

    let result = if args.stdio {
        mcp::serve_stdio(engine).await
    } else {
        Err(anyhow::anyhow!("Only --stdio mode is currently supported"))
    };

    reaper.abort();
    result
}
