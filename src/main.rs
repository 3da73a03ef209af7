//! code-interpreter-proxy
//!
//! MCP server that multiplexes code execution onto reusable sandbox sessions.
//! Configuration comes from `CI_CONFIG` (JSON) and `CI_*` overrides.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_interpreter_proxy::config::Config;
use code_interpreter_proxy::manager::SessionManager;
use code_interpreter_proxy::runtime::RuntimeRegistry;
use code_interpreter_proxy::storage::{FileStore, StorageLimits};
use code_interpreter_proxy::{mcp, sweeper};

#[derive(Parser, Debug)]
#[command(name = "code-interpreter-proxy")]
#[command(about = "MCP server for session-based sandboxed code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Sandbox backend, overriding the configured one
    #[arg(long)]
    backend: Option<String>,
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

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    info!(
        backend = %config.backend,
        languages = ?config.supported_languages,
        storage = %config.file_storage_path.display(),
        "Loaded configuration"
    );

    let store = FileStore::open(
        &config.file_storage_path,
        StorageLimits {
            max_file_size_bytes: config.max_file_size_bytes,
            max_files_per_session: config.max_files_per_session,
        },
    )
    .await
    .context("Failed to open file storage")?;

    let runtime = RuntimeRegistry::with_defaults()
        .create(&config.backend, &config)
        .context("Failed to initialize sandbox backend")?;

    if config.sandbox_sweep_on_startup {
        let report = sweeper::sweep_stale_environments(
            runtime.as_ref(),
            config.session_ttl(),
            &config.sandbox_image_prefixes,
        )
        .await;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some stale sandbox environments could not be removed");
        }
    }

    let manager = Arc::new(SessionManager::from_config(&config, runtime, Arc::new(store))?);
    manager.start_cleanup_task().await;

    let served = mcp::serve_stdio(Arc::clone(&manager)).await;

    info!("Shutting down sessions");
    manager.shutdown().await;

    served
}
