use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use warden_daemon::audit::AuditLog;
use warden_daemon::config::WardenConfig;
use warden_daemon::context::DaemonContext;
use warden_daemon::handler::handle_request;
use warden_daemon::manager;
use warden_protocol::protocol::Request;
use warden_protocol::server::{RequestContext, Server};

/// Warden daemon - session authority, log streaming and service control
#[derive(Parser)]
#[command(name = "warden-daemon", about = "Warden daemon for session-gated log streaming and service control")]
struct Args {
    /// Config file (default ~/.warden/warden.yaml)
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the socket path from the config
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = match args.config {
        Some(path) => path,
        None => warden_daemon::default_config_path()?,
    };
    let config = WardenConfig::load(&config_path)?;
    info!("Loaded config from {}", config_path.display());

    let socket_path = match args.socket {
        Some(path) => path,
        None => config.socket_path()?,
    };
    if let Some(dir) = socket_path.parent() {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("creating socket directory {}", dir.display()))?;
    }

    let audit = Arc::new(AuditLog::from_config(&config.audit)?);
    let manager = manager::from_kind(config.process_manager);
    let daemon = Arc::new(DaemonContext::start(&config, manager, audit, None)?);

    let handler_daemon = daemon.clone();
    let handler = move |request: Request, ctx: RequestContext| {
        let daemon = handler_daemon.clone();
        async move { handle_request(daemon, request, ctx).await }
    };

    let server = Server::new(socket_path.clone(), handler);
    let shutdown_tx = server.shutdown_handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => warn!("Cannot listen for interrupts: {}", e),
        }
    });

    info!("Warden daemon starting on {}", socket_path.display());
    let result = server.run().await;

    daemon.shutdown().await;
    if let Err(e) = &result {
        error!("Server stopped with error: {}", e);
    }
    info!("Warden daemon stopped");
    result.map_err(Into::into)
}
