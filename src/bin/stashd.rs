use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use stash::cli::DaemonOpts;
use stash::config::ServerConfig;
use stash::console::{ConsoleSink, TextConsole, TracingConsole};
use stash::{Server, ServerContext};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let config = ServerConfig::from_opts(&opts)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stash=info")),
        )
        .init();

    let console: Arc<dyn ConsoleSink> = match &config.console_log {
        Some(path) => Arc::new(
            TextConsole::new(path)
                .with_context(|| format!("open console log {}", path.display()))?,
        ),
        None => Arc::new(TracingConsole),
    };

    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!(
            bind = %config.bind,
            "listening on all interfaces; traffic is unencrypted"
        );
    }
    tracing::info!(
        users_root = %config.users_root.display(),
        inbox = %config.inbox_dir.display(),
        accounts = %config.accounts_path.display(),
        "starting stash daemon"
    );

    let ctx = ServerContext::from_config(config, console)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let server = Server::bind(ctx).await?;
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                tracing::info!("shutdown requested");
            })
            .await
    })
}
