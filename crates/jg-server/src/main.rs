//! jumpgate daemon
//!
//! SSH jump server: authenticates a single client key, services
//! `direct-tcpip` channels, and provisions backing machines on demand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jg_core::{config, Diagnostics, Provider, Severity};
use jg_providers::ProviderRegistry;
use jg_server::auth::AuthPolicy;
use jg_server::manager::Manager;
use jg_server::server::{load_host_key, SshServer};

#[derive(Parser)]
#[command(name = "jumpgate")]
#[command(about = "SSH jump server with on-demand machines")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("jumpgate starting...");

    let config = config::load_config(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;

    // Resolve every target against the provider registry, collecting
    // diagnostics so the operator sees all mistakes in one run.
    let registry = ProviderRegistry::builtin();
    let mut diagnostics = Diagnostics::new();
    let mut targets: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (address, target) in &config.targets {
        match registry.create(address, target) {
            Ok(provider) => {
                targets.insert(address.clone(), provider);
            }
            Err(diags) => diagnostics.merge(diags),
        }
    }
    for diagnostic in diagnostics.iter() {
        match diagnostic.severity {
            Severity::Error => tracing::error!("{}", diagnostic),
            Severity::Warning => tracing::warn!("{}", diagnostic),
        }
    }
    if diagnostics.has_errors() {
        bail!("configuration errors");
    }
    if targets.is_empty() {
        tracing::warn!("no targets configured - every channel will be rejected");
    }

    let host_key = load_host_key(&config.server.host_key)?;
    let auth = AuthPolicy::from_openssh(&config.server.authorized_key)
        .map_err(|diags| anyhow::anyhow!("{}", diags))?;

    let manager = Manager::spawn(targets);
    let cancel = CancellationToken::new();

    // First signal starts graceful shutdown; a second one hard-exits.
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("received shutdown signal, stopping...");
        cancel_signal.cancel();
        wait_for_signal().await;
        tracing::warn!("second signal, exiting immediately");
        std::process::exit(1);
    });

    let server = SshServer::new(host_key, Arc::new(auth), manager.clone(), cancel.clone());
    server.run(&config.server.listen).await?;

    manager.stop().await;
    tracing::info!("jumpgate shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
