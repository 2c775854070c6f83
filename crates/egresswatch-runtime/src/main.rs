//! egresswatch-daemon - egress-attesting runtime daemon.
//!
//! Wires the audit pipeline together for a single function: generates (or
//! loads) the signing key, opens the log store, starts the logging proxy
//! on loopback, and serves the manifest registry API. The outer control
//! plane talks to these pieces over the interfaces they expose; this
//! binary is the minimal standalone deployment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use egresswatch_core::manifest::registry::ManifestRegistry;
use egresswatch_core::probe;
use egresswatch_core::sequencer::EntrySequencer;
use egresswatch_core::signer::Signer;
use egresswatch_core::store::{LogStore, MemoryLogStore, SqliteLogStore};
use egresswatch_runtime::api;
use egresswatch_runtime::proxy::{LoggingProxy, ProxyConfig};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// egresswatch daemon - egress-attesting function runtime
#[derive(Parser, Debug)]
#[command(name = "egresswatch-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port for the logging proxy (0 selects an ephemeral port)
    #[arg(long, default_value = "0")]
    proxy_port: u16,

    /// Function id whose egress chain the proxy feeds
    #[arg(long, default_value = "default")]
    function_id: String,

    /// Bind address for the manifest registry API
    #[arg(long, default_value = "127.0.0.1:8787")]
    registry_addr: SocketAddr,

    /// Path to the SQLite log store; omitted means in-memory
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Path to a PKCS#8 PEM private key; omitted means an ephemeral key
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Path to the loader interception shim probed for layer 3
    #[arg(long)]
    shim_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let capabilities = probe::probe(args.shim_path.as_deref());
    info!(
        level = %capabilities.level,
        network_namespace = capabilities.network_namespace,
        loader_shim = capabilities.loader_shim,
        syscall_filter = capabilities.syscall_filter,
        "isolation capabilities probed"
    );
    if capabilities.level == egresswatch_core::probe::IsolationLevel::Minimal {
        warn!("running with proxy-environment isolation only");
    }

    let signer = match &args.key_file {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            Signer::from_private_key_pem(&pem).context("failed to load signing key")?
        },
        None => Signer::generate().context("failed to generate signing key")?,
    };
    info!(fingerprint = %signer.key_fingerprint(), "signing key ready");

    let store: Arc<dyn LogStore> = match &args.store_path {
        Some(path) => Arc::new(
            SqliteLogStore::open(path)
                .with_context(|| format!("failed to open log store {}", path.display()))?,
        ),
        None => Arc::new(MemoryLogStore::new()),
    };

    let sequencer = Arc::new(EntrySequencer::new(store, Arc::new(signer)));

    let mut proxy = LoggingProxy::new(
        Arc::clone(&sequencer),
        ProxyConfig {
            port: args.proxy_port,
            function_id: args.function_id.clone(),
        },
    );
    let proxy_port = proxy.start().await.context("failed to start proxy")?;
    info!(proxy_port, "sandbox traffic should route via http://127.0.0.1:{proxy_port}");

    let registry = Arc::new(RwLock::new(ManifestRegistry::new()));
    let listener = tokio::net::TcpListener::bind(args.registry_addr)
        .await
        .with_context(|| format!("failed to bind registry API on {}", args.registry_addr))?;
    info!(addr = %args.registry_addr, "manifest registry API listening");

    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(registry)).await {
            warn!(error = %e, "registry API server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received; draining");
    proxy.stop().await;
    api_task.abort();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
    }
}
