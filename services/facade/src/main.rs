//! hostmux
//!
//! Host-routed TCP facade.
//!
//! This service:
//! - Accepts TCP connections on one listen address
//! - Sniffs the HTTP request head without losing any client bytes
//! - Routes on the leftmost label of the Host header
//! - Hands the live connection to the registered tunnel, or answers 400/404
//! - Relays statically configured tunnels to upstream TCP addresses

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostmux::config::Config;
use hostmux::facade::{serve_upstream, Listener, RelayConfig, TunnelRegistry, DEFAULT_TUNNEL_BACKLOG};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostmux");
    info!(
        listen_addr = %config.listener.bind_addr,
        server_name = %config.listener.server_name,
        upstream_count = config.upstreams.len(),
        "Configuration loaded"
    );

    let registry: Arc<TunnelRegistry> = Arc::new(TunnelRegistry::new());

    for upstream in &config.upstreams {
        let tunnel = registry
            .register(&upstream.routing_key, DEFAULT_TUNNEL_BACKLOG)
            .with_context(|| format!("Failed to register upstream '{}'", upstream.routing_key))?;
        tokio::spawn(serve_upstream(tunnel, RelayConfig::new(upstream.addr.clone())));
    }

    let listener = match Listener::bind(config.listener.clone(), registry.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr = %config.listener.bind_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();
    let listener_cancel = cancel.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run(listener_cancel).await {
            error!(error = %e, "Listener error");
        }
    });

    wait_for_shutdown_signal().await;
    warn!("hostmux will be shut down");
    cancel.cancel();

    if let Err(e) = listener_handle.await {
        error!(error = %e, "Listener task failed");
    }

    // In-flight connections get the grace period, then the runtime drops them.
    tokio::time::sleep(config.shutdown_grace).await;
    info!("Shutdown complete");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}
