//! TCP listener and connection handling.
//!
//! The listener owns the listening socket and spawns one task per accepted
//! connection. Each task wraps the socket in a [`PeekableConn`], sniffs the
//! request head and routes it. Nothing is shared between tasks except the
//! forward capability and the stats counters.
//!
//! Cancellation only stops the accept loop. The listening socket is closed
//! when `run` returns, so later connection attempts are refused by the OS.
//! Connection tasks already spawned run to completion.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::peek::PeekableConn;
use super::router::{FacadeRequest, Forward, Router, RoutingDecision, DEFAULT_SERVER_NAME};
use super::sniff::{HeadSniffer, SniffConfig};

/// Pause after a failed accept before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Facade startup and serving errors.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// `Server` header value of the fixed responses.
    pub server_name: String,
    /// Request head sniffing bounds.
    pub sniff: SniffConfig,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            sniff: SniffConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose task is still running.
    pub connections_active: AtomicU64,
    /// Connections whose task has finished.
    pub connections_closed: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
    /// Connections answered with 400.
    pub bad_requests: AtomicU64,
    /// Connections handed off to a handler.
    pub forwarded: AtomicU64,
    /// Connections answered with 404.
    pub not_found: AtomicU64,
}

/// Per-connection collaborators, shared by every connection task.
struct ConnectionHandler {
    sniffer: HeadSniffer,
    router: Router,
    forward: Arc<dyn Forward>,
    stats: Arc<ListenerStats>,
}

impl ConnectionHandler {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let mut conn = PeekableConn::new(stream);

        let head = match self.sniffer.sniff(&mut conn).await {
            Ok(head) => head,
            Err(e) => {
                self.stats.bad_requests.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Bad request");
                return self.router.bad_request(conn).await;
            }
        };

        let request = FacadeRequest::new(head, conn).with_peer_addr(peer_addr);
        let decision = self.router.route(request, self.forward.as_ref()).await?;

        let counter = match decision {
            RoutingDecision::Forwarded { .. } => &self.stats.forwarded,
            RoutingDecision::NotFound { .. } => &self.stats.not_found,
            RoutingDecision::BadRequest { .. } => &self.stats.bad_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }
}

/// A TCP listener for the facade.
pub struct Listener {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, forward: Arc<dyn Forward>) -> Result<Self, FacadeError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| FacadeError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            server_name = %config.server_name,
            "Listener bound"
        );

        Ok(Self {
            listener,
            handler: Arc::new(ConnectionHandler {
                sniffer: HeadSniffer::with_config(config.sniff),
                router: Router::new(config.server_name),
                forward,
                stats: Arc::new(ListenerStats::default()),
            }),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.handler.stats)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let handler = Arc::clone(&self.handler);
                    handler
                        .stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    handler
                        .stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(
                        async move {
                            if let Err(e) = handler.handle(stream, peer_addr).await {
                                debug!(error = %e, "Connection error");
                            }

                            handler
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            handler
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    if !accept_failed(&self.handler.stats, local_addr, &e, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

/// Record a failed accept and back off.
///
/// Returns `false` if `cancel` fired during the back-off.
async fn accept_failed(
    stats: &ListenerStats,
    local_addr: SocketAddr,
    error: &io::Error,
    cancel: &CancellationToken,
) -> bool {
    stats.accept_errors.fetch_add(1, Ordering::Relaxed);
    error!(bind_addr = %local_addr, error = %error, "Accept error");
    // Brief sleep to avoid tight loop on persistent errors
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Bind `config.bind_addr` and serve until `cancel` fires.
pub async fn serve(
    cancel: CancellationToken,
    config: ListenerConfig,
    forward: Arc<dyn Forward>,
) -> Result<(), FacadeError> {
    let listener = Listener::bind(config, forward).await?;
    listener.run(cancel).await?;
    Ok(())
}
