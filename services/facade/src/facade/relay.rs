//! Static upstream relay.
//!
//! Serves a registered [`Tunnel`] by dialing a fixed upstream for every
//! handed-off connection and copying bytes both ways. The upstream receives
//! the client's stream from its first byte, request head included.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use super::registry::Tunnel;
use super::router::FacadeRequest;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay settings for one upstream.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream address (`host:port`).
    pub upstream: String,
    pub connect_timeout: Duration,
    /// Idle timeout per direction; `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Relay every connection handed to `tunnel` until it is deregistered.
pub async fn serve_upstream(mut tunnel: Tunnel, config: RelayConfig) {
    info!(routing_key = %tunnel.key(), upstream = %config.upstream, "Relay started");

    while let Some(request) = tunnel.accept().await {
        let config = config.clone();
        let span = tracing::info_span!(
            "relay",
            routing_key = %tunnel.key(),
            peer = ?request.peer_addr()
        );
        tokio::spawn(
            async move {
                match relay(request, &config).await {
                    Ok((to_upstream, from_upstream)) => debug!(
                        bytes_to_upstream = to_upstream,
                        bytes_from_upstream = from_upstream,
                        "Relay closed"
                    ),
                    Err(e) => warn!(upstream = %config.upstream, error = %e, "Relay failed"),
                }
            }
            .instrument(span),
        );
    }

    info!(routing_key = %tunnel.key(), "Relay stopped");
}

/// Connect to the upstream and proxy `request`'s connection to it.
///
/// Returns (bytes_to_upstream, bytes_from_upstream).
pub async fn relay(request: FacadeRequest, config: &RelayConfig) -> io::Result<(u64, u64)> {
    let upstream = match timeout(config.connect_timeout, TcpStream::connect(&config.upstream)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream connect timeout",
            ))
        }
    };
    debug!(upstream = %config.upstream, "Connected to upstream");

    proxy_bidirectional(request.into_stream(), upstream, config.idle_timeout).await
}

/// Proxy data bidirectionally between two streams.
///
/// Returns (bytes_to_b, bytes_from_b) once both directions have finished.
/// If either direction failed, the first failure is returned instead; the
/// bytes each direction moved before failing are logged.
pub async fn proxy_bidirectional<A, B>(
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut to_b = 0u64;
    let mut from_b = 0u64;
    let (a_result, b_result) = tokio::join!(
        copy_half(a_read, b_write, idle_timeout, &mut to_b),
        copy_half(b_read, a_write, idle_timeout, &mut from_b)
    );

    if let Err(e) = &a_result {
        warn!(direction = "to_upstream", bytes = to_b, error = %e, "Copy failed");
    }
    if let Err(e) = &b_result {
        warn!(direction = "from_upstream", bytes = from_b, error = %e, "Copy failed");
    }
    a_result.and(b_result)?;

    Ok((to_b, from_b))
}

async fn copy_half<R, W>(
    mut from: R,
    mut to: W,
    idle_timeout: Option<Duration>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let read_result = match idle_timeout {
            Some(idle) => match timeout(idle, from.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => from.read(&mut buf).await,
        };

        match read_result? {
            0 => break,
            n => {
                to.write_all(&buf[..n]).await?;
                *total += n as u64;
            }
        }
    }
    to.shutdown().await
}
