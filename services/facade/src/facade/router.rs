//! Routing key extraction and connection hand-off.
//!
//! The router derives a routing key from the leftmost label of the Host
//! header and offers the connection to an injected [`Forward`] capability.
//!
//! - Host without a `.` separator: fixed 400, connection closed
//! - Key not accepted: fixed 404 naming the key, connection closed
//! - Key accepted: the connection now belongs to the handler; the router
//!   never touches it again
//!
//! Responses are written straight onto the raw connection with HTTP/1.0
//! framing and the connection is shut down right after.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::peek::PeekableConn;
use super::sniff::RequestHead;

/// Default `Server` header value of the fixed responses.
pub const DEFAULT_SERVER_NAME: &str = "hostmux";

/// Body of the fixed 400 response.
const BAD_REQUEST_BODY: &str = "Bad Request\n";

/// Length of the 404 body minus the routing key: `"Tunnel "` plus `" not found\n"`.
///
/// Must stay in lockstep with [`not_found_body`].
pub const NOT_FOUND_FRAME_LEN: usize = 18;

fn not_found_body(routing_key: &str) -> String {
    format!("Tunnel {} not found\n", routing_key)
}

/// Fixed 400 response.
pub fn bad_request_response(server_name: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 400 Bad Request\r\nServer: {}\r\nContent-Length: {}\r\n\r\n{}",
        server_name,
        BAD_REQUEST_BODY.len(),
        BAD_REQUEST_BODY
    )
    .into_bytes()
}

/// Fixed 404 response for a routing key nobody accepted.
pub fn not_found_response(server_name: &str, routing_key: &str) -> Vec<u8> {
    let body = not_found_body(routing_key);
    let content_length = routing_key.len() + NOT_FOUND_FRAME_LEN;
    debug_assert_eq!(body.len(), content_length);

    format!(
        "HTTP/1.0 404 Not Found\r\nServer: {}\r\nContent-Length: {}\r\n\r\n{}",
        server_name, content_length, body
    )
    .into_bytes()
}

/// Derive the routing key from a Host value.
///
/// The key is the leftmost `.`-separated label, case preserved. Returns
/// `None` when the host has fewer than two labels.
pub fn routing_key(host: &str) -> Option<&str> {
    let mut labels = host.split('.');
    let first = labels.next()?;
    labels.next().map(|_| first)
}

/// A sniffed request together with the connection it arrived on.
///
/// Whoever holds this value owns the connection.
#[derive(Debug)]
pub struct FacadeRequest<S = TcpStream> {
    head: RequestHead,
    peer_addr: Option<SocketAddr>,
    conn: PeekableConn<S>,
}

impl<S> FacadeRequest<S> {
    pub fn new(head: RequestHead, conn: PeekableConn<S>) -> Self {
        Self {
            head,
            peer_addr: None,
            conn,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn host(&self) -> &str {
        &self.head.host
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Take the connection, replaying from the first byte the client sent.
    pub fn into_stream(self) -> PeekableConn<S> {
        self.conn
    }

    /// Take the connection positioned immediately after the request head.
    pub fn into_body_stream(mut self) -> PeekableConn<S> {
        self.conn.consume(self.head.head_len);
        self.conn
    }

    pub fn into_parts(self) -> (RequestHead, PeekableConn<S>) {
        (self.head, self.conn)
    }
}

/// Result of offering a request to a [`Forward`] capability.
#[derive(Debug)]
pub enum Forwarded<S = TcpStream> {
    /// A handler took ownership of the connection.
    Accepted,
    /// No live handler for the key; ownership comes back to the caller.
    Rejected(FacadeRequest<S>),
}

/// Lookup-and-handoff capability.
///
/// Called concurrently from every connection task.
#[async_trait]
pub trait Forward<S: Send + 'static = TcpStream>: Send + Sync {
    async fn forward(&self, routing_key: &str, request: FacadeRequest<S>) -> Forwarded<S>;
}

/// Adapts a plain function into a [`Forward`] capability.
pub struct ForwardFn<F>(pub F);

/// Build a [`Forward`] capability from a function.
pub fn forward_fn<F>(f: F) -> ForwardFn<F> {
    ForwardFn(f)
}

#[async_trait]
impl<S, F> Forward<S> for ForwardFn<F>
where
    S: Send + 'static,
    F: Fn(&str, FacadeRequest<S>) -> Forwarded<S> + Send + Sync,
{
    async fn forward(&self, routing_key: &str, request: FacadeRequest<S>) -> Forwarded<S> {
        (self.0)(routing_key, request)
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Handed off; the connection belongs to the handler.
    Forwarded { routing_key: String },
    /// Answered with 404 and closed.
    NotFound { routing_key: String },
    /// Answered with 400 and closed.
    BadRequest { reason: String },
}

/// Routes sniffed requests to a [`Forward`] capability.
#[derive(Debug, Clone)]
pub struct Router {
    server_name: String,
}

impl Router {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Derive the routing key from the request's Host and dispatch it.
    pub async fn route<S>(
        &self,
        request: FacadeRequest<S>,
        forward: &dyn Forward<S>,
    ) -> io::Result<RoutingDecision>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(key) = routing_key(request.host()).map(str::to_string) else {
            warn!(
                method = %request.method(),
                path = %request.path(),
                host = %request.host(),
                "Bad request: host has no routing key"
            );
            let reason = format!("host '{}' has no routing key", request.host());
            self.bad_request(request.into_stream()).await?;
            return Ok(RoutingDecision::BadRequest { reason });
        };

        self.dispatch(&key, request, forward).await
    }

    /// Offer `request` to `forward` under `routing_key`.
    ///
    /// On acceptance the request has been moved into the handler and this
    /// returns without any further I/O.
    pub async fn dispatch<S>(
        &self,
        routing_key: &str,
        request: FacadeRequest<S>,
        forward: &dyn Forward<S>,
    ) -> io::Result<RoutingDecision>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let method = request.method().to_string();
        let path = request.path().to_string();

        match forward.forward(routing_key, request).await {
            Forwarded::Accepted => {
                debug!(method = %method, routing_key = %routing_key, path = %path, "Tunnel found");
                Ok(RoutingDecision::Forwarded {
                    routing_key: routing_key.to_string(),
                })
            }
            Forwarded::Rejected(request) => {
                warn!(method = %method, routing_key = %routing_key, path = %path, "Tunnel not found");
                let response = not_found_response(&self.server_name, routing_key);
                respond_and_close(request.into_stream(), &response).await?;
                Ok(RoutingDecision::NotFound {
                    routing_key: routing_key.to_string(),
                })
            }
        }
    }

    /// Answer with the fixed 400 response and close.
    pub async fn bad_request<W: AsyncWrite + Unpin>(&self, conn: W) -> io::Result<()> {
        respond_and_close(conn, &bad_request_response(&self.server_name)).await
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_NAME)
    }
}

/// Write `response` and shut the connection down; dropping `conn` closes it.
async fn respond_and_close<W: AsyncWrite + Unpin>(mut conn: W, response: &[u8]) -> io::Result<()> {
    conn.write_all(response).await?;
    conn.shutdown().await
}
