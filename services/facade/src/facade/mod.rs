//! Host-routed connection facade.
//!
//! This module provides:
//! - A replayable connection wrapper
//! - HTTP/1.x request head sniffing
//! - Routing key extraction and connection hand-off
//! - The accept loop
//! - An in-memory tunnel registry and a static upstream relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> PeekableConn -> HeadSniffer -> Router -> Forward (registry) -> Tunnel
//!                                                        |
//!                                              400 / 404 fixed responses
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use hostmux::{serve, ListenerConfig, TunnelRegistry};
//!
//! let registry = Arc::new(TunnelRegistry::new());
//! let mut tunnel = registry.register("app", 64)?;
//!
//! let cancel = CancellationToken::new();
//! let config = ListenerConfig::new("0.0.0.0:8080".parse()?);
//! tokio::spawn(serve(cancel.clone(), config, registry));
//!
//! while let Some(request) = tunnel.accept().await {
//!     // request.into_stream() replays the client's bytes from the start
//! }
//! ```

mod listener;
mod peek;
mod registry;
mod relay;
mod router;
mod sniff;

pub use listener::{serve, FacadeError, Listener, ListenerConfig, ListenerStats};
pub use peek::PeekableConn;
pub use registry::{RegistryError, Tunnel, TunnelRegistry, DEFAULT_TUNNEL_BACKLOG};
pub use relay::{proxy_bidirectional, relay, serve_upstream, RelayConfig};
pub use router::{
    bad_request_response, forward_fn, not_found_response, routing_key, FacadeRequest, Forward,
    ForwardFn, Forwarded, Router, RoutingDecision, DEFAULT_SERVER_NAME, NOT_FOUND_FRAME_LEN,
};
pub use sniff::{HeadSniffer, RequestHead, SniffConfig, SniffError};
