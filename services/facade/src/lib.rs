pub mod config;
pub mod facade;

pub use facade::{
    bad_request_response, forward_fn, not_found_response, routing_key, serve, serve_upstream,
    FacadeError, FacadeRequest, Forward, ForwardFn, Forwarded, HeadSniffer, Listener,
    ListenerConfig, ListenerStats, PeekableConn, RegistryError, RelayConfig, RequestHead, Router,
    RoutingDecision, SniffConfig, SniffError, Tunnel, TunnelRegistry,
};
