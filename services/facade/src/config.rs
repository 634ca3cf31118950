//! Facade configuration.
//!
//! Env-driven. The listener section is handed to the accept loop as is;
//! the upstream list and shutdown grace belong to the process wrapper.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::facade::{ListenerConfig, SniffConfig, DEFAULT_SERVER_NAME};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default grace period between cancellation and process exit.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A static registration: requests for `routing_key` go to `addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub routing_key: String,
    /// `host:port`.
    pub addr: String,
}

/// Facade configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Accept loop, fixed responses and sniffing bounds.
    pub listener: ListenerConfig,

    /// Static upstream registrations.
    pub upstreams: Vec<Upstream>,

    /// Time in-flight connections get after shutdown starts.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("HOSTMUX_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let bind_addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("HOSTMUX_LISTEN_ADDR '{}' is not a socket address.", listen_addr))?;

        let server_name = var("HOSTMUX_SERVER_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let defaults = SniffConfig::default();

        let sniff_timeout_ms: u64 = var("HOSTMUX_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(defaults.timeout.as_millis() as u64);

        let max_head_bytes: usize = var("HOSTMUX_MAX_HEAD_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_MAX_HEAD_BYTES must be an integer.")?
            .unwrap_or(defaults.max_head_bytes)
            .clamp(256, 65536);

        let max_headers: usize = var("HOSTMUX_MAX_HEADERS")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_MAX_HEADERS must be an integer.")?
            .unwrap_or(defaults.max_headers)
            .max(1);

        let shutdown_grace_ms: u64 = var("HOSTMUX_SHUTDOWN_GRACE_MS")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTMUX_SHUTDOWN_GRACE_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE.as_millis() as u64);

        let upstreams = match var("HOSTMUX_UPSTREAMS") {
            Some(raw) => parse_upstreams(&raw).context("Invalid HOSTMUX_UPSTREAMS.")?,
            None => Vec::new(),
        };

        let log_level = var("HOSTMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let mut listener = ListenerConfig::new(bind_addr);
        listener.server_name = server_name;
        listener.sniff = SniffConfig {
            timeout: Duration::from_millis(sniff_timeout_ms.max(50)),
            max_head_bytes,
            max_headers,
        };

        Ok(Self {
            listener,
            upstreams,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            log_level,
        })
    }
}

/// Parse `key=host:port[,key=host:port...]`.
fn parse_upstreams(raw: &str) -> Result<Vec<Upstream>> {
    let mut seen = HashSet::new();
    let mut upstreams = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, addr)) = entry.split_once('=') else {
            bail!("entry '{}' is not key=host:port", entry);
        };
        let (key, addr) = (key.trim(), addr.trim());
        if key.is_empty() || key.contains('.') {
            bail!("entry '{}' has an invalid routing key", entry);
        }
        if addr.rsplit_once(':').is_none_or(|(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
            bail!("entry '{}' has an invalid upstream address", entry);
        }
        if !seen.insert(key.to_string()) {
            bail!("routing key '{}' is listed twice", key);
        }

        upstreams.push(Upstream {
            routing_key: key.to_string(),
            addr: addr.to_string(),
        });
    }

    Ok(upstreams)
}
