//! In-memory tunnel registry.
//!
//! Maps routing keys to live handlers. Each registration owns the receiving
//! half of a bounded channel; the facade hands accepted connections to it.
//! Dropping the [`Tunnel`] closes the channel and the key stops accepting.
//!
//! Uses ArcSwap so lookups on the connection path never block behind
//! registration changes.

use std::collections::HashMap;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::router::{FacadeRequest, Forward, Forwarded};

/// Default number of handed-off connections a tunnel may have queued.
pub const DEFAULT_TUNNEL_BACKLOG: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("routing key '{0}' is already registered")]
    AlreadyRegistered(String),
}

type Handlers<S> = HashMap<String, mpsc::Sender<FacadeRequest<S>>>;

/// Receiving end of a registration.
#[derive(Debug)]
pub struct Tunnel<S = TcpStream> {
    key: String,
    rx: mpsc::Receiver<FacadeRequest<S>>,
}

impl<S> Tunnel<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next handed-off connection.
    ///
    /// Returns `None` once the registration has been removed.
    pub async fn accept(&mut self) -> Option<FacadeRequest<S>> {
        self.rx.recv().await
    }
}

/// Registry of live tunnels, usable as the facade's [`Forward`] capability.
pub struct TunnelRegistry<S = TcpStream> {
    tunnels: ArcSwap<Handlers<S>>,
}

impl<S> TunnelRegistry<S> {
    pub fn new() -> Self {
        Self {
            tunnels: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Register a handler for `key` with room for `backlog` queued connections.
    ///
    /// A key whose previous [`Tunnel`] was dropped can be registered again.
    pub fn register(&self, key: &str, backlog: usize) -> Result<Tunnel<S>, RegistryError> {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let mut taken = false;

        self.tunnels.rcu(|current| {
            let mut next = Handlers::clone(current);
            taken = next.get(key).is_some_and(|existing| !existing.is_closed());
            if !taken {
                next.insert(key.to_string(), tx.clone());
            }
            next
        });

        if taken {
            return Err(RegistryError::AlreadyRegistered(key.to_string()));
        }

        info!(routing_key = %key, "Tunnel registered");
        Ok(Tunnel {
            key: key.to_string(),
            rx,
        })
    }

    /// Remove the registration for `key`. Returns whether one existed.
    pub fn deregister(&self, key: &str) -> bool {
        let mut removed = false;
        self.tunnels.rcu(|current| {
            let mut next = Handlers::clone(current);
            removed = next.remove(key).is_some();
            next
        });
        if removed {
            info!(routing_key = %key, "Tunnel deregistered");
        }
        removed
    }

    /// Whether a live handler is registered for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.tunnels
            .load()
            .get(key)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.tunnels.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.load().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.tunnels.load().keys().cloned().collect()
    }

    /// Drop the entry for `key` if its handler has gone away.
    fn prune(&self, key: &str) {
        self.tunnels.rcu(|current| {
            let mut next = Handlers::clone(current);
            if next.get(key).is_some_and(|tx| tx.is_closed()) {
                next.remove(key);
            }
            next
        });
        debug!(routing_key = %key, "Pruned closed tunnel");
    }
}

impl<S> Default for TunnelRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Send + 'static> Forward<S> for TunnelRegistry<S> {
    async fn forward(&self, routing_key: &str, request: FacadeRequest<S>) -> Forwarded<S> {
        let Some(tx) = self.tunnels.load().get(routing_key).cloned() else {
            return Forwarded::Rejected(request);
        };

        match tx.try_send(request) {
            Ok(()) => Forwarded::Accepted,
            Err(TrySendError::Full(request)) => {
                warn!(routing_key = %routing_key, "Tunnel backlog full");
                Forwarded::Rejected(request)
            }
            Err(TrySendError::Closed(request)) => {
                self.prune(routing_key);
                Forwarded::Rejected(request)
            }
        }
    }
}
