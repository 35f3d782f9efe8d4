//! Error types for the proxy engine.
//!
//! `Bind`, `Accept` and `ListenerClosed` end the accept loop. Every other
//! variant is scoped to a single connection and never leaves its task.

use std::io;

use thiserror::Error;

use crate::proxy::session::Direction;

/// Boxed error returned by resolvers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Listen address could not be resolved or bound.
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accept failed on the listening socket.
    #[error("accept failed on port {port}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The listening socket was closed by cancellation.
    #[error("listener on port {port} closed")]
    ListenerClosed { port: u16 },

    /// The resolver failed to produce candidates.
    #[error("failed to resolve backends for port {port}")]
    Resolution {
        port: u16,
        #[source]
        source: BoxError,
    },

    /// The resolver returned an empty candidate list.
    #[error("no backends for port {port}")]
    NoBackends { port: u16 },

    /// Every candidate failed to connect. `source` is the last failure.
    #[error("all {attempts} backends for port {port} unreachable")]
    AllBackendsUnreachable {
        port: u16,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    /// A relay direction failed before teardown started.
    #[error("relay {direction} failed")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// True when the accept loop stopped because it was asked to.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ProxyError::ListenerClosed { .. })
    }

    /// Short stable label, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind",
            ProxyError::Accept { .. } => "accept",
            ProxyError::ListenerClosed { .. } => "listener_closed",
            ProxyError::Resolution { .. } => "resolution",
            ProxyError::NoBackends { .. } => "no_backends",
            ProxyError::AllBackendsUnreachable { .. } => "all_backends_unreachable",
            ProxyError::Relay { .. } => "relay",
        }
    }
}
