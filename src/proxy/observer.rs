//! Per-connection outcome reporting
//!
//! Connection tasks hand their outcome to a [`SessionObserver`] instead of
//! logging directly, so embedders and tests can capture results.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::proxy::session::SessionReport;

pub trait SessionObserver: Send + Sync {
    /// Called once per accepted connection after its handling has finished.
    fn on_outcome(&self, port: u16, peer: SocketAddr, outcome: &Result<SessionReport, ProxyError>);

    /// Called when a connection is turned away at the connection limit.
    fn on_rejected(&self, port: u16, peer: SocketAddr) {
        let _ = (port, peer);
    }
}

pub type SharedObserver = Arc<dyn SessionObserver>;

/// Logs outcomes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_outcome(&self, port: u16, peer: SocketAddr, outcome: &Result<SessionReport, ProxyError>) {
        match outcome {
            Ok(report) => tracing::info!(
                port,
                peer = %peer,
                backend = %report.backend,
                bytes_to_upstream = report.bytes_to_upstream,
                bytes_to_client = report.bytes_to_client,
                first_closed = %report.first_closed,
                duration_ms = report.duration.as_millis() as u64,
                "Session closed"
            ),
            Err(e) => {
                let cause = std::error::Error::source(e)
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                tracing::warn!(
                    port,
                    peer = %peer,
                    kind = e.kind(),
                    error = %e,
                    cause = %cause,
                    "Connection failed"
                );
            }
        }
    }

    fn on_rejected(&self, port: u16, peer: SocketAddr) {
        tracing::warn!(port, peer = %peer, "Connection rejected: max connections reached");
    }
}
