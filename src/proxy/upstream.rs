//! Upstream connection establishment
//!
//! This module resolves the candidates for a port and connects to the
//! first one that accepts, trying them strictly in the order given.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::proxy::backend::BackendCandidate;
use crate::proxy::resolver::SharedResolver;

/// Default per-attempt connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves backends and dials them with failover
#[derive(Clone)]
pub struct Upstream {
    /// Source of candidates
    resolver: SharedResolver,

    /// Timeout for a single connect attempt
    dial_timeout: Duration,
}

impl Upstream {
    pub fn new(resolver: SharedResolver, dial_timeout: Duration) -> Self {
        Self {
            resolver,
            dial_timeout,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Resolve candidates for `port` and connect to the first reachable one.
    ///
    /// Resolver errors are not retried; that is the resolver's business.
    /// If `cancel` fires while resolution is pending, the resolve is
    /// abandoned and reported as a resolution failure.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        port: u16,
    ) -> Result<(TcpStream, BackendCandidate), ProxyError> {
        let resolved = tokio::select! {
            res = self.resolver.resolve(cancel, port) => res,
            _ = cancel.cancelled() => Err("resolution cancelled by shutdown".into()),
        };
        let candidates = resolved.map_err(|source| ProxyError::Resolution { port, source })?;

        tracing::debug!(port, candidates = candidates.len(), "Resolved backends");

        dial_with_failover(port, &candidates, self.dial_timeout).await
    }
}

/// Try `candidates` in order, each attempt bounded by `dial_timeout`.
///
/// Returns the first established stream. When every attempt fails, the
/// error carries the last attempt's failure.
pub async fn dial_with_failover(
    port: u16,
    candidates: &[BackendCandidate],
    dial_timeout: Duration,
) -> Result<(TcpStream, BackendCandidate), ProxyError> {
    if candidates.is_empty() {
        return Err(ProxyError::NoBackends { port });
    }

    let mut last_error = None;

    for (attempt, candidate) in candidates.iter().enumerate() {
        match dial(candidate, dial_timeout).await {
            Ok(stream) => {
                tracing::debug!(
                    backend = %candidate,
                    attempt = attempt + 1,
                    "Connected to backend"
                );
                return Ok((stream, candidate.clone()));
            }
            Err(e) => {
                tracing::warn!(
                    backend = %candidate,
                    attempt = attempt + 1,
                    error = %e,
                    "Failed to connect to backend"
                );
                last_error = Some(e);
            }
        }
    }

    let source = last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no attempt made"));

    Err(ProxyError::AllBackendsUnreachable {
        port,
        attempts: candidates.len(),
        source,
    })
}

async fn dial(candidate: &BackendCandidate, dial_timeout: Duration) -> io::Result<TcpStream> {
    let stream = timeout(
        dial_timeout,
        TcpStream::connect((candidate.host.as_str(), candidate.port)),
    )
    .await
    .map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "connect to {} timed out after {}ms",
                candidate,
                dial_timeout.as_millis()
            ),
        )
    })??;

    stream.set_nodelay(true)?;
    Ok(stream)
}
