use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info};

use crate::error::ProxyError;
use crate::proxy::observer::{SharedObserver, TracingObserver};
use crate::proxy::resolver::SharedResolver;
use crate::proxy::session::{Session, SessionReport};
use crate::proxy::upstream::Upstream;

/// Default maximum concurrent connections per engine.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Proxy for a single listen port. Immutable once built.
#[derive(Clone)]
pub struct ProxyEngine {
    listen: String,
    port: u16,
    upstream: Upstream,
    max_connections: usize,
    observer: SharedObserver,
}

impl ProxyEngine {
    /// Pure configuration; nothing is bound until [`ProxyEngine::start`].
    pub fn new(
        listen: impl Into<String>,
        port: u16,
        dial_timeout: Duration,
        resolver: SharedResolver,
    ) -> Self {
        Self {
            listen: listen.into(),
            port,
            upstream: Upstream::new(resolver, dial_timeout),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listen_addr(&self) -> String {
        if self.listen.contains(':') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }

    /// Bind the listening socket without accepting yet.
    pub async fn bind(&self) -> Result<BoundProxy, ProxyError> {
        let bind_err = |source| ProxyError::Bind {
            addr: self.listen_addr(),
            source,
        };

        let listener = TcpListener::bind((self.listen.as_str(), self.port))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        Ok(BoundProxy {
            listener,
            local_addr,
            upstream: self.upstream.clone(),
            conn_semaphore: Arc::new(Semaphore::new(self.max_connections)),
            max_connections: self.max_connections,
            observer: Arc::clone(&self.observer),
        })
    }

    /// Bind and run the accept loop until it fails or `cancel` fires.
    ///
    /// Always returns an error; [`ProxyError::is_shutdown`] tells a requested
    /// stop apart from a failure.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ProxyError> {
        self.bind().await?.run(cancel).await
    }
}

/// An engine whose listening socket is bound.
pub struct BoundProxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    upstream: Upstream,
    conn_semaphore: Arc<Semaphore>,
    max_connections: usize,
    observer: SharedObserver,
}

impl BoundProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for watching the connection count after `run` takes ownership.
    pub fn connection_gauge(&self) -> ConnectionGauge {
        ConnectionGauge {
            semaphore: Arc::clone(&self.conn_semaphore),
            max_connections: self.max_connections,
        }
    }

    /// Accept connections until accept fails or `cancel` fires.
    ///
    /// Dispatched connections are not awaited: on cancellation the
    /// listening socket is closed and in-flight sessions run to their own
    /// completion. Connections still waiting on the resolver see `cancel`
    /// and are closed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        let port = self.local_addr.port();
        info!(bind_addr = %self.local_addr, "Listening");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(bind_addr = %self.local_addr, "Shutting down listener");
                    break Err(ProxyError::ListenerClosed { port });
                }
                res = self.listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(source) => {
                    tracing::error!(error = %source, "Accept failed");
                    break Err(ProxyError::Accept { port, source });
                }
            };

            let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.observer.on_rejected(port, peer);
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let upstream = self.upstream.clone();
            let observer = Arc::clone(&self.observer);
            let cancel = cancel.clone();

            tokio::spawn(
                async move {
                    tracing::debug!("Accepted connection");
                    let outcome = handle_connection(stream, port, &upstream, &cancel).await;
                    drop(permit);
                    observer.on_outcome(port, peer, &outcome);
                }
                .instrument(tracing::info_span!("connection", peer = %peer, port)),
            );
        };

        // Dropping the listener here closes the socket.
        drop(self.listener);
        result
    }
}

/// Cloneable view of an engine's in-flight connection count.
#[derive(Clone)]
pub struct ConnectionGauge {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionGauge {
    pub fn active(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }
}

/// Pair `client` with a backend and relay until the session ends.
///
/// On any failure before the session starts, `client` is dropped, which
/// closes it. `cancel` only reaches resolution; an established session
/// ignores it.
async fn handle_connection(
    client: TcpStream,
    port: u16,
    upstream: &Upstream,
    cancel: &CancellationToken,
) -> Result<SessionReport, ProxyError> {
    let (server, backend) = upstream.connect(cancel, port).await?;
    Session::new(client, server, backend).run().await
}
