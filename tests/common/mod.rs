//! Shared helpers for the integration tests: backends, resolvers, and a
//! proxy launcher that captures per-connection outcomes.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use portgate::error::BoxError;
use portgate::proxy::{BackendCandidate, Direction, Resolver, SessionObserver, SessionReport};
use portgate::server::ConnectionGauge;
use portgate::{ProxyEngine, ProxyError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn candidate(addr: SocketAddr) -> BackendCandidate {
    BackendCandidate::new(addr.ip().to_string(), addr.port())
}

/// A loopback port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub struct EchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
}

impl EchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));

        let conn_count = Arc::clone(&connections);
        let closed_count = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                conn_count.fetch_add(1, Ordering::SeqCst);
                let closed = Arc::clone(&closed_count);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Ok(Self {
            addr,
            connections,
            closed,
        })
    }

    pub fn candidate(&self) -> BackendCandidate {
        candidate(self.addr)
    }

    /// Wait until `n` backend connections have been closed.
    pub async fn wait_closed(&self, n: u64) -> bool {
        wait_until(|| self.closed.load(Ordering::SeqCst) >= n).await
    }
}

/// Poll `cond` until it holds or [`EVENT_TIMEOUT`] passes.
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Returns the same candidates for every port and counts calls.
pub struct FixedResolver {
    pub candidates: Vec<BackendCandidate>,
    pub calls: AtomicUsize,
}

impl FixedResolver {
    pub fn new(candidates: Vec<BackendCandidate>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        _port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.candidates.clone())
    }
}

pub struct FailingResolver;

#[async_trait]
impl Resolver for FailingResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError> {
        Err(format!("discovery unavailable for port {}", port).into())
    }
}

/// Blocks until the engine's token fires, then gives up.
pub struct StalledResolver {
    pub calls: AtomicUsize,
}

impl StalledResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for StalledResolver {
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Err(format!("discovery for port {} abandoned", port).into())
    }
}

/// Never answers and ignores cancellation.
pub struct HungResolver;

#[async_trait]
impl Resolver for HungResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        _port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError> {
        std::future::pending().await
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub kind: &'static str,
    pub message: String,
    pub direction: Option<Direction>,
}

#[derive(Debug)]
pub enum Observed {
    Outcome {
        port: u16,
        result: Result<SessionReport, ObservedError>,
    },
    Rejected {
        port: u16,
    },
}

pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Observed>,
}

impl SessionObserver for ChannelObserver {
    fn on_outcome(&self, port: u16, _peer: SocketAddr, outcome: &Result<SessionReport, ProxyError>) {
        let result = match outcome {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(ObservedError {
                kind: e.kind(),
                message: e.to_string(),
                direction: match e {
                    ProxyError::Relay { direction, .. } => Some(*direction),
                    _ => None,
                },
            }),
        };
        let _ = self.tx.send(Observed::Outcome { port, result });
    }

    fn on_rejected(&self, port: u16, _peer: SocketAddr) {
        let _ = self.tx.send(Observed::Rejected { port });
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), ProxyError>>,
    pub gauge: ConnectionGauge,
    events: mpsc::UnboundedReceiver<Observed>,
}

impl TestProxy {
    pub async fn start(resolver: Arc<dyn Resolver>, dial_timeout: Duration) -> Self {
        Self::start_with_limit(resolver, dial_timeout, 1024).await
    }

    pub async fn start_with_limit(
        resolver: Arc<dyn Resolver>,
        dial_timeout: Duration,
        max_connections: usize,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let engine = ProxyEngine::new("127.0.0.1", 0, dial_timeout, resolver)
            .with_max_connections(max_connections)
            .with_observer(Arc::new(ChannelObserver { tx }));

        let bound = engine.bind().await.unwrap();
        let addr = bound.local_addr();
        let gauge = bound.connection_gauge();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bound.run(cancel.clone()));

        Self {
            addr,
            cancel,
            handle,
            gauge,
            events,
        }
    }

    pub async fn next_event(&mut self) -> Observed {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for proxy event")
            .expect("observer channel closed")
    }

    /// Next connection outcome, panicking on any other event.
    pub async fn next_outcome(&mut self) -> Result<SessionReport, ObservedError> {
        match self.next_event().await {
            Observed::Outcome { result, .. } => result,
            other => panic!("expected outcome, got {:?}", other),
        }
    }

    /// Panics if any event arrives within `window`.
    pub async fn assert_no_event(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.events.recv()).await {
            panic!("unexpected proxy event: {:?}", event);
        }
    }
}
