//! Backend resolution
//!
//! The engine asks a [`Resolver`] for candidates once per accepted
//! connection. Ordering of the returned list is the trial order used by
//! failover; the engine does no reordering of its own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::proxy::backend::BackendCandidate;

/// Maps a listen port to the backends currently serving it.
///
/// Called concurrently from many connection tasks. `cancel` fires when the
/// engine that owns the connection shuts down; a resolver blocked on slow
/// discovery should give up at that point.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError>;
}

/// Resolver shared between engines and connection tasks.
pub type SharedResolver = Arc<dyn Resolver>;

/// Resolver backed by a fixed table, replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: Arc<RwLock<HashMap<u16, Vec<BackendCandidate>>>>,
}

impl StaticResolver {
    pub fn new(table: HashMap<u16, Vec<BackendCandidate>>) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Replace the candidates for one port. An empty list removes the port.
    pub async fn set_backends(&self, port: u16, backends: Vec<BackendCandidate>) {
        let mut table = self.table.write().await;
        if backends.is_empty() {
            table.remove(&port);
        } else {
            table.insert(port, backends);
        }
    }

    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.table.read().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        port: u16,
    ) -> Result<Vec<BackendCandidate>, BoxError> {
        Ok(self
            .table
            .read()
            .await
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }
}
