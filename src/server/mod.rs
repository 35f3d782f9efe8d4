//! Accept loop and engine lifecycle

pub mod listener;

pub use listener::{BoundProxy, ConnectionGauge, DEFAULT_MAX_CONNECTIONS, ProxyEngine};
