//! portgate - TCP port proxy
//!
//! Accepts connections on a port and relays each byte stream, unmodified,
//! to the first reachable backend a resolver offers for that port.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use error::{BoxError, ProxyError};
pub use proxy::{BackendCandidate, Resolver, SessionObserver, StaticResolver};
pub use server::{BoundProxy, ProxyEngine};
