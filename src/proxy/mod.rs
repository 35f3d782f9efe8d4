//! Connection proxying
//!
//! This module implements everything that happens to an accepted
//! connection: backend resolution, failover dial, and the relay session.

pub mod backend;
pub mod observer;
pub mod resolver;
pub mod session;
pub mod upstream;

pub use backend::{BackendCandidate, ParseCandidateError};
pub use observer::{SessionObserver, SharedObserver, TracingObserver};
pub use resolver::{Resolver, SharedResolver, StaticResolver};
pub use session::{Direction, Session, SessionReport};
pub use upstream::{Upstream, dial_with_failover};
