//! Backend candidates
//!
//! A candidate is an address at which a backend may be reachable for the
//! proxy's port. Candidates are produced fresh by a resolver for every
//! accepted connection and are never cached here.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Host used when a candidate is given as a bare port.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// A resolved backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendCandidate {
    /// Hostname or IP literal, without brackets for IPv6.
    pub host: String,

    /// TCP port on `host`.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCandidateError {
    #[error("empty backend address")]
    Empty,

    #[error("missing port in backend address `{0}`")]
    MissingPort(String),

    #[error("invalid port in backend address `{0}`")]
    InvalidPort(String),

    #[error("invalid host in backend address `{0}`")]
    InvalidHost(String),
}

impl BackendCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Candidate on the local machine, for backends published as host ports.
    pub fn loopback(port: u16) -> Self {
        Self::new(LOOPBACK_HOST, port)
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), LOOPBACK_HOST | "::1" | "localhost")
    }
}

impl fmt::Display for BackendCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, ParseCandidateError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ParseCandidateError::InvalidPort(input.to_string())),
        Ok(p) => Ok(p),
    }
}

impl FromStr for BackendCandidate {
    type Err = ParseCandidateError;

    /// Accepts `host:port`, `[v6]:port`, or a bare port meaning loopback.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseCandidateError::Empty);
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self::loopback(parse_port(s, s)?));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(ParseCandidateError::InvalidHost(s.to_string()));
            };
            let Some(port) = tail.strip_prefix(':') else {
                return Err(ParseCandidateError::MissingPort(s.to_string()));
            };
            if host.is_empty() {
                return Err(ParseCandidateError::InvalidHost(s.to_string()));
            }
            return Ok(Self::new(host, parse_port(port, s)?));
        }

        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(ParseCandidateError::MissingPort(s.to_string()));
        };
        // Unbracketed IPv6 is ambiguous.
        if host.is_empty() || host.contains(':') {
            return Err(ParseCandidateError::InvalidHost(s.to_string()));
        }

        Ok(Self::new(host, parse_port(port, s)?))
    }
}
