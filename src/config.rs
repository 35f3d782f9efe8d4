//! Process configuration
//!
//! Loaded from an optional YAML file named by `PORTGATE_CONFIG`, then
//! overridden by environment variables.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::proxy::backend::BackendCandidate;
use crate::proxy::upstream::DEFAULT_DIAL_TIMEOUT;
use crate::server::listener::DEFAULT_MAX_CONNECTIONS;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "PORTGATE_CONFIG";

/// A backend entry as written in the config file: a bare port or an address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BackendSpec {
    Port(u16),
    Address(String),
}

impl BackendSpec {
    pub fn to_candidate(&self) -> Result<BackendCandidate> {
        match self {
            BackendSpec::Port(0) => bail!("backend port must not be 0"),
            BackendSpec::Port(port) => Ok(BackendCandidate::loopback(*port)),
            BackendSpec::Address(addr) => addr
                .parse()
                .with_context(|| format!("invalid backend `{}`", addr)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host or IP to listen on.
    #[serde(alias = "listen")]
    pub listen_addr: String,

    /// Ports to proxy. Defaults to the ports that have backends.
    pub ports: Vec<u16>,

    pub dial_timeout_ms: u64,

    pub max_connections: usize,

    pub log_level: String,

    /// Static backend table, keyed by listen port.
    pub backends: HashMap<u16, Vec<BackendSpec>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            ports: Vec::new(),
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: "info".to_string(),
            backends: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `PORTGATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config file {}", path))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(raw).context("failed to parse YAML")?;
        cfg.fill_ports();
        Ok(cfg)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("LISTEN") {
            self.listen_addr = listen;
        }

        if let Some(ports) = lookup("PORTGATE_PORTS") {
            self.ports = ports
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<u16>())
                .collect::<Result<_, _>>()
                .context("PORTGATE_PORTS must be a comma-separated list of ports.")?;
        }

        if let Some(ms) = lookup("PORTGATE_DIAL_TIMEOUT_MS") {
            self.dial_timeout_ms = ms
                .parse()
                .context("PORTGATE_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?;
        }

        if let Some(max) = lookup("PORTGATE_MAX_CONNECTIONS") {
            self.max_connections = max
                .parse()
                .context("PORTGATE_MAX_CONNECTIONS must be an integer.")?;
        }

        if let Some(level) = lookup("PORTGATE_LOG_LEVEL") {
            self.log_level = level;
        }

        self.fill_ports();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("no ports configured; set `ports` or PORTGATE_PORTS");
        }
        if self.ports.contains(&0) {
            bail!("listen port must not be 0");
        }
        if self.dial_timeout_ms == 0 {
            bail!("dial_timeout_ms must be greater than 0");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }
        self.backend_table().map(|_| ())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Parsed static backend table.
    pub fn backend_table(&self) -> Result<HashMap<u16, Vec<BackendCandidate>>> {
        self.backends
            .iter()
            .map(|(port, specs)| {
                let candidates = specs
                    .iter()
                    .map(BackendSpec::to_candidate)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("backends for port {}", port))?;
                Ok((*port, candidates))
            })
            .collect()
    }

    fn fill_ports(&mut self) {
        if self.ports.is_empty() {
            self.ports = self.backends.keys().copied().collect();
            self.ports.sort_unstable();
        }
    }
}
