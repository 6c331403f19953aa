use std::fmt;

use log::debug;
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// A candidate FSF server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on port {}", self.host, self.port)
    }
}

/// Configured set of servers a submission may go to. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPool {
    endpoints: Vec<ServerEndpoint>,
}

impl ServerPool {
    pub fn new(endpoints: Vec<ServerEndpoint>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::EmptyServerPool);
        }
        Ok(Self { endpoints })
    }

    /// Builds a pool where every host listens on the same port.
    pub fn from_hosts<I, S>(hosts: I, port: u16) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            hosts
                .into_iter()
                .map(|host| ServerEndpoint::new(host, port))
                .collect(),
        )
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Returns a uniformly random permutation of the pool.
///
/// This is a crude way to spread submissions across servers, nothing depends on it.
pub fn select_order<R: Rng + ?Sized>(pool: &ServerPool, rng: &mut R) -> Vec<ServerEndpoint> {
    let mut order = pool.endpoints.clone();
    order.shuffle(rng);
    debug!(
        "server order: {}",
        order
            .iter()
            .map(|e| e.host.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    order
}
