//! Client configuration.
//!
//! Endpoints come either from an explicit server list or from a headless
//! DNS name that resolves to the set of backend IPs (plus a port override
//! for that case). Everything else tunes pools, timeouts, and the two
//! controller loops.
//!
//! # Environment Variables
//!
//! [`ClientConfig::from_env`] reads:
//!
//! - `MEMCACHED_SERVERS`: comma-separated list of `host:port` / unix-path
//!   endpoints
//! - `MEMCACHED_HEADLESS_SERVICE_ADDRESS`: headless service name to resolve
//!   periodically
//! - `MEMCACHED_PORT`: port joined to resolved IPs (default 11211)

use std::env;
use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_IDLE_CONNS, DEFAULT_MEMCACHED_PORT, DEFAULT_NODE_HEALTH_CHECK_PERIOD,
    DEFAULT_REBUILDING_NODE_PERIOD, DEFAULT_TIMEOUT,
};
use crate::error::{Error, Result};

/// Environment variable holding the explicit server list.
pub const ENV_SERVERS: &str = "MEMCACHED_SERVERS";
/// Environment variable holding the headless service name.
pub const ENV_HEADLESS_SERVICE_ADDRESS: &str = "MEMCACHED_HEADLESS_SERVICE_ADDRESS";
/// Environment variable holding the port override for headless lookups.
pub const ENV_PORT: &str = "MEMCACHED_PORT";

/// Credentials enabling PLAIN SASL authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the password.
        f.debug_struct("AuthCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for [`Client`](crate::client::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit list of endpoints (`host:port` or unix-socket paths).
    pub servers: Vec<String>,
    /// Headless service name resolved periodically to the endpoint set.
    pub headless_service_address: Option<String>,
    /// Port joined to IPs obtained from the headless lookup.
    pub port: u16,
    /// Maximum idle (and live) connections kept per address.
    pub max_idle_conns: usize,
    /// Socket read/write (and dial) timeout.
    pub socket_timeout: Duration,
    /// Period of the node health-check loop.
    pub health_check_period: Duration,
    /// Period of the ring rebuild loop.
    pub rebuild_period: Duration,
    /// When set, the controller never runs and the ring stays static.
    pub disable_node_provider: bool,
    /// When set, the rebuild loop does not rotate idle connections.
    pub disable_pool_refresh: bool,
    /// When set, no latency metrics are emitted.
    pub disable_diagnostics: bool,
    /// When set, [`telemetry::init`](crate::telemetry) installs nothing.
    pub disable_logs: bool,
    /// PLAIN SASL credentials; `None` disables authentication.
    pub auth: Option<AuthCredentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            headless_service_address: None,
            port: DEFAULT_MEMCACHED_PORT,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            socket_timeout: DEFAULT_TIMEOUT,
            health_check_period: DEFAULT_NODE_HEALTH_CHECK_PERIOD,
            rebuild_period: DEFAULT_REBUILDING_NODE_PERIOD,
            disable_node_provider: false,
            disable_pool_refresh: false,
            disable_diagnostics: false,
            disable_logs: false,
            auth: None,
        }
    }
}

impl ClientConfig {
    /// Configuration with an explicit server list and defaults elsewhere.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Read endpoint settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(servers) = env::var(ENV_SERVERS) {
            cfg.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(name) = env::var(ENV_HEADLESS_SERVICE_ADDRESS) {
            if !name.is_empty() {
                cfg.headless_service_address = Some(name);
            }
        }
        if let Ok(port) = env::var(ENV_PORT) {
            cfg.port = port
                .parse()
                .map_err(|_| Error::InvalidAddr(format!("{ENV_PORT}={port}")))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Ensure the configuration names at least one endpoint source.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() && self.headless_service_address.is_none() {
            return Err(Error::NotConfigured);
        }
        Ok(())
    }

    /// Set the headless service name.
    pub fn headless_service(mut self, name: impl Into<String>) -> Self {
        self.headless_service_address = Some(name.into());
        self
    }

    /// Set the port joined to headless-resolved IPs.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the per-address connection cap.
    pub fn max_idle_conns(mut self, n: usize) -> Self {
        self.max_idle_conns = n;
        self
    }

    /// Set the socket read/write timeout.
    pub fn socket_timeout(mut self, t: Duration) -> Self {
        self.socket_timeout = t;
        self
    }

    /// Set the health-check loop period.
    pub fn health_check_period(mut self, t: Duration) -> Self {
        self.health_check_period = t;
        self
    }

    /// Set the rebuild loop period.
    pub fn rebuild_period(mut self, t: Duration) -> Self {
        self.rebuild_period = t;
        self
    }

    /// Freeze ring membership: no health checks, no rebuilds.
    pub fn disable_node_provider(mut self) -> Self {
        self.disable_node_provider = true;
        self
    }

    /// Keep idle connections as old as they get.
    pub fn disable_pool_refresh(mut self) -> Self {
        self.disable_pool_refresh = true;
        self
    }

    /// Suppress latency metric emission.
    pub fn disable_diagnostics(mut self) -> Self {
        self.disable_diagnostics = true;
        self
    }

    /// Suppress the library's log subscriber installation.
    pub fn disable_logs(mut self) -> Self {
        self.disable_logs = true;
        self
    }

    /// Enable PLAIN SASL authentication.
    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(AuthCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_SOCKET_POOLING_TIMEOUT;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert!(cfg.servers.is_empty());
        assert_eq!(cfg.headless_service_address, None);
        assert_eq!(cfg.port, 11211);
        assert_eq!(cfg.max_idle_conns, 100);
        assert_eq!(cfg.socket_timeout, Duration::from_millis(500));
        assert_eq!(cfg.health_check_period, Duration::from_secs(15));
        assert_eq!(cfg.rebuild_period, Duration::from_secs(15));
        assert!(!cfg.disable_node_provider);
        assert!(!cfg.disable_pool_refresh);
        assert!(!cfg.disable_diagnostics);
        assert!(!cfg.disable_logs);
        assert!(cfg.auth.is_none());
        // Acquisition timeout is a constant, not a config knob.
        assert_eq!(DEFAULT_SOCKET_POOLING_TIMEOUT, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_requires_an_endpoint_source() {
        assert_eq!(ClientConfig::default().validate(), Err(Error::NotConfigured));
        assert!(ClientConfig::with_servers(["a:1"]).validate().is_ok());
        assert!(
            ClientConfig::default()
                .headless_service("cache.svc")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ClientConfig::with_servers(["10.0.0.1:11211", "10.0.0.2:11211"])
            .max_idle_conns(5)
            .socket_timeout(Duration::from_millis(100))
            .health_check_period(Duration::from_secs(1))
            .rebuild_period(Duration::from_secs(2))
            .disable_pool_refresh()
            .disable_diagnostics()
            .auth("user", "secret");

        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.max_idle_conns, 5);
        assert_eq!(cfg.socket_timeout, Duration::from_millis(100));
        assert_eq!(cfg.health_check_period, Duration::from_secs(1));
        assert_eq!(cfg.rebuild_period, Duration::from_secs(2));
        assert!(cfg.disable_pool_refresh);
        assert!(cfg.disable_diagnostics);
        assert_eq!(cfg.auth.as_ref().unwrap().username, "user");
    }

    #[test]
    fn test_auth_debug_redacts_password() {
        let auth = AuthCredentials {
            username: "user".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{auth:?}");
        assert!(printed.contains("user"));
        assert!(!printed.contains("hunter2"));
    }
}
