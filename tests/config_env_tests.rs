//! Integration tests for ClientConfig::from_env().
//!
//! Environment variables are process-global, so every test here serializes
//! on one mutex and restores the variables it touched before finishing.

use std::env;
use std::sync::Mutex;

use memcachesque::config::{
    ClientConfig, ENV_HEADLESS_SERVICE_ADDRESS, ENV_PORT, ENV_SERVERS,
};
use memcachesque::error::Error;

/// Global mutex to serialize all env-based tests.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// All environment variables read by ClientConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[ENV_SERVERS, ENV_HEADLESS_SERVICE_ADDRESS, ENV_PORT];

struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn capture() -> Self {
        let saved = ALL_CONFIG_ENV_VARS
            .iter()
            .map(|&name| (name, env::var(name).ok()))
            .collect();
        for name in ALL_CONFIG_ENV_VARS {
            env::remove_var(name);
        }
        EnvGuard { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            match value {
                Some(v) => env::set_var(name, v),
                None => env::remove_var(name),
            }
        }
    }
}

#[test]
fn test_from_env_with_server_list() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    env::set_var(ENV_SERVERS, "10.0.0.1:11211, 10.0.0.2:11211 ,10.0.0.3:11211");

    let cfg = ClientConfig::from_env().unwrap();
    assert_eq!(
        cfg.servers,
        vec!["10.0.0.1:11211", "10.0.0.2:11211", "10.0.0.3:11211"]
    );
    assert_eq!(cfg.headless_service_address, None);
    assert_eq!(cfg.port, 11211);
}

#[test]
fn test_from_env_with_headless_service() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    env::set_var(ENV_HEADLESS_SERVICE_ADDRESS, "memcached.cache.svc.cluster.local");
    env::set_var(ENV_PORT, "11311");

    let cfg = ClientConfig::from_env().unwrap();
    assert!(cfg.servers.is_empty());
    assert_eq!(
        cfg.headless_service_address.as_deref(),
        Some("memcached.cache.svc.cluster.local")
    );
    assert_eq!(cfg.port, 11311);
}

#[test]
fn test_from_env_without_endpoints_fails() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    assert_eq!(ClientConfig::from_env().unwrap_err(), Error::NotConfigured);
}

#[test]
fn test_from_env_rejects_bad_port() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    env::set_var(ENV_HEADLESS_SERVICE_ADDRESS, "cache.svc");
    env::set_var(ENV_PORT, "not-a-port");

    assert!(matches!(
        ClientConfig::from_env().unwrap_err(),
        Error::InvalidAddr(_)
    ));
}

#[test]
fn test_from_env_ignores_empty_entries() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    env::set_var(ENV_SERVERS, "10.0.0.1:11211,, ,");

    let cfg = ClientConfig::from_env().unwrap();
    assert_eq!(cfg.servers, vec!["10.0.0.1:11211"]);
}

#[test]
fn test_from_env_empty_headless_name_is_none() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::capture();

    env::set_var(ENV_SERVERS, "10.0.0.1:11211");
    env::set_var(ENV_HEADLESS_SERVICE_ADDRESS, "");

    let cfg = ClientConfig::from_env().unwrap();
    assert_eq!(cfg.headless_service_address, None);
}
