// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// HTTP API bind address.
    pub http_addr: SocketAddr,
    /// Maximum simultaneous supervised runs.
    pub max_concurrent_runs: usize,
    /// How often the worker pool polls the queue.
    pub poll_interval: Duration,
    /// Database connection pool size.
    pub db_pool_size: u32,
    /// How long shutdown waits for in-flight runs before giving up.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEVEDORE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("STEVEDORE_DATABASE_URL"))?;

        let port: u16 = std::env::var("STEVEDORE_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let max_concurrent_runs = std::env::var("STEVEDORE_MAX_CONCURRENT_RUNS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(5);

        let poll_interval_ms = std::env::var("STEVEDORE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1_000u64);

        let db_pool_size = std::env::var("STEVEDORE_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let shutdown_grace_secs = std::env::var("STEVEDORE_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30u64);

        Ok(Self {
            database_url,
            http_addr,
            max_concurrent_runs,
            poll_interval: Duration::from_millis(poll_interval_ms),
            db_pool_size,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STEVEDORE_DATABASE_URL", "postgres://localhost/test");
        guard.remove("DATABASE_URL");
        guard.remove("STEVEDORE_HTTP_PORT");
        guard.remove("STEVEDORE_MAX_CONCURRENT_RUNS");
        guard.remove("STEVEDORE_POLL_INTERVAL_MS");
        guard.remove("STEVEDORE_DB_POOL_SIZE");
        guard.remove("STEVEDORE_SHUTDOWN_GRACE_SECS");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.max_concurrent_runs, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(1_000));
        assert_eq!(config.db_pool_size, 20);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_config_database_url_fallback() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("STEVEDORE_DATABASE_URL");
        guard.set("DATABASE_URL", "postgres://fallback/db");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://fallback/db");
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("STEVEDORE_DATABASE_URL");
        guard.remove("DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("STEVEDORE_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STEVEDORE_DATABASE_URL", "postgres://localhost/test");
        guard.set("STEVEDORE_HTTP_PORT", "9000");
        guard.set("STEVEDORE_MAX_CONCURRENT_RUNS", "12");
        guard.set("STEVEDORE_POLL_INTERVAL_MS", "250");
        guard.set("STEVEDORE_DB_POOL_SIZE", "50");
        guard.set("STEVEDORE_SHUTDOWN_GRACE_SECS", "5");

        let config = Config::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.max_concurrent_runs, 12);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.db_pool_size, 50);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STEVEDORE_DATABASE_URL", "postgres://localhost/test");
        guard.set("STEVEDORE_HTTP_PORT", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn test_config_zero_concurrency_falls_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STEVEDORE_DATABASE_URL", "postgres://localhost/test");
        guard.set("STEVEDORE_MAX_CONCURRENT_RUNS", "0");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_concurrent_runs, 5);
    }
}
