//! Configuration for the Keel control plane.
//!
//! Every field is environment-addressable; `Config::from_env` is the single
//! place environment variables are read. `keeld` layers CLI flags on top.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// PostgreSQL connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "keel".to_string(),
            user: "keel".to_string(),
            password: String::new(),
            pool_size: 16,
        }
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ApiConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between scheduler ticks.
    pub reconcile_interval_sec: u64,
    /// Upper bound on concurrently running reconciliations.
    pub max_concurrent_reconciles: usize,
    /// Seconds between drift re-checks of a ready resource.
    pub drift_interval_sec: u64,
    /// Base delay for exponential failure backoff.
    pub backoff_base_sec: u64,
    /// Cap on the failure backoff delay.
    pub backoff_cap_sec: u64,
    /// Bound on graceful shutdown of in-flight reconciliations.
    pub shutdown_grace_sec: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_sec: 60,
            max_concurrent_reconciles: 5,
            drift_interval_sec: 300,
            backoff_base_sec: 60,
            backoff_cap_sec: 61_440,
            shutdown_grace_sec: 30,
        }
    }
}

impl ControllerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_sec)
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift_interval_sec)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_sec)
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub db: DbConfig,
    pub api: ApiConfig,
    pub controller: ControllerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `DB_PASSWORD` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let password = std::env::var("DB_PASSWORD").unwrap_or_default();
        if password.is_empty() {
            return Err(Error::InvalidConfig(
                "DB_PASSWORD must be set; the database password cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            db: DbConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_parse("DB_PORT", 5432)?,
                name: env_or("DB_NAME", "keel"),
                user: env_or("DB_USER", "keel"),
                password,
                pool_size: env_parse("DB_POOL_SIZE", 16)?,
            },
            api: ApiConfig {
                bind_address: env_or("API_BIND", "0.0.0.0"),
                port: env_parse("API_PORT", 8000)?,
            },
            controller: ControllerConfig {
                reconcile_interval_sec: env_parse("RECONCILE_INTERVAL_SEC", 60)?,
                max_concurrent_reconciles: env_parse("MAX_CONCURRENT_RECONCILES", 5)?,
                drift_interval_sec: env_parse("DRIFT_INTERVAL_SEC", 300)?,
                backoff_base_sec: env_parse("BACKOFF_BASE_SEC", 60)?,
                backoff_cap_sec: env_parse("BACKOFF_CAP_SEC", 61_440)?,
                shutdown_grace_sec: env_parse("SHUTDOWN_GRACE_SEC", 30)?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.reconcile_interval_sec, 60);
        assert_eq!(config.max_concurrent_reconciles, 5);
        assert_eq!(config.drift_interval_sec, 300);
        assert_eq!(config.backoff_base_sec, 60);
        assert_eq!(config.backoff_cap_sec, 61_440);
        assert_eq!(config.shutdown_grace_sec, 30);
    }

    #[test]
    fn db_password_is_redacted_in_debug_output() {
        let db = DbConfig {
            password: "hunter2".to_string(),
            ..DbConfig::default()
        };
        let rendered = format!("{db:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn server_address_joins_bind_and_port() {
        let api = ApiConfig {
            bind_address: "127.0.0.1".into(),
            port: 9000,
        };
        assert_eq!(api.server_address(), "127.0.0.1:9000");
    }
}
