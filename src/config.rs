//! Server configuration loaded from the environment.
//!
//! `.env` is read by `main` through dotenvy before [`ServerConfig::from_env`]
//! runs, so both real environment variables and the file are honored.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::SyncServerConfig;

/// `STORAGE_PATH` value that selects the in-process store
pub const MEMORY_STORAGE: &str = "memory";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on
    pub port: u16,
    /// Sled database path, or [`MEMORY_STORAGE`]
    pub storage_path: String,
    /// Session and router tuning
    pub sync: SyncServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage_path: StorageConfig::default().path,
            sync: SyncServerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables, falling back to defaults for unset keys
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let sync = defaults.sync;

        let config = Self {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            storage_path: lookup("STORAGE_PATH").unwrap_or(defaults.storage_path),
            sync: SyncServerConfig::default()
                .with_lock_ttl(secs_or(&lookup, "LOCK_TTL_SECS", sync.lock_ttl)?)
                .with_typing_idle(secs_or(&lookup, "TYPING_IDLE_SECS", sync.typing_idle)?)
                .with_sweep_interval(Duration::from_millis(parse_or(
                    &lookup,
                    "SWEEP_INTERVAL_MS",
                    sync.sweep_interval.as_millis() as u64,
                )?))
                .with_save_interval(secs_or(&lookup, "SAVE_INTERVAL_SECS", sync.save_interval)?)
                .with_eviction_grace(secs_or(&lookup, "EVICTION_GRACE_SECS", sync.eviction_grace)?)
                .with_max_history_entries(parse_or(
                    &lookup,
                    "MAX_HISTORY_ENTRIES",
                    sync.max_history_entries,
                )?)
                .with_persist_every_edits(parse_or(
                    &lookup,
                    "PERSIST_EVERY_EDITS",
                    sync.persist_every_edits,
                )?)
                .with_max_participants_per_document(parse_or(
                    &lookup,
                    "MAX_PARTICIPANTS",
                    sync.max_participants_per_document,
                )?)
                .with_evicted_retention(secs_or(
                    &lookup,
                    "EVICTED_RETENTION_SECS",
                    sync.evicted_retention,
                )?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn uses_memory_storage(&self) -> bool {
        self.storage_path == MEMORY_STORAGE
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.is_empty() {
            return Err(ConfigError::Invalid("storage path is empty".to_string()));
        }
        if self.sync.lock_ttl.is_zero() {
            return Err(ConfigError::Invalid("lock TTL must be positive".to_string()));
        }
        if self.sync.sweep_interval.is_zero() || self.sync.save_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "background intervals must be positive".to_string(),
            ));
        }
        if self.sync.max_history_entries == 0 {
            return Err(ConfigError::Invalid(
                "history must retain at least one entry".to_string(),
            ));
        }
        if self.sync.max_participants_per_document == 0 {
            return Err(ConfigError::Invalid(
                "documents must admit at least one participant".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_path, "./data/docsync.sled");
        assert_eq!(config.sync.lock_ttl, Duration::from_secs(30));
        assert!(!config.uses_memory_storage());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("STORAGE_PATH", "memory"),
            ("LOCK_TTL_SECS", "10"),
            ("SWEEP_INTERVAL_MS", "250"),
            ("MAX_HISTORY_ENTRIES", "3"),
            ("MAX_PARTICIPANTS", " 4 "),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert!(config.uses_memory_storage());
        assert_eq!(config.sync.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.sync.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.sync.max_history_entries, 3);
        assert_eq!(config.sync.max_participants_per_document, 4);
        assert_eq!(config.sync.evicted_retention, Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_invalid_value_names_the_key() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let err = ServerConfig::from_lookup(lookup(&[("LOCK_TTL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = ServerConfig {
            sync: SyncServerConfig::default().with_max_participants_per_document(0),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
