// File: portal-sync/src/config.rs
// Purpose: Configuration parsing from portal-sync.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::rate_limiter::RateLimitRule;
use crate::retry::RetryPolicy;
use crate::storage::{filesystem::FileStore, memory::MemoryStore, KeyValueStore};

/// Subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PortalSyncConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub undo: UndoConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backoff for transient sync failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts after which an item is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Action log retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UndoConfig {
    #[serde(default = "default_undo_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

/// Named limits for the sensitive call sites
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_login_rule")]
    pub login: RateLimitRule,

    #[serde(default = "default_api_rule")]
    pub api: RateLimitRule,

    #[serde(default = "default_form_submit_rule")]
    pub form_submit: RateLimitRule,

    #[serde(default = "default_export_rule")]
    pub export: RateLimitRule,

    /// Caps how fast the engine pushes queued items after reconnecting
    #[serde(default = "default_sync_rule")]
    pub sync: RateLimitRule,
}

/// Connectivity detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

/// Where the queue and action log are persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Non-persistent, for tests and previews
    Memory,

    /// One JSON file per record under `path`
    Filesystem {
        #[serde(default = "default_storage_path")]
        path: PathBuf,
    },
}

// Default values
fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_undo_timeout_ms() -> u64 {
    10_000
}

fn default_history_capacity() -> usize {
    50
}

fn default_login_rule() -> RateLimitRule {
    RateLimitRule::new(5, 15 * 60 * 1000)
}

fn default_api_rule() -> RateLimitRule {
    RateLimitRule::new(100, 60 * 1000)
}

fn default_form_submit_rule() -> RateLimitRule {
    RateLimitRule::new(10, 60 * 1000)
}

fn default_export_rule() -> RateLimitRule {
    RateLimitRule::new(5, 10 * 60 * 1000)
}

fn default_sync_rule() -> RateLimitRule {
    RateLimitRule::new(20, 1000)
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".portal/sync")
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_undo_timeout_ms(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: default_login_rule(),
            api: default_api_rule(),
            form_submit: default_form_submit_rule(),
            export: default_export_rule(),
            sync: default_sync_rule(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.max_retries,
        )
    }
}

impl UndoConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl RateLimitConfig {
    /// Look up a named rule
    pub fn rule(&self, name: &str) -> Option<RateLimitRule> {
        match name {
            "login" => Some(self.login),
            "api" => Some(self.api),
            "form_submit" => Some(self.form_submit),
            "export" => Some(self.export),
            "sync" => Some(self.sync),
            _ => None,
        }
    }
}

impl ConnectivityConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl StorageConfig {
    /// Build the configured backend
    pub async fn open(&self) -> Result<Arc<dyn KeyValueStore>> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            StorageConfig::Filesystem { path } => {
                let store = FileStore::new(path).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl PortalSyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // If file doesn't exist or is empty, return default config
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: PortalSyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Load configuration from default path (./portal-sync.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("portal-sync.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = PortalSyncConfig::default();
        assert_eq!(config.retry.base_backoff_ms, 1000);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.undo.history_capacity, 50);
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn test_empty_config() {
        let config = toml::from_str::<PortalSyncConfig>("").unwrap_or_default();
        assert_eq!(config, PortalSyncConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let toml = r#"
            [retry]
            max_retries = 3

            [rate_limit.export]
            max_requests = 2
            window_ms = 60000

            [storage]
            backend = "filesystem"
            path = "/var/lib/portal"
        "#;
        let config: PortalSyncConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_backoff_ms, 1000);
        assert_eq!(config.rate_limit.export, RateLimitRule::new(2, 60_000));
        assert_eq!(config.rate_limit.login, default_login_rule());
        assert_eq!(
            config.storage,
            StorageConfig::Filesystem {
                path: PathBuf::from("/var/lib/portal")
            }
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = PortalSyncConfig::load("/definitely/not/here.toml").unwrap();
        assert_eq!(config, PortalSyncConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portal-sync.toml");
        std::fs::write(&path, "[retry\nmax_retries = ").unwrap();

        assert!(PortalSyncConfig::load(&path).is_err());
    }

    #[test]
    fn test_named_rule_lookup() {
        let config = RateLimitConfig::default();
        assert_eq!(config.rule("sync"), Some(config.sync));
        assert_eq!(config.rule("unknown"), None);
    }
}
