pub mod env;
pub use env::apply_env_overrides;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Retry and timeout policy for outbound calls
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Total attempts per request, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Batch size used when neither the action nor the payload sets one
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
}

fn default_batch_size() -> usize {
    300
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Refresh OAuth tokens this many seconds before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
    /// SQLite file for refreshed tokens; unset disables persistence
    #[serde(default)]
    pub vault_path: Option<String>,
}

fn default_refresh_skew_secs() -> i64 {
    90
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: default_refresh_skew_secs(),
            vault_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3001
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl EngineConfig {
    /// Rejects settings the retry and batching code cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_attempts == 0 {
            bail!("dispatch.max_attempts must be at least 1");
        }
        if self.dispatch.backoff_factor < 2 {
            bail!("dispatch.backoff_factor must be at least 2");
        }
        if self.dispatch.initial_backoff_ms == 0 {
            bail!("dispatch.initial_backoff_ms must be positive");
        }
        if self.dispatch.max_backoff_ms < self.dispatch.initial_backoff_ms {
            bail!("dispatch.max_backoff_ms must not be below dispatch.initial_backoff_ms");
        }
        if self.batching.default_batch_size == 0 {
            bail!("batching.default_batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&contents).context("Failed to parse config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.request_timeout_ms, 10_000);
        assert_eq!(config.batching.default_batch_size, 300);
        assert_eq!(config.auth.refresh_skew_secs, 90);
        assert!(config.auth.vault_path.is_none());
        assert_eq!(config.server.port, 3001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [dispatch]
            max_attempts = 5
            initial_backoff_ms = 100
            backoff_factor = 3
            max_backoff_ms = 10000
            request_timeout_ms = 2000

            [batching]
            default_batch_size = 50

            [auth]
            refresh_skew_secs = 30
            vault_path = "/var/lib/actionkit/tokens.db"

            [server]
            port = 8080
        "#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.backoff_factor, 3);
        assert_eq!(config.batching.default_batch_size, 50);
        assert_eq!(config.auth.vault_path.as_deref(), Some("/var/lib/actionkit/tokens.db"));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [dispatch]
            max_attempts = 1
        "#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.dispatch.max_attempts, 1);
        assert_eq!(config.dispatch.initial_backoff_ms, 500); // Default
        assert_eq!(config.batching.default_batch_size, 300); // Default
    }

    #[test]
    fn test_validation_rejects_flat_backoff() {
        let mut config = EngineConfig::default();
        config.dispatch.backoff_factor = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.dispatch.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actionkit.toml");
        std::fs::write(&path, "[server]\nport = 4000\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 4000);

        assert!(load_config(dir.path().join("missing.toml")).is_err());
    }
}
