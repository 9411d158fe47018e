//! Configuration management for kmem.
//!
//! This module provides a unified configuration system that separates
//! secrets (from environment variables) from settings (from TOML files).
//!
//! # Configuration Sources
//!
//! ## Secrets (Environment Variables)
//! - `KMEM_EMBEDDING_API_KEY` - bearer token for the embedding endpoint
//!
//! ## Settings (TOML File)
//! Located at `~/.config/kmem/config.toml` (or `$KMEM_CONFIG_DIR/config.toml`):
//! ```toml
//! [gateway]
//! host = "127.0.0.1"
//! port = 9001
//!
//! [pipeline]
//! max_step_retries = 3
//!
//! [queue]
//! backend = "sqlite"
//!
//! [memory]
//! backends = ["sqlite"]
//! ```

mod secrets;
mod settings;

pub use secrets::{EMBEDDING_API_KEY_ENV, Secrets, SecretsError};
pub use settings::{
    EmbeddingSettings, GatewaySettings, LoggingSettings, MemorySettings, PartitionSettings,
    PipelineSettings, QueueSettings, Settings, SettingsError, StorageSettings,
};

/// Combined configuration containing both secrets and settings.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Secrets loaded from environment variables
    pub secrets: Secrets,
    /// Settings loaded from TOML configuration file
    pub settings: Settings,
}

/// Errors that can occur when loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Unknown queue backend '{0}'")]
    UnknownQueueBackend(String),
}

const QUEUE_BACKENDS: &[&str] = &["sqlite", "memory"];

impl Config {
    /// Load configuration from all sources.
    ///
    /// This loads:
    /// 1. Secrets from environment variables
    /// 2. Settings from TOML file (creating defaults if needed)
    pub fn load() -> Result<Self, ConfigError> {
        let secrets = Secrets::from_env()?;
        let settings = Settings::load()?;
        let config = Self { secrets, settings };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let backend = self.settings.queue.backend.as_str();
        if !QUEUE_BACKENDS.contains(&backend) {
            return Err(ConfigError::UnknownQueueBackend(backend.to_string()));
        }
        Ok(())
    }

    /// Get the HTTP bind address.
    pub fn bind_addr(&self) -> String {
        self.settings.bind_addr()
    }

    /// Get the embedding API key (if configured).
    pub fn embedding_api_key(&self) -> Option<&str> {
        self.secrets.embedding_api_key.as_deref()
    }
}

/// Load .env file if it exists (for development convenience).
///
/// This is called automatically by `Config::load()` but is also
/// exported for use in other contexts.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}
