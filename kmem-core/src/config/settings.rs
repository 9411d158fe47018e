//! Settings configuration loaded from TOML files.
//!
//! This module handles non-sensitive configuration stored in TOML format
//! in the XDG config directory (~/.config/kmem/config.toml).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::DEFAULT_INGESTION_STEPS;

/// Default TOML configuration file content
const DEFAULT_CONFIG_TOML: &str = r#"# kmem configuration file
# Located at: ~/.config/kmem/config.toml
#
# This file contains non-sensitive configuration.
# Secrets are loaded from environment variables:
#   - KMEM_EMBEDDING_API_KEY (optional, bearer token for the embedding endpoint)

[gateway]
host = "127.0.0.1"
port = 9001

[logging]
level = "info"

[storage]
# data_root = "/var/lib/kmem"       # Defaults to $KMEM_DATA_DIR or the XDG data dir
# db_path = "/var/lib/kmem/kmem.sqlite3"

[pipeline]
default_index = "default"
default_steps = ["extract", "partition", "gen_embeddings", "save_records"]
max_step_retries = 3
embedding_failure_threshold = 0.0
workers = 4
poll_interval_ms = 500

[queue]
backend = "sqlite"
name = "pipeline"
max_deliveries_before_poison = 20
message_ttl_secs = 3600
visibility_timeout_secs = 300
redelivery_delay_secs = 5
poison_queue_suffix = "-poison"

[partition]
max_tokens_per_chunk = 1000
overlap_tokens = 100

[embedding]
provider = "ollama"
url = "http://127.0.0.1:11434"
model = "nomic-embed-text"
max_tokens = 8191
max_batch_size = 32

[memory]
backends = ["sqlite"]
"#;

/// Settings loaded from TOML configuration file.
///
/// These are non-sensitive configuration values that can be safely
/// stored in files and version controlled (excluding secrets).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Artifact and database locations
    #[serde(default)]
    pub storage: StorageSettings,

    /// Orchestrator and worker settings
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Work queue settings
    #[serde(default)]
    pub queue: QueueSettings,

    /// Text partitioning settings
    #[serde(default)]
    pub partition: PartitionSettings,

    /// Embedding generator settings
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Vector store settings
    #[serde(default)]
    pub memory: MemorySettings,
}

/// Gateway server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    /// Host to bind to
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Maximum accepted request body, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Root directory for document artifacts and status documents
    pub data_root: Option<PathBuf>,

    /// SQLite database used by the durable queue and the sqlite vector store
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSettings {
    /// Index used when a request does not name one
    #[serde(default = "default_index")]
    pub default_index: String,

    /// Steps used when an upload does not name any
    #[serde(default = "default_steps")]
    pub default_steps: Vec<String>,

    /// Times a failing step is retried before the pipeline fails
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Fraction of chunks allowed to fail embedding before the step fails
    #[serde(default)]
    pub embedding_failure_threshold: f64,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Idle polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    /// Queue backend ("sqlite" or "memory")
    #[serde(default = "default_queue_backend")]
    pub backend: String,

    /// Name of the work queue
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Deliveries of one message before it moves to the poison queue
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries_before_poison: u32,

    /// Message time-to-live in seconds
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    /// How long a dequeued message stays invisible to other workers
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Delay before a nacked message becomes visible again
    #[serde(default = "default_redelivery_delay_secs")]
    pub redelivery_delay_secs: u64,

    /// Suffix appended to the queue name for poisoned messages
    #[serde(default = "default_poison_suffix")]
    pub poison_queue_suffix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionSettings {
    /// Upper bound of a chunk, in estimated tokens
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: usize,

    /// Tokens repeated at the start of the next chunk
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingSettings {
    /// Provider name (currently only "ollama")
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Embedding provider base URL
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Maximum tokens accepted by the model for one input
    #[serde(default = "default_embedding_max_tokens")]
    pub max_tokens: usize,

    /// Maximum inputs sent in one request
    #[serde(default = "default_embedding_batch")]
    pub max_batch_size: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemorySettings {
    /// Vector store backends records are written to ("simple", "sqlite")
    #[serde(default = "default_memory_backends")]
    pub backends: Vec<String>,
}

// Default value functions

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    9001
}

fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_index() -> String {
    "default".to_string()
}

fn default_steps() -> Vec<String> {
    DEFAULT_INGESTION_STEPS.iter().map(|s| s.to_string()).collect()
}

fn default_max_step_retries() -> u32 {
    3
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_queue_backend() -> String {
    "sqlite".to_string()
}

fn default_queue_name() -> String {
    "pipeline".to_string()
}

fn default_max_deliveries() -> u32 {
    20
}

fn default_message_ttl_secs() -> u64 {
    3600
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_redelivery_delay_secs() -> u64 {
    5
}

fn default_poison_suffix() -> String {
    "-poison".to_string()
}

fn default_max_tokens_per_chunk() -> usize {
    1000
}

fn default_overlap_tokens() -> usize {
    100
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}

fn default_embedding_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_max_tokens() -> usize {
    8191
}

fn default_embedding_batch() -> usize {
    32
}

fn default_embedding_timeout_seconds() -> u64 {
    60
}

fn default_memory_backends() -> Vec<String> {
    vec!["sqlite".to_string()]
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_index: default_index(),
            default_steps: default_steps(),
            max_step_retries: default_max_step_retries(),
            embedding_failure_threshold: 0.0,
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            name: default_queue_name(),
            max_deliveries_before_poison: default_max_deliveries(),
            message_ttl_secs: default_message_ttl_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            redelivery_delay_secs: default_redelivery_delay_secs(),
            poison_queue_suffix: default_poison_suffix(),
        }
    }
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: default_max_tokens_per_chunk(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            max_tokens: default_embedding_max_tokens(),
            max_batch_size: default_embedding_batch(),
            timeout_seconds: default_embedding_timeout_seconds(),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            backends: default_memory_backends(),
        }
    }
}

/// Errors that can occur when loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        message: message.into(),
    }
}

impl Settings {
    /// Load settings from the TOML configuration file.
    ///
    /// If the config file doesn't exist, creates it with default values.
    /// The file is located at `~/.config/kmem/config.toml`.
    pub fn load() -> Result<Self, SettingsError> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!("Creating default configuration at {:?}", config_path);
            Self::create_default_config(&config_path)?;
        }

        let content = fs::read_to_string(&config_path)?;
        let settings = Self::from_toml(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)?;
        Ok(settings)
    }

    /// Serialize settings to TOML content.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the configuration file path.
    ///
    /// Uses XDG config directory: `~/.config/kmem/config.toml`
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        if let Ok(override_dir) = std::env::var("KMEM_CONFIG_DIR") {
            let dir = PathBuf::from(override_dir);
            return Ok(dir.join("config.toml"));
        }

        let config_dir = dirs::config_dir()
            .ok_or(SettingsError::ConfigDirNotFound)?
            .join("kmem");

        Ok(config_dir.join("config.toml"))
    }

    fn create_default_config(path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)?;
        Ok(())
    }

    /// Save settings to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let threshold = self.pipeline.embedding_failure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "pipeline.embedding_failure_threshold",
                format!("{threshold} is outside [0, 1]"),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.default_steps.is_empty() {
            return Err(invalid("pipeline.default_steps", "cannot be empty"));
        }
        let suffix = &self.queue.poison_queue_suffix;
        if suffix.trim().is_empty() {
            return Err(invalid("queue.poison_queue_suffix", "is empty"));
        }
        // Leaves room for the queue name in backends that cap names at 255 bytes.
        if suffix.len() > 60 {
            return Err(invalid("queue.poison_queue_suffix", "is longer than 60 bytes"));
        }
        if self.queue.name.trim().is_empty() {
            return Err(invalid("queue.name", "is empty"));
        }
        if self.partition.max_tokens_per_chunk == 0 {
            return Err(invalid("partition.max_tokens_per_chunk", "must be positive"));
        }
        if self.partition.overlap_tokens >= self.partition.max_tokens_per_chunk {
            return Err(invalid(
                "partition.overlap_tokens",
                "must be smaller than max_tokens_per_chunk",
            ));
        }
        if self.embedding.max_batch_size == 0 {
            return Err(invalid("embedding.max_batch_size", "must be at least 1"));
        }
        if self.memory.backends.is_empty() {
            return Err(invalid("memory.backends", "at least one backend is required"));
        }
        Ok(())
    }

    /// Get the HTTP bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.gateway.host, "127.0.0.1");
        assert_eq!(settings.gateway.port, 9001);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.pipeline.default_index, "default");
        assert_eq!(
            settings.pipeline.default_steps,
            vec!["extract", "partition", "gen_embeddings", "save_records"]
        );
        assert_eq!(settings.pipeline.max_step_retries, 3);
        assert_eq!(settings.queue.max_deliveries_before_poison, 20);
        assert_eq!(settings.queue.message_ttl_secs, 3600);
        assert_eq!(settings.queue.poison_queue_suffix, "-poison");
        assert_eq!(settings.memory.backends, vec!["sqlite"]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_toml_matches_defaults() {
        let settings = Settings::from_toml(DEFAULT_CONFIG_TOML).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.embedding.max_batch_size, 32);
        assert_eq!(settings.partition.overlap_tokens, 100);
        assert_eq!(settings.queue.backend, "sqlite");
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[pipeline]
max_step_retries = 1
embedding_failure_threshold = 0.2

[memory]
backends = ["simple", "sqlite"]
"#;

        let settings = Settings::from_toml(toml).unwrap();

        assert_eq!(settings.pipeline.max_step_retries, 1);
        assert!((settings.pipeline.embedding_failure_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(settings.memory.backends, vec!["simple", "sqlite"]);
        assert_eq!(settings.gateway.port, 9001);
        assert_eq!(settings.pipeline.workers, 4);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.pipeline.embedding_failure_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.queue.poison_queue_suffix = " ".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.partition.overlap_tokens = settings.partition.max_tokens_per_chunk;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.memory.backends.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.gateway.port = 4000;
        settings.queue.backend = "memory".to_string();
        settings.save_to_path(&path).expect("save failed");

        let content = fs::read_to_string(&path).expect("read failed");
        let loaded = Settings::from_toml(&content).expect("parse failed");
        assert_eq!(loaded.gateway.port, 4000);
        assert_eq!(loaded.queue.backend, "memory");
    }

    #[test]
    fn test_bind_addr() {
        let settings = Settings::default();
        assert_eq!(settings.bind_addr(), "127.0.0.1:9001");
    }
}
