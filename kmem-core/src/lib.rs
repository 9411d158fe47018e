pub mod config;
pub mod memory;
pub mod mime;
pub mod pipeline;
pub mod tags;

// Config re-exports
pub use config::{
    Config, ConfigError, Secrets, SecretsError, Settings, SettingsError, load_dotenv,
};

// Model re-exports
pub use memory::{MemoryFilter, MemoryRecord};
pub use pipeline::{
    ArtifactType, DataPipeline, FileDetails, PipelineState, PipelineStatus, ValidationError,
};
pub use tags::TagCollection;
