//! Document ingestion pipeline: orchestrator, step handlers, queues and
//! the stores they work against.

pub mod artifacts;
pub mod cancel;
pub mod chunker;
pub mod decoders;
pub mod embeddings;
pub mod errors;
pub mod handlers;
pub mod memory;
pub mod orchestrator;
pub mod paths;
pub mod queue;
pub mod service;
pub mod storage;
pub mod worker;

pub use artifacts::{ArtifactStore, FileSystemArtifactStore};
pub use cancel::{CancelHandle, CancelSignal};
pub use decoders::{ContentDecoder, DecoderRegistry, FileContent, FileSection};
pub use embeddings::{EmbeddingClient, EmbeddingGenerator};
pub use errors::{PipelineError, PipelineResult};
pub use handlers::{HandlerContext, HandlerOptions, HandlerRegistry, StepHandler, StepOutcome};
pub use memory::{MemoryDb, ScoredRecord, SimpleMemoryDb, SqliteMemoryDb};
pub use orchestrator::{Orchestrator, OrchestratorOptions, StepDisposition};
pub use queue::{InMemoryQueue, PipelineQueue, PoisonedMessage, QueueMessage, QueueOptions, SqliteQueue};
pub use service::{
    MemoryService, SearchRequest, SearchResult, ServiceOptions, UploadFile, UploadRequest,
};
pub use worker::WorkerPool;
