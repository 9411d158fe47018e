//! Step handlers.
//!
//! A handler performs one named stage for a pipeline and reports an
//! outcome. Handlers only mutate files and artifacts; moving the step
//! cursor is the orchestrator's job. Every handler must be safe to run
//! again for the same execution, which `processed_by` markers and
//! deterministic artifact names take care of.

mod delete_document;
mod delete_index;
mod extract;
mod gen_embeddings;
mod partition;
mod save_records;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::pipeline::{DataPipeline, FileDetails};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::decoders::DecoderRegistry;
use crate::embeddings::EmbeddingGenerator;
use crate::errors::{PipelineError, PipelineResult};
use crate::memory::MemoryDb;

pub use delete_document::DeleteDocumentHandler;
pub use delete_index::DeleteIndexHandler;
pub use extract::ExtractHandler;
pub use gen_embeddings::{EmbeddingArtifact, GenerateEmbeddingsHandler};
pub use partition::PartitionHandler;
pub use save_records::SaveRecordsHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    /// Transient failure; the step may be retried.
    Retry(String),
    /// Permanent failure; the pipeline fails without retry.
    Fatal(String),
}

impl StepOutcome {
    /// Classify an error raised while the handler was working.
    pub fn from_error(context: &str, err: &PipelineError) -> Self {
        let reason = format!("{context}: {err}");
        if err.is_transient() {
            Self::Retry(reason)
        } else {
            Self::Fatal(reason)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_name(&self) -> &str;

    /// Run the step. `Err` is reserved for `Cancelled` and for contract
    /// violations such as a malformed pipeline; expected failures are
    /// reported through the outcome.
    async fn invoke(
        &self,
        pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)>;
}

/// Shared collaborators of the built-in handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub decoders: Arc<DecoderRegistry>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
    pub memory_dbs: Vec<Arc<dyn MemoryDb>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerOptions {
    pub max_tokens_per_chunk: usize,
    pub overlap_tokens: usize,
    pub embedding_failure_threshold: f64,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: 1000,
            overlap_tokens: 100,
            embedding_failure_threshold: 0.0,
        }
    }
}

/// Lookup table from step name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in handler.
    pub fn with_defaults(context: &HandlerContext, options: HandlerOptions) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExtractHandler::new(context)));
        registry.register(Arc::new(PartitionHandler::new(context, &options)));
        registry.register(Arc::new(GenerateEmbeddingsHandler::new(context, &options)));
        registry.register(Arc::new(SaveRecordsHandler::new(context)));
        registry.register(Arc::new(DeleteDocumentHandler::new(context)));
        registry.register(Arc::new(DeleteIndexHandler::new(context)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.step_name().to_string(), handler);
    }

    pub fn get(&self, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step).cloned()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.handlers.contains_key(step)
    }
}

pub(crate) async fn write_json<T: Serialize + Sync>(
    artifacts: &dyn ArtifactStore,
    pipeline: &DataPipeline,
    name: &str,
    value: &T,
) -> PipelineResult<u64> {
    let bytes = serde_json::to_vec(value)?;
    artifacts
        .write_file(&pipeline.index, &pipeline.document_id, name, &bytes)
        .await?;
    Ok(bytes.len() as u64)
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    artifacts: &dyn ArtifactStore,
    pipeline: &DataPipeline,
    name: &str,
) -> PipelineResult<T> {
    let bytes = artifacts
        .read_file(&pipeline.index, &pipeline.document_id, name)
        .await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) async fn read_text(
    artifacts: &dyn ArtifactStore,
    pipeline: &DataPipeline,
    name: &str,
) -> PipelineResult<String> {
    let bytes = artifacts
        .read_file(&pipeline.index, &pipeline.document_id, name)
        .await?;
    String::from_utf8(bytes).map_err(|e| PipelineError::Decode(format!("{name}: {e}")))
}

/// Uploaded file a derived artifact came from.
pub(crate) fn source_file<'a>(
    pipeline: &'a DataPipeline,
    artifact: &FileDetails,
) -> PipelineResult<&'a FileDetails> {
    let parent = artifact.parent_id.as_deref().unwrap_or(&artifact.id);
    pipeline.uploaded_file(parent).ok_or_else(|| {
        PipelineError::InvalidRequest(format!(
            "artifact {} references unknown file {parent}",
            artifact.name
        ))
    })
}
