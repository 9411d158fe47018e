//! Public entry point: uploads, status, deletion and search over the
//! ingestion pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kmem_core::config::{Config, Settings};
use kmem_core::memory::{MemoryFilter, PAYLOAD_FILE};
use kmem_core::mime;
use kmem_core::pipeline::{
    DEFAULT_INGESTION_STEPS, DataPipeline, FileDetails, INDEX_DELETION_DOCUMENT_ID,
    PipelineStatus, STATUS_FILE, STEP_DELETE_DOCUMENT, STEP_DELETE_INDEX,
};
use kmem_core::tags::TagCollection;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, FileSystemArtifactStore, validate_artifact_name};
use crate::decoders::DecoderRegistry;
use crate::embeddings::{EmbeddingClient, EmbeddingGenerator};
use crate::errors::{PipelineError, PipelineResult};
use crate::handlers::{HandlerContext, HandlerOptions, HandlerRegistry};
use crate::memory::{self, MemoryDb};
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::paths;
use crate::queue::{self, InMemoryQueue, PipelineQueue, PoisonedMessage, QueueOptions, SqliteQueue};
use crate::storage;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    /// Guessed from the file name when absent.
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub index: Option<String>,
    /// A new id is generated when absent.
    pub document_id: Option<String>,
    pub tags: TagCollection,
    /// The default ingestion steps when empty.
    pub steps: Vec<String>,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub index: Option<String>,
    pub query: String,
    #[serde(default)]
    pub filters: Vec<MemoryFilter>,
    #[serde(default)]
    pub min_relevance: f64,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub record_id: String,
    pub document_id: Option<String>,
    pub file: Option<String>,
    pub text: Option<String>,
    pub relevance: f64,
    pub tags: TagCollection,
}

/// Knobs the service takes from [`Settings`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub default_index: String,
    pub default_steps: Vec<String>,
    pub handlers: HandlerOptions,
    pub orchestrator: OrchestratorOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ServiceOptions {
    fn from(settings: &Settings) -> Self {
        let default_steps = if settings.pipeline.default_steps.is_empty() {
            DEFAULT_INGESTION_STEPS.iter().map(|s| s.to_string()).collect()
        } else {
            settings.pipeline.default_steps.clone()
        };
        Self {
            default_index: settings.pipeline.default_index.clone(),
            default_steps,
            handlers: HandlerOptions {
                max_tokens_per_chunk: settings.partition.max_tokens_per_chunk,
                overlap_tokens: settings.partition.overlap_tokens,
                embedding_failure_threshold: settings.pipeline.embedding_failure_threshold,
            },
            orchestrator: OrchestratorOptions {
                max_step_retries: settings.pipeline.max_step_retries,
            },
        }
    }
}

/// The index deletion pipeline keeps its status under this id.
fn reject_reserved_document_id(document_id: &str) -> PipelineResult<()> {
    if document_id == INDEX_DELETION_DOCUMENT_ID {
        return Err(PipelineError::InvalidRequest(format!(
            "document id {document_id} is reserved"
        )));
    }
    Ok(())
}

pub struct MemoryService {
    orchestrator: Arc<Orchestrator>,
    artifacts: Arc<dyn ArtifactStore>,
    embedder: Arc<dyn EmbeddingGenerator>,
    memory_dbs: Vec<Arc<dyn MemoryDb>>,
    options: ServiceOptions,
}

impl MemoryService {
    pub fn new(
        context: HandlerContext,
        queue: Arc<dyn PipelineQueue>,
        options: ServiceOptions,
    ) -> Self {
        let handlers = HandlerRegistry::with_defaults(&context, options.handlers);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&context.artifacts),
            queue,
            handlers,
            options.orchestrator,
        ));
        Self {
            orchestrator,
            artifacts: context.artifacts,
            embedder: context.embedder,
            memory_dbs: context.memory_dbs,
            options,
        }
    }

    /// Build every collaborator from configuration: artifact directory,
    /// SQLite pool when a backend needs it, queue, vector stores and the
    /// embedding client.
    pub async fn from_config(config: &Config) -> PipelineResult<Self> {
        let settings = &config.settings;
        let artifacts = Arc::new(
            FileSystemArtifactStore::open(paths::artifacts_root(&settings.storage)?).await?,
        );

        let needs_pool = settings.queue.backend == queue::BACKEND_SQLITE
            || settings.memory.backends.iter().any(|b| b == memory::BACKEND_SQLITE);
        let pool: Option<SqlitePool> = if needs_pool {
            let db_path = paths::db_path(&settings.storage)?;
            info!("opening database at {}", db_path.display());
            Some(storage::open_pool(&db_path).await?)
        } else {
            None
        };

        let queue_options = QueueOptions::from(&settings.queue);
        let queue: Arc<dyn PipelineQueue> = match (settings.queue.backend.as_str(), &pool) {
            (queue::BACKEND_MEMORY, _) => Arc::new(InMemoryQueue::new(queue_options)),
            (queue::BACKEND_SQLITE, Some(pool)) => {
                Arc::new(SqliteQueue::new(pool.clone(), queue_options))
            }
            (other, _) => {
                return Err(PipelineError::UnknownBackend {
                    kind: "queue",
                    name: other.to_string(),
                });
            }
        };

        let memory_dbs = memory::build_memory_dbs(&settings.memory.backends, pool.as_ref())?;
        let embedder = Arc::new(EmbeddingClient::new(
            &settings.embedding,
            config.embedding_api_key().map(str::to_string),
        )?);

        let context = HandlerContext {
            artifacts,
            decoders: Arc::new(DecoderRegistry::with_defaults()),
            embedder,
            memory_dbs,
        };
        Ok(Self::new(context, queue, ServiceOptions::from(settings)))
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn spawn_workers(&self, workers: usize, poll_interval: Duration) -> WorkerPool {
        WorkerPool::start(Arc::clone(&self.orchestrator), workers, poll_interval)
    }

    /// Store the files of a document and start its ingestion pipeline.
    /// Uploading an existing document id replaces the document.
    pub async fn upload_document(&self, request: UploadRequest) -> PipelineResult<String> {
        if request.files.is_empty() {
            return Err(PipelineError::InvalidRequest("upload has no files".to_string()));
        }
        if request.tags.has_reserved_keys() {
            return Err(PipelineError::InvalidRequest(
                "tag keys starting with \"__\" are reserved".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for file in &request.files {
            validate_artifact_name(&file.name)?;
            if file.name == STATUS_FILE || !names.insert(file.name.as_str()) {
                return Err(PipelineError::InvalidRequest(format!(
                    "duplicate or reserved file name: {}",
                    file.name
                )));
            }
        }

        if let Some(document_id) = &request.document_id {
            reject_reserved_document_id(document_id)?;
        }
        let index = request
            .index
            .unwrap_or_else(|| self.options.default_index.clone());
        let document_id = request
            .document_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let steps = if request.steps.is_empty() {
            self.options.default_steps.clone()
        } else {
            request.steps
        };

        let mut pipeline = DataPipeline::new(&index, &document_id, steps.as_slice()).with_tags(request.tags);
        self.orchestrator.check(&pipeline)?;

        // Artifacts of a previous execution must not leak into this one.
        self.artifacts
            .empty_document_directory(&index, &document_id)
            .await?;
        for file in request.files {
            let mime_type = file
                .mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| mime::from_file_name(&file.name).to_string());
            self.artifacts
                .write_file(&index, &document_id, &file.name, &file.content)
                .await?;
            pipeline = pipeline.with_file(FileDetails::uploaded(
                file.name,
                mime_type,
                file.content.len() as u64,
            ));
        }

        let pipeline = self.orchestrator.start(pipeline).await?;
        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            files = pipeline.uploaded_files.len(),
            "document uploaded"
        );
        Ok(document_id)
    }

    pub async fn pipeline_status(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> PipelineResult<Option<PipelineStatus>> {
        let index = self.index_or_default(index);
        Ok(self
            .orchestrator
            .status(index, document_id)
            .await?
            .map(|p| p.status()))
    }

    /// A document is ready once its ingestion completed and it was not
    /// deleted since.
    pub async fn is_document_ready(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> PipelineResult<bool> {
        Ok(self
            .pipeline_status(index, document_id)
            .await?
            .is_some_and(|s| s.completed && !s.steps.iter().any(|step| step == STEP_DELETE_DOCUMENT)))
    }

    pub async fn delete_document(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> PipelineResult<PipelineStatus> {
        reject_reserved_document_id(document_id)?;
        let index = self.index_or_default(index);
        let pipeline = DataPipeline::new(index, document_id, &[STEP_DELETE_DOCUMENT]);
        Ok(self.orchestrator.start(pipeline).await?.status())
    }

    pub async fn delete_index(&self, index: Option<&str>) -> PipelineResult<PipelineStatus> {
        let index = self.index_or_default(index);
        let pipeline = DataPipeline::new(index, INDEX_DELETION_DOCUMENT_ID, &[STEP_DELETE_INDEX]);
        Ok(self.orchestrator.start(pipeline).await?.status())
    }

    pub async fn resume(&self, index: Option<&str>, document_id: &str) -> PipelineResult<PipelineStatus> {
        let index = self.index_or_default(index);
        self.orchestrator.resume(index, document_id).await?;
        self.pipeline_status(Some(index), document_id)
            .await?
            .ok_or_else(|| PipelineError::StatusNotFound {
                index: index.to_string(),
                document_id: document_id.to_string(),
            })
    }

    /// Re-enqueue every pipeline left unfinished by a previous process.
    pub async fn resume_unfinished(&self) -> PipelineResult<Vec<PipelineStatus>> {
        Ok(self
            .orchestrator
            .resume_unfinished()
            .await?
            .into_iter()
            .map(|p| p.status())
            .collect())
    }

    /// Indexes known to any vector store, sorted.
    pub async fn list_indexes(&self) -> PipelineResult<Vec<String>> {
        let mut indexes = BTreeSet::new();
        for db in &self.memory_dbs {
            indexes.extend(db.get_indexes().await?);
        }
        Ok(indexes.into_iter().collect())
    }

    /// Similarity search against the first configured vector store.
    pub async fn search(&self, request: SearchRequest) -> PipelineResult<Vec<SearchResult>> {
        if request.query.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("query is empty".to_string()));
        }
        let Some(db) = self.memory_dbs.first() else {
            return Ok(Vec::new());
        };
        let index = self.index_or_default(request.index.as_deref());

        self.embedder.check_tokens(&request.query)?;
        let embedding = self.embedder.generate_embedding(&request.query).await?;
        let scored = match db
            .get_similar(
                index,
                &embedding,
                &request.filters,
                request.min_relevance,
                request.limit,
            )
            .await
        {
            Ok(scored) => scored,
            Err(PipelineError::IndexNotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        Ok(scored
            .into_iter()
            .map(|s| SearchResult {
                document_id: s.record.document_id().map(str::to_string),
                file: s
                    .record
                    .payload
                    .get(PAYLOAD_FILE)
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                text: s.record.text().map(str::to_string),
                relevance: s.relevance,
                record_id: s.record.id,
                tags: s.record.tags,
            })
            .collect())
    }

    pub async fn poisoned_messages(&self) -> PipelineResult<Vec<PoisonedMessage>> {
        self.orchestrator.queue().poisoned().await
    }

    fn index_or_default<'a>(&'a self, index: Option<&'a str>) -> &'a str {
        match index {
            Some(index) if !index.trim().is_empty() => index,
            _ => &self.options.default_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cancel::CancelSignal;
    use crate::handlers::test_support::FakeEmbedder;
    use crate::memory::SimpleMemoryDb;

    async fn service(dir: &TempDir) -> MemoryService {
        let artifacts = Arc::new(FileSystemArtifactStore::open(dir.path()).await.unwrap());
        let context = HandlerContext {
            artifacts,
            decoders: Arc::new(DecoderRegistry::with_defaults()),
            embedder: Arc::new(FakeEmbedder::new()),
            memory_dbs: vec![Arc::new(SimpleMemoryDb::new()) as Arc<dyn MemoryDb>],
        };
        let queue = Arc::new(InMemoryQueue::new(QueueOptions::default()));
        MemoryService::new(context, queue, ServiceOptions::default())
    }

    async fn drain(service: &MemoryService) {
        while service
            .orchestrator()
            .run_once(&CancelSignal::never())
            .await
            .unwrap()
            .is_some()
        {}
    }

    fn text_upload(document_id: &str, text: &str) -> UploadRequest {
        UploadRequest {
            document_id: Some(document_id.to_string()),
            files: vec![UploadFile {
                name: "note.txt".to_string(),
                mime_type: None,
                content: text.as_bytes().to_vec(),
            }],
            ..UploadRequest::default()
        }
    }

    #[tokio::test]
    async fn upload_then_search() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let id = service
            .upload_document(text_upload("doc1", "Cats sleep most of the day."))
            .await
            .unwrap();
        assert_eq!(id, "doc1");
        assert!(!service.is_document_ready(None, "doc1").await.unwrap());

        drain(&service).await;
        assert!(service.is_document_ready(None, "doc1").await.unwrap());
        assert_eq!(service.list_indexes().await.unwrap(), vec!["default"]);

        let results = service
            .search(SearchRequest {
                index: None,
                query: "Cats sleep most of the day.".to_string(),
                filters: vec![MemoryFilter::by_document("doc1")],
                min_relevance: 0.0,
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id.as_deref(), Some("doc1"));
        assert_eq!(results[0].file.as_deref(), Some("note.txt"));
    }

    #[tokio::test]
    async fn upload_validation() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let no_files = UploadRequest::default();
        assert!(matches!(
            service.upload_document(no_files).await,
            Err(PipelineError::InvalidRequest(_))
        ));

        let mut reserved = text_upload("doc1", "x");
        reserved.tags.add("__document_id", "other");
        assert!(matches!(
            service.upload_document(reserved).await,
            Err(PipelineError::InvalidRequest(_))
        ));

        let bad_id = text_upload("../escape", "x");
        assert!(matches!(
            service.upload_document(bad_id).await,
            Err(PipelineError::InvalidPipeline(_))
        ));

        let mut unknown_step = text_upload("doc1", "x");
        unknown_step.steps = vec!["summarize".to_string()];
        assert!(matches!(
            service.upload_document(unknown_step).await,
            Err(PipelineError::InvalidPipeline(_))
        ));
    }

    #[tokio::test]
    async fn index_deletion_id_is_reserved() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service
            .upload_document(text_upload("doc1", "Some text."))
            .await
            .unwrap();
        service.delete_index(None).await.unwrap();

        assert!(matches!(
            service
                .upload_document(text_upload(INDEX_DELETION_DOCUMENT_ID, "x"))
                .await,
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.delete_document(None, INDEX_DELETION_DOCUMENT_ID).await,
            Err(PipelineError::InvalidRequest(_))
        ));

        // The pending index deletion was left untouched.
        let tombstone = service
            .pipeline_status(None, INDEX_DELETION_DOCUMENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tombstone.steps, vec![STEP_DELETE_INDEX]);
        drain(&service).await;
        assert!(service.list_indexes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn generated_document_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let mut request = text_upload("x", "hello");
        request.document_id = None;

        let a = service.upload_document(request.clone()).await.unwrap();
        let b = service.upload_document(request).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn delete_index_removes_everything() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service
            .upload_document(text_upload("doc1", "Some text."))
            .await
            .unwrap();
        drain(&service).await;

        service.delete_index(None).await.unwrap();
        drain(&service).await;

        assert!(service.list_indexes().await.unwrap().is_empty());
        assert!(service.pipeline_status(None, "doc1").await.unwrap().is_none());
        let tombstone = service
            .pipeline_status(None, INDEX_DELETION_DOCUMENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(tombstone.completed);
    }

    #[tokio::test]
    async fn search_on_missing_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let results = service
            .search(SearchRequest {
                index: Some("nothing".to_string()),
                query: "anything".to_string(),
                filters: Vec::new(),
                min_relevance: 0.0,
                limit: 3,
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
