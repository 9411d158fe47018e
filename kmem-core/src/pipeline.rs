//! Data pipeline model: the unit of work driven through the ingestion steps.
//!
//! A [`DataPipeline`] is created when a document is uploaded (or deleted),
//! persisted as a status document after every step transition, and reloaded
//! by workers before every step. Only the orchestrator moves the step
//! cursor; handlers mutate files and artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tags::TagCollection;

pub const STEP_EXTRACT: &str = "extract";
pub const STEP_PARTITION: &str = "partition";
pub const STEP_GEN_EMBEDDINGS: &str = "gen_embeddings";
pub const STEP_SAVE_RECORDS: &str = "save_records";
pub const STEP_DELETE_DOCUMENT: &str = "delete_document";
pub const STEP_DELETE_INDEX: &str = "delete_index";

/// Steps used for an upload when the caller does not pick any.
pub const DEFAULT_INGESTION_STEPS: &[&str] =
    &[STEP_EXTRACT, STEP_PARTITION, STEP_GEN_EMBEDDINGS, STEP_SAVE_RECORDS];

/// Artifact name of the status document inside a document directory.
pub const STATUS_FILE: &str = "__pipeline_status.json";

/// Document id used by index deletion pipelines.
pub const INDEX_DELETION_DOCUMENT_ID: &str = "__index";

const MAX_ID_LEN: usize = 128;
const MAX_LOG_ENTRIES: usize = 100;

/// Errors raised when a pipeline is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("pipeline has no steps")]
    EmptySteps,
    #[error("invalid {field}: {value:?}")]
    InvalidId { field: &'static str, value: String },
    #[error("duplicate step: {0}")]
    DuplicateStep(String),
    #[error("no handler registered for step: {0}")]
    UnknownStep(String),
}

/// Check an index name or document id.
///
/// Ids address directories and database rows, so they are limited to
/// `[A-Za-z0-9._-]`, at most 128 chars, and may not be `.` or `..`.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidId {
            field,
            value: value.to_string(),
        })
    }
}

/// Kind of file tracked by a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Uploaded,
    ExtractedText,
    TextPartition,
    EmbeddingVector,
}

/// One uploaded or derived file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetails {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub tags: TagCollection,
    pub artifact_type: ArtifactType,
    /// Uploaded file this artifact was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub section_number: u32,
    #[serde(default)]
    pub partition_number: u32,
    /// Steps that already processed this file.
    #[serde(default)]
    pub processed_by: Vec<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl FileDetails {
    pub fn uploaded(name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            tags: TagCollection::new(),
            artifact_type: ArtifactType::Uploaded,
            parent_id: None,
            section_number: 0,
            partition_number: 0,
            processed_by: Vec::new(),
            skipped: false,
            skip_reason: None,
        }
    }

    /// A file derived from `parent`; the id is the artifact name so that
    /// re-running a step produces the same entry.
    pub fn derived(
        parent: &FileDetails,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        artifact_type: ArtifactType,
    ) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            mime_type: mime_type.into(),
            size,
            tags: parent.tags.clone(),
            artifact_type,
            parent_id: Some(parent.parent_id.clone().unwrap_or_else(|| parent.id.clone())),
            section_number: parent.section_number,
            partition_number: parent.partition_number,
            processed_by: Vec::new(),
            skipped: false,
            skip_reason: None,
        }
    }

    pub fn already_processed_by(&self, step: &str) -> bool {
        self.processed_by.iter().any(|s| s == step)
    }

    pub fn mark_processed_by(&mut self, step: &str) {
        if !self.already_processed_by(step) {
            self.processed_by.push(step.to_string());
        }
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.skipped = true;
        self.skip_reason = Some(reason.into());
    }
}

/// Lifecycle state. `Running` means the head of `remaining_steps` is the
/// current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where and why a pipeline stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFailure {
    pub step: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLogEntry {
    pub at: DateTime<Utc>,
    pub source: String,
    pub text: String,
}

/// The ordered multi-step processing job for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPipeline {
    pub index: String,
    pub document_id: String,
    pub execution_id: String,
    pub steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub uploaded_files: Vec<FileDetails>,
    #[serde(default)]
    pub tags: TagCollection,
    /// Derived files keyed by artifact name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, FileDetails>,
    pub state: PipelineState,
    /// Failed attempts per step, for the pipeline-level retry ceiling.
    #[serde(default)]
    pub step_attempts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
    #[serde(default)]
    pub logs: Vec<PipelineLogEntry>,
    pub creation: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl DataPipeline {
    pub fn new<S: AsRef<str>>(
        index: impl Into<String>,
        document_id: impl Into<String>,
        steps: &[S],
    ) -> Self {
        let steps: Vec<String> = steps.iter().map(|s| s.as_ref().to_string()).collect();
        let now = Utc::now();
        Self {
            index: index.into(),
            document_id: document_id.into(),
            execution_id: Uuid::new_v4().simple().to_string(),
            remaining_steps: steps.clone(),
            steps,
            completed_steps: Vec::new(),
            uploaded_files: Vec::new(),
            tags: TagCollection::new(),
            artifacts: BTreeMap::new(),
            state: PipelineState::Created,
            step_attempts: BTreeMap::new(),
            failure: None,
            logs: Vec::new(),
            creation: now,
            last_update: now,
        }
    }

    pub fn with_tags(mut self, tags: TagCollection) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_file(mut self, file: FileDetails) -> Self {
        self.uploaded_files.push(file);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id("index", &self.index)?;
        validate_id("document id", &self.document_id)?;
        if self.steps.is_empty() {
            return Err(ValidationError::EmptySteps);
        }
        for (i, step) in self.steps.iter().enumerate() {
            if self.steps[..i].contains(step) {
                return Err(ValidationError::DuplicateStep(step.clone()));
            }
        }
        Ok(())
    }

    /// Step currently being executed (head of the remaining steps).
    pub fn current_step(&self) -> Option<&str> {
        self.remaining_steps.first().map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Move `step` from the remaining to the completed steps.
    ///
    /// Only the head can complete, which keeps the step order intact.
    /// Returns `false` when `step` is not the current step.
    pub fn complete_step(&mut self, step: &str) -> bool {
        if self.current_step() != Some(step) {
            return false;
        }
        let done = self.remaining_steps.remove(0);
        self.completed_steps.push(done);
        self.step_attempts.remove(step);
        if self.remaining_steps.is_empty() {
            self.state = PipelineState::Completed;
        }
        self.touch();
        true
    }

    /// Count a failed attempt of `step`; returns the updated count.
    pub fn record_failed_attempt(&mut self, step: &str) -> u32 {
        let attempts = self.step_attempts.entry(step.to_string()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        self.touch();
        attempts
    }

    pub fn fail(&mut self, step: &str, reason: impl Into<String>) {
        self.state = PipelineState::Failed;
        self.failure = Some(PipelineFailure {
            step: step.to_string(),
            reason: reason.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn log(&mut self, source: &str, text: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.remove(0);
        }
        self.logs.push(PipelineLogEntry {
            at: Utc::now(),
            source: source.to_string(),
            text: text.into(),
        });
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    pub fn artifacts_of(&self, artifact_type: ArtifactType) -> impl Iterator<Item = &FileDetails> {
        self.artifacts
            .values()
            .filter(move |f| f.artifact_type == artifact_type)
    }

    pub fn uploaded_file(&self, id: &str) -> Option<&FileDetails> {
        self.uploaded_files.iter().find(|f| f.id == id)
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from(self)
    }
}

/// Summary of a pipeline returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub index: String,
    pub document_id: String,
    pub execution_id: String,
    pub state: PipelineState,
    pub completed: bool,
    pub failed: bool,
    pub steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub tags: TagCollection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
    pub creation: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl From<&DataPipeline> for PipelineStatus {
    fn from(p: &DataPipeline) -> Self {
        Self {
            index: p.index.clone(),
            document_id: p.document_id.clone(),
            execution_id: p.execution_id.clone(),
            state: p.state,
            completed: p.state == PipelineState::Completed,
            failed: p.state == PipelineState::Failed,
            steps: p.steps.clone(),
            remaining_steps: p.remaining_steps.clone(),
            completed_steps: p.completed_steps.clone(),
            tags: p.tags.clone(),
            failure: p.failure.clone(),
            creation: p.creation,
            last_update: p.last_update,
        }
    }
}
