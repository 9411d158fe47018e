use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::TryStreamExt;
use kmem_core::memory::{
    MemoryFilter, MemoryRecord, PAYLOAD_FILE, PAYLOAD_LAST_UPDATE, PAYLOAD_TEXT,
    PAYLOAD_VECTOR_PROVIDER,
};
use kmem_core::pipeline::{ArtifactType, DataPipeline, FileDetails, STEP_SAVE_RECORDS};
use kmem_core::tags::{
    TAG_DOCUMENT_ID, TAG_FILE_ID, TAG_FILE_NAME, TAG_FILE_PART, TAG_FILE_TYPE,
    TAG_PARTITION_NUMBER, TAG_SECTION_NUMBER,
};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    EmbeddingArtifact, HandlerContext, StepHandler, StepOutcome, read_json, read_text, source_file,
};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::errors::PipelineResult;
use crate::memory::MemoryDb;

/// Writes one memory record per embedded partition to every configured
/// vector store, then removes records of this document that the current
/// run no longer produces.
pub struct SaveRecordsHandler {
    artifacts: Arc<dyn ArtifactStore>,
    memory_dbs: Vec<Arc<dyn MemoryDb>>,
}

impl SaveRecordsHandler {
    pub fn new(context: &HandlerContext) -> Self {
        Self {
            artifacts: Arc::clone(&context.artifacts),
            memory_dbs: context.memory_dbs.clone(),
        }
    }

    async fn build_record(
        &self,
        pipeline: &DataPipeline,
        embedding: &FileDetails,
    ) -> PipelineResult<MemoryRecord> {
        let stored: EmbeddingArtifact =
            read_json(self.artifacts.as_ref(), pipeline, &embedding.name).await?;
        let text = read_text(self.artifacts.as_ref(), pipeline, &stored.source_partition).await?;
        let file = source_file(pipeline, embedding)?;

        let mut tags = pipeline.tags.clone();
        tags.set(TAG_DOCUMENT_ID, &pipeline.document_id);
        tags.set(TAG_FILE_ID, &file.id);
        tags.set(TAG_FILE_NAME, &file.name);
        tags.set(TAG_FILE_TYPE, &file.mime_type);
        tags.set(TAG_FILE_PART, &stored.source_partition);
        tags.set(TAG_PARTITION_NUMBER, embedding.partition_number.to_string());
        tags.set(TAG_SECTION_NUMBER, embedding.section_number.to_string());

        let mut record = MemoryRecord {
            id: MemoryRecord::build_id(&pipeline.document_id, &file.name, embedding.partition_number),
            vector: stored.vector,
            tags,
            ..MemoryRecord::default()
        };
        record.payload.insert(PAYLOAD_TEXT.into(), Value::String(text));
        record
            .payload
            .insert(PAYLOAD_FILE.into(), Value::String(file.name.clone()));
        record.payload.insert(
            PAYLOAD_LAST_UPDATE.into(),
            Value::String(
                pipeline
                    .last_update
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        );
        record
            .payload
            .insert(PAYLOAD_VECTOR_PROVIDER.into(), Value::String(stored.generator));
        Ok(record)
    }

    /// Delete records of this document whose id is not in `keep`.
    async fn purge_stale(
        &self,
        db: &dyn MemoryDb,
        pipeline: &DataPipeline,
        keep: &HashSet<String>,
    ) -> PipelineResult<usize> {
        let filters = [MemoryFilter::by_document(&pipeline.document_id)];
        let existing: Vec<MemoryRecord> = db
            .get_list(&pipeline.index, &filters, None)
            .try_collect()
            .await?;
        let mut removed = 0;
        for record in existing {
            if !keep.contains(&record.id) {
                db.delete(&pipeline.index, &record.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl StepHandler for SaveRecordsHandler {
    fn step_name(&self) -> &str {
        STEP_SAVE_RECORDS
    }

    async fn invoke(
        &self,
        mut pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        let embeddings: Vec<FileDetails> = pipeline
            .artifacts_of(ArtifactType::EmbeddingVector)
            .cloned()
            .collect();

        let mut keep = HashSet::new();
        let mut saved = 0usize;
        for embedding in &embeddings {
            cancel.check()?;
            let record = match self.build_record(&pipeline, embedding).await {
                Ok(record) => record,
                Err(err) => return Ok((StepOutcome::from_error(&embedding.name, &err), pipeline)),
            };
            keep.insert(record.id.clone());
            if embedding.already_processed_by(STEP_SAVE_RECORDS) {
                continue;
            }

            for db in &self.memory_dbs {
                let result = async {
                    db.create_index(&pipeline.index, record.vector.len()).await?;
                    db.upsert(&pipeline.index, record.clone()).await
                }
                .await;
                if let Err(err) = result {
                    let context = format!("{} ({})", record.id, db.name());
                    return Ok((StepOutcome::from_error(&context, &err), pipeline));
                }
            }
            debug!(record_id = %record.id, "record saved");
            saved += 1;
            if let Some(artifact) = pipeline.artifacts.get_mut(&embedding.name) {
                artifact.mark_processed_by(STEP_SAVE_RECORDS);
            }
        }

        cancel.check()?;
        let mut purged = 0;
        for db in &self.memory_dbs {
            if embeddings.is_empty() {
                // Nothing was written, so the index may not exist yet.
                let indexes = match db.get_indexes().await {
                    Ok(indexes) => indexes,
                    Err(err) => return Ok((StepOutcome::from_error(db.name(), &err), pipeline)),
                };
                if !indexes.contains(&pipeline.index) {
                    continue;
                }
            }
            match self.purge_stale(db.as_ref(), &pipeline, &keep).await {
                Ok(count) => purged += count,
                Err(err) => return Ok((StepOutcome::from_error(db.name(), &err), pipeline)),
            }
        }

        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            saved,
            purged,
            "records saved"
        );
        Ok((StepOutcome::Success, pipeline))
    }
}
