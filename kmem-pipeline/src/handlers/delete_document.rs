use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use kmem_core::memory::{MemoryFilter, MemoryRecord};
use kmem_core::pipeline::{DataPipeline, STEP_DELETE_DOCUMENT};
use tracing::info;

use super::{HandlerContext, StepHandler, StepOutcome};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::errors::{PipelineError, PipelineResult};
use crate::memory::MemoryDb;

/// Removes every record of a document from every vector store, then its
/// artifacts. The status document stays behind as a tombstone.
pub struct DeleteDocumentHandler {
    artifacts: Arc<dyn ArtifactStore>,
    memory_dbs: Vec<Arc<dyn MemoryDb>>,
}

impl DeleteDocumentHandler {
    pub fn new(context: &HandlerContext) -> Self {
        Self {
            artifacts: Arc::clone(&context.artifacts),
            memory_dbs: context.memory_dbs.clone(),
        }
    }
}

async fn delete_records(
    db: &dyn MemoryDb,
    index: &str,
    document_id: &str,
    cancel: &CancelSignal,
) -> PipelineResult<usize> {
    let filters = [MemoryFilter::by_document(document_id)];
    // Collect first: deleting while the listing is open would mutate the
    // store under the stream.
    let records: Vec<MemoryRecord> = match db.get_list(index, &filters, None).try_collect().await {
        Ok(records) => records,
        Err(PipelineError::IndexNotFound(_)) => return Ok(0),
        Err(err) => return Err(err),
    };
    for record in &records {
        cancel.check()?;
        db.delete(index, &record.id).await?;
    }
    Ok(records.len())
}

#[async_trait]
impl StepHandler for DeleteDocumentHandler {
    fn step_name(&self) -> &str {
        STEP_DELETE_DOCUMENT
    }

    async fn invoke(
        &self,
        pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        let mut deleted = 0;
        for db in &self.memory_dbs {
            match delete_records(db.as_ref(), &pipeline.index, &pipeline.document_id, cancel).await {
                Ok(count) => deleted += count,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => return Ok((StepOutcome::from_error(db.name(), &err), pipeline)),
            }
        }

        cancel.check()?;
        if let Err(err) = self
            .artifacts
            .empty_document_directory(&pipeline.index, &pipeline.document_id)
            .await
        {
            return Ok((StepOutcome::from_error("artifacts", &err), pipeline));
        }

        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            records = deleted,
            "document deleted"
        );
        Ok((StepOutcome::Success, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::read_status;
    use crate::handlers::test_support::{FakeEmbedder, fixture};
    use kmem_core::pipeline::STATUS_FILE;
    use kmem_core::tags::TAG_DOCUMENT_ID;

    fn record(document_id: &str, n: u32) -> MemoryRecord {
        let mut record = MemoryRecord {
            id: MemoryRecord::build_id(document_id, "a.txt", n),
            vector: vec![1.0, 2.0, 3.0],
            ..MemoryRecord::default()
        };
        record.tags.set(TAG_DOCUMENT_ID, document_id);
        record
    }

    #[tokio::test]
    async fn removes_records_and_artifacts_but_keeps_status() {
        let fx = fixture(FakeEmbedder::new()).await;
        fx.db.create_index("default", 3).await.unwrap();
        for n in 0..3 {
            fx.db.upsert("default", record("doc1", n)).await.unwrap();
        }
        fx.db.upsert("default", record("doc2", 0)).await.unwrap();
        fx.artifacts
            .write_file("default", "doc1", "a.txt.partition.0.txt", b"x")
            .await
            .unwrap();

        let pipeline = DataPipeline::new("default", "doc1", &[STEP_DELETE_DOCUMENT]);
        crate::artifacts::write_status(fx.artifacts.as_ref(), &pipeline)
            .await
            .unwrap();

        let (outcome, _) = DeleteDocumentHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);

        let left: Vec<MemoryRecord> = fx
            .db
            .get_list("default", &[], None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].document_id(), Some("doc2"));

        let files = fx.artifacts.list_files("default", "doc1").await.unwrap();
        assert_eq!(files, vec![STATUS_FILE.to_string()]);
        assert!(read_status(fx.artifacts.as_ref(), "default", "doc1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_index_is_not_an_error() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline = DataPipeline::new("nowhere", "doc1", &[STEP_DELETE_DOCUMENT]);
        let (outcome, _) = DeleteDocumentHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
    }
}
