use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::pipeline::{DataPipeline, INDEX_DELETION_DOCUMENT_ID, STEP_DELETE_INDEX};
use tracing::info;

use super::{HandlerContext, StepHandler, StepOutcome};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::errors::{PipelineError, PipelineResult};
use crate::memory::MemoryDb;

/// Drops an index from every vector store and removes all of its document
/// directories except the one holding this pipeline's status.
pub struct DeleteIndexHandler {
    artifacts: Arc<dyn ArtifactStore>,
    memory_dbs: Vec<Arc<dyn MemoryDb>>,
}

impl DeleteIndexHandler {
    pub fn new(context: &HandlerContext) -> Self {
        Self {
            artifacts: Arc::clone(&context.artifacts),
            memory_dbs: context.memory_dbs.clone(),
        }
    }
}

#[async_trait]
impl StepHandler for DeleteIndexHandler {
    fn step_name(&self) -> &str {
        STEP_DELETE_INDEX
    }

    async fn invoke(
        &self,
        pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        for db in &self.memory_dbs {
            cancel.check()?;
            match db.delete_index(&pipeline.index).await {
                Ok(()) | Err(PipelineError::IndexNotFound(_)) => {}
                Err(err) => return Ok((StepOutcome::from_error(db.name(), &err), pipeline)),
            }
        }

        cancel.check()?;
        if let Err(err) = self
            .artifacts
            .delete_index_directory(&pipeline.index, Some(INDEX_DELETION_DOCUMENT_ID))
            .await
        {
            return Ok((StepOutcome::from_error("artifacts", &err), pipeline));
        }

        info!(index = %pipeline.index, "index deleted");
        Ok((StepOutcome::Success, pipeline))
    }
}
