use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::mime;
use kmem_core::pipeline::{ArtifactType, DataPipeline, FileDetails, STEP_PARTITION};
use tracing::{debug, info};

use super::{HandlerContext, HandlerOptions, StepHandler, StepOutcome, read_json, source_file};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::chunker::Partitioner;
use crate::decoders::FileContent;
use crate::errors::PipelineResult;

/// Splits extracted sections into chunks stored as
/// `{file}.partition.{n}.txt`.
pub struct PartitionHandler {
    artifacts: Arc<dyn ArtifactStore>,
    partitioner: Partitioner,
}

pub fn partition_artifact_name(file_name: &str, partition_number: u32) -> String {
    format!("{file_name}.partition.{partition_number}.txt")
}

impl PartitionHandler {
    /// Chunks never exceed the embedding model's input limit.
    pub fn new(context: &HandlerContext, options: &HandlerOptions) -> Self {
        let max_tokens = options
            .max_tokens_per_chunk
            .min(context.embedder.max_tokens());
        Self {
            artifacts: Arc::clone(&context.artifacts),
            partitioner: Partitioner::new(max_tokens, options.overlap_tokens),
        }
    }
}

#[async_trait]
impl StepHandler for PartitionHandler {
    fn step_name(&self) -> &str {
        STEP_PARTITION
    }

    async fn invoke(
        &self,
        mut pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        let extracted: Vec<FileDetails> = pipeline
            .artifacts_of(ArtifactType::ExtractedText)
            .filter(|f| !f.already_processed_by(STEP_PARTITION))
            .cloned()
            .collect();

        for extract in extracted {
            cancel.check()?;
            let source_name = source_file(&pipeline, &extract)?.name.clone();
            let content: FileContent =
                match read_json(self.artifacts.as_ref(), &pipeline, &extract.name).await {
                    Ok(content) => content,
                    Err(err) => return Ok((StepOutcome::from_error(&extract.name, &err), pipeline)),
                };

            // Numbering is per uploaded file and stable across reruns.
            let mut partition_number = 0u32;
            let mut created = Vec::new();
            for section in &content.sections {
                for chunk in self.partitioner.split(&section.text) {
                    cancel.check()?;
                    let name = partition_artifact_name(&source_name, partition_number);
                    if let Err(err) = self
                        .artifacts
                        .write_file(&pipeline.index, &pipeline.document_id, &name, chunk.as_bytes())
                        .await
                    {
                        return Ok((StepOutcome::from_error(&name, &err), pipeline));
                    }

                    let mut artifact = FileDetails::derived(
                        &extract,
                        &name,
                        mime::PLAIN_TEXT,
                        chunk.len() as u64,
                        ArtifactType::TextPartition,
                    );
                    artifact.section_number = section.number;
                    artifact.partition_number = partition_number;
                    created.push(artifact);
                    partition_number += 1;
                }
            }

            debug!(file = %source_name, partitions = created.len(), "partitioned");
            for artifact in created {
                pipeline.artifacts.insert(artifact.name.clone(), artifact);
            }
            if let Some(artifact) = pipeline.artifacts.get_mut(&extract.name) {
                artifact.mark_processed_by(STEP_PARTITION);
            }
        }

        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            partitions = pipeline.artifacts_of(ArtifactType::TextPartition).count(),
            "partitioning finished"
        );
        Ok((StepOutcome::Success, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::ExtractHandler;
    use crate::handlers::test_support::{FakeEmbedder, fixture, pipeline_with_file};
    use kmem_core::pipeline::{DEFAULT_INGESTION_STEPS, STEP_EXTRACT};

    #[tokio::test]
    async fn partitions_inherit_section_numbers() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pdf = crate::decoders::pdf::tests::make_test_pdf(&["Page one text", "Page two text"]);
        let mut pipeline =
            pipeline_with_file(&fx, DEFAULT_INGESTION_STEPS, "doc.pdf", mime::PDF, &pdf).await;

        let (outcome, extracted) = ExtractHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        pipeline = extracted;
        pipeline.complete_step(STEP_EXTRACT);

        let handler = PartitionHandler::new(&fx.context, &HandlerOptions::default());
        let (outcome, pipeline) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success);

        let partitions: Vec<&FileDetails> =
            pipeline.artifacts_of(ArtifactType::TextPartition).collect();
        assert_eq!(partitions.len(), 2);
        let first = &pipeline.artifacts["doc.pdf.partition.0.txt"];
        let second = &pipeline.artifacts["doc.pdf.partition.1.txt"];
        assert_eq!((first.section_number, first.partition_number), (1, 0));
        assert_eq!((second.section_number, second.partition_number), (2, 1));
        assert_eq!(
            first.parent_id.as_deref(),
            Some(pipeline.uploaded_files[0].id.as_str())
        );
    }

    #[tokio::test]
    async fn small_budget_produces_many_partitions() {
        let fx = fixture(FakeEmbedder::new()).await;
        let text = "One sentence here. ".repeat(40);
        let pipeline = pipeline_with_file(
            &fx,
            DEFAULT_INGESTION_STEPS,
            "long.txt",
            mime::PLAIN_TEXT,
            text.as_bytes(),
        )
        .await;
        let (_, pipeline) = ExtractHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();

        let options = HandlerOptions {
            max_tokens_per_chunk: 20,
            overlap_tokens: 0,
            ..HandlerOptions::default()
        };
        let handler = PartitionHandler::new(&fx.context, &options);
        let (_, first) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        let count = first.artifacts_of(ArtifactType::TextPartition).count();
        assert!(count > 5);

        // Rerun skips the already partitioned file.
        let (_, second) = handler.invoke(first.clone(), &CancelSignal::never()).await.unwrap();
        assert_eq!(second.artifacts, first.artifacts);
    }
}
