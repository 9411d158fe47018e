use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::mime;
use kmem_core::pipeline::{ArtifactType, DataPipeline, FileDetails, STEP_EXTRACT};
use tracing::{debug, info, warn};

use super::{HandlerContext, StepHandler, StepOutcome, write_json};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::decoders::DecoderRegistry;
use crate::errors::PipelineResult;

/// Decodes every uploaded file into text sections stored as
/// `{file}.extract.json`.
pub struct ExtractHandler {
    artifacts: Arc<dyn ArtifactStore>,
    decoders: Arc<DecoderRegistry>,
}

pub fn extract_artifact_name(file_name: &str) -> String {
    format!("{file_name}.extract.json")
}

impl ExtractHandler {
    pub fn new(context: &HandlerContext) -> Self {
        Self {
            artifacts: Arc::clone(&context.artifacts),
            decoders: Arc::clone(&context.decoders),
        }
    }
}

#[async_trait]
impl StepHandler for ExtractHandler {
    fn step_name(&self) -> &str {
        STEP_EXTRACT
    }

    async fn invoke(
        &self,
        mut pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        for i in 0..pipeline.uploaded_files.len() {
            cancel.check()?;
            let file = pipeline.uploaded_files[i].clone();
            if file.already_processed_by(STEP_EXTRACT) {
                continue;
            }

            let Some(decoder) = self.decoders.get(&file.mime_type) else {
                warn!(file = %file.name, mime_type = %file.mime_type, "unsupported file type, skipping");
                let upload = &mut pipeline.uploaded_files[i];
                upload.mark_skipped(format!("unsupported mime type {}", file.mime_type));
                upload.mark_processed_by(STEP_EXTRACT);
                pipeline.log(STEP_EXTRACT, format!("{}: unsupported type", file.name));
                continue;
            };

            let bytes = match self
                .artifacts
                .read_file(&pipeline.index, &pipeline.document_id, &file.name)
                .await
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    return Ok((StepOutcome::from_error(&file.name, &err), pipeline));
                }
            };

            let content = match decoder.extract_content(&file.name, &bytes, &file.mime_type).await {
                Ok(content) => content,
                Err(err) if err.is_transient() => {
                    return Ok((StepOutcome::from_error(&file.name, &err), pipeline));
                }
                Err(err) => {
                    warn!(file = %file.name, error = %err, "decoding failed, skipping");
                    let upload = &mut pipeline.uploaded_files[i];
                    upload.mark_skipped(err.to_string());
                    upload.mark_processed_by(STEP_EXTRACT);
                    pipeline.log(STEP_EXTRACT, format!("{}: {err}", file.name));
                    continue;
                }
            };

            cancel.check()?;
            let name = extract_artifact_name(&file.name);
            let size = match write_json(self.artifacts.as_ref(), &pipeline, &name, &content).await {
                Ok(size) => size,
                Err(err) => return Ok((StepOutcome::from_error(&name, &err), pipeline)),
            };

            debug!(file = %file.name, sections = content.sections.len(), "extracted");
            let artifact =
                FileDetails::derived(&file, &name, mime::JSON, size, ArtifactType::ExtractedText);
            pipeline.artifacts.insert(name, artifact);
            pipeline.uploaded_files[i].mark_processed_by(STEP_EXTRACT);
        }

        let extracted = pipeline.artifacts_of(ArtifactType::ExtractedText).count();
        if extracted == 0 {
            return Ok((
                StepOutcome::Fatal("no uploaded file could be decoded".to_string()),
                pipeline,
            ));
        }

        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            files = extracted,
            "extraction finished"
        );
        Ok((StepOutcome::Success, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::FileContent;
    use crate::errors::PipelineError;
    use crate::handlers::read_json;
    use crate::handlers::test_support::{FakeEmbedder, fixture, pipeline_with_file};
    use kmem_core::pipeline::DEFAULT_INGESTION_STEPS;

    #[tokio::test]
    async fn extracts_text_into_artifact() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline = pipeline_with_file(
            &fx,
            DEFAULT_INGESTION_STEPS,
            "notes.txt",
            mime::PLAIN_TEXT,
            b"Some notes.",
        )
        .await;
        let handler = ExtractHandler::new(&fx.context);

        let (outcome, pipeline) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert!(pipeline.uploaded_files[0].already_processed_by(STEP_EXTRACT));

        let content: FileContent = read_json(fx.artifacts.as_ref(), &pipeline, "notes.txt.extract.json")
            .await
            .unwrap();
        assert_eq!(content.sections[0].text, "Some notes.");
        assert_eq!(
            pipeline.artifacts["notes.txt.extract.json"].parent_id.as_deref(),
            Some(pipeline.uploaded_files[0].id.as_str())
        );
        // The handler never moves the cursor.
        assert_eq!(pipeline.current_step(), Some(STEP_EXTRACT));
    }

    #[tokio::test]
    async fn unsupported_files_are_skipped() {
        let fx = fixture(FakeEmbedder::new()).await;
        let mut pipeline =
            pipeline_with_file(&fx, DEFAULT_INGESTION_STEPS, "a.txt", mime::PLAIN_TEXT, b"text")
                .await;
        let image = FileDetails::uploaded("b.png", mime::IMAGE_PNG, 3);
        fx.artifacts.write_file("default", "doc1", "b.png", b"png").await.unwrap();
        pipeline.uploaded_files.push(image);

        let (outcome, pipeline) = ExtractHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert!(pipeline.uploaded_files[1].skipped);
        assert_eq!(pipeline.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn all_files_unsupported_is_fatal() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline =
            pipeline_with_file(&fx, DEFAULT_INGESTION_STEPS, "b.png", mime::IMAGE_PNG, b"png").await;

        let (outcome, _) = ExtractHandler::new(&fx.context)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline =
            pipeline_with_file(&fx, DEFAULT_INGESTION_STEPS, "a.md", mime::MARKDOWN, b"# Title").await;
        let handler = ExtractHandler::new(&fx.context);

        let (_, first) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        let (outcome, second) = handler.invoke(first.clone(), &CancelSignal::never()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(first.artifacts, second.artifacts);
    }

    #[tokio::test]
    async fn cancelled_invocation_returns_cancelled() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline =
            pipeline_with_file(&fx, DEFAULT_INGESTION_STEPS, "a.txt", mime::PLAIN_TEXT, b"x").await;
        let handle = crate::cancel::CancelHandle::new();
        handle.cancel();

        let result = ExtractHandler::new(&fx.context)
            .invoke(pipeline, &handle.signal())
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
