use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::mime;
use kmem_core::pipeline::{ArtifactType, DataPipeline, FileDetails, STEP_GEN_EMBEDDINGS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{HandlerContext, HandlerOptions, StepHandler, StepOutcome, read_text, write_json};
use crate::artifacts::ArtifactStore;
use crate::cancel::CancelSignal;
use crate::embeddings::EmbeddingGenerator;
use crate::errors::{PipelineError, PipelineResult};

/// Stored as `{partition}.embedding.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingArtifact {
    pub source_partition: String,
    pub generator: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
}

pub fn embedding_artifact_name(partition_name: &str) -> String {
    format!("{partition_name}.embedding.json")
}

/// Embeds every text partition. Individual failures are tolerated up to
/// `embedding_failure_threshold` (a fraction of all partitions); above it
/// the step asks for a retry and only the failed partitions run again.
pub struct GenerateEmbeddingsHandler {
    artifacts: Arc<dyn ArtifactStore>,
    embedder: Arc<dyn EmbeddingGenerator>,
    failure_threshold: f64,
}

struct Pending {
    partition: FileDetails,
    text: String,
}

impl GenerateEmbeddingsHandler {
    pub fn new(context: &HandlerContext, options: &HandlerOptions) -> Self {
        Self {
            artifacts: Arc::clone(&context.artifacts),
            embedder: Arc::clone(&context.embedder),
            failure_threshold: options.embedding_failure_threshold.clamp(0.0, 1.0),
        }
    }

    /// One result per input. A failed batch is retried one item at a time
    /// so a single bad input does not sink its neighbours.
    async fn embed(
        &self,
        batch: &[Pending],
        cancel: &CancelSignal,
    ) -> PipelineResult<Vec<Result<Vec<f32>, String>>> {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        match self.embedder.generate_embeddings(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => {
                return Ok(vectors.into_iter().map(Ok).collect());
            }
            Ok(vectors) => {
                warn!(expected = texts.len(), actual = vectors.len(), "embedding batch size mismatch");
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                debug!(error = %err, size = texts.len(), "embedding batch failed, retrying items");
            }
        }

        let mut results = Vec::with_capacity(texts.len());
        for text in &texts {
            cancel.check()?;
            match self.embedder.generate_embedding(text).await {
                Ok(vector) => results.push(Ok(vector)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => results.push(Err(err.to_string())),
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl StepHandler for GenerateEmbeddingsHandler {
    fn step_name(&self) -> &str {
        STEP_GEN_EMBEDDINGS
    }

    async fn invoke(
        &self,
        mut pipeline: DataPipeline,
        cancel: &CancelSignal,
    ) -> PipelineResult<(StepOutcome, DataPipeline)> {
        let partitions: Vec<FileDetails> = pipeline
            .artifacts_of(ArtifactType::TextPartition)
            .filter(|p| !p.skipped)
            .cloned()
            .collect();
        let total = partitions.len();

        let mut pending = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for partition in partitions {
            if partition.already_processed_by(STEP_GEN_EMBEDDINGS) {
                continue;
            }
            let text = match read_text(self.artifacts.as_ref(), &pipeline, &partition.name).await {
                Ok(text) => text,
                Err(err) => {
                    return Ok((StepOutcome::from_error(&partition.name, &err), pipeline));
                }
            };
            if let Err(err) = self.embedder.check_tokens(&text) {
                failed.push((partition.name.clone(), err.to_string()));
                continue;
            }
            pending.push(Pending { partition, text });
        }

        let generator = self.embedder.provider_name().to_string();
        for batch in pending.chunks(self.embedder.max_batch_size().max(1)) {
            cancel.check()?;
            let results = self.embed(batch, cancel).await?;

            for (item, result) in batch.iter().zip(results) {
                let vector = match result {
                    Ok(vector) => vector,
                    Err(reason) => {
                        failed.push((item.partition.name.clone(), reason));
                        continue;
                    }
                };
                let name = embedding_artifact_name(&item.partition.name);
                let artifact = EmbeddingArtifact {
                    source_partition: item.partition.name.clone(),
                    generator: generator.clone(),
                    dimension: vector.len(),
                    vector,
                };
                let size = match write_json(self.artifacts.as_ref(), &pipeline, &name, &artifact).await {
                    Ok(size) => size,
                    Err(err) => return Ok((StepOutcome::from_error(&name, &err), pipeline)),
                };

                let details = FileDetails::derived(
                    &item.partition,
                    &name,
                    mime::JSON,
                    size,
                    ArtifactType::EmbeddingVector,
                );
                pipeline.artifacts.insert(name, details);
                if let Some(partition) = pipeline.artifacts.get_mut(&item.partition.name) {
                    partition.mark_processed_by(STEP_GEN_EMBEDDINGS);
                }
            }
        }

        if !failed.is_empty() {
            let fraction = failed.len() as f64 / total as f64;
            if fraction > self.failure_threshold {
                let reason = format!(
                    "{} of {total} partitions failed to embed ({:.0}% > {:.0}%): {}",
                    failed.len(),
                    fraction * 100.0,
                    self.failure_threshold * 100.0,
                    failed[0].1
                );
                warn!(
                    index = %pipeline.index,
                    document_id = %pipeline.document_id,
                    failed = failed.len(),
                    total,
                    "embedding failures over threshold"
                );
                return Ok((StepOutcome::Retry(reason), pipeline));
            }

            for (name, reason) in &failed {
                pipeline.log(STEP_GEN_EMBEDDINGS, format!("{name}: {reason}"));
                if let Some(partition) = pipeline.artifacts.get_mut(name) {
                    partition.mark_skipped(reason.clone());
                    partition.mark_processed_by(STEP_GEN_EMBEDDINGS);
                }
            }
        }

        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            embedded = pipeline.artifacts_of(ArtifactType::EmbeddingVector).count(),
            skipped = failed.len(),
            "embedding finished"
        );
        Ok((StepOutcome::Success, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::handlers::read_json;
    use crate::handlers::test_support::{FakeEmbedder, Fixture, fixture};
    use kmem_core::pipeline::DEFAULT_INGESTION_STEPS;

    /// Pipeline with `texts.len()` stored partitions of one uploaded file.
    async fn with_partitions(fx: &Fixture, texts: &[&str]) -> DataPipeline {
        let upload = FileDetails::uploaded("a.txt", mime::PLAIN_TEXT, 1);
        let mut pipeline = DataPipeline::new("default", "doc1", DEFAULT_INGESTION_STEPS)
            .with_file(upload.clone());
        for (n, text) in texts.iter().enumerate() {
            let name = format!("a.txt.partition.{n}.txt");
            fx.artifacts
                .write_file("default", "doc1", &name, text.as_bytes())
                .await
                .unwrap();
            let mut partition = FileDetails::derived(
                &upload,
                &name,
                mime::PLAIN_TEXT,
                text.len() as u64,
                ArtifactType::TextPartition,
            );
            partition.partition_number = n as u32;
            pipeline.artifacts.insert(name, partition);
        }
        pipeline
    }

    fn ten_texts(bad: Option<usize>) -> Vec<String> {
        (0..10)
            .map(|i| {
                if Some(i) == bad {
                    format!("partition {i} BAD")
                } else {
                    format!("partition {i}")
                }
            })
            .collect()
    }

    fn handler(fx: &Fixture, threshold: f64) -> GenerateEmbeddingsHandler {
        let options = HandlerOptions {
            embedding_failure_threshold: threshold,
            ..HandlerOptions::default()
        };
        GenerateEmbeddingsHandler::new(&fx.context, &options)
    }

    #[tokio::test]
    async fn writes_one_embedding_per_partition() {
        let fx = fixture(FakeEmbedder::new()).await;
        let texts = ten_texts(None);
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let pipeline = with_partitions(&fx, &refs).await;

        let (outcome, pipeline) = handler(&fx, 0.0)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(pipeline.artifacts_of(ArtifactType::EmbeddingVector).count(), 10);

        let stored: EmbeddingArtifact = read_json(
            fx.artifacts.as_ref(),
            &pipeline,
            "a.txt.partition.3.txt.embedding.json",
        )
        .await
        .unwrap();
        assert_eq!(stored.source_partition, "a.txt.partition.3.txt");
        assert_eq!(stored.generator, "fake");
        assert_eq!(stored.dimension, 3);
        let artifact = &pipeline.artifacts["a.txt.partition.3.txt.embedding.json"];
        assert_eq!(artifact.partition_number, 3);
    }

    #[tokio::test]
    async fn one_failure_within_threshold_succeeds() {
        let fx = fixture(FakeEmbedder::failing_on("BAD")).await;
        let texts = ten_texts(Some(4));
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let pipeline = with_partitions(&fx, &refs).await;

        let (outcome, pipeline) = handler(&fx, 0.2)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(pipeline.artifacts_of(ArtifactType::EmbeddingVector).count(), 9);
        assert!(pipeline.artifacts["a.txt.partition.4.txt"].skipped);
    }

    #[tokio::test]
    async fn one_failure_over_threshold_retries() {
        let fx = fixture(FakeEmbedder::failing_on("BAD")).await;
        let texts = ten_texts(Some(4));
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let pipeline = with_partitions(&fx, &refs).await;

        let (outcome, pipeline) = handler(&fx, 0.05)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Retry(_)));
        let failed = &pipeline.artifacts["a.txt.partition.4.txt"];
        assert!(!failed.skipped);
        assert!(!failed.already_processed_by(STEP_GEN_EMBEDDINGS));
        assert_eq!(pipeline.artifacts_of(ArtifactType::EmbeddingVector).count(), 9);
    }

    #[tokio::test]
    async fn retry_only_embeds_missing_partitions() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline = with_partitions(&fx, &["a", "b", "c", "d", "e"]).await;
        let handler = handler(&fx, 0.0);

        let (_, pipeline) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        // Five partitions in batches of four.
        assert_eq!(fx.embedder.batch_calls.load(Ordering::SeqCst), 2);

        let (outcome, _) = handler.invoke(pipeline, &CancelSignal::never()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(fx.embedder.batch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_partitions_is_a_success() {
        let fx = fixture(FakeEmbedder::new()).await;
        let pipeline = with_partitions(&fx, &[]).await;
        let (outcome, _) = handler(&fx, 0.0)
            .invoke(pipeline, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Success);
    }
}
