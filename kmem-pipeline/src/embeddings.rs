use std::time::Duration;

use async_trait::async_trait;
use kmem_core::config::EmbeddingSettings;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{PipelineError, PipelineResult};

/// Rough token estimate used for partition budgets and input checks.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 3.5).ceil() as usize
}

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Name stored with every record this generator embedded.
    fn provider_name(&self) -> &str;

    fn max_tokens(&self) -> usize;

    fn max_batch_size(&self) -> usize;

    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    /// `TokenLimitExceeded` when `text` is over the model budget.
    fn check_tokens(&self, text: &str) -> PipelineResult<()> {
        let tokens = self.count_tokens(text);
        let max_tokens = self.max_tokens();
        if tokens > max_tokens {
            return Err(PipelineError::TokenLimitExceeded { tokens, max_tokens });
        }
        Ok(())
    }

    async fn generate_embedding(&self, text: &str) -> PipelineResult<Vec<f32>>;

    /// Embed several inputs; the result has one vector per input, in order.
    async fn generate_embeddings(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.generate_embedding(text).await?);
        }
        Ok(vectors)
    }
}

/// Client for Ollama-compatible `/api/embed` endpoints.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    provider_name: String,
    api_key: Option<String>,
    max_tokens: usize,
    max_batch_size: usize,
    client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(settings: &EmbeddingSettings, api_key: Option<String>) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            provider_name: format!("{}/{}", settings.provider, settings.model),
            api_key,
            max_tokens: settings.max_tokens,
            max_batch_size: settings.max_batch_size.max(1),
            client,
        })
    }

    pub async fn embed_batch(&self, inputs: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        for input in inputs {
            self.check_tokens(input)?;
        }

        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: inputs,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("embedding request failed: {status} {text}");
            // Rate limits and server errors may clear up; other client errors won't.
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::Embedding(message)
            } else {
                PipelineError::EmbeddingRejected(message)
            });
        }

        let payload: EmbedResponse = response.json().await?;
        let vectors = if let Some(embeddings) = payload.embeddings {
            embeddings
        } else if let Some(embedding) = payload.embedding {
            vec![embedding]
        } else {
            return Err(PipelineError::Embedding(
                "embedding response missing vectors".to_string(),
            ));
        };

        if vectors.len() != inputs.len() {
            return Err(PipelineError::Embedding(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                vectors.len()
            )));
        }
        debug!(count = vectors.len(), model = %self.model, "generated embeddings");
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingGenerator for EmbeddingClient {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn generate_embedding(&self, text: &str) -> PipelineResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".to_string()))
    }

    async fn generate_embeddings(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_tokens_from_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(35)), 10);
        assert_eq!(estimate_tokens(&"a".repeat(36)), 11);
    }

    #[tokio::test]
    async fn rejects_oversized_input_before_sending() {
        let settings = EmbeddingSettings {
            url: "http://127.0.0.1:9".to_string(),
            max_tokens: 4,
            ..EmbeddingSettings::default()
        };
        let client = EmbeddingClient::new(&settings, None).unwrap();
        let result = client.generate_embedding(&"word ".repeat(20)).await;
        assert!(matches!(
            result,
            Err(PipelineError::TokenLimitExceeded { max_tokens: 4, .. })
        ));
    }

    #[test]
    fn provider_name_includes_model() {
        let client = EmbeddingClient::new(&EmbeddingSettings::default(), None).unwrap();
        assert_eq!(client.provider_name(), "ollama/nomic-embed-text");
        assert_eq!(client.max_batch_size(), 32);
    }
}
