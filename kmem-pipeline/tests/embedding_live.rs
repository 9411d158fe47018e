#![cfg(feature = "live-tests")]

use kmem_core::config::EmbeddingSettings;
use kmem_pipeline::{EmbeddingClient, EmbeddingGenerator};

#[tokio::test]
async fn test_embedding_endpoint_live() {
    let settings = EmbeddingSettings::default();
    let api_key = std::env::var(kmem_core::config::EMBEDDING_API_KEY_ENV).ok();
    let client = EmbeddingClient::new(&settings, api_key).expect("client");
    let inputs = vec!["hello world".to_string(), "kernel memory".to_string()];

    let embeddings = client
        .generate_embeddings(&inputs)
        .await
        .expect("embedding request");
    assert_eq!(embeddings.len(), inputs.len());
    let dim = embeddings[0].len();
    assert!(dim > 0);
    assert!(embeddings.iter().all(|vec| vec.len() == dim));
}
