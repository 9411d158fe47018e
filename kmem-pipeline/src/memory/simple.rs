use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kmem_core::memory::{MemoryFilter, MemoryRecord, matches_any};
use tokio::sync::RwLock;

use super::{BACKEND_SIMPLE, MemoryDb, RecordStream, ScoredRecord, cosine_similarity};
use crate::errors::{PipelineError, PipelineResult};

#[derive(Debug, Default)]
struct SimpleIndex {
    dimension: usize,
    records: BTreeMap<String, MemoryRecord>,
}

/// Process-local vector store, mostly for tests and single-node setups.
#[derive(Debug, Default)]
pub struct SimpleMemoryDb {
    indexes: RwLock<HashMap<String, SimpleIndex>>,
}

impl SimpleMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    async fn matching(
        &self,
        index: &str,
        filters: &[MemoryFilter],
    ) -> PipelineResult<Vec<MemoryRecord>> {
        let indexes = self.indexes.read().await;
        let idx = indexes
            .get(index)
            .ok_or_else(|| PipelineError::IndexNotFound(index.to_string()))?;
        Ok(idx
            .records
            .values()
            .filter(|r| matches_any(filters, &r.tags))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MemoryDb for SimpleMemoryDb {
    fn name(&self) -> &str {
        BACKEND_SIMPLE
    }

    async fn create_index(&self, index: &str, dimension: usize) -> PipelineResult<()> {
        let mut indexes = self.indexes.write().await;
        indexes.entry(index.to_string()).or_insert_with(|| SimpleIndex {
            dimension,
            records: BTreeMap::new(),
        });
        Ok(())
    }

    async fn get_indexes(&self) -> PipelineResult<Vec<String>> {
        let indexes = self.indexes.read().await;
        let mut names: Vec<String> = indexes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &str) -> PipelineResult<()> {
        let mut indexes = self.indexes.write().await;
        indexes
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| PipelineError::IndexNotFound(index.to_string()))
    }

    async fn upsert(&self, index: &str, record: MemoryRecord) -> PipelineResult<String> {
        let mut indexes = self.indexes.write().await;
        let idx = indexes
            .get_mut(index)
            .ok_or_else(|| PipelineError::IndexNotFound(index.to_string()))?;
        if record.vector.len() != idx.dimension {
            return Err(PipelineError::DimensionMismatch {
                expected: idx.dimension,
                actual: record.vector.len(),
            });
        }
        let id = record.id.clone();
        idx.records.insert(id.clone(), record);
        Ok(id)
    }

    fn get_list<'a>(
        &'a self,
        index: &'a str,
        filters: &'a [MemoryFilter],
        limit: Option<usize>,
    ) -> RecordStream<'a> {
        stream::once(self.matching(index, filters))
            .flat_map(move |result| match result {
                Ok(records) => {
                    let take = limit.unwrap_or(records.len());
                    stream::iter(records.into_iter().take(take).map(Ok)).boxed()
                }
                Err(err) => stream::iter([Err(err)]).boxed(),
            })
            .boxed()
    }

    async fn get_similar(
        &self,
        index: &str,
        embedding: &[f32],
        filters: &[MemoryFilter],
        min_relevance: f64,
        limit: usize,
    ) -> PipelineResult<Vec<ScoredRecord>> {
        let mut scored: Vec<ScoredRecord> = self
            .matching(index, filters)
            .await?
            .into_iter()
            .map(|record| {
                let relevance = cosine_similarity(embedding, &record.vector);
                ScoredRecord { record, relevance }
            })
            .filter(|s| s.relevance >= min_relevance)
            .collect();
        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, index: &str, record_id: &str) -> PipelineResult<()> {
        let mut indexes = self.indexes.write().await;
        let idx = indexes
            .get_mut(index)
            .ok_or_else(|| PipelineError::IndexNotFound(index.to_string()))?;
        idx.records.remove(record_id);
        Ok(())
    }
}
