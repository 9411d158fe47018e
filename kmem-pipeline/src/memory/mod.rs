//! Vector stores holding memory records.
//!
//! Every backend implements [`MemoryDb`]. Which backends a deployment writes
//! to is configured by name and resolved with [`build_memory_dbs`].

mod simple;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kmem_core::memory::{MemoryFilter, MemoryRecord};
use sqlx::SqlitePool;

use crate::errors::{PipelineError, PipelineResult};

pub use simple::SimpleMemoryDb;
pub use sqlite::SqliteMemoryDb;

pub const BACKEND_SIMPLE: &str = "simple";
pub const BACKEND_SQLITE: &str = "sqlite";

pub type RecordStream<'a> = BoxStream<'a, PipelineResult<MemoryRecord>>;

/// A record with its cosine relevance to a query, in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub relevance: f64,
}

#[async_trait]
pub trait MemoryDb: Send + Sync {
    /// Backend name, as used in configuration.
    fn name(&self) -> &str;

    /// Creating an existing index is a no-op.
    async fn create_index(&self, index: &str, dimension: usize) -> PipelineResult<()>;

    async fn get_indexes(&self) -> PipelineResult<Vec<String>>;

    async fn delete_index(&self, index: &str) -> PipelineResult<()>;

    /// Insert or replace by record id; returns the id.
    async fn upsert(&self, index: &str, record: MemoryRecord) -> PipelineResult<String>;

    /// Records matching any of `filters`, lazily.
    fn get_list<'a>(
        &'a self,
        index: &'a str,
        filters: &'a [MemoryFilter],
        limit: Option<usize>,
    ) -> RecordStream<'a>;

    /// Records ordered by decreasing relevance to `embedding`.
    async fn get_similar(
        &self,
        index: &str,
        embedding: &[f32],
        filters: &[MemoryFilter],
        min_relevance: f64,
        limit: usize,
    ) -> PipelineResult<Vec<ScoredRecord>>;

    /// Deleting an absent record is a no-op.
    async fn delete(&self, index: &str, record_id: &str) -> PipelineResult<()>;
}

/// Resolve configured backend names. `pool` is required by `sqlite`.
pub fn build_memory_dbs(
    backends: &[String],
    pool: Option<&SqlitePool>,
) -> PipelineResult<Vec<Arc<dyn MemoryDb>>> {
    let mut dbs: Vec<Arc<dyn MemoryDb>> = Vec::with_capacity(backends.len());
    for name in backends {
        let db: Arc<dyn MemoryDb> = match (name.as_str(), pool) {
            (BACKEND_SIMPLE, _) => Arc::new(SimpleMemoryDb::new()),
            (BACKEND_SQLITE, Some(pool)) => Arc::new(SqliteMemoryDb::new(pool.clone())),
            _ => {
                return Err(PipelineError::UnknownBackend {
                    kind: "memory",
                    name: name.clone(),
                });
            }
        };
        dbs.push(db);
    }
    Ok(dbs)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
