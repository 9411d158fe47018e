use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kmem_core::memory::{MemoryFilter, MemoryRecord, matches_any};
use kmem_core::tags::TagCollection;
use sqlx::SqlitePool;

use super::{BACKEND_SQLITE, MemoryDb, RecordStream, ScoredRecord};
use crate::errors::{PipelineError, PipelineResult};

/// Vector store persisted in SQLite. Similarity uses sqlite-vec's
/// `vec_distance_cosine` over JSON encoded vectors; tag filters are applied
/// after the fetch.
#[derive(Debug, Clone)]
pub struct SqliteMemoryDb {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    embedding: String,
    tags_json: String,
    payload_json: String,
}

impl TryFrom<RecordRow> for MemoryRecord {
    type Error = PipelineError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(MemoryRecord {
            id: row.id,
            vector: serde_json::from_str(&row.embedding)?,
            tags: serde_json::from_str::<TagCollection>(&row.tags_json)?,
            payload: serde_json::from_str(&row.payload_json)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    record: RecordRow,
    distance: f64,
}

/// Single-filter lists on a document id can use the document column.
fn document_prefilter(filters: &[MemoryFilter]) -> Option<String> {
    match filters {
        [only] => only.tags().first(kmem_core::tags::TAG_DOCUMENT_ID).map(str::to_string),
        _ => None,
    }
}

impl SqliteMemoryDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn dimension(&self, index: &str) -> PipelineResult<usize> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT dimension FROM memory_indexes WHERE name = ?")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(dimension,)| dimension as usize)
            .ok_or_else(|| PipelineError::IndexNotFound(index.to_string()))
    }
}

#[async_trait]
impl MemoryDb for SqliteMemoryDb {
    fn name(&self) -> &str {
        BACKEND_SQLITE
    }

    async fn create_index(&self, index: &str, dimension: usize) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO memory_indexes (name, dimension, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(index)
        .bind(dimension as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_indexes(&self) -> PipelineResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM memory_indexes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn delete_index(&self, index: &str) -> PipelineResult<()> {
        let result = sqlx::query("DELETE FROM memory_indexes WHERE name = ?")
            .bind(index)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::IndexNotFound(index.to_string()));
        }
        Ok(())
    }

    async fn upsert(&self, index: &str, record: MemoryRecord) -> PipelineResult<String> {
        let dimension = self.dimension(index).await?;
        if record.vector.len() != dimension {
            return Err(PipelineError::DimensionMismatch {
                expected: dimension,
                actual: record.vector.len(),
            });
        }

        sqlx::query(
            "INSERT INTO memory_records
                (index_name, id, document_id, embedding, tags_json, payload_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(index_name, id) DO UPDATE SET
                document_id = excluded.document_id,
                embedding = excluded.embedding,
                tags_json = excluded.tags_json,
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at",
        )
        .bind(index)
        .bind(&record.id)
        .bind(record.document_id())
        .bind(serde_json::to_string(&record.vector)?)
        .bind(serde_json::to_string(&record.tags)?)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(record.id)
    }

    fn get_list<'a>(
        &'a self,
        index: &'a str,
        filters: &'a [MemoryFilter],
        limit: Option<usize>,
    ) -> RecordStream<'a> {
        try_stream! {
            self.dimension(index).await?;

            let document_id = document_prefilter(filters);
            let mut rows = sqlx::query_as::<_, RecordRow>(
                "SELECT id, embedding, tags_json, payload_json FROM memory_records
                 WHERE index_name = ? AND (? IS NULL OR document_id = ?)
                 ORDER BY id",
            )
            .bind(index)
            .bind(document_id.clone())
            .bind(document_id)
            .fetch(&self.pool);

            let mut yielded = 0usize;
            while let Some(row) = rows.next().await {
                if limit.is_some_and(|limit| yielded >= limit) {
                    break;
                }
                let record = MemoryRecord::try_from(row?)?;
                if matches_any(filters, &record.tags) {
                    yielded += 1;
                    yield record;
                }
            }
        }
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
        let dimension = self.dimension(index).await?;
        if embedding.len() != dimension {
            return Err(PipelineError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            });
        }

        let rows: Vec<ScoredRow> = sqlx::query_as(
            "SELECT id, embedding, tags_json, payload_json,
                    vec_distance_cosine(embedding, ?) AS distance
             FROM memory_records
             WHERE index_name = ?
             ORDER BY distance ASC",
        )
        .bind(serde_json::to_string(embedding)?)
        .bind(index)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in rows {
            let relevance = 1.0 - row.distance;
            if relevance < min_relevance {
                break;
            }
            let record = MemoryRecord::try_from(row.record)?;
            if !matches_any(filters, &record.tags) {
                continue;
            }
            results.push(ScoredRecord { record, relevance });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    async fn delete(&self, index: &str, record_id: &str) -> PipelineResult<()> {
        self.dimension(index).await?;
        sqlx::query("DELETE FROM memory_records WHERE index_name = ? AND id = ?")
            .bind(index)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
