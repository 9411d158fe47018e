use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::{
    Delivery, NackOutcome, PipelineQueue, PoisonedMessage, QueueMessage, QueueOptions, WorkItem,
    after, max_deliveries_reason, undeliverable_reason,
};
use crate::errors::{PipelineError, PipelineResult};

/// Durable queue backed by the `queue_messages` table. Poisoned messages
/// stay in the table under the poison queue name.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    options: QueueOptions,
    poison_queue: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    payload: String,
    delivery_count: i64,
    enqueued_at: i64,
    visible_at: i64,
    expires_at: i64,
    poison_reason: Option<String>,
    poisoned_at: Option<i64>,
}

fn from_millis(millis: i64) -> PipelineResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| PipelineError::Queue(format!("invalid timestamp: {millis}")))
}

impl TryFrom<&MessageRow> for QueueMessage {
    type Error = PipelineError;

    fn try_from(row: &MessageRow) -> Result<Self, Self::Error> {
        Ok(QueueMessage {
            id: row.id.clone(),
            item: serde_json::from_str::<WorkItem>(&row.payload)?,
            delivery_count: u32::try_from(row.delivery_count).unwrap_or(u32::MAX),
            enqueued_at: from_millis(row.enqueued_at)?,
            visible_at: from_millis(row.visible_at)?,
            expires_at: from_millis(row.expires_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, payload, delivery_count, enqueued_at, visible_at, \
     expires_at, poison_reason, poisoned_at FROM queue_messages";

impl SqliteQueue {
    pub fn new(pool: SqlitePool, options: QueueOptions) -> Self {
        let poison_queue = options.poison_queue_name();
        Self {
            pool,
            options,
            poison_queue,
        }
    }

    async fn move_to_poison(&self, id: &str, reason: &str, now: DateTime<Utc>) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE queue_messages SET queue = ?, poison_reason = ?, poisoned_at = ?
             WHERE id = ?",
        )
        .bind(&self.poison_queue)
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PipelineQueue for SqliteQueue {
    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue(&self, item: WorkItem) -> PipelineResult<String> {
        let message = QueueMessage::new(item, self.options.message_ttl);
        sqlx::query(
            "INSERT INTO queue_messages
                (id, queue, payload, delivery_count, enqueued_at, visible_at, expires_at)
             VALUES (?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&self.options.name)
        .bind(serde_json::to_string(&message.item)?)
        .bind(message.enqueued_at.timestamp_millis())
        .bind(message.visible_at.timestamp_millis())
        .bind(message.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        debug!(queue = %self.options.name, item = %message.item, "enqueued");
        Ok(message.id)
    }

    async fn dequeue(&self) -> PipelineResult<Option<Delivery>> {
        loop {
            let now = Utc::now();
            let row: Option<MessageRow> = sqlx::query_as(&format!(
                "{SELECT_COLUMNS} WHERE queue = ? AND visible_at <= ?
                 ORDER BY visible_at, enqueued_at LIMIT 1"
            ))
            .bind(&self.options.name)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let mut message = QueueMessage::try_from(&row)?;

            if let Some(reason) = undeliverable_reason(&message, &self.options, now) {
                self.move_to_poison(&message.id, &reason, now).await?;
                warn!(item = %message.item, reason = %reason, "moved to poison queue");
                return Ok(Some(Delivery::Poisoned(PoisonedMessage {
                    message,
                    reason,
                    poisoned_at: now,
                })));
            }

            // Claim the message only if no other worker claimed it since the read.
            let visible_at = after(now, self.options.visibility_timeout);
            let claimed = sqlx::query(
                "UPDATE queue_messages
                 SET delivery_count = delivery_count + 1, visible_at = ?
                 WHERE id = ? AND queue = ? AND visible_at = ?",
            )
            .bind(visible_at.timestamp_millis())
            .bind(&message.id)
            .bind(&self.options.name)
            .bind(row.visible_at)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            message.delivery_count += 1;
            message.visible_at = visible_at;
            return Ok(Some(Delivery::Message(message)));
        }
    }

    async fn ack(&self, message: &QueueMessage) -> PipelineResult<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue = ?")
            .bind(&message.id)
            .bind(&self.options.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage) -> PipelineResult<NackOutcome> {
        let now = Utc::now();
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT delivery_count FROM queue_messages WHERE id = ? AND queue = ?")
                .bind(&message.id)
                .bind(&self.options.name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((delivery_count,)) = current else {
            return Ok(NackOutcome::Requeued);
        };

        if delivery_count >= i64::from(self.options.max_deliveries_before_poison) {
            self.move_to_poison(&message.id, &max_deliveries_reason(&self.options), now)
                .await?;
            warn!(item = %message.item, deliveries = delivery_count, "moved to poison queue");
            return Ok(NackOutcome::Poisoned);
        }

        sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE id = ? AND queue = ?")
            .bind(after(now, self.options.redelivery_delay).timestamp_millis())
            .bind(&message.id)
            .bind(&self.options.name)
            .execute(&self.pool)
            .await?;
        Ok(NackOutcome::Requeued)
    }

    async fn poison(&self, message: &QueueMessage, reason: &str) -> PipelineResult<()> {
        self.move_to_poison(&message.id, reason, Utc::now()).await
    }

    async fn poisoned(&self) -> PipelineResult<Vec<PoisonedMessage>> {
        let rows: Vec<MessageRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE queue = ? ORDER BY poisoned_at"))
                .bind(&self.poison_queue)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| {
                Ok(PoisonedMessage {
                    message: QueueMessage::try_from(row)?,
                    reason: row.poison_reason.clone().unwrap_or_default(),
                    poisoned_at: from_millis(row.poisoned_at.unwrap_or(row.enqueued_at))?,
                })
            })
            .collect()
    }

    async fn len(&self) -> PipelineResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(&self.options.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_in_memory_pool, open_pool};
    use std::time::Duration;

    fn item(step: &str) -> WorkItem {
        WorkItem {
            index: "default".to_string(),
            document_id: "doc1".to_string(),
            execution_id: "exec".to_string(),
            step: step.to_string(),
        }
    }

    fn options() -> QueueOptions {
        QueueOptions {
            max_deliveries_before_poison: 2,
            redelivery_delay: Duration::ZERO,
            ..QueueOptions::default()
        }
    }

    async fn queue(options: QueueOptions) -> SqliteQueue {
        SqliteQueue::new(open_in_memory_pool().await.unwrap(), options)
    }

    fn message(delivery: Option<Delivery>) -> QueueMessage {
        match delivery {
            Some(Delivery::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack() {
        let queue = queue(options()).await;
        queue.enqueue(item("extract")).await.unwrap();

        let m = message(queue.dequeue().await.unwrap());
        assert_eq!(m.item, item("extract"));
        assert_eq!(m.delivery_count, 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.ack(&m).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_poisons_at_delivery_ceiling() {
        let queue = queue(options()).await;
        queue.enqueue(item("gen_embeddings")).await.unwrap();

        let m = message(queue.dequeue().await.unwrap());
        assert_eq!(queue.nack(&m).await.unwrap(), NackOutcome::Requeued);
        let m = message(queue.dequeue().await.unwrap());
        assert_eq!(m.delivery_count, 2);
        assert_eq!(queue.nack(&m).await.unwrap(), NackOutcome::Poisoned);

        assert_eq!(queue.len().await.unwrap(), 0);
        let poisoned = queue.poisoned().await.unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].message.delivery_count, 2);
        assert!(poisoned[0].reason.contains("2 times"));
    }

    #[tokio::test]
    async fn expired_messages_skip_delivery() {
        let queue = queue(QueueOptions {
            message_ttl: Duration::ZERO,
            ..options()
        })
        .await;
        queue.enqueue(item("extract")).await.unwrap();

        assert!(matches!(
            queue.dequeue().await.unwrap(),
            Some(Delivery::Poisoned(_))
        ));
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.poisoned().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsettled_message_is_poisoned_at_the_ceiling() {
        let queue = queue(QueueOptions {
            visibility_timeout: Duration::ZERO,
            ..options()
        })
        .await;
        queue.enqueue(item("save_records")).await.unwrap();

        assert_eq!(message(queue.dequeue().await.unwrap()).delivery_count, 1);
        assert_eq!(message(queue.dequeue().await.unwrap()).delivery_count, 2);
        match queue.dequeue().await.unwrap() {
            Some(Delivery::Poisoned(poisoned)) => {
                assert_eq!(poisoned.message.delivery_count, 2);
                assert!(poisoned.reason.contains("2 times"));
            }
            other => panic!("expected poisoning, got {other:?}"),
        }
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.poisoned().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_survive_reopening_the_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("queue.sqlite3");

        let queue = SqliteQueue::new(open_pool(&path).await.unwrap(), options());
        queue.enqueue(item("partition")).await.unwrap();
        drop(queue);

        let reopened = SqliteQueue::new(open_pool(&path).await.unwrap(), options());
        let m = message(reopened.dequeue().await.unwrap());
        assert_eq!(m.item.step, "partition");
    }

    #[tokio::test]
    async fn poison_queue_name_uses_suffix() {
        let queue = queue(options()).await;
        assert_eq!(queue.options().poison_queue_name(), "pipeline-poison");
    }
}
