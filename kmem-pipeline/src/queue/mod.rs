//! At-least-once delivery of "run step S of pipeline P" work items.
//!
//! Every message counts its own deliveries. A message that keeps failing
//! moves to the poison queue after `max_deliveries_before_poison`
//! deliveries, either when it is nacked or, if its worker never settled
//! it, on the next dequeue. A message that outlives its TTL moves there on
//! the next dequeue too, without being delivered. The pipeline keeps a
//! separate per-step failure counter, so both ceilings are configured
//! independently.

mod memory;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kmem_core::config::QueueSettings;
use kmem_core::pipeline::DataPipeline;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineResult;

pub use memory::InMemoryQueue;
pub use sqlite::SqliteQueue;

pub const BACKEND_MEMORY: &str = "memory";
pub const BACKEND_SQLITE: &str = "sqlite";

/// The payload of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: String,
    pub document_id: String,
    pub execution_id: String,
    pub step: String,
}

impl WorkItem {
    pub fn for_step(pipeline: &DataPipeline, step: &str) -> Self {
        Self {
            index: pipeline.index.clone(),
            document_id: pipeline.document_id.clone(),
            execution_id: pipeline.execution_id.clone(),
            step: step.to_string(),
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.index, self.document_id, self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub item: WorkItem,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(item: WorkItem, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            item,
            delivery_count: 0,
            enqueued_at: now,
            visible_at: now,
            expires_at: after(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoisonedMessage {
    pub message: QueueMessage,
    pub reason: String,
    pub poisoned_at: DateTime<Utc>,
}

/// Result of a dequeue.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message(QueueMessage),
    /// The message expired, or reached the delivery ceiling without being
    /// settled, and is now in the poison queue.
    Poisoned(PoisonedMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    Poisoned,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub poison_queue_suffix: String,
    pub max_deliveries_before_poison: u32,
    pub message_ttl: Duration,
    pub visibility_timeout: Duration,
    pub redelivery_delay: Duration,
}

impl QueueOptions {
    pub fn poison_queue_name(&self) -> String {
        format!("{}{}", self.name, self.poison_queue_suffix)
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueOptions {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            name: settings.name.clone(),
            poison_queue_suffix: settings.poison_queue_suffix.clone(),
            max_deliveries_before_poison: settings.max_deliveries_before_poison.max(1),
            message_ttl: Duration::from_secs(settings.message_ttl_secs),
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
            redelivery_delay: Duration::from_secs(settings.redelivery_delay_secs),
        }
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn expired_reason(message: &QueueMessage) -> String {
    format!("message expired at {}", message.expires_at.to_rfc3339())
}

/// Why a visible message may not be delivered again, if it may not.
pub(crate) fn undeliverable_reason(
    message: &QueueMessage,
    options: &QueueOptions,
    now: DateTime<Utc>,
) -> Option<String> {
    if message.is_expired(now) {
        Some(expired_reason(message))
    } else if message.delivery_count >= options.max_deliveries_before_poison {
        Some(max_deliveries_reason(options))
    } else {
        None
    }
}

pub(crate) fn max_deliveries_reason(options: &QueueOptions) -> String {
    format!(
        "delivered {} times without success",
        options.max_deliveries_before_poison
    )
}

#[async_trait]
pub trait PipelineQueue: Send + Sync {
    fn options(&self) -> &QueueOptions;

    /// Returns the message id.
    async fn enqueue(&self, item: WorkItem) -> PipelineResult<String>;

    /// Next visible message, or `None` when nothing is ready. The message
    /// stays invisible for the visibility timeout; its delivery count is
    /// incremented. Expired and exhausted messages come back as
    /// [`Delivery::Poisoned`].
    async fn dequeue(&self) -> PipelineResult<Option<Delivery>>;

    /// Remove a processed message.
    async fn ack(&self, message: &QueueMessage) -> PipelineResult<()>;

    /// Hand a message back for redelivery after the redelivery delay, or
    /// poison it once it reached the delivery ceiling.
    async fn nack(&self, message: &QueueMessage) -> PipelineResult<NackOutcome>;

    async fn poison(&self, message: &QueueMessage, reason: &str) -> PipelineResult<()>;

    async fn poisoned(&self) -> PipelineResult<Vec<PoisonedMessage>>;

    /// Messages in the active queue, visible or not.
    async fn len(&self) -> PipelineResult<usize>;

    async fn is_empty(&self) -> PipelineResult<bool> {
        Ok(self.len().await? == 0)
    }
}
