use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    Delivery, NackOutcome, PipelineQueue, PoisonedMessage, QueueMessage, QueueOptions, WorkItem,
    after, max_deliveries_reason, undeliverable_reason,
};
use crate::errors::PipelineResult;

#[derive(Debug, Default)]
struct State {
    active: Vec<QueueMessage>,
    poison: Vec<PoisonedMessage>,
}

/// Process-local queue. Messages are lost when the process exits; pipeline
/// status documents survive and `resume` re-enqueues them.
#[derive(Debug)]
pub struct InMemoryQueue {
    options: QueueOptions,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
        }
    }
}

impl State {
    fn take(&mut self, id: &str) -> Option<QueueMessage> {
        let pos = self.active.iter().position(|m| m.id == id)?;
        Some(self.active.remove(pos))
    }
}

#[async_trait]
impl PipelineQueue for InMemoryQueue {
    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn enqueue(&self, item: WorkItem) -> PipelineResult<String> {
        let message = QueueMessage::new(item, self.options.message_ttl);
        let id = message.id.clone();
        debug!(queue = %self.options.name, item = %message.item, "enqueued");
        self.state.lock().await.active.push(message);
        Ok(id)
    }

    async fn dequeue(&self) -> PipelineResult<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let next = state
            .active
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .min_by_key(|(_, m)| (m.visible_at, m.enqueued_at))
            .map(|(i, _)| i);
        let Some(pos) = next else {
            return Ok(None);
        };

        if let Some(reason) = undeliverable_reason(&state.active[pos], &self.options, now) {
            let message = state.active.remove(pos);
            warn!(item = %message.item, reason = %reason, "moved to poison queue");
            let poisoned = PoisonedMessage {
                reason,
                message,
                poisoned_at: now,
            };
            state.poison.push(poisoned.clone());
            return Ok(Some(Delivery::Poisoned(poisoned)));
        }

        let message = &mut state.active[pos];
        message.delivery_count += 1;
        message.visible_at = after(now, self.options.visibility_timeout);
        Ok(Some(Delivery::Message(message.clone())))
    }

    async fn ack(&self, message: &QueueMessage) -> PipelineResult<()> {
        self.state.lock().await.take(&message.id);
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage) -> PipelineResult<NackOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(current) = state.active.iter_mut().find(|m| m.id == message.id) else {
            // Already acked or poisoned by someone else.
            return Ok(NackOutcome::Requeued);
        };

        if current.delivery_count >= self.options.max_deliveries_before_poison {
            let message = current.clone();
            state.take(&message.id);
            warn!(item = %message.item, deliveries = message.delivery_count, "moved to poison queue");
            state.poison.push(PoisonedMessage {
                message,
                reason: max_deliveries_reason(&self.options),
                poisoned_at: now,
            });
            return Ok(NackOutcome::Poisoned);
        }

        current.visible_at = after(now, self.options.redelivery_delay);
        Ok(NackOutcome::Requeued)
    }

    async fn poison(&self, message: &QueueMessage, reason: &str) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        let message = state.take(&message.id).unwrap_or_else(|| message.clone());
        state.poison.push(PoisonedMessage {
            message,
            reason: reason.to_string(),
            poisoned_at: Utc::now(),
        });
        Ok(())
    }

    async fn poisoned(&self) -> PipelineResult<Vec<PoisonedMessage>> {
        Ok(self.state.lock().await.poison.clone())
    }

    async fn len(&self) -> PipelineResult<usize> {
        Ok(self.state.lock().await.active.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
            max_deliveries_before_poison: 3,
            redelivery_delay: Duration::ZERO,
            ..QueueOptions::default()
        }
    }

    fn message(delivery: Option<Delivery>) -> QueueMessage {
        match delivery {
            Some(Delivery::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dequeued_message_is_invisible_until_acked() {
        let queue = InMemoryQueue::new(options());
        queue.enqueue(item("extract")).await.unwrap();

        let first = message(queue.dequeue().await.unwrap());
        assert_eq!(first.delivery_count, 1);
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.ack(&first).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn nack_redelivers_then_poisons() {
        let queue = InMemoryQueue::new(options());
        queue.enqueue(item("extract")).await.unwrap();

        for expected in 1..=2 {
            let m = message(queue.dequeue().await.unwrap());
            assert_eq!(m.delivery_count, expected);
            assert_eq!(queue.nack(&m).await.unwrap(), NackOutcome::Requeued);
        }
        let m = message(queue.dequeue().await.unwrap());
        assert_eq!(m.delivery_count, 3);
        assert_eq!(queue.nack(&m).await.unwrap(), NackOutcome::Poisoned);

        assert!(queue.is_empty().await.unwrap());
        let poisoned = queue.poisoned().await.unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].message.item.step, "extract");
    }

    #[tokio::test]
    async fn expired_message_goes_straight_to_poison() {
        let queue = InMemoryQueue::new(QueueOptions {
            message_ttl: Duration::ZERO,
            ..options()
        });
        queue.enqueue(item("extract")).await.unwrap();

        match queue.dequeue().await.unwrap() {
            Some(Delivery::Poisoned(poisoned)) => {
                assert_eq!(poisoned.message.delivery_count, 0);
                assert!(poisoned.reason.contains("expired"));
            }
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.poisoned().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsettled_message_is_poisoned_at_the_ceiling() {
        // Nobody acks or nacks: every delivery times out immediately.
        let queue = InMemoryQueue::new(QueueOptions {
            max_deliveries_before_poison: 2,
            visibility_timeout: Duration::ZERO,
            ..options()
        });
        queue.enqueue(item("partition")).await.unwrap();

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
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.poisoned().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn explicit_poison_keeps_reason() {
        let queue = InMemoryQueue::new(options());
        queue.enqueue(item("save_records")).await.unwrap();
        let m = message(queue.dequeue().await.unwrap());
        queue.poison(&m, "store rejected record").await.unwrap();

        let poisoned = queue.poisoned().await.unwrap();
        assert_eq!(poisoned[0].reason, "store rejected record");
        assert!(queue.is_empty().await.unwrap());
    }
}
