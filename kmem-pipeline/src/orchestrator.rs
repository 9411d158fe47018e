//! Drives pipelines through their steps.
//!
//! The orchestrator owns the step cursor. Every queue message names one
//! step of one execution; the status document is reloaded before the
//! handler runs and persisted after the outcome is applied, so any worker
//! can pick up any message and a crash at any point is recovered by
//! redelivery.

use std::sync::Arc;

use kmem_core::pipeline::{DataPipeline, PipelineState, ValidationError};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactStore, read_status, write_status};
use crate::cancel::CancelSignal;
use crate::errors::{PipelineError, PipelineResult};
use crate::handlers::{HandlerRegistry, StepOutcome};
use crate::queue::{Delivery, NackOutcome, PipelineQueue, PoisonedMessage, QueueMessage, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// How many times a failing step is retried before the pipeline fails.
    pub max_step_retries: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self { max_step_retries: 3 }
    }
}

/// What happened to a pipeline after one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDisposition {
    /// The step completed and `next` was enqueued.
    Advanced { next: String },
    /// The last step completed.
    Completed,
    /// The step failed transiently and will run again.
    Retrying { attempts: u32 },
    Failed { reason: String },
    /// The message no longer applied to the pipeline and was discarded.
    Dropped,
    /// The handler was cancelled; nothing was persisted.
    Cancelled,
}

pub struct Orchestrator {
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<dyn PipelineQueue>,
    handlers: HandlerRegistry,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        queue: Arc<dyn PipelineQueue>,
        handlers: HandlerRegistry,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            artifacts,
            queue,
            handlers,
            options,
        }
    }

    pub fn queue(&self) -> &Arc<dyn PipelineQueue> {
        &self.queue
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Ids must be well formed and every step must have a handler.
    pub fn check(&self, pipeline: &DataPipeline) -> PipelineResult<()> {
        pipeline.validate()?;
        if let Some(step) = pipeline.steps.iter().find(|s| !self.handlers.contains(s)) {
            return Err(ValidationError::UnknownStep(step.clone()).into());
        }
        Ok(())
    }

    /// Validate, persist and enqueue the first step of a new execution.
    pub async fn start(&self, mut pipeline: DataPipeline) -> PipelineResult<DataPipeline> {
        self.check(&pipeline)?;

        pipeline.state = PipelineState::Running;
        pipeline.touch();
        write_status(self.artifacts.as_ref(), &pipeline).await?;
        self.enqueue_head(&pipeline).await?;
        info!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            execution_id = %pipeline.execution_id,
            steps = ?pipeline.steps,
            "pipeline started"
        );
        Ok(pipeline)
    }

    /// Re-enqueue the current step of an unfinished pipeline. Terminal
    /// pipelines are left alone.
    pub async fn resume(&self, index: &str, document_id: &str) -> PipelineResult<PipelineState> {
        let mut pipeline = self.load(index, document_id).await?;
        if pipeline.is_terminal() {
            return Ok(pipeline.state);
        }
        if pipeline.state == PipelineState::Created {
            pipeline.state = PipelineState::Running;
            pipeline.touch();
            write_status(self.artifacts.as_ref(), &pipeline).await?;
        }
        self.enqueue_head(&pipeline).await?;
        info!(index, document_id, step = ?pipeline.current_step(), "pipeline resumed");
        Ok(pipeline.state)
    }

    /// Resume every unfinished pipeline in the artifact store. Run at
    /// startup: a queue that did not survive the restart lost their
    /// messages, and duplicates left by a durable queue are dropped when
    /// they arrive.
    pub async fn resume_unfinished(&self) -> PipelineResult<Vec<DataPipeline>> {
        let mut resumed = Vec::new();
        for index in self.artifacts.list_indexes().await? {
            for document_id in self.artifacts.list_documents(&index).await? {
                let mut pipeline = match self.status(&index, &document_id).await {
                    Ok(Some(pipeline)) if !pipeline.is_terminal() => pipeline,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(
                            index = %index,
                            document_id = %document_id,
                            error = %err,
                            "unreadable status document"
                        );
                        continue;
                    }
                };
                pipeline.state = self.resume(&index, &document_id).await?;
                resumed.push(pipeline);
            }
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), "unfinished pipelines resumed");
        }
        Ok(resumed)
    }

    pub async fn status(&self, index: &str, document_id: &str) -> PipelineResult<Option<DataPipeline>> {
        read_status(self.artifacts.as_ref(), index, document_id).await
    }

    /// Apply a handler outcome to the pipeline and persist it.
    ///
    /// Queue acknowledgement is left to the caller; see
    /// [`Orchestrator::process_message`].
    pub async fn handle_step_completion(
        &self,
        mut pipeline: DataPipeline,
        step: &str,
        outcome: StepOutcome,
    ) -> PipelineResult<(StepDisposition, DataPipeline)> {
        if !self.is_current(&pipeline, Some(step)).await? {
            warn!(
                index = %pipeline.index,
                document_id = %pipeline.document_id,
                execution_id = %pipeline.execution_id,
                step,
                "pipeline moved on while the step ran, discarding its outcome"
            );
            return Ok((StepDisposition::Dropped, pipeline));
        }

        let disposition = match outcome {
            StepOutcome::Success => {
                if !pipeline.complete_step(step) {
                    return Err(PipelineError::InvalidRequest(format!(
                        "step {step} is not the current step of {}/{}",
                        pipeline.index, pipeline.document_id
                    )));
                }
                write_status(self.artifacts.as_ref(), &pipeline).await?;
                match pipeline.current_step() {
                    Some(next) => {
                        let next = next.to_string();
                        self.queue.enqueue(WorkItem::for_step(&pipeline, &next)).await?;
                        debug!(
                            index = %pipeline.index,
                            document_id = %pipeline.document_id,
                            step,
                            next = %next,
                            "step completed"
                        );
                        StepDisposition::Advanced { next }
                    }
                    None => {
                        info!(
                            index = %pipeline.index,
                            document_id = %pipeline.document_id,
                            "pipeline completed"
                        );
                        StepDisposition::Completed
                    }
                }
            }
            StepOutcome::Retry(reason) => {
                let attempts = pipeline.record_failed_attempt(step);
                if attempts > self.options.max_step_retries {
                    let reason = format!("gave up after {attempts} attempts: {reason}");
                    self.fail(&mut pipeline, step, &reason).await?
                } else {
                    pipeline.log(step, format!("attempt {attempts} failed: {reason}"));
                    write_status(self.artifacts.as_ref(), &pipeline).await?;
                    warn!(
                        index = %pipeline.index,
                        document_id = %pipeline.document_id,
                        step,
                        attempts,
                        reason = %reason,
                        "step failed, will retry"
                    );
                    StepDisposition::Retrying { attempts }
                }
            }
            StepOutcome::Fatal(reason) => self.fail(&mut pipeline, step, &reason).await?,
        };
        Ok((disposition, pipeline))
    }

    /// Run the step named by `message` and settle the message.
    pub async fn process_message(
        &self,
        message: &QueueMessage,
        cancel: &CancelSignal,
    ) -> PipelineResult<StepDisposition> {
        let item = &message.item;
        let Some(pipeline) = self.status(&item.index, &item.document_id).await? else {
            warn!(item = %item, "no status document, dropping message");
            return self.drop_message(message).await;
        };

        if pipeline.execution_id != item.execution_id || pipeline.is_terminal() {
            debug!(item = %item, state = %pipeline.state, "stale message");
            return self.drop_message(message).await;
        }

        if pipeline.is_step_completed(&item.step) {
            // Redelivery after the step was persisted; the next step may
            // not have been enqueued yet.
            if let Some(head) = pipeline.current_step() {
                self.queue.enqueue(WorkItem::for_step(&pipeline, head)).await?;
            }
            debug!(item = %item, "step already completed");
            return self.drop_message(message).await;
        }

        if pipeline.current_step() != Some(item.step.as_str()) {
            warn!(item = %item, current = ?pipeline.current_step(), "message out of order");
            return self.drop_message(message).await;
        }

        let outcome = match self.handlers.get(&item.step) {
            None => StepOutcome::Fatal(
                ValidationError::UnknownStep(item.step.clone()).to_string(),
            ),
            Some(handler) => match handler.invoke(pipeline.clone(), cancel).await {
                Ok((outcome, updated)) => {
                    let (disposition, _) =
                        self.handle_step_completion(updated, &item.step, outcome).await?;
                    return self.settle(message, disposition).await;
                }
                Err(PipelineError::Cancelled) => {
                    debug!(item = %item, "step cancelled");
                    return match self.queue.nack(message).await? {
                        NackOutcome::Requeued => Ok(StepDisposition::Cancelled),
                        NackOutcome::Poisoned => self.fail_poisoned(pipeline, &item.step).await,
                    };
                }
                Err(err) => {
                    error!(item = %item, error = %err, "handler broke its contract");
                    StepOutcome::Fatal(format!("handler error: {err}"))
                }
            },
        };

        let (disposition, _) = self
            .handle_step_completion(pipeline, &item.step, outcome)
            .await?;
        self.settle(message, disposition).await
    }

    /// Mark the pipeline of a message the queue poisoned on dequeue as
    /// failed, unless the message no longer applies to it.
    pub async fn handle_poisoned(&self, poisoned: &PoisonedMessage) -> PipelineResult<StepDisposition> {
        let item = &poisoned.message.item;
        let Some(mut pipeline) = self.status(&item.index, &item.document_id).await? else {
            return Ok(StepDisposition::Dropped);
        };
        if pipeline.execution_id != item.execution_id || pipeline.is_terminal() {
            return Ok(StepDisposition::Dropped);
        }
        if pipeline.is_step_completed(&item.step) {
            if let Some(head) = pipeline.current_step() {
                self.queue.enqueue(WorkItem::for_step(&pipeline, head)).await?;
            }
            debug!(item = %item, "poisoned duplicate of a completed step");
            return Ok(StepDisposition::Dropped);
        }
        if pipeline.current_step() != Some(item.step.as_str()) {
            warn!(item = %item, current = ?pipeline.current_step(), "poisoned message out of order");
            return Ok(StepDisposition::Dropped);
        }
        self.fail(&mut pipeline, &item.step, &poisoned.reason).await
    }

    /// Process at most one message. `None` when the queue had nothing
    /// ready.
    pub async fn run_once(&self, cancel: &CancelSignal) -> PipelineResult<Option<StepDisposition>> {
        match self.queue.dequeue().await? {
            None => Ok(None),
            Some(Delivery::Poisoned(poisoned)) => self.handle_poisoned(&poisoned).await.map(Some),
            Some(Delivery::Message(message)) => {
                self.process_message(&message, cancel).await.map(Some)
            }
        }
    }

    async fn settle(
        &self,
        message: &QueueMessage,
        disposition: StepDisposition,
    ) -> PipelineResult<StepDisposition> {
        match &disposition {
            StepDisposition::Retrying { .. } => {
                if self.queue.nack(message).await? == NackOutcome::Poisoned {
                    let item = &message.item;
                    if let Some(pipeline) = self.status(&item.index, &item.document_id).await? {
                        return self.fail_poisoned(pipeline, &item.step).await;
                    }
                }
            }
            StepDisposition::Failed { reason } => self.queue.poison(message, reason).await?,
            _ => self.queue.ack(message).await?,
        }
        Ok(disposition)
    }

    async fn drop_message(&self, message: &QueueMessage) -> PipelineResult<StepDisposition> {
        self.queue.ack(message).await?;
        Ok(StepDisposition::Dropped)
    }

    /// The queue gave up on the message before the step ceiling was hit.
    async fn fail_poisoned(
        &self,
        mut pipeline: DataPipeline,
        step: &str,
    ) -> PipelineResult<StepDisposition> {
        let reason = format!(
            "message delivered {} times without success",
            self.queue.options().max_deliveries_before_poison
        );
        self.fail(&mut pipeline, step, &reason).await
    }

    /// Whether `pipeline` is still the persisted, unfinished execution and,
    /// when `step` is given, still waiting on that step.
    async fn is_current(&self, pipeline: &DataPipeline, step: Option<&str>) -> PipelineResult<bool> {
        Ok(self
            .status(&pipeline.index, &pipeline.document_id)
            .await?
            .is_some_and(|p| {
                p.execution_id == pipeline.execution_id
                    && !p.is_terminal()
                    && step.is_none_or(|s| p.current_step() == Some(s))
            }))
    }

    /// `Dropped` when another execution took over the document.
    async fn fail(
        &self,
        pipeline: &mut DataPipeline,
        step: &str,
        reason: &str,
    ) -> PipelineResult<StepDisposition> {
        if !self.is_current(pipeline, None).await? {
            debug!(document_id = %pipeline.document_id, step, "superseded, not failing");
            return Ok(StepDisposition::Dropped);
        }
        pipeline.fail(step, reason);
        pipeline.log(step, reason);
        write_status(self.artifacts.as_ref(), pipeline).await?;
        error!(
            index = %pipeline.index,
            document_id = %pipeline.document_id,
            step,
            reason,
            "pipeline failed"
        );
        Ok(StepDisposition::Failed {
            reason: reason.to_string(),
        })
    }

    async fn enqueue_head(&self, pipeline: &DataPipeline) -> PipelineResult<()> {
        if let Some(step) = pipeline.current_step() {
            self.queue.enqueue(WorkItem::for_step(pipeline, step)).await?;
        }
        Ok(())
    }

    async fn load(&self, index: &str, document_id: &str) -> PipelineResult<DataPipeline> {
        self.status(index, document_id)
            .await?
            .ok_or_else(|| PipelineError::StatusNotFound {
                index: index.to_string(),
                document_id: document_id.to_string(),
            })
    }
}
