//! Single-consumer stage coordinator.
//!
//! One coordinator binds one stage to one input queue: poll, decode,
//! hand to the stage runner, acknowledge. Scale-out is horizontal (run
//! more processes on the same queue); the at-least-once queue plus the
//! fingerprint-idempotent registry make duplicate deliveries harmless.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::invoker::ToolInvoker;
use crate::queue::{Delivery, WorkQueue};
use crate::registry::{ProcessingRegistry, ProcessingStatus};
use crate::stages::runner::{RunnerError, StageRunner};
use crate::stages::{handler_for, StageContext};
use crate::types::{StageKind, WorkPacket};

/// Counters for one coordinator's lifetime.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub decode_failures: u64,
    pub redelivered: u64,
}

impl fmt::Display for CoordinatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} succeeded={} failed={} decode_failures={} redelivered={}",
            self.received, self.succeeded, self.failed, self.decode_failures, self.redelivered
        )
    }
}

pub struct Coordinator {
    stage: StageKind,
    input_queue: String,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<dyn ProcessingRegistry>,
    runner: StageRunner,
    stats: Mutex<CoordinatorStats>,
}

impl Coordinator {
    pub fn new(
        stage: StageKind,
        queue: Arc<dyn WorkQueue>,
        registry: Arc<dyn ProcessingRegistry>,
        invoker: Arc<dyn ToolInvoker>,
        config: Arc<PipelineConfig>,
        input_queue: Option<String>,
    ) -> Self {
        let input_queue =
            input_queue.unwrap_or_else(|| config.input_queue(stage).to_string());
        let runner = StageRunner::new(
            handler_for(stage),
            queue.clone(),
            input_queue.clone(),
            StageContext {
                registry: registry.clone(),
                invoker,
                config,
            },
        );
        Self {
            stage,
            input_queue,
            queue,
            registry,
            runner,
            stats: Mutex::new(CoordinatorStats::default()),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut CoordinatorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Consume at most one message. Returns `false` when the queue was
    /// empty.
    pub async fn process_one(&self) -> Result<bool, RunnerError> {
        let Some(delivery) = self.queue.try_receive(&self.input_queue).await? else {
            return Ok(false);
        };
        self.bump(|s| s.received += 1);

        let packet = match serde_json::from_slice::<WorkPacket>(&delivery.payload) {
            Ok(packet) if packet.kind() == self.stage => packet,
            Ok(packet) => {
                let note = format!(
                    "{} packet delivered to the {} stage queue {}",
                    packet.kind(),
                    self.stage,
                    self.input_queue
                );
                return self.discard_poison(&delivery, note).await.map(|()| true);
            }
            Err(e) => {
                let snippet: String = String::from_utf8_lossy(&delivery.payload)
                    .chars()
                    .take(256)
                    .collect();
                let note = format!("undecodable packet ({e}): {snippet}");
                return self.discard_poison(&delivery, note).await.map(|()| true);
            }
        };

        match self.runner.execute(packet).await {
            Ok(reports) => {
                self.queue.ack(&delivery).await?;
                self.bump(|s| {
                    for report in &reports {
                        match report.status {
                            ProcessingStatus::Successful => s.succeeded += 1,
                            ProcessingStatus::Failed => s.failed += 1,
                            _ => {}
                        }
                    }
                });
                Ok(true)
            }
            Err(e) => {
                // Infrastructure trouble. Put the delivery back so it is
                // retried once the registry or queue comes back.
                warn!(stage = %self.stage, error = %e, "delivery aborted, returning to queue");
                if let Err(requeue_err) = self.queue.requeue(&delivery).await {
                    warn!(error = %requeue_err, "failed to return delivery to queue");
                }
                self.bump(|s| s.redelivered += 1);
                Err(e)
            }
        }
    }

    /// Record a message that can never succeed as a Failed processing,
    /// then acknowledge it so it stops looping.
    async fn discard_poison(&self, delivery: &Delivery, note: String) -> Result<(), RunnerError> {
        warn!(stage = %self.stage, note, "discarding poison message");
        let record = async {
            let id = self
                .registry
                .create_processing(self.stage, self.stage.pipeline_name(), Utc::now())
                .await?;
            self.registry.mark_failed(id, Utc::now(), &note).await
        };
        match record.await {
            Ok(()) => {
                self.queue.ack(delivery).await?;
                self.bump(|s| {
                    s.decode_failures += 1;
                    s.failed += 1;
                });
                Ok(())
            }
            Err(e) => {
                // Could not even record the failure; redeliver instead of
                // silently dropping the message.
                if let Err(requeue_err) = self.queue.requeue(delivery).await {
                    warn!(error = %requeue_err, "failed to return poison delivery to queue");
                }
                self.bump(|s| s.redelivered += 1);
                Err(e.into())
            }
        }
    }

    /// Consume everything currently queued, stopping at the first empty
    /// poll.
    pub async fn drain(&self) -> Result<CoordinatorStats, RunnerError> {
        while self.process_one().await? {}
        Ok(self.stats())
    }

    /// Consume until cancelled, sleeping `poll_interval` between empty
    /// polls and after infrastructure errors.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Result<(), RunnerError> {
        let recovered = self.queue.recover(&self.input_queue).await?;
        info!(
            stage = %self.stage,
            queue = %self.input_queue,
            recovered,
            "coordinator started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                result = self.process_one() => {
                    let idle = match result {
                        Ok(processed) => !processed,
                        Err(e) => {
                            warn!(stage = %self.stage, error = %e, "processing error, backing off");
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        }
        info!(stage = %self.stage, stats = %self.stats(), "coordinator stopped");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
