//! Generic stage lifecycle driver.
//!
//! The runner owns everything every stage does identically: one
//! Processing record per sub-packet, input-product links, start/end
//! timestamps, product fingerprinting and registration, downstream
//! publication. Handler failures are isolated per sub-packet; only
//! infrastructure failures (registry down, queue down, state-machine
//! violations) abort the whole delivery so it can be redelivered.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use super::{StageContext, StageHandler};
use crate::error::PipelineError;
use crate::fingerprint::fingerprint_path;
use crate::queue::{QueueError, WorkQueue};
use crate::registry::{NewDataProduct, ProcessingStatus};
use crate::types::{ProcessingId, WorkPacket};

/// Errors that abort a delivery instead of being recorded against one
/// Processing.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome of one sub-packet.
#[derive(Debug, Clone)]
pub struct PacketReport {
    pub processing_id: ProcessingId,
    pub status: ProcessingStatus,
    pub note: Option<String>,
}

pub struct StageRunner {
    handler: Arc<dyn StageHandler>,
    queue: Arc<dyn WorkQueue>,
    /// Queue this stage's packets arrive on. Requeued inputs go back
    /// here, not to the configured default, which may differ when the
    /// consumer runs with an overridden queue name.
    input_queue: String,
    ctx: StageContext,
}

impl StageRunner {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        queue: Arc<dyn WorkQueue>,
        input_queue: String,
        ctx: StageContext,
    ) -> Self {
        Self {
            handler,
            queue,
            input_queue,
            ctx,
        }
    }

    /// Split and execute one decoded packet, producing one report per
    /// sub-packet.
    pub async fn execute(&self, packet: WorkPacket) -> Result<Vec<PacketReport>, RunnerError> {
        let kind = self.handler.kind();
        let subs = match self.handler.split(packet, &self.ctx.config) {
            Ok(subs) => subs,
            Err(e) => {
                // The packet cannot even be partitioned; record a single
                // failed Processing so the attempt is auditable.
                let report = self.record_unrunnable(&e).await?;
                return Ok(vec![report]);
            }
        };

        let mut reports = Vec::with_capacity(subs.len());
        for sub in subs {
            let registry = &self.ctx.registry;
            let id = registry
                .create_processing(kind, kind.pipeline_name(), Utc::now())
                .await?;
            for dp in sub.input_dp_ids() {
                registry.link_data_product(*dp, id).await?;
            }
            registry.mark_started(id, Utc::now()).await?;

            match self.handler.run(&sub, &self.ctx).await {
                Ok(output) if output.failure_note.is_some() => {
                    let note = output.failure_note.unwrap_or_default();
                    registry.mark_failed(id, Utc::now(), &note).await?;
                    if output.requeue_input {
                        self.queue.publish(&self.input_queue, &sub).await?;
                    }
                    info!(processing = %id, stage = %kind, note, "processing failed");
                    reports.push(PacketReport {
                        processing_id: id,
                        status: ProcessingStatus::Failed,
                        note: Some(note),
                    });
                }
                Ok(output) => {
                    let mut product_ids = Vec::with_capacity(output.products.len());
                    for draft in &output.products {
                        let location = draft.location.clone();
                        let fp = tokio::task::spawn_blocking(move || fingerprint_path(&location))
                            .await
                            .map_err(|e| {
                                PipelineError::ExternalToolFailure(format!(
                                    "fingerprint task failed: {e}"
                                ))
                            })?;
                        let dp_id = registry
                            .register_data_product(NewDataProduct {
                                fingerprint: fp.digest,
                                size_bytes: fp.size_bytes,
                                location: draft.location.clone(),
                                file_type: draft.file_type.clone(),
                                owner: Some(id),
                            })
                            .await?;
                        registry.link_data_product(dp_id, id).await?;
                        product_ids.push(dp_id);
                    }
                    registry.mark_successful(id, Utc::now()).await?;
                    for dispatch in output.downstream {
                        let mut packet = dispatch.packet;
                        packet.append_input_dp_ids(&product_ids);
                        self.queue.publish(&dispatch.queue, &packet).await?;
                    }
                    info!(processing = %id, stage = %kind, products = product_ids.len(), "processing successful");
                    reports.push(PacketReport {
                        processing_id: id,
                        status: ProcessingStatus::Successful,
                        note: None,
                    });
                }
                Err(
                    e @ (PipelineError::RegistryUnavailable(_)
                    | PipelineError::InvalidStateTransition { .. }),
                ) => {
                    // Not a property of this packet; abort so the queue
                    // redelivers the whole thing.
                    error!(processing = %id, stage = %kind, error = %e, "aborting delivery");
                    return Err(e.into());
                }
                Err(e) => {
                    let note = e.to_string();
                    registry.mark_failed(id, Utc::now(), &note).await?;
                    info!(processing = %id, stage = %kind, note, "processing failed");
                    reports.push(PacketReport {
                        processing_id: id,
                        status: ProcessingStatus::Failed,
                        note: Some(note),
                    });
                }
            }
        }
        Ok(reports)
    }

    async fn record_unrunnable(&self, cause: &PipelineError) -> Result<PacketReport, RunnerError> {
        let kind = self.handler.kind();
        let note = format!("packet could not be partitioned: {cause}");
        let id = self
            .ctx
            .registry
            .create_processing(kind, kind.pipeline_name(), Utc::now())
            .await?;
        self.ctx.registry.mark_failed(id, Utc::now(), &note).await?;
        Ok(PacketReport {
            processing_id: id,
            status: ProcessingStatus::Failed,
            note: Some(note),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
