//! Stage processors.
//!
//! Each pipeline stage implements [`StageHandler`]: split an incoming
//! packet into independently-tracked sub-packets, then run the domain
//! computation and tool invocations for each. The surrounding lifecycle
//! (Processing records, product registration, downstream publication) is
//! the [`runner::StageRunner`]'s job, so handlers stay focused on their
//! stage's commands and file layout.

mod fold;
mod merge;
pub mod runner;
mod score;
mod search;

pub use fold::FoldStage;
pub use merge::MergeStage;
pub use score::ScoreStage;
pub use search::SearchStage;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::invoker::ToolInvoker;
use crate::registry::ProcessingRegistry;
use crate::types::{StageKind, WorkPacket};

/// Collaborators a stage handler may use while running one packet.
pub struct StageContext {
    pub registry: Arc<dyn ProcessingRegistry>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub config: Arc<PipelineConfig>,
}

/// A produced file or directory to be fingerprinted and registered.
#[derive(Debug, Clone)]
pub struct ProductDraft {
    pub location: PathBuf,
    pub file_type: String,
}

/// A packet to publish once the current processing has been recorded
/// Successful. The runner appends this stage's registered product ids to
/// the packet before publishing.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub queue: String,
    pub packet: WorkPacket,
}

/// What one handler run produced.
#[derive(Debug, Default)]
pub struct StageOutput {
    /// Files/directories to register as data products of this processing.
    pub products: Vec<ProductDraft>,
    /// Packets for downstream stages.
    pub downstream: Vec<Dispatch>,
    /// When set, the processing is recorded Failed with this note even
    /// though the handler returned Ok. Used for domain-level outcomes like
    /// an empty candidate list, where nothing crashed but there is no
    /// result to pass on.
    pub failure_note: Option<String>,
    /// Re-publish the input packet to this stage's own queue after a
    /// `failure_note` outcome.
    pub requeue_input: bool,
}

impl StageOutput {
    /// Domain-level failure without products or downstream packets.
    pub fn failed(note: impl Into<String>, requeue_input: bool) -> Self {
        Self {
            failure_note: Some(note.into()),
            requeue_input,
            ..Self::default()
        }
    }
}

/// One pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Partition a packet into independent sub-packets, each of which gets
    /// its own Processing record. Default: no split.
    fn split(
        &self,
        packet: WorkPacket,
        _config: &PipelineConfig,
    ) -> Result<Vec<WorkPacket>, PipelineError> {
        Ok(vec![packet])
    }

    /// Run the stage for one (sub-)packet.
    async fn run(
        &self,
        packet: &WorkPacket,
        ctx: &StageContext,
    ) -> Result<StageOutput, PipelineError>;
}

/// Handler for the given stage kind.
pub fn handler_for(kind: StageKind) -> Arc<dyn StageHandler> {
    match kind {
        StageKind::Merge => Arc::new(MergeStage),
        StageKind::Search => Arc::new(SearchStage),
        StageKind::Fold => Arc::new(FoldStage),
        StageKind::Score => Arc::new(ScoreStage),
    }
}

fn wrong_packet(expected: StageKind, got: &WorkPacket) -> PipelineError {
    PipelineError::PacketDecodeError(format!(
        "{expected} stage received a {} packet",
        got.kind()
    ))
}
