//! Pipeline error taxonomy.
//!
//! One variant per failure class, each with its own propagation policy
//! (see `pipeline::coordinator` for how the consume loop reacts to each).

use crate::registry::ProcessingStatus;
use crate::types::ProcessingId;

/// Errors raised while driving a work packet through a stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed numeric input to the candidate transform engine.
    /// Aborts the current packet only; recorded as Failed with the value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A state transition was requested on a Processing record that has
    /// already reached a terminal state. Programming-invariant violation:
    /// surfaced to the operator, never auto-corrected.
    #[error("invalid state transition for processing {id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        id: ProcessingId,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    /// Non-zero exit, spawn failure, or timeout from an invoked tool.
    /// Recorded as Failed; never propagates past the stage runner.
    #[error("external tool failure: {0}")]
    ExternalToolFailure(String),

    /// The processing registry could not be reached or written. The packet
    /// is left un-acknowledged so the queue redelivers it later.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A queue message could not be decoded into a work packet.
    #[error("packet decode error: {0}")]
    PacketDecodeError(String),
}
