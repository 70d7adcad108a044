//! psrpipe: pulsar-search pipeline coordination engine.
//!
//! Drives a merge → search → fold → score batch pipeline over queued
//! work packets. Each stage combines domain computation with external
//! tool invocations and republishes derived packets for the next stage;
//! a persistent processing registry records every attempt so the whole
//! pipeline stays idempotent and auditable under at-least-once delivery.
//!
//! ## Architecture
//!
//! - **Stages**: merge beams (`digifil` + IQRM), acceleration search
//!   (`peasoup`), candidate folding (`prepfold`), classifier scoring.
//! - **Splitter**: partitions oversized work into DM sub-ranges, time
//!   segments, and candidate batches.
//! - **Transform engine**: acceleration/period corrections shared by the
//!   search and fold stages.
//! - **Consumed abstractions**: [`queue::WorkQueue`],
//!   [`registry::ProcessingRegistry`], [`invoker::ToolInvoker`].

pub mod candidates;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod invoker;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod splitter;
pub mod stages;
pub mod transform;
pub mod types;

// Re-export the configuration entry point
pub use config::PipelineConfig;

// Re-export commonly used types
pub use error::PipelineError;
pub use types::{
    AccelerationRange, Candidate, DataProductId, DmRange, FoldPacket, MergePacket,
    ProcessingId, ScorePacket, SearchPacket, StageKind, WorkPacket,
};
