//! Processing registry contract.
//!
//! The registry is the only shared mutable state in the system: a durable
//! store of Processing records, data product identities, and the pivot
//! rows linking them. The pipeline consumes this interface; production
//! deployments implement it over whatever store satisfies the idempotency
//! guarantees (uniqueness-guarded upserts, atomic state transitions).
//! [`MemoryRegistry`] ships for tests and single-process local runs.
//!
//! State machine per Processing record:
//!
//! ```text
//! Enqueued -> Running -> { Successful | Failed }   (terminal)
//! ```
//!
//! Terminal records are never revived; a retry creates a new record.

mod memory;

pub use memory::MemoryRegistry;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{DataProductId, ProcessingId, StageKind};

/// Lifecycle state of one Processing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Enqueued,
    Running,
    Successful,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

/// One instance of a stage executing against a set of input data products.
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    pub id: ProcessingId,
    pub stage: StageKind,
    pub pipeline: String,
    pub status: ProcessingStatus,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Free text; carries the error message for Failed records.
    pub note: Option<String>,
}

/// A registered artifact tracked by the registry.
#[derive(Debug, Clone)]
pub struct DataProduct {
    pub id: DataProductId,
    pub fingerprint: String,
    pub size_bytes: u64,
    pub location: PathBuf,
    pub file_type: String,
    /// Processing that produced this product; None for raw recordings.
    pub owner: Option<ProcessingId>,
    /// Lifecycle flag: false once the underlying file has been deleted.
    pub present: bool,
}

/// Fields for registering a data product. Registration is idempotent by
/// fingerprint: an existing fingerprint resolves to the existing id.
#[derive(Debug, Clone)]
pub struct NewDataProduct {
    pub fingerprint: String,
    pub size_bytes: u64,
    pub location: PathBuf,
    pub file_type: String,
    pub owner: Option<ProcessingId>,
}

/// Durable store of Processing and DataProduct lifecycles.
///
/// All write operations must be exactly-once under concurrent callers:
/// idempotent upserts guarded by a uniqueness constraint on the resource
/// key, never optimistic retries that could double-insert.
#[async_trait]
pub trait ProcessingRegistry: Send + Sync {
    /// Create a fresh Processing record in status Enqueued.
    async fn create_processing(
        &self,
        stage: StageKind,
        pipeline: &str,
        submitted: DateTime<Utc>,
    ) -> Result<ProcessingId, PipelineError>;

    /// Link a data product to a processing. Returns `false` when the pivot
    /// already existed (idempotent; at most one row per pair).
    async fn link_data_product(
        &self,
        dp_id: DataProductId,
        processing_id: ProcessingId,
    ) -> Result<bool, PipelineError>;

    /// Transition Enqueued -> Running and stamp the start time.
    async fn mark_started(
        &self,
        id: ProcessingId,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError>;

    /// Transition to the Successful terminal state.
    async fn mark_successful(
        &self,
        id: ProcessingId,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError>;

    /// Transition to the Failed terminal state, recording the error note.
    async fn mark_failed(
        &self,
        id: ProcessingId,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<(), PipelineError>;

    /// Register a data product, idempotent by fingerprint.
    async fn register_data_product(
        &self,
        product: NewDataProduct,
    ) -> Result<DataProductId, PipelineError>;

    /// Data products linked to a processing via pivots.
    async fn data_products_for_processing(
        &self,
        id: ProcessingId,
    ) -> Result<Vec<DataProductId>, PipelineError>;
}
