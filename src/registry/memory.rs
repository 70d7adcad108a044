//! In-process registry for tests and single-process local runs.
//!
//! Implements the same uniqueness and state-machine invariants a durable
//! backend must provide, behind one mutex (the advisory-lock analogue for
//! a single process). An availability toggle lets tests exercise the
//! un-acknowledge/redeliver path without a real network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    DataProduct, NewDataProduct, ProcessingRecord, ProcessingRegistry, ProcessingStatus,
};
use crate::error::PipelineError;
use crate::types::{DataProductId, ProcessingId, StageKind};

#[derive(Default)]
struct Inner {
    next_processing_id: i64,
    next_product_id: i64,
    processings: BTreeMap<ProcessingId, ProcessingRecord>,
    products: BTreeMap<DataProductId, DataProduct>,
    /// fingerprint -> product id; the uniqueness constraint.
    by_fingerprint: BTreeMap<String, DataProductId>,
    pivots: BTreeSet<(DataProductId, ProcessingId)>,
}

/// Shared-nothing registry held behind a mutex.
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a registry outage (for redelivery tests).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of one processing record.
    pub fn processing(&self, id: ProcessingId) -> Option<ProcessingRecord> {
        self.lock().ok()?.processings.get(&id).cloned()
    }

    /// Snapshot of all processing records, ordered by id.
    pub fn processings(&self) -> Vec<ProcessingRecord> {
        self.lock()
            .map(|inner| inner.processings.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one data product.
    pub fn product(&self, id: DataProductId) -> Option<DataProduct> {
        self.lock().ok()?.products.get(&id).cloned()
    }

    pub fn product_count(&self) -> usize {
        self.lock().map(|inner| inner.products.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PipelineError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PipelineError::RegistryUnavailable(
                "registry connection lost".to_string(),
            ));
        }
        self.inner
            .lock()
            .map_err(|e| PipelineError::RegistryUnavailable(format!("registry lock poisoned: {e}")))
    }
}

fn transition(
    record: &mut ProcessingRecord,
    to: ProcessingStatus,
    at: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let from = record.status;
    let allowed = match to {
        ProcessingStatus::Running => from == ProcessingStatus::Enqueued,
        // A stage may fail before it ever starts (missing inputs), so
        // terminal transitions are allowed from Enqueued as well.
        ProcessingStatus::Successful | ProcessingStatus::Failed => !from.is_terminal(),
        ProcessingStatus::Enqueued => false,
    };
    if !allowed {
        return Err(PipelineError::InvalidStateTransition {
            id: record.id,
            from,
            to,
        });
    }
    match to {
        ProcessingStatus::Running => record.started = Some(at),
        ProcessingStatus::Successful | ProcessingStatus::Failed => record.ended = Some(at),
        ProcessingStatus::Enqueued => {}
    }
    record.status = to;
    Ok(())
}

#[async_trait]
impl ProcessingRegistry for MemoryRegistry {
    async fn create_processing(
        &self,
        stage: StageKind,
        pipeline: &str,
        submitted: DateTime<Utc>,
    ) -> Result<ProcessingId, PipelineError> {
        let mut inner = self.lock()?;
        inner.next_processing_id += 1;
        let id = ProcessingId(inner.next_processing_id);
        inner.processings.insert(
            id,
            ProcessingRecord {
                id,
                stage,
                pipeline: pipeline.to_string(),
                status: ProcessingStatus::Enqueued,
                submitted,
                started: None,
                ended: None,
                note: None,
            },
        );
        Ok(id)
    }

    async fn link_data_product(
        &self,
        dp_id: DataProductId,
        processing_id: ProcessingId,
    ) -> Result<bool, PipelineError> {
        let mut inner = self.lock()?;
        Ok(inner.pivots.insert((dp_id, processing_id)))
    }

    async fn mark_started(&self, id: ProcessingId, at: DateTime<Utc>) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        let record = inner
            .processings
            .get_mut(&id)
            .ok_or_else(|| PipelineError::RegistryUnavailable(format!("no processing {id}")))?;
        transition(record, ProcessingStatus::Running, at)
    }

    async fn mark_successful(
        &self,
        id: ProcessingId,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        let record = inner
            .processings
            .get_mut(&id)
            .ok_or_else(|| PipelineError::RegistryUnavailable(format!("no processing {id}")))?;
        transition(record, ProcessingStatus::Successful, at)
    }

    async fn mark_failed(
        &self,
        id: ProcessingId,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<(), PipelineError> {
        let mut inner = self.lock()?;
        let record = inner
            .processings
            .get_mut(&id)
            .ok_or_else(|| PipelineError::RegistryUnavailable(format!("no processing {id}")))?;
        transition(record, ProcessingStatus::Failed, at)?;
        record.note = Some(note.to_string());
        Ok(())
    }

    async fn register_data_product(
        &self,
        product: NewDataProduct,
    ) -> Result<DataProductId, PipelineError> {
        let mut inner = self.lock()?;
        if let Some(&existing) = inner.by_fingerprint.get(&product.fingerprint) {
            return Ok(existing);
        }
        inner.next_product_id += 1;
        let id = DataProductId(inner.next_product_id);
        inner.by_fingerprint.insert(product.fingerprint.clone(), id);
        inner.products.insert(
            id,
            DataProduct {
                id,
                fingerprint: product.fingerprint,
                size_bytes: product.size_bytes,
                location: product.location,
                file_type: product.file_type,
                owner: product.owner,
                present: true,
            },
        );
        Ok(id)
    }

    async fn data_products_for_processing(
        &self,
        id: ProcessingId,
    ) -> Result<Vec<DataProductId>, PipelineError> {
        let inner = self.lock()?;
        Ok(inner
            .pivots
            .iter()
            .filter(|(_, pid)| *pid == id)
            .map(|(dp, _)| *dp)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn product(fingerprint: &str) -> NewDataProduct {
        NewDataProduct {
            fingerprint: fingerprint.to_string(),
            size_bytes: 42,
            location: PathBuf::from("/data/x.fil"),
            file_type: "filterbank".to_string(),
            owner: None,
        }
    }

    #[tokio::test]
    async fn registration_is_idempotent_by_fingerprint() {
        let registry = MemoryRegistry::new();
        let first = registry.register_data_product(product("abc")).await.unwrap();
        let second = registry.register_data_product(product("abc")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.product_count(), 1);

        let other = registry.register_data_product(product("def")).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn concurrent_registration_converges_to_one_id() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.register_data_product(product("same")).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.product_count(), 1);
    }

    #[tokio::test]
    async fn pivot_creation_is_idempotent() {
        let registry = MemoryRegistry::new();
        let dp = registry.register_data_product(product("abc")).await.unwrap();
        let pid = registry
            .create_processing(StageKind::Search, "peasoup", Utc::now())
            .await
            .unwrap();
        assert!(registry.link_data_product(dp, pid).await.unwrap());
        assert!(!registry.link_data_product(dp, pid).await.unwrap());
        assert_eq!(
            registry.data_products_for_processing(pid).await.unwrap(),
            vec![dp]
        );
    }

    #[tokio::test]
    async fn lifecycle_walks_enqueued_running_terminal() {
        let registry = MemoryRegistry::new();
        let id = registry
            .create_processing(StageKind::Fold, "PRESTO", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            registry.processing(id).unwrap().status,
            ProcessingStatus::Enqueued
        );

        registry.mark_started(id, Utc::now()).await.unwrap();
        let record = registry.processing(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Running);
        assert!(record.started.is_some());
        assert!(record.ended.is_none());

        registry.mark_successful(id, Utc::now()).await.unwrap();
        let record = registry.processing(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Successful);
        assert!(record.started.unwrap() <= record.ended.unwrap());
    }

    #[tokio::test]
    async fn terminal_records_reject_further_transitions() {
        let registry = MemoryRegistry::new();
        let id = registry
            .create_processing(StageKind::Fold, "PRESTO", Utc::now())
            .await
            .unwrap();
        registry.mark_started(id, Utc::now()).await.unwrap();
        registry.mark_successful(id, Utc::now()).await.unwrap();

        let err = registry.mark_failed(id, Utc::now(), "late failure").await;
        assert!(matches!(
            err,
            Err(PipelineError::InvalidStateTransition { .. })
        ));
        let err = registry.mark_started(id, Utc::now()).await;
        assert!(matches!(
            err,
            Err(PipelineError::InvalidStateTransition { .. })
        ));
        // Terminal state and note untouched.
        let record = registry.processing(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Successful);
        assert!(record.note.is_none());
    }

    #[tokio::test]
    async fn duplicate_mark_started_is_rejected() {
        let registry = MemoryRegistry::new();
        let id = registry
            .create_processing(StageKind::Merge, "digifil_merge", Utc::now())
            .await
            .unwrap();
        registry.mark_started(id, Utc::now()).await.unwrap();
        assert!(matches!(
            registry.mark_started(id, Utc::now()).await,
            Err(PipelineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failure_before_start_is_allowed() {
        let registry = MemoryRegistry::new();
        let id = registry
            .create_processing(StageKind::Score, "PICS_Original", Utc::now())
            .await
            .unwrap();
        registry
            .mark_failed(id, Utc::now(), "input directory missing")
            .await
            .unwrap();
        let record = registry.processing(id).unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.note.as_deref(), Some("input directory missing"));
    }

    #[tokio::test]
    async fn outage_surfaces_registry_unavailable() {
        let registry = MemoryRegistry::new();
        registry.set_available(false);
        let err = registry
            .create_processing(StageKind::Search, "peasoup", Utc::now())
            .await;
        assert!(matches!(err, Err(PipelineError::RegistryUnavailable(_))));
        registry.set_available(true);
        assert!(registry
            .create_processing(StageKind::Search, "peasoup", Utc::now())
            .await
            .is_ok());
    }
}
