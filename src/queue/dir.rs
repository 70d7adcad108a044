//! Disk-backed work queue.
//!
//! Each queue is a directory; each message is one JSON file. Receiving a
//! message renames it to `.inflight`, acking deletes it, and requeueing
//! renames it back. The rename-based claim means a crash between receive
//! and ack leaves the file recoverable, giving at-least-once delivery
//! with no extra bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{Delivery, QueueError, WorkQueue};
use crate::types::WorkPacket;

const PENDING_EXT: &str = "json";
const INFLIGHT_EXT: &str = "inflight";

/// Filesystem-backed [`WorkQueue`]. Filenames embed a millisecond
/// timestamp plus a process-local sequence number so lexicographic order
/// is arrival order.
pub struct DirQueue {
    root: PathBuf,
    seq: AtomicU64,
}

impl DirQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    fn next_filename(&self) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{millis:016}-{:05}-{seq:06}.{PENDING_EXT}", std::process::id() % 100_000)
    }

    /// Pending message files in arrival order.
    async fn pending_files(&self, queue: &str) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.queue_dir(queue);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PENDING_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn with_extension(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

#[async_trait]
impl WorkQueue for DirQueue {
    async fn publish(&self, queue: &str, packet: &WorkPacket) -> Result<(), QueueError> {
        let dir = self.queue_dir(queue);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        let payload = serde_json::to_vec_pretty(packet)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let final_path = dir.join(self.next_filename());
        // Write via a temp name so consumers never see a half-written file.
        let tmp_path = with_extension(&final_path, "tmp");
        tokio::fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        debug!(queue, file = %final_path.display(), "published packet");
        Ok(())
    }

    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        for path in self.pending_files(queue).await? {
            let claimed = with_extension(&path, INFLIGHT_EXT);
            // Rename is the claim; losing the race to another consumer is
            // not an error, just move on to the next file.
            if tokio::fs::rename(&path, &claimed).await.is_err() {
                continue;
            }
            let payload = tokio::fs::read(&claimed)
                .await
                .map_err(|e| QueueError::Io(e.to_string()))?;
            let token = claimed.to_string_lossy().into_owned();
            return Ok(Some(Delivery {
                queue: queue.to_string(),
                payload,
                token,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        tokio::fs::remove_file(&delivery.token)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let claimed = PathBuf::from(&delivery.token);
        let pending = with_extension(&claimed, PENDING_EXT);
        tokio::fs::rename(&claimed, &pending)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))
    }

    async fn recover(&self, queue: &str) -> Result<usize, QueueError> {
        let dir = self.queue_dir(queue);
        if !dir.exists() {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?;
        let mut restored = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(INFLIGHT_EXT) {
                let pending = with_extension(&path, PENDING_EXT);
                if let Err(e) = tokio::fs::rename(&path, &pending).await {
                    warn!(file = %path.display(), error = %e, "failed to restore in-flight message");
                } else {
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            warn!(queue, restored, "restored in-flight messages from previous run");
        }
        Ok(restored)
    }
}

// ============================================================================
// Tests
// ============================================================================
