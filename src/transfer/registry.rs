//! Transfer bookkeeping: one owned registry, injected where needed.
//!
//! The registry holds three maps (uploads, downloads, and offer statuses),
//! each behind its own exclusive lock. Every read-decide-write sequence on a
//! given transfer happens fully inside one lock hold, so two logical
//! operations can never interleave on the same transfer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::ChunkSource;

/// Resolution state of an offered transfer, keyed by (peer, transfer id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Accepted,
    Declined,
    Completed,
}

impl TransferStatus {
    /// Resolved means the offer no longer awaits a decision or data.
    pub fn is_resolved(self) -> bool {
        matches!(self, TransferStatus::Declined | TransferStatus::Completed)
    }
}

/// One outbound file transfer.
pub struct FileUpload {
    pub id: String,
    pub peer: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: Option<String>,
    pub total_chunks: u32,
    /// Next chunk index to send; chunks below this are acknowledged-by-send.
    pub next_chunk: u32,
    pub paused: bool,
    /// Idempotent re-entry guard: true while a send loop is driving this
    /// transfer's offset, so a resume trigger and the original loop can
    /// never both advance it.
    pub streaming: bool,
    /// Set once the offer control message has been emitted.
    pub offered: bool,
    pub consecutive_errors: u32,
    pub source: Arc<dyn ChunkSource>,
}

impl FileUpload {
    pub fn progress_percent(&self) -> f32 {
        if self.total_chunks == 0 {
            100.0
        } else {
            (self.next_chunk as f32 / self.total_chunks as f32) * 100.0
        }
    }
}

/// One inbound file transfer.
pub struct FileDownload {
    pub id: String,
    pub peer: String,
    pub file_name: String,
    pub file_size: u64,
    /// Whole-file SHA-256 hex digest advertised in the offer, if any.
    pub expected_hash: Option<String>,
    /// Chunks are only applied once this is true; chunks for unaccepted
    /// offers are dropped and logged, never buffered speculatively.
    pub accepted: bool,
    /// Learned from the first chunk's frame header.
    pub total_chunks: Option<u32>,
    /// Received payloads keyed by chunk index rather than appended, to
    /// tolerate out-of-order or re-ordered delivery.
    pub chunks: BTreeMap<u32, Vec<u8>>,
}

impl FileDownload {
    pub fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Indices expected but not received. Empty until the total is known.
    pub fn missing_chunks(&self) -> Vec<u32> {
        match self.total_chunks {
            None => Vec::new(),
            Some(total) => (0..total).filter(|i| !self.chunks.contains_key(i)).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks
            .is_some_and(|total| self.received_count() >= total)
    }
}

/// Single owned transfer state store, shared by the upload and download
/// coordinators. Explicitly constructed once and injected, never a static.
#[derive(Default)]
pub struct TransferRegistry {
    pub(crate) uploads: Mutex<HashMap<String, FileUpload>>,
    pub(crate) downloads: Mutex<HashMap<String, FileDownload>>,
    pub(crate) statuses: Mutex<HashMap<(String, String), TransferStatus>>,
}

impl TransferRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_status(&self, peer: &str, transfer_id: &str, status: TransferStatus) {
        self.statuses
            .lock()
            .await
            .insert((peer.to_string(), transfer_id.to_string()), status);
    }

    /// True when every outstanding offer across all peers has resolved.
    pub async fn all_resolved(&self) -> bool {
        let statuses = self.statuses.lock().await;
        !statuses.is_empty() && statuses.values().all(|s| s.is_resolved())
    }

    /// Bulk cleanup of transient upload bookkeeping once every offer has
    /// resolved to declined/completed.
    pub async fn clear_if_all_resolved(&self) {
        if self.all_resolved().await {
            let dropped = {
                let mut uploads = self.uploads.lock().await;
                let n = uploads.len();
                uploads.clear();
                n
            };
            self.statuses.lock().await.clear();
            info!(
                event = "upload_state_cleared",
                dropped, "All offers resolved, cleared upload bookkeeping"
            );
        }
    }

    /// Remove every transfer involving `peer` (the peer disappeared).
    pub async fn remove_peer(&self, peer: &str) {
        self.uploads.lock().await.retain(|_, u| u.peer != peer);
        self.downloads.lock().await.retain(|_, d| d.peer != peer);
        self.statuses.lock().await.retain(|(p, _), _| p != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemorySource;

    fn upload(id: &str, peer: &str) -> FileUpload {
        FileUpload {
            id: id.into(),
            peer: peer.into(),
            file_name: "f.bin".into(),
            file_size: 4,
            file_hash: None,
            total_chunks: 1,
            next_chunk: 0,
            paused: false,
            streaming: false,
            offered: false,
            consecutive_errors: 0,
            source: Arc::new(MemorySource::new(vec![0u8; 4])),
        }
    }

    #[tokio::test]
    async fn cleanup_waits_for_all_offers_to_resolve() {
        let registry = TransferRegistry::new();
        registry.uploads.lock().await.insert("a".into(), upload("a", "bob"));
        registry.uploads.lock().await.insert("b".into(), upload("b", "carol"));
        registry.set_status("bob", "a", TransferStatus::Pending).await;
        registry.set_status("carol", "b", TransferStatus::Completed).await;

        registry.clear_if_all_resolved().await;
        assert_eq!(registry.uploads.lock().await.len(), 2, "one offer still open");

        registry.set_status("bob", "a", TransferStatus::Declined).await;
        registry.clear_if_all_resolved().await;
        assert!(registry.uploads.lock().await.is_empty());
        assert!(registry.statuses.lock().await.is_empty());
    }

    #[tokio::test]
    async fn remove_peer_drops_only_that_peer() {
        let registry = TransferRegistry::new();
        registry.uploads.lock().await.insert("a".into(), upload("a", "bob"));
        registry.uploads.lock().await.insert("b".into(), upload("b", "carol"));
        registry.remove_peer("bob").await;
        let uploads = registry.uploads.lock().await;
        assert_eq!(uploads.len(), 1);
        assert!(uploads.contains_key("b"));
    }

    #[test]
    fn progress_tracks_sent_chunks() {
        let mut u = upload("a", "bob");
        u.total_chunks = 4;
        u.next_chunk = 1;
        assert_eq!(u.progress_percent(), 25.0);
        u.next_chunk = 4;
        assert_eq!(u.progress_percent(), 100.0);
    }

    #[test]
    fn missing_chunks_reports_gaps() {
        let mut download = FileDownload {
            id: "t".into(),
            peer: "bob".into(),
            file_name: "f".into(),
            file_size: 5 * 4,
            expected_hash: None,
            accepted: true,
            total_chunks: Some(5),
            chunks: BTreeMap::new(),
        };
        for i in [0u32, 1, 3, 4] {
            download.chunks.insert(i, vec![i as u8]);
        }
        assert_eq!(download.missing_chunks(), vec![2]);
        assert!(!download.is_complete());
    }
}
