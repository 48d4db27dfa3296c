//! Download side: offer handling, chunk application, ordered assembly.
//!
//! Chunks are stored keyed by index, so reordered delivery is harmless.
//! A chunk is only applied if its download was accepted; CRC-invalid and
//! duplicate chunks are dropped. Assembly runs strictly in index order,
//! hashing incrementally over the ordered parts, and only after the
//! whole-file hash checks out are the bytes surfaced to the application.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::{ChunkFrame, FileHasher};
use crate::config::{AssemblyPolicy, NodeConfig};
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::protocol::ControlMessage;

use super::registry::{FileDownload, TransferRegistry};

/// Drives inbound transfers against the shared registry.
pub struct DownloadCoordinator {
    registry: Arc<TransferRegistry>,
    events: mpsc::UnboundedSender<NodeEvent>,
    assembly: AssemblyPolicy,
}

impl DownloadCoordinator {
    pub fn new(
        registry: Arc<TransferRegistry>,
        events: mpsc::UnboundedSender<NodeEvent>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            registry,
            events,
            assembly: config.assembly,
        }
    }

    /// A peer offered a file. The download starts unaccepted; nothing is
    /// buffered until the application accepts.
    pub async fn handle_offer(
        &self,
        peer: &str,
        file_id: &str,
        file_name: &str,
        file_size: u64,
        file_hash: Option<String>,
    ) {
        let download = FileDownload {
            id: file_id.to_string(),
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            file_size,
            expected_hash: file_hash,
            accepted: false,
            total_chunks: None,
            chunks: BTreeMap::new(),
        };
        let mut downloads = self.registry.downloads.lock().await;
        if downloads.insert(file_id.to_string(), download).is_some() {
            warn!(
                event = "offer_replaced",
                peer = %peer,
                transfer_id = %file_id,
                "New offer replaces an existing download with the same id"
            );
        }
        drop(downloads);
        info!(
            event = "offer_received",
            peer = %peer,
            transfer_id = %file_id,
            size = file_size,
            "File offer received"
        );
        let _ = self.events.send(NodeEvent::FileOffered {
            peer: peer.to_string(),
            transfer_id: file_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
        });
    }

    /// Accept an offer. Returns the file-accept notice for the hub to send,
    /// or `None` if the offer is unknown.
    pub async fn accept(&self, file_id: &str) -> Option<ControlMessage> {
        let mut downloads = self.registry.downloads.lock().await;
        let download = downloads.get_mut(file_id)?;
        download.accepted = true;
        Some(ControlMessage::FileAccept {
            file_id: file_id.to_string(),
        })
    }

    /// Decline an offer. Returns the file-decline notice, or `None` if the
    /// offer is unknown.
    pub async fn decline(&self, file_id: &str) -> Option<ControlMessage> {
        self.registry.downloads.lock().await.remove(file_id)?;
        Some(ControlMessage::FileDecline {
            file_id: file_id.to_string(),
        })
    }

    /// Abort an in-flight download locally. Returns the cancel notice.
    pub async fn cancel(&self, file_id: &str) -> Option<ControlMessage> {
        let download = self.registry.downloads.lock().await.remove(file_id)?;
        let _ = self.events.send(NodeEvent::TransferCancelled {
            peer: download.peer,
            transfer_id: file_id.to_string(),
        });
        Some(ControlMessage::FileCancelDownload {
            file_id: file_id.to_string(),
        })
    }

    /// The sender aborted its upload: drop whatever we have.
    pub async fn handle_cancel_upload(&self, peer: &str, file_id: &str) {
        if self
            .registry
            .downloads
            .lock()
            .await
            .remove(file_id)
            .is_some()
        {
            let _ = self.events.send(NodeEvent::TransferCancelled {
                peer: peer.to_string(),
                transfer_id: file_id.to_string(),
            });
        }
    }

    /// Apply one inbound chunk frame.
    pub async fn handle_chunk(&self, peer: &str, frame: ChunkFrame) {
        let finished = {
            let mut downloads = self.registry.downloads.lock().await;
            let Some(download) = downloads.get_mut(&frame.transfer_id) else {
                debug!(
                    event = "chunk_unknown_transfer",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    "Dropping chunk for unknown transfer"
                );
                return;
            };
            if download.peer != peer {
                warn!(
                    event = "chunk_wrong_peer",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    expected = %download.peer,
                    "Dropping chunk from the wrong peer"
                );
                return;
            }
            if !download.accepted {
                warn!(
                    event = "chunk_unaccepted_offer",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    chunk = frame.chunk_index,
                    "Dropping chunk for an offer that was never accepted"
                );
                return;
            }
            if !frame.is_valid {
                error!(
                    event = "chunk_crc_mismatch",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    chunk = frame.chunk_index,
                    "Dropping chunk with CRC mismatch"
                );
                let _ = self.events.send(NodeEvent::IntegrityFailure {
                    peer: peer.to_string(),
                    transfer_id: frame.transfer_id.clone(),
                    reason: format!("chunk {} failed CRC check", frame.chunk_index),
                });
                return;
            }

            match download.total_chunks {
                None => download.total_chunks = Some(frame.total_chunks),
                Some(total) if total != frame.total_chunks => {
                    warn!(
                        event = "chunk_total_mismatch",
                        peer = %peer,
                        transfer_id = %frame.transfer_id,
                        expected = total,
                        got = frame.total_chunks,
                        "Dropping chunk with inconsistent total count"
                    );
                    return;
                }
                Some(_) => {}
            }
            if frame.chunk_index >= frame.total_chunks {
                warn!(
                    event = "chunk_index_out_of_range",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    chunk = frame.chunk_index,
                    "Dropping chunk with out-of-range index"
                );
                return;
            }
            if download.chunks.contains_key(&frame.chunk_index) {
                debug!(
                    event = "chunk_duplicate",
                    peer = %peer,
                    transfer_id = %frame.transfer_id,
                    chunk = frame.chunk_index,
                    "Dropping duplicate chunk"
                );
                return;
            }

            download.chunks.insert(frame.chunk_index, frame.payload);
            let received = download.received_count();
            let total = frame.total_chunks;
            let _ = self.events.send(NodeEvent::DownloadProgress {
                peer: peer.to_string(),
                transfer_id: frame.transfer_id.clone(),
                received_chunks: received,
                total_chunks: total,
            });

            if download.is_complete() {
                downloads.remove(&frame.transfer_id)
            } else {
                None
            }
        };

        if let Some(download) = finished {
            self.assemble_and_report(download);
        }
    }

    /// Force assembly of whatever arrived, even if the download is not
    /// complete (sender gone, user gave up waiting).
    pub async fn finalize_now(&self, file_id: &str) {
        let download = self.registry.downloads.lock().await.remove(file_id);
        match download {
            Some(download) => self.assemble_and_report(download),
            None => warn!(
                event = "finalize_unknown_transfer",
                transfer_id = %file_id,
                "Nothing to finalize"
            ),
        }
    }

    fn assemble_and_report(&self, download: FileDownload) {
        let peer = download.peer.clone();
        if let Err(Error::Integrity { transfer_id, reason }) = self.assemble(download) {
            let _ = self.events.send(NodeEvent::IntegrityFailure {
                peer,
                transfer_id,
                reason,
            });
        }
    }

    /// Reassemble in strict index order, hash over the ordered parts, and
    /// surface the result. Missing indices are logged individually; whether
    /// assembly proceeds is the configured policy's call. Fails only with
    /// `Error::Integrity`.
    fn assemble(&self, download: FileDownload) -> Result<()> {
        let missing = download.missing_chunks();
        for index in &missing {
            warn!(
                event = "chunk_missing",
                peer = %download.peer,
                transfer_id = %download.id,
                chunk = index,
                "Chunk never arrived"
            );
        }
        if !missing.is_empty() {
            match self.assembly {
                AssemblyPolicy::Strict => {
                    error!(
                        event = "assembly_aborted",
                        peer = %download.peer,
                        transfer_id = %download.id,
                        missing = missing.len(),
                        "Strict assembly policy: aborting incomplete download"
                    );
                    return Err(Error::Integrity {
                        transfer_id: download.id,
                        reason: format!("{} chunk(s) missing", missing.len()),
                    });
                }
                AssemblyPolicy::BestEffort => {
                    warn!(
                        event = "assembly_incomplete",
                        peer = %download.peer,
                        transfer_id = %download.id,
                        missing = missing.len(),
                        "Assembling best-effort despite missing chunks"
                    );
                }
            }
        }

        let mut data = Vec::with_capacity(download.file_size as usize);
        let mut hasher = FileHasher::new();
        for payload in download.chunks.values() {
            hasher.update(payload);
            data.extend_from_slice(payload);
        }
        let digest = hasher.finalize();

        // Verifying against the advertised hash only makes sense for a
        // complete file; an incomplete best-effort assembly is already
        // flagged via `missing_chunks`.
        if missing.is_empty() {
            if let Some(expected) = &download.expected_hash {
                if !expected.eq_ignore_ascii_case(&digest) {
                    error!(
                        event = "file_hash_mismatch",
                        peer = %download.peer,
                        transfer_id = %download.id,
                        expected = %expected,
                        computed = %digest,
                        "Whole-file hash mismatch, rejecting assembled file"
                    );
                    return Err(Error::Integrity {
                        transfer_id: download.id,
                        reason: "whole-file hash mismatch".into(),
                    });
                }
            }
        }

        info!(
            event = "download_complete",
            peer = %download.peer,
            transfer_id = %download.id,
            bytes = data.len(),
            missing = missing.len(),
            "Download assembled"
        );
        let _ = self.events.send(NodeEvent::DownloadComplete {
            peer: download.peer,
            transfer_id: download.id,
            file_name: download.file_name,
            data,
            missing_chunks: missing,
        });
        Ok(())
    }
}
