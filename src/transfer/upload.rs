//! Upload side: offer emission and accept-triggered chunk streaming.
//!
//! Streaming is fire-and-forget-with-backpressure: a chunk is accounted for
//! when it is handed to the channel, not when the peer confirms receipt.
//! Every loop iteration re-checks, under one registry lock hold, that the
//! transfer still exists, is not paused, and the channel is usable, so
//! cancellation takes effect within one chunk's processing latency. A
//! per-transfer `streaming` flag makes loop entry idempotent: a resume
//! trigger and the original loop can never both drive the same offset.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{NodeConfig, MAX_CONSECUTIVE_SEND_ERRORS};
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::protocol::ControlMessage;
use crate::transport::{wait_for_buffer_space, DataChannelHandle};

use super::registry::{FileUpload, TransferRegistry, TransferStatus};
use super::{chunk_count, new_transfer_id, source_digest, ChunkSource};

/// Delay before retrying after a failed chunk send (transient SCTP hiccup).
const SEND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Drives outbound transfers against the shared registry.
pub struct UploadCoordinator {
    registry: Arc<TransferRegistry>,
    events: mpsc::UnboundedSender<NodeEvent>,
    chunk_size: usize,
    buffer_low: usize,
    buffer_max: usize,
}

impl UploadCoordinator {
    pub fn new(
        registry: Arc<TransferRegistry>,
        events: mpsc::UnboundedSender<NodeEvent>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            registry,
            events,
            chunk_size: config.chunk_size,
            buffer_low: config.buffer_low,
            buffer_max: config.buffer_max,
        }
    }

    /// Register a file for sending to `peer`. The whole-file digest is
    /// computed up front so it can be advertised in the offer before any
    /// chunk leaves.
    pub async fn prepare(
        &self,
        peer: &str,
        file_name: &str,
        source: Arc<dyn ChunkSource>,
    ) -> Result<String> {
        let id = new_transfer_id();
        let file_size = source.size();
        let file_hash = source_digest(&source, self.chunk_size).await?;
        let upload = FileUpload {
            id: id.clone(),
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            file_size,
            file_hash: Some(file_hash),
            total_chunks: chunk_count(file_size, self.chunk_size),
            next_chunk: 0,
            paused: false,
            streaming: false,
            offered: false,
            consecutive_errors: 0,
            source,
        };
        info!(
            event = "upload_prepared",
            peer = %peer,
            transfer_id = %id,
            size = file_size,
            chunks = upload.total_chunks,
            "File queued for sending"
        );
        self.registry.uploads.lock().await.insert(id.clone(), upload);
        Ok(id)
    }

    /// Emit a file-offer control message for every not-yet-offered transfer
    /// to `peer`, marking each `pending`. The hub sends the returned
    /// messages through the peer's transport session.
    pub async fn pending_offers(&self, peer: &str) -> Vec<ControlMessage> {
        let mut offers = Vec::new();
        let mut marked = Vec::new();
        {
            let mut uploads = self.registry.uploads.lock().await;
            for upload in uploads.values_mut() {
                if upload.peer == peer && !upload.offered {
                    upload.offered = true;
                    marked.push(upload.id.clone());
                    offers.push(ControlMessage::FileOffer {
                        file_id: upload.id.clone(),
                        file_name: upload.file_name.clone(),
                        file_size: upload.file_size,
                        file_hash: upload.file_hash.clone(),
                    });
                }
            }
        }
        for id in marked {
            self.registry.set_status(peer, &id, TransferStatus::Pending).await;
        }
        offers
    }

    /// The peer accepted: start streaming chunks.
    pub async fn handle_accept(
        &self,
        peer: &str,
        file_id: &str,
        channel: Arc<dyn DataChannelHandle>,
    ) {
        {
            let uploads = self.registry.uploads.lock().await;
            match uploads.get(file_id) {
                Some(upload) if upload.peer == peer => {}
                _ => {
                    warn!(
                        event = "accept_unknown_transfer",
                        peer = %peer,
                        transfer_id = %file_id,
                        "file-accept for a transfer we are not offering"
                    );
                    return;
                }
            }
        }
        self.registry
            .set_status(peer, file_id, TransferStatus::Accepted)
            .await;
        self.spawn_stream(file_id, channel);
    }

    /// The peer declined: drop the transfer and, once every outstanding
    /// offer everywhere has resolved, clear the upload bookkeeping.
    pub async fn handle_decline(&self, peer: &str, file_id: &str) {
        if self.registry.uploads.lock().await.remove(file_id).is_none() {
            return;
        }
        self.registry
            .set_status(peer, file_id, TransferStatus::Declined)
            .await;
        let _ = self.events.send(NodeEvent::TransferDeclined {
            peer: peer.to_string(),
            transfer_id: file_id.to_string(),
        });
        self.registry.clear_if_all_resolved().await;
    }

    /// The peer cancelled its download mid-flight: stop sending.
    pub async fn handle_cancel_download(&self, peer: &str, file_id: &str) {
        if self.registry.uploads.lock().await.remove(file_id).is_none() {
            return;
        }
        self.registry
            .set_status(peer, file_id, TransferStatus::Declined)
            .await;
        let _ = self.events.send(NodeEvent::TransferCancelled {
            peer: peer.to_string(),
            transfer_id: file_id.to_string(),
        });
        self.registry.clear_if_all_resolved().await;
    }

    /// Locally abort an upload. Returns the cancel notice for the hub to
    /// forward to the peer, or `None` if the transfer is already gone.
    pub async fn cancel(&self, file_id: &str) -> Option<ControlMessage> {
        let upload = self.registry.uploads.lock().await.remove(file_id)?;
        self.registry
            .set_status(&upload.peer, file_id, TransferStatus::Declined)
            .await;
        let _ = self.events.send(NodeEvent::TransferCancelled {
            peer: upload.peer,
            transfer_id: file_id.to_string(),
        });
        self.registry.clear_if_all_resolved().await;
        Some(ControlMessage::FileCancelUpload {
            file_id: file_id.to_string(),
        })
    }

    pub async fn pause(&self, file_id: &str) {
        if let Some(upload) = self.registry.uploads.lock().await.get_mut(file_id) {
            upload.paused = true;
        }
    }

    /// Clear the pause flag and restart the send loop (idempotent).
    pub async fn resume(&self, file_id: &str, channel: Arc<dyn DataChannelHandle>) {
        if let Some(upload) = self.registry.uploads.lock().await.get_mut(file_id) {
            upload.paused = false;
        } else {
            return;
        }
        self.spawn_stream(file_id, channel);
    }

    /// Restart streaming for every accepted, unpaused transfer to `peer`
    /// (called when the peer's channel opens or reopens).
    pub async fn resume_for_peer(&self, peer: &str, channel: Arc<dyn DataChannelHandle>) {
        let candidates: Vec<String> = {
            let uploads = self.registry.uploads.lock().await;
            uploads
                .values()
                .filter(|u| u.peer == peer && !u.paused && !u.streaming)
                .map(|u| u.id.clone())
                .collect()
        };
        for id in candidates {
            let accepted = {
                let statuses = self.registry.statuses.lock().await;
                statuses.get(&(peer.to_string(), id.clone()))
                    == Some(&TransferStatus::Accepted)
            };
            if accepted {
                self.spawn_stream(&id, channel.clone());
            }
        }
    }

    fn spawn_stream(&self, file_id: &str, channel: Arc<dyn DataChannelHandle>) {
        let registry = self.registry.clone();
        let events = self.events.clone();
        let file_id = file_id.to_string();
        let chunk_size = self.chunk_size;
        let low = self.buffer_low;
        let max = self.buffer_max;
        tokio::spawn(async move {
            run_stream(registry, events, file_id, channel, chunk_size, low, max).await;
        });
    }
}

/// What the per-iteration registry check decided.
enum StreamStep {
    Send {
        peer: String,
        index: u32,
        total: u32,
        source: Arc<dyn ChunkSource>,
    },
    Complete { peer: String },
    Stop,
}

async fn run_stream(
    registry: Arc<TransferRegistry>,
    events: mpsc::UnboundedSender<NodeEvent>,
    file_id: String,
    channel: Arc<dyn DataChannelHandle>,
    chunk_size: usize,
    low: usize,
    max: usize,
) {
    // Idempotent re-entry guard, taken and released under the uploads lock.
    {
        let mut uploads = registry.uploads.lock().await;
        match uploads.get_mut(&file_id) {
            Some(upload) if !upload.streaming && !upload.paused => upload.streaming = true,
            _ => return,
        }
    }

    loop {
        let step = {
            let mut uploads = registry.uploads.lock().await;
            match uploads.get_mut(&file_id) {
                None => StreamStep::Stop,
                Some(upload) if upload.paused => {
                    upload.streaming = false;
                    debug!(event = "upload_paused", transfer_id = %file_id);
                    StreamStep::Stop
                }
                Some(upload) if upload.next_chunk >= upload.total_chunks => {
                    StreamStep::Complete {
                        peer: upload.peer.clone(),
                    }
                }
                Some(upload) => StreamStep::Send {
                    peer: upload.peer.clone(),
                    index: upload.next_chunk,
                    total: upload.total_chunks,
                    source: upload.source.clone(),
                },
            }
        };

        let (peer, index, total, source) = match step {
            StreamStep::Stop => return,
            StreamStep::Complete { peer } => {
                finish_upload(&registry, &events, &file_id, &peer).await;
                return;
            }
            StreamStep::Send {
                peer,
                index,
                total,
                source,
            } => (peer, index, total, source),
        };

        if !channel.is_open() {
            // The reconnect path restarts streaming once the channel reopens.
            clear_streaming(&registry, &file_id).await;
            debug!(event = "upload_channel_closed", transfer_id = %file_id);
            return;
        }
        if wait_for_buffer_space(&channel, &peer, chunk_size, low, max)
            .await
            .is_err()
        {
            clear_streaming(&registry, &file_id).await;
            return;
        }

        let payload = match source.read_chunk(index, chunk_size).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    event = "chunk_read_failure",
                    transfer_id = %file_id,
                    chunk = index,
                    error = %e,
                    "Failed to read chunk from source"
                );
                abort_upload(&registry, &events, &file_id, &peer, &channel, e).await;
                return;
            }
        };

        let frame = Bytes::from(codec::encode_chunk(&file_id, index, total, &payload));
        match channel.send_binary(frame).await {
            Ok(()) => {
                let mut uploads = registry.uploads.lock().await;
                let Some(upload) = uploads.get_mut(&file_id) else {
                    return; // cancelled mid-send
                };
                upload.next_chunk = index + 1;
                upload.consecutive_errors = 0;
                debug!(
                    event = "chunk_sent",
                    transfer_id = %file_id,
                    chunk = index,
                    percent = upload.progress_percent(),
                );
                let _ = events.send(NodeEvent::UploadProgress {
                    peer: peer.clone(),
                    transfer_id: file_id.clone(),
                    sent_chunks: upload.next_chunk,
                    total_chunks: total,
                });
            }
            Err(e) => {
                let failures = {
                    let mut uploads = registry.uploads.lock().await;
                    match uploads.get_mut(&file_id) {
                        None => return,
                        Some(upload) => {
                            upload.consecutive_errors += 1;
                            upload.consecutive_errors
                        }
                    }
                };
                warn!(
                    event = "chunk_send_failure",
                    peer = %peer,
                    transfer_id = %file_id,
                    chunk = index,
                    failures,
                    error = %e,
                    "Chunk send failed"
                );
                if failures >= MAX_CONSECUTIVE_SEND_ERRORS {
                    let reason = Error::SendErrors {
                        transfer_id: file_id.clone(),
                        failures,
                    };
                    abort_upload(&registry, &events, &file_id, &peer, &channel, reason).await;
                    return;
                }
                tokio::time::sleep(SEND_RETRY_DELAY).await;
            }
        }
    }
}

async fn clear_streaming(registry: &TransferRegistry, file_id: &str) {
    if let Some(upload) = registry.uploads.lock().await.get_mut(file_id) {
        upload.streaming = false;
    }
}

async fn finish_upload(
    registry: &Arc<TransferRegistry>,
    events: &mpsc::UnboundedSender<NodeEvent>,
    file_id: &str,
    peer: &str,
) {
    registry.uploads.lock().await.remove(file_id);
    registry
        .set_status(peer, file_id, TransferStatus::Completed)
        .await;
    info!(
        event = "upload_complete",
        peer = %peer,
        transfer_id = %file_id,
        "All chunks handed to the transport"
    );
    let _ = events.send(NodeEvent::UploadComplete {
        peer: peer.to_string(),
        transfer_id: file_id.to_string(),
    });
    registry.clear_if_all_resolved().await;
}

/// The transfer cannot continue: cancel it, notify the peer, and surface
/// the reason to the application.
async fn abort_upload(
    registry: &Arc<TransferRegistry>,
    events: &mpsc::UnboundedSender<NodeEvent>,
    file_id: &str,
    peer: &str,
    channel: &Arc<dyn DataChannelHandle>,
    reason: Error,
) {
    registry.uploads.lock().await.remove(file_id);
    registry
        .set_status(peer, file_id, TransferStatus::Declined)
        .await;
    error!(
        event = "upload_aborted",
        peer = %peer,
        transfer_id = %file_id,
        error = %reason,
        "Transfer cancelled"
    );
    let _ = events.send(NodeEvent::Error {
        peer: Some(peer.to_string()),
        message: reason.to_string(),
    });
    let notice = ControlMessage::FileCancelUpload {
        file_id: file_id.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&notice) {
        let _ = channel.send_text(text).await;
    }
    let _ = events.send(NodeEvent::TransferCancelled {
        peer: peer.to_string(),
        transfer_id: file_id.to_string(),
    });
    registry.clear_if_all_resolved().await;
}
