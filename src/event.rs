//! App-facing events.
//!
//! Everything the embedding application needs to react to (connection
//! lifecycle, chat, transfer progress and outcomes) arrives as a
//! [`NodeEvent`] on the hub's event channel. User-visible failures carry the
//! peer identity and transfer id; the underlying cause is logged where it
//! happened.

/// Events emitted by the hub to the application layer.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    // ── Connection lifecycle ─────────────────────────────────────────────
    /// Negotiation reached `Stable`; the data channel is usable.
    PeerConnected { peer: String },
    /// The connection dropped; reconnection is in progress.
    PeerDisconnected { peer: String },
    /// Terminal: reconnect attempts exhausted, the session is torn down.
    /// Emitted exactly once per session.
    PeerFailed { peer: String, attempts: u32 },

    // ── Chat ─────────────────────────────────────────────────────────────
    MessageReceived { peer: String, text: String },

    // ── Transfers (receiver) ─────────────────────────────────────────────
    /// A peer offered a file; accept or decline via the hub.
    FileOffered {
        peer: String,
        transfer_id: String,
        file_name: String,
        file_size: u64,
    },
    DownloadProgress {
        peer: String,
        transfer_id: String,
        received_chunks: u32,
        total_chunks: u32,
    },
    /// Assembly finished and (if advertised) the whole-file hash verified.
    /// `missing_chunks` is non-empty only under best-effort assembly.
    DownloadComplete {
        peer: String,
        transfer_id: String,
        file_name: String,
        data: Vec<u8>,
        missing_chunks: Vec<u32>,
    },

    // ── Transfers (sender) ───────────────────────────────────────────────
    UploadProgress {
        peer: String,
        transfer_id: String,
        sent_chunks: u32,
        total_chunks: u32,
    },
    UploadComplete { peer: String, transfer_id: String },
    /// The receiving peer declined the offer.
    TransferDeclined { peer: String, transfer_id: String },

    // ── Shared transfer outcomes ─────────────────────────────────────────
    TransferCancelled { peer: String, transfer_id: String },
    /// CRC or whole-file hash mismatch; recoverable, scoped to one transfer.
    IntegrityFailure {
        peer: String,
        transfer_id: String,
        reason: String,
    },

    /// Anything else worth surfacing, already translated to a presentable
    /// message.
    Error {
        peer: Option<String>,
        message: String,
    },
}
