//! Error taxonomy.
//!
//! Four classes, matching how failures are handled:
//! - transient network errors feed the bounded-backoff reconnection path,
//! - protocol violations are logged and dropped (possibly forcing a reset),
//! - data-integrity failures surface to the user as recoverable errors,
//! - terminal conditions (reconnect exhaustion, send-error runs) end the
//!   session or transfer they belong to.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient: the channel to this peer is not usable right now.
    #[error("peer {peer}: channel not open")]
    ChannelNotOpen { peer: String },

    /// Transient: SDP or ICE negotiation failed; routed to the reset path.
    #[error("peer {peer}: negotiation failed: {reason}")]
    Negotiation { peer: String, reason: String },

    /// Protocol violation: the envelope or frame was structurally invalid or
    /// arrived in a state where it cannot be applied.
    #[error("peer {peer}: protocol violation: {reason}")]
    Protocol { peer: String, reason: String },

    /// Data integrity: per-chunk CRC or whole-file hash mismatch.
    #[error("transfer {transfer_id}: integrity failure: {reason}")]
    Integrity {
        transfer_id: String,
        reason: String,
    },

    /// Terminal: reconnect attempts to this peer are exhausted.
    #[error("peer {peer}: abandoned after {attempts} reconnect attempts")]
    ReconnectExhausted { peer: String, attempts: u32 },

    /// Terminal: a transfer was cancelled after a run of send failures.
    #[error("transfer {transfer_id}: cancelled after {failures} consecutive send errors")]
    SendErrors {
        transfer_id: String,
        failures: u32,
    },

    /// The referenced transfer does not exist (completed, cancelled, or never
    /// offered).
    #[error("transfer {0}: unknown transfer id")]
    UnknownTransfer(String),

    #[error("signaling relay: {0}")]
    Signaling(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
