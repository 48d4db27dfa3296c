//! Signaling envelopes and the relay-channel seam.
//!
//! The relay is an opaque collaborator: it accepts a connection, tags each
//! peer with a name, and forwards envelopes between two named participants
//! in a room. Nothing here talks to a network; outbound envelopes go through
//! the injected [`SignalingChannel`], inbound envelopes are fed to the hub
//! by the embedding application.
//!
//! Envelopes carry a per-peer monotonically increasing `sequence`. Receivers
//! accept an envelope only if its sequence is strictly greater than the last
//! accepted one for that peer, making signaling idempotent to replays and
//! duplicates from an unreliable relay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Envelope discriminator, `type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    ConnectionRequest,
}

/// A signaling envelope, JSON over the relay's text channel.
///
/// `data` is opaque to the state machine: an SDP description for offers and
/// answers, a serialized ICE candidate for candidates, absent for
/// connection requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Thin duplex channel to the relay (outbound half). The relay must forward
/// envelopes opaquely; it never rewrites them.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;
}

/// Per-peer monotonic sequence acceptance.
///
/// Unsequenced envelopes (candidates from legacy peers) are always accepted;
/// sequenced ones must be strictly newer than the last accepted.
#[derive(Debug, Default)]
pub struct SequenceGate {
    last_accepted: Option<u64>,
    next_outbound: u64,
}

impl SequenceGate {
    /// Next sequence number to attach to an outbound envelope.
    pub fn next(&mut self) -> u64 {
        self.next_outbound += 1;
        self.next_outbound
    }

    /// Whether an inbound envelope passes the gate; accepting advances it.
    pub fn accept(&mut self, sequence: Option<u64>) -> bool {
        match sequence {
            None => true,
            Some(seq) => {
                if self.last_accepted.is_some_and(|last| seq <= last) {
                    false
                } else {
                    self.last_accepted = Some(seq);
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = SignalEnvelope {
            kind: SignalKind::ConnectionRequest,
            data: None,
            from: "Alice".into(),
            to: "Bob".into(),
            sequence: Some(4),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "connection-request");
        assert_eq!(json["from"], "Alice");
        assert_eq!(json["sequence"], 4);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn gate_rejects_stale_and_duplicate() {
        let mut gate = SequenceGate::default();
        assert!(gate.accept(Some(1)));
        assert!(gate.accept(Some(3)));
        assert!(!gate.accept(Some(3)), "duplicate");
        assert!(!gate.accept(Some(2)), "stale");
        assert!(gate.accept(Some(4)));
        assert!(gate.accept(None), "unsequenced always passes");
    }

    #[test]
    fn outbound_sequences_are_monotonic() {
        let mut gate = SequenceGate::default();
        let a = gate.next();
        let b = gate.next();
        assert!(b > a);
    }
}
