//! Peer-to-peer chat and file transfer over WebRTC data channels.
//!
//! A relay bootstraps the connection (signaling only); everything after that
//! flows directly between the two peers. The crate centers on two pieces:
//! the negotiation state machine (role arbitration, offer/answer, trickle
//! ICE, reconnection with bounded backoff) and the chunked transfer protocol
//! (self-describing CRC32 frames, whole-file SHA-256 verification,
//! backpressure-aware streaming).
//!
//! Embedding: construct a [`hub::PeerHub`] with an [`rtc::RtcConnectorFactory`]
//! and your relay's [`signaling::SignalingChannel`], feed inbound envelopes
//! through the returned [`hub::NodeHandle`], and react to [`event::NodeEvent`]s.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod negotiation;
pub mod protocol;
pub mod rtc;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use config::{AssemblyPolicy, NodeConfig};
pub use error::{Error, Result};
pub use event::NodeEvent;
pub use hub::{NodeHandle, PeerHub};
pub use rtc::RtcConnectorFactory;
pub use signaling::{SignalEnvelope, SignalKind, SignalingChannel};
