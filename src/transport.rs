//! Transport session: one peer's data channel, made reliable enough to use.
//!
//! The channel is unreliable-until-open: sends while `Connecting` or
//! `Closed` enqueue into a FIFO queue instead of failing, and the queue is
//! drained in order the instant the channel opens. Control messages travel
//! as JSON text, chunk frames as binary.
//!
//! Backpressure is cooperative: the channel exposes a buffered-byte counter,
//! and senders pause above [`max`](TransportSession) and resume below `low`.
//! Exceeding the ceiling is a signal to stop calling send, not an error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::codec::{self, ChunkFrame};
use crate::config::{BUFFER_DRAIN_TIMEOUT, BUFFER_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::protocol::ControlMessage;

/// Lifecycle of the attached data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel has been attached yet.
    Detached,
    Connecting,
    Open,
    Closed,
}

/// The open bidirectional byte-stream to a peer. Implemented by the `rtc`
/// adapter over a real WebRTC data channel and by fakes in tests.
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
    /// Bytes queued in the transport's send buffer, for flow control.
    async fn buffered_amount(&self) -> usize;
    fn is_open(&self) -> bool;
}

/// A pending outbound application message.
#[derive(Debug, Clone)]
pub enum OutboundItem {
    Control(ControlMessage),
    Chunk(Bytes),
}

/// An inbound payload after demultiplexing.
#[derive(Debug)]
pub enum Inbound {
    Control(ControlMessage),
    Chunk(ChunkFrame),
}

/// Per-peer send/receive surface over the data channel.
///
/// The handle is replaced, not mutated, when a session reconnects; the
/// outbound queue survives the swap. The queue is unbounded: it only grows
/// while a channel is connecting, and session teardown clears it.
pub struct TransportSession {
    peer: String,
    state: ChannelState,
    channel: Option<Arc<dyn DataChannelHandle>>,
    queue: VecDeque<OutboundItem>,
    low: usize,
    max: usize,
}

impl TransportSession {
    pub fn new(peer: impl Into<String>, low: usize, max: usize) -> Self {
        Self {
            peer: peer.into(),
            state: ChannelState::Detached,
            channel: None,
            queue: VecDeque::new(),
            low,
            max,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Low water mark (resume threshold) in bytes.
    pub fn buffer_low(&self) -> usize {
        self.low
    }

    /// High water mark (pause ceiling) in bytes.
    pub fn buffer_max(&self) -> usize {
        self.max
    }

    /// A clone of the live channel handle, for streaming tasks.
    pub fn channel(&self) -> Option<Arc<dyn DataChannelHandle>> {
        self.channel.clone()
    }

    /// Attach a (new) channel. Replaces any previous handle; queued messages
    /// are kept and drain once this channel opens.
    pub fn attach(&mut self, channel: Arc<dyn DataChannelHandle>) {
        self.channel = Some(channel);
        self.state = ChannelState::Connecting;
    }

    /// The channel reported open: drain the queue in submission order.
    pub async fn mark_open(&mut self) -> Result<()> {
        self.state = ChannelState::Open;
        if !self.queue.is_empty() {
            info!(
                event = "queue_drain",
                peer = %self.peer,
                pending = self.queue.len(),
                "Channel opened, draining queued messages"
            );
        }
        while let Some(item) = self.queue.pop_front() {
            if let Err(e) = self.send_now(&item).await {
                // Put it back so nothing is lost; the next open retries.
                warn!(event = "queue_drain_failure", peer = %self.peer, error = %e);
                self.queue.push_front(item);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
        self.channel = None;
    }

    /// Drop the channel and any queued messages (session teardown).
    pub fn reset(&mut self) {
        self.mark_closed();
        self.queue.clear();
    }

    async fn send_now(&self, item: &OutboundItem) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| Error::ChannelNotOpen {
            peer: self.peer.clone(),
        })?;
        match item {
            OutboundItem::Control(msg) => {
                let text = serde_json::to_string(msg)?;
                channel.send_text(text).await
            }
            OutboundItem::Chunk(data) => channel.send_binary(data.clone()).await,
        }
    }

    /// Send a control message, or enqueue it if the channel is not open.
    pub async fn send_control(&mut self, msg: ControlMessage) -> Result<()> {
        self.send_item(OutboundItem::Control(msg)).await
    }

    /// Send an encoded chunk frame, or enqueue it if the channel is not open.
    pub async fn send_chunk(&mut self, frame: Bytes) -> Result<()> {
        self.send_item(OutboundItem::Chunk(frame)).await
    }

    async fn send_item(&mut self, item: OutboundItem) -> Result<()> {
        if self.is_open() && self.channel.is_some() {
            self.send_now(&item).await
        } else {
            debug!(
                event = "send_queued",
                peer = %self.peer,
                state = ?self.state,
                queued = self.queue.len() + 1,
                "Channel not open, queueing outbound message"
            );
            self.queue.push_back(item);
            Ok(())
        }
    }

    // ── Inbound demultiplexing ───────────────────────────────────────────

    /// Demultiplex an inbound text payload into a control message.
    pub fn demux_text(&self, text: &str) -> Result<Inbound> {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(msg) => Ok(Inbound::Control(msg)),
            Err(e) => Err(Error::Protocol {
                peer: self.peer.clone(),
                reason: format!("unparseable control message: {e}"),
            }),
        }
    }

    /// Demultiplex an inbound binary payload into a chunk frame.
    ///
    /// A binary payload that does not decode as a frame is never attributed
    /// to any file.
    pub fn demux_binary(&self, data: &[u8]) -> Result<Inbound> {
        match codec::decode_chunk(data) {
            Some(frame) => Ok(Inbound::Chunk(frame)),
            None => Err(Error::Protocol {
                peer: self.peer.clone(),
                reason: format!("malformed {}-byte binary frame", data.len()),
            }),
        }
    }
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Poll until the channel's send buffer has room for `next_size` more bytes.
///
/// Fast path: buffered + next within `max`. Otherwise wait until the buffer
/// drains below `low` (hysteresis, so a sender hovering at the ceiling does
/// not thrash). Returns an error only if the channel closes while waiting;
/// a drain timeout proceeds anyway and lets the channel throttle.
pub async fn wait_for_buffer_space(
    channel: &Arc<dyn DataChannelHandle>,
    peer: &str,
    next_size: usize,
    low: usize,
    max: usize,
) -> Result<()> {
    if !channel.is_open() {
        return Err(Error::ChannelNotOpen { peer: peer.into() });
    }
    if channel.buffered_amount().await + next_size <= max {
        return Ok(());
    }

    debug!(
        event = "backpressure_pause",
        peer = %peer,
        next = next_size,
        high_watermark = max,
        "Send buffer above ceiling, pausing until it drains"
    );

    let deadline = Instant::now() + BUFFER_DRAIN_TIMEOUT;
    loop {
        if !channel.is_open() {
            return Err(Error::ChannelNotOpen { peer: peer.into() });
        }
        if channel.buffered_amount().await < low {
            debug!(event = "backpressure_resume", peer = %peer);
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(
                event = "buffer_drain_timeout",
                peer = %peer,
                "Buffer drain timeout, proceeding anyway"
            );
            return Ok(());
        }
        tokio::time::sleep(BUFFER_POLL_INTERVAL).await;
    }
}
