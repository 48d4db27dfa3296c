//! Peer-connection negotiation: role arbitration, offer/answer exchange,
//! candidate queuing, collision resolution, reconnection with backoff.
//!
//! One [`PeerSession`] exists per remote identity at a time. The session is
//! owned exclusively by the [`Negotiator`], which is itself driven from a
//! single dispatch loop, so no per-session locking is needed: inbound
//! envelopes, connector events and timer ticks are serialized by the caller.
//!
//! The connector seam ([`PeerConnector`] / [`ConnectorFactory`]) keeps the
//! state machine free of any WebRTC types; the `rtc` module provides the
//! real implementation and tests drive the machine with fakes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{
    reconnect_delay, NodeConfig, CONNECTION_REQUEST_JITTER, CONNECTION_REQUEST_TIMEOUT,
    RESET_RETRY_DELAY,
};
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::signaling::{SequenceGate, SignalEnvelope, SignalKind, SignalingChannel};
use crate::transport::{DataChannelHandle, Inbound, TransportSession};

// ── Roles and states ─────────────────────────────────────────────────────────

/// Who sends the offer on a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Deterministic role arbitration: the lexicographically smaller identity is
/// always the caller. Pure function of the two identities, so both sides
/// agree without a negotiation round.
pub fn negotiation_role(local: &str, remote: &str) -> Role {
    if local < remote {
        Role::Caller
    } else {
        Role::Callee
    }
}

/// Per-peer connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// This round is underway but no description exists yet: either a
    /// connector has been claimed, or the designated callee has sent a
    /// connection-request and is waiting for the caller's offer.
    Locked,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Reconnecting,
    Closed,
}

// ── Connector seam ───────────────────────────────────────────────────────────

/// Events surfaced by a connector. Fed into a channel keyed by peer identity
/// and consumed by the hub's dispatch loop, never by ad-hoc callbacks.
pub enum ConnectorEvent {
    /// A local ICE candidate was discovered; the payload is an opaque
    /// serialized candidate to forward through signaling.
    LocalCandidate(String),
    /// A data channel exists for this connection (not yet open).
    ChannelAttached(Arc<dyn DataChannelHandle>),
    ChannelOpen,
    ChannelClosed,
    /// The underlying peer connection reached its connected state.
    Connected,
    /// ICE or connection failure; routes to the reconnect path.
    Failed,
    Text(String),
    Binary(Bytes),
}

impl fmt::Debug for ConnectorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalCandidate(_) => "LocalCandidate",
            Self::ChannelAttached(_) => "ChannelAttached",
            Self::ChannelOpen => "ChannelOpen",
            Self::ChannelClosed => "ChannelClosed",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
            Self::Text(_) => "Text",
            Self::Binary(_) => "Binary",
        };
        f.write_str(name)
    }
}

/// One underlying peer connection. Closed and replaced, never reused, when a
/// negotiation round is aborted or reset.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create and set the local offer; returns the SDP to signal.
    async fn create_offer(&self) -> Result<String>;
    /// Apply a remote offer and produce a local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;
    /// Apply the remote answer to our outstanding offer.
    async fn apply_answer(&self, sdp: &str) -> Result<()>;
    /// Apply a remote ICE candidate.
    async fn add_candidate(&self, candidate: &str) -> Result<()>;
    async fn close(&self);
}

/// Creates connectors. `role` tells the factory whether this side will send
/// the offer (and must therefore create the data channel up front).
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(
        &self,
        local: &str,
        peer: &str,
        role: Role,
        events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
    ) -> Result<Arc<dyn PeerConnector>>;
}

// ── Timers ───────────────────────────────────────────────────────────────────

/// Deferred actions delivered back into the dispatch loop. Each carries the
/// session epoch it was scheduled in; a session reset bumps the epoch so
/// stale timers are ignored instead of re-driving a dead round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The connection-request wait elapsed without an inbound offer.
    OfferWaitExpired { peer: String, epoch: u64 },
    /// A scheduled reconnect attempt is due.
    Retry { peer: String, epoch: u64 },
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Everything the state machine tracks for one remote participant.
pub struct PeerSession {
    state: ConnectionState,
    /// Bumped on every reset/reconnect so stale timers can be detected.
    epoch: u64,
    gate: SequenceGate,
    connector: Option<Arc<dyn PeerConnector>>,
    transport: TransportSession,
    /// Candidates that arrived before the remote description; flushed exactly
    /// once when it lands, never discarded.
    pending_candidates: Vec<String>,
    remote_description_set: bool,
    reconnect_attempts: u32,
    /// Local candidates discovered so far, kept for diagnostics.
    candidate_log: Vec<String>,
}

impl PeerSession {
    fn new(peer: &str, low: usize, max: usize) -> Self {
        Self {
            state: ConnectionState::Idle,
            epoch: 0,
            gate: SequenceGate::default(),
            connector: None,
            transport: TransportSession::new(peer, low, max),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            reconnect_attempts: 0,
            candidate_log: Vec::new(),
        }
    }
}

/// What a dispatched input produced, for the hub to act on.
#[derive(Debug)]
pub enum SessionOutput {
    /// The data channel opened and the queue drained; transfers may resume.
    Opened,
    /// An application payload arrived on the data channel.
    Inbound(Inbound),
    /// Reconnect attempts exhausted; the session is gone and a terminal
    /// failure was emitted.
    Failed { attempts: u32 },
}

// ── Negotiator ───────────────────────────────────────────────────────────────

/// Drives every peer session. All methods are called from one dispatch loop.
pub struct Negotiator {
    local: String,
    config: NodeConfig,
    factory: Arc<dyn ConnectorFactory>,
    signaling: Arc<dyn SignalingChannel>,
    connector_events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    events: mpsc::UnboundedSender<NodeEvent>,
    sessions: HashMap<String, PeerSession>,
}

impl Negotiator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: impl Into<String>,
        config: NodeConfig,
        factory: Arc<dyn ConnectorFactory>,
        signaling: Arc<dyn SignalingChannel>,
        connector_events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
        timers: mpsc::UnboundedSender<TimerEvent>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            local: local.into(),
            config,
            factory,
            signaling,
            connector_events,
            timers,
            events,
            sessions: HashMap::new(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn state(&self, peer: &str) -> Option<ConnectionState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.state(peer) == Some(ConnectionState::Stable)
    }

    pub fn channel(&self, peer: &str) -> Option<Arc<dyn DataChannelHandle>> {
        self.sessions.get(peer).and_then(|s| s.transport.channel())
    }

    pub fn transport_mut(&mut self, peer: &str) -> Option<&mut TransportSession> {
        self.sessions.get_mut(peer).map(|s| &mut s.transport)
    }

    pub fn peers(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    fn ensure_session(&mut self, peer: &str) {
        if !self.sessions.contains_key(peer) {
            self.sessions.insert(
                peer.to_string(),
                PeerSession::new(peer, self.config.buffer_low, self.config.buffer_max),
            );
        }
    }

    // ── Public operations ────────────────────────────────────────────────

    /// Begin negotiating with `peer`. The rightful caller sends an offer
    /// immediately; the rightful callee requests one and arms a fallback
    /// timer so a missing caller cannot deadlock the pair.
    pub async fn connect(&mut self, peer: &str) -> Option<SessionOutput> {
        if peer == self.local {
            warn!(event = "self_connect_rejected", peer = %peer);
            return None;
        }
        if self.sessions.contains_key(peer) {
            debug!(event = "connect_already_in_progress", peer = %peer);
            return None;
        }
        self.ensure_session(peer);
        self.initiate(peer).await
    }

    /// Tear down the session with `peer` and forget it.
    pub async fn disconnect(&mut self, peer: &str) {
        if let Some(mut session) = self.sessions.remove(peer) {
            session.state = ConnectionState::Closed;
            session.transport.reset();
            if let Some(connector) = session.connector.take() {
                connector.close().await;
            }
            info!(event = "peer_closed", peer = %peer, "Session closed");
        }
    }

    /// Dispatch one inbound signaling envelope.
    pub async fn handle_envelope(&mut self, envelope: SignalEnvelope) -> Option<SessionOutput> {
        if envelope.to != self.local {
            warn!(
                event = "envelope_misrouted",
                from = %envelope.from,
                to = %envelope.to,
                "Dropping envelope addressed to another participant"
            );
            return None;
        }
        let peer = envelope.from.clone();
        self.ensure_session(&peer);

        let accepted = self
            .sessions
            .get_mut(&peer)
            .is_some_and(|s| s.gate.accept(envelope.sequence));
        if !accepted {
            debug!(
                event = "envelope_stale",
                peer = %peer,
                sequence = ?envelope.sequence,
                kind = ?envelope.kind,
                "Dropping stale or duplicate envelope"
            );
            return None;
        }

        match envelope.kind {
            SignalKind::Offer => self.handle_offer(&peer, envelope.data).await,
            SignalKind::Answer => self.handle_answer(&peer, envelope.data).await,
            SignalKind::Candidate => self.handle_candidate(&peer, envelope.data).await,
            SignalKind::ConnectionRequest => self.handle_connection_request(&peer).await,
        }
    }

    /// Dispatch one connector event for `peer`.
    pub async fn handle_connector_event(
        &mut self,
        peer: &str,
        event: ConnectorEvent,
    ) -> Option<SessionOutput> {
        if !self.sessions.contains_key(peer) {
            debug!(event = "connector_event_orphaned", peer = %peer, kind = ?event);
            return None;
        }
        match event {
            ConnectorEvent::LocalCandidate(candidate) => {
                let sequence = self.sessions.get_mut(peer).map(|s| {
                    s.candidate_log.push(candidate.clone());
                    s.gate.next()
                });
                if let Err(e) = self
                    .send_signal(peer, SignalKind::Candidate, Some(candidate), sequence)
                    .await
                {
                    warn!(event = "candidate_signal_failure", peer = %peer, error = %e);
                }
                None
            }
            ConnectorEvent::ChannelAttached(handle) => {
                self.sessions.get_mut(peer)?.transport.attach(handle);
                None
            }
            ConnectorEvent::ChannelOpen => {
                {
                    let session = self.sessions.get_mut(peer)?;
                    session.state = ConnectionState::Stable;
                    session.reconnect_attempts = 0;
                    if let Err(e) = session.transport.mark_open().await {
                        warn!(event = "queue_drain_failure", peer = %peer, error = %e);
                    }
                }
                info!(event = "peer_connected", peer = %peer, "Data channel open");
                let _ = self.events.send(NodeEvent::PeerConnected {
                    peer: peer.to_string(),
                });
                Some(SessionOutput::Opened)
            }
            ConnectorEvent::Connected => {
                debug!(event = "transport_connected", peer = %peer);
                None
            }
            ConnectorEvent::ChannelClosed | ConnectorEvent::Failed => {
                self.handle_connection_loss(peer).await
            }
            ConnectorEvent::Text(text) => {
                let demuxed = self.sessions.get(peer)?.transport.demux_text(&text);
                self.demuxed_or_drop(peer, demuxed)
            }
            ConnectorEvent::Binary(data) => {
                let demuxed = self.sessions.get(peer)?.transport.demux_binary(&data);
                self.demuxed_or_drop(peer, demuxed)
            }
        }
    }

    /// Malformed application payloads are logged and dropped; they never
    /// reach the transfer engine.
    fn demuxed_or_drop(&self, peer: &str, demuxed: Result<Inbound>) -> Option<SessionOutput> {
        match demuxed {
            Ok(inbound) => Some(SessionOutput::Inbound(inbound)),
            Err(e) => {
                warn!(event = "demux_failure", peer = %peer, error = %e);
                None
            }
        }
    }

    /// Dispatch one due timer.
    pub async fn handle_tick(&mut self, timer: TimerEvent) -> Option<SessionOutput> {
        match timer {
            TimerEvent::Retry { peer, epoch } => {
                let due = self
                    .sessions
                    .get(&peer)
                    .is_some_and(|s| s.epoch == epoch && s.state == ConnectionState::Reconnecting);
                if !due {
                    debug!(event = "retry_timer_stale", peer = %peer, epoch);
                    return None;
                }
                info!(event = "reconnect_attempt", peer = %peer, "Retrying connection");
                self.initiate(&peer).await
            }
            TimerEvent::OfferWaitExpired { peer, epoch } => {
                let due = self.sessions.get(&peer).is_some_and(|s| {
                    s.epoch == epoch
                        && s.state == ConnectionState::Locked
                        && !s.remote_description_set
                });
                if !due {
                    debug!(event = "offer_wait_timer_stale", peer = %peer, epoch);
                    return None;
                }
                // The rightful caller never showed up. Force our own offer
                // rather than deadlock.
                warn!(
                    event = "offer_wait_timeout",
                    peer = %peer,
                    "No offer arrived after connection-request, forcing own offer"
                );
                if let Err(e) = self.start_offer(&peer).await {
                    warn!(event = "forced_offer_failure", peer = %peer, error = %e);
                    return self.reset_session(&peer).await;
                }
                None
            }
        }
    }

    // ── Envelope handlers ────────────────────────────────────────────────

    async fn handle_offer(&mut self, peer: &str, data: Option<String>) -> Option<SessionOutput> {
        let Some(sdp) = data else {
            warn!(event = "offer_missing_sdp", peer = %peer, "Dropping offer without SDP");
            return None;
        };
        // Collision: both sides have an outstanding offer. Role arbitration
        // settles it without another round trip.
        let colliding = self
            .sessions
            .get(peer)
            .is_some_and(|s| s.state == ConnectionState::HaveLocalOffer);
        if colliding {
            if negotiation_role(&self.local, peer) == Role::Caller {
                info!(
                    event = "offer_collision_ignored",
                    peer = %peer,
                    "Both sides offered; we are the rightful caller, ours proceeds"
                );
                return None;
            }
            info!(
                event = "offer_collision_yielded",
                peer = %peer,
                "Both sides offered; we are the rightful callee, aborting ours"
            );
        }
        if let Err(e) = self.accept_inbound_offer(peer, &sdp).await {
            warn!(event = "offer_accept_failure", peer = %peer, error = %e);
            return self.reset_session(peer).await;
        }
        None
    }

    async fn handle_answer(&mut self, peer: &str, data: Option<String>) -> Option<SessionOutput> {
        let state = self.sessions.get(peer)?.state;
        if state != ConnectionState::HaveLocalOffer {
            // Signaling-state mismatch. Partial negotiation state is not
            // worth salvaging; reset and start fresh.
            warn!(
                event = "answer_state_mismatch",
                peer = %peer,
                state = ?state,
                "Answer received without an outstanding local offer"
            );
            return self.reset_session(peer).await;
        }
        let Some(sdp) = data else {
            warn!(event = "answer_missing_sdp", peer = %peer, "Dropping answer without SDP");
            return None;
        };
        let connector = self.sessions.get(peer).and_then(|s| s.connector.clone())?;
        if let Err(e) = connector.apply_answer(&sdp).await {
            warn!(event = "answer_apply_failure", peer = %peer, error = %e);
            return self.reset_session(peer).await;
        }
        self.flush_candidates(peer, &connector).await;
        None
    }

    async fn handle_candidate(&mut self, peer: &str, data: Option<String>) -> Option<SessionOutput> {
        let Some(candidate) = data else {
            warn!(event = "candidate_missing_data", peer = %peer);
            return None;
        };
        let ready = self
            .sessions
            .get(peer)
            .is_some_and(|s| s.remote_description_set);
        if ready {
            if let Some(connector) = self.sessions.get(peer).and_then(|s| s.connector.clone()) {
                if let Err(e) = connector.add_candidate(&candidate).await {
                    // Individual candidates may legitimately fail; others
                    // can still complete connectivity.
                    warn!(event = "candidate_rejected", peer = %peer, error = %e);
                }
            }
        } else {
            debug!(event = "candidate_queued", peer = %peer, "No remote description yet");
            if let Some(session) = self.sessions.get_mut(peer) {
                session.pending_candidates.push(candidate);
            }
        }
        None
    }

    async fn handle_connection_request(&mut self, peer: &str) -> Option<SessionOutput> {
        if negotiation_role(&self.local, peer) != Role::Caller {
            debug!(
                event = "connection_request_ignored",
                peer = %peer,
                "We are the designated callee; waiting for their offer"
            );
            return None;
        }
        let state = self.sessions.get(peer)?.state;
        if matches!(
            state,
            ConnectionState::HaveLocalOffer | ConnectionState::Stable
        ) {
            debug!(event = "connection_request_redundant", peer = %peer, state = ?state);
            return None;
        }
        if let Err(e) = self.start_offer(peer).await {
            warn!(event = "requested_offer_failure", peer = %peer, error = %e);
            return self.reset_session(peer).await;
        }
        None
    }

    // ── Negotiation steps ────────────────────────────────────────────────

    /// Role-appropriate first move for a (re)connection round.
    async fn initiate(&mut self, peer: &str) -> Option<SessionOutput> {
        let result = match negotiation_role(&self.local, peer) {
            Role::Caller => self.start_offer(peer).await,
            Role::Callee => self.request_offer(peer).await,
        };
        if let Err(e) = result {
            warn!(event = "initiate_failure", peer = %peer, error = %e);
            return self.reset_session(peer).await;
        }
        None
    }

    /// Claim a fresh connector, create a local offer and signal it.
    async fn start_offer(&mut self, peer: &str) -> Result<()> {
        let old = self.sessions.get_mut(peer).and_then(|s| {
            s.state = ConnectionState::Locked;
            s.remote_description_set = false;
            s.pending_candidates.clear();
            s.connector.take()
        });
        if let Some(old) = old {
            old.close().await;
        }
        let connector = self
            .factory
            .connect(&self.local, peer, Role::Caller, self.connector_events.clone())
            .await?;
        let offer = connector.create_offer().await?;
        let sequence = {
            let session = self.sessions.get_mut(peer).ok_or_else(|| Error::Negotiation {
                peer: peer.to_string(),
                reason: "session disappeared during offer".into(),
            })?;
            session.connector = Some(connector);
            session.state = ConnectionState::HaveLocalOffer;
            session.gate.next()
        };
        info!(event = "offer_sent", peer = %peer, sequence, "Local offer signaled");
        self.send_signal(peer, SignalKind::Offer, Some(offer), Some(sequence))
            .await
    }

    /// Designated callee: ask the caller to offer, then arm the fallback
    /// timer with random jitter so two simultaneous requesters do not also
    /// time out simultaneously.
    async fn request_offer(&mut self, peer: &str) -> Result<()> {
        let (sequence, epoch) = {
            let session = self.sessions.get_mut(peer).ok_or_else(|| Error::Negotiation {
                peer: peer.to_string(),
                reason: "session disappeared during connection request".into(),
            })?;
            session.state = ConnectionState::Locked;
            (session.gate.next(), session.epoch)
        };
        info!(event = "connection_requested", peer = %peer, "Asking the caller to offer");
        self.send_signal(peer, SignalKind::ConnectionRequest, None, Some(sequence))
            .await?;

        let jitter_ms = rand::thread_rng().gen_range(0..=CONNECTION_REQUEST_JITTER.as_millis() as u64);
        let wait = CONNECTION_REQUEST_TIMEOUT + Duration::from_millis(jitter_ms);
        let timers = self.timers.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = timers.send(TimerEvent::OfferWaitExpired { peer, epoch });
        });
        Ok(())
    }

    /// Apply a remote offer on a fresh connector and signal the answer back.
    /// Also the collision abort path: any outstanding local offer is closed
    /// first.
    async fn accept_inbound_offer(&mut self, peer: &str, sdp: &str) -> Result<()> {
        let old = self.sessions.get_mut(peer).and_then(|s| {
            s.state = ConnectionState::Locked;
            s.remote_description_set = false;
            s.connector.take()
        });
        if let Some(old) = old {
            old.close().await;
        }
        let connector = self
            .factory
            .connect(&self.local, peer, Role::Callee, self.connector_events.clone())
            .await?;
        let answer = connector.accept_offer(sdp).await?;
        let sequence = {
            let session = self.sessions.get_mut(peer).ok_or_else(|| Error::Negotiation {
                peer: peer.to_string(),
                reason: "session disappeared during answer".into(),
            })?;
            session.connector = Some(connector.clone());
            session.remote_description_set = true;
            session.state = ConnectionState::HaveRemoteOffer;
            session.gate.next()
        };
        self.flush_candidates(peer, &connector).await;
        info!(event = "answer_sent", peer = %peer, sequence, "Remote offer accepted");
        self.send_signal(peer, SignalKind::Answer, Some(answer), Some(sequence))
            .await
    }

    /// Apply candidates queued before the remote description, exactly once.
    async fn flush_candidates(&mut self, peer: &str, connector: &Arc<dyn PeerConnector>) {
        let queued = {
            let Some(session) = self.sessions.get_mut(peer) else {
                return;
            };
            session.remote_description_set = true;
            std::mem::take(&mut session.pending_candidates)
        };
        if queued.is_empty() {
            return;
        }
        debug!(event = "candidates_flushed", peer = %peer, count = queued.len());
        for candidate in queued {
            if let Err(e) = connector.add_candidate(&candidate).await {
                warn!(event = "candidate_rejected", peer = %peer, error = %e);
            }
        }
    }

    // ── Failure paths ────────────────────────────────────────────────────

    /// The channel closed or the connection failed while established or
    /// negotiating: surface the disconnect and schedule a retry.
    async fn handle_connection_loss(&mut self, peer: &str) -> Option<SessionOutput> {
        let state = self.sessions.get(peer)?.state;
        if matches!(state, ConnectionState::Closed | ConnectionState::Reconnecting) {
            return None;
        }
        let old = self.sessions.get_mut(peer).and_then(|s| {
            s.transport.mark_closed();
            s.connector.take()
        });
        if let Some(old) = old {
            old.close().await;
        }
        warn!(event = "peer_disconnected", peer = %peer, "Connection lost");
        let _ = self.events.send(NodeEvent::PeerDisconnected {
            peer: peer.to_string(),
        });
        self.schedule_reconnect(peer, None).await
    }

    /// Single reset path: force-close, then schedule a fresh attempt after a
    /// fixed delay. Partial negotiation state is never reused.
    async fn reset_session(&mut self, peer: &str) -> Option<SessionOutput> {
        let old = self.sessions.get_mut(peer).and_then(|s| {
            s.transport.mark_closed();
            s.remote_description_set = false;
            s.pending_candidates.clear();
            s.connector.take()
        });
        if let Some(old) = old {
            old.close().await;
        }
        self.schedule_reconnect(peer, Some(RESET_RETRY_DELAY)).await
    }

    /// Count an attempt and either arm the retry timer or, past the bound,
    /// tear the session down for good.
    async fn schedule_reconnect(
        &mut self,
        peer: &str,
        delay: Option<Duration>,
    ) -> Option<SessionOutput> {
        let (attempts, epoch) = {
            let session = self.sessions.get_mut(peer)?;
            session.reconnect_attempts += 1;
            session.epoch += 1;
            (session.reconnect_attempts, session.epoch)
        };
        if attempts > self.config.reconnect_max_attempts {
            return self.teardown_failed(peer).await;
        }
        let delay = delay.unwrap_or_else(|| reconnect_delay(attempts));
        {
            let session = self.sessions.get_mut(peer)?;
            session.state = ConnectionState::Reconnecting;
        }
        info!(
            event = "reconnect_scheduled",
            peer = %peer,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect attempt scheduled"
        );
        let timers = self.timers.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(TimerEvent::Retry { peer, epoch });
        });
        None
    }

    /// Terminal: forget the session and report the failure exactly once.
    async fn teardown_failed(&mut self, peer: &str) -> Option<SessionOutput> {
        let mut session = self.sessions.remove(peer)?;
        session.transport.reset();
        if let Some(connector) = session.connector.take() {
            connector.close().await;
        }
        let attempts = session.reconnect_attempts.saturating_sub(1);
        error!(
            event = "peer_failed",
            peer = %peer,
            attempts,
            candidates_seen = session.candidate_log.len(),
            "Reconnect attempts exhausted, abandoning peer"
        );
        let _ = self.events.send(NodeEvent::PeerFailed {
            peer: peer.to_string(),
            attempts,
        });
        Some(SessionOutput::Failed { attempts })
    }

    async fn send_signal(
        &self,
        to: &str,
        kind: SignalKind,
        data: Option<String>,
        sequence: Option<u64>,
    ) -> Result<()> {
        self.signaling
            .send(SignalEnvelope {
                kind,
                data,
                from: self.local.clone(),
                to: to.to_string(),
                sequence,
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RECONNECT_MAX_DELAY;
    use crate::transport::tests::FakeChannel;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    pub(crate) struct FakeConnector {
        pub offers_created: Mutex<u32>,
        pub accepted_offers: Mutex<Vec<String>>,
        pub applied_answers: Mutex<Vec<String>>,
        pub candidates: Mutex<Vec<String>>,
        pub closed: AtomicBool,
    }

    impl FakeConnector {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                offers_created: Mutex::new(0),
                accepted_offers: Mutex::new(Vec::new()),
                applied_answers: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn create_offer(&self) -> Result<String> {
            *self.offers_created.lock().await += 1;
            Ok("offer-sdp".into())
        }

        async fn accept_offer(&self, sdp: &str) -> Result<String> {
            self.accepted_offers.lock().await.push(sdp.to_string());
            Ok("answer-sdp".into())
        }

        async fn apply_answer(&self, sdp: &str) -> Result<()> {
            self.applied_answers.lock().await.push(sdp.to_string());
            Ok(())
        }

        async fn add_candidate(&self, candidate: &str) -> Result<()> {
            self.candidates.lock().await.push(candidate.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeFactory {
        pub made: Mutex<Vec<(Role, Arc<FakeConnector>)>>,
    }

    impl FakeFactory {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                made: Mutex::new(Vec::new()),
            })
        }

        pub(crate) async fn connector(&self, index: usize) -> Arc<FakeConnector> {
            self.made.lock().await[index].1.clone()
        }
    }

    #[async_trait]
    impl ConnectorFactory for FakeFactory {
        async fn connect(
            &self,
            _local: &str,
            _peer: &str,
            role: Role,
            _events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
        ) -> Result<Arc<dyn PeerConnector>> {
            let connector = FakeConnector::new();
            self.made.lock().await.push((role, connector.clone()));
            Ok(connector)
        }
    }

    pub(crate) struct FakeSignaling {
        pub sent: Mutex<Vec<SignalEnvelope>>,
    }

    impl FakeSignaling {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        pub(crate) async fn kinds(&self) -> Vec<SignalKind> {
            self.sent.lock().await.iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl SignalingChannel for FakeSignaling {
        async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
            self.sent.lock().await.push(envelope);
            Ok(())
        }
    }

    struct Harness {
        negotiator: Negotiator,
        factory: Arc<FakeFactory>,
        signaling: Arc<FakeSignaling>,
        timers_rx: mpsc::UnboundedReceiver<TimerEvent>,
        events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    }

    fn harness(local: &str) -> Harness {
        let factory = FakeFactory::new();
        let signaling = FakeSignaling::new();
        let (connector_tx, _connector_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            local,
            NodeConfig::default(),
            factory.clone(),
            signaling.clone(),
            connector_tx,
            timers_tx,
            events_tx,
        );
        Harness {
            negotiator,
            factory,
            signaling,
            timers_rx,
            events_rx,
        }
    }

    fn envelope(kind: SignalKind, data: Option<&str>, from: &str, to: &str, seq: u64) -> SignalEnvelope {
        SignalEnvelope {
            kind,
            data: data.map(str::to_string),
            from: from.into(),
            to: to.into(),
            sequence: Some(seq),
        }
    }

    #[test]
    fn role_arbitration_is_pure_and_symmetric() {
        assert_eq!(negotiation_role("Alice", "Bob"), Role::Caller);
        assert_eq!(negotiation_role("Bob", "Alice"), Role::Callee);
        assert_eq!(negotiation_role("alice", "Bob"), Role::Callee, "byte order, not case-insensitive");
    }

    #[tokio::test]
    async fn caller_offers_immediately() {
        let mut h = harness("Alice");
        h.negotiator.connect("Bob").await;

        let sent = h.signaling.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SignalKind::Offer);
        assert_eq!(sent[0].data.as_deref(), Some("offer-sdp"));
        assert_eq!(sent[0].sequence, Some(1));
        drop(sent);
        assert_eq!(h.negotiator.state("Bob"), Some(ConnectionState::HaveLocalOffer));
        assert_eq!(h.factory.made.lock().await[0].0, Role::Caller);
    }

    #[tokio::test]
    async fn callee_requests_an_offer_instead_of_sending_one() {
        let mut h = harness("Bob");
        h.negotiator.connect("Alice").await;

        assert_eq!(h.signaling.kinds().await, vec![SignalKind::ConnectionRequest]);
        assert!(h.factory.made.lock().await.is_empty());
        // The round is claimed while the offer wait is in flight.
        assert_eq!(h.negotiator.state("Alice"), Some(ConnectionState::Locked));
    }

    #[tokio::test]
    async fn inbound_offer_is_answered() {
        let mut h = harness("Bob");
        let env = envelope(SignalKind::Offer, Some("their-offer"), "Alice", "Bob", 1);
        h.negotiator.handle_envelope(env).await;

        assert_eq!(h.signaling.kinds().await, vec![SignalKind::Answer]);
        let connector = h.factory.connector(0).await;
        assert_eq!(*connector.accepted_offers.lock().await, vec!["their-offer"]);
        assert_eq!(h.negotiator.state("Alice"), Some(ConnectionState::HaveRemoteOffer));
    }

    #[tokio::test]
    async fn early_candidates_apply_exactly_once_after_remote_description() {
        let mut h = harness("Bob");
        h.negotiator
            .handle_envelope(envelope(SignalKind::Candidate, Some("cand-1"), "Alice", "Bob", 1))
            .await;
        h.negotiator
            .handle_envelope(envelope(SignalKind::Candidate, Some("cand-2"), "Alice", "Bob", 2))
            .await;
        // No connector exists yet, nothing applied, nothing dropped.
        assert!(h.factory.made.lock().await.is_empty());

        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("their-offer"), "Alice", "Bob", 3))
            .await;
        let connector = h.factory.connector(0).await;
        assert_eq!(*connector.candidates.lock().await, vec!["cand-1", "cand-2"]);

        // Late candidate goes straight through.
        h.negotiator
            .handle_envelope(envelope(SignalKind::Candidate, Some("cand-3"), "Alice", "Bob", 4))
            .await;
        assert_eq!(
            *connector.candidates.lock().await,
            vec!["cand-1", "cand-2", "cand-3"]
        );
    }

    #[tokio::test]
    async fn stale_sequence_numbers_are_dropped() {
        let mut h = harness("Bob");
        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("first"), "Alice", "Bob", 5))
            .await;
        // Replay with an older sequence: ignored outright.
        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("replay"), "Alice", "Bob", 5))
            .await;
        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("older"), "Alice", "Bob", 3))
            .await;

        assert_eq!(h.factory.made.lock().await.len(), 1);
        let connector = h.factory.connector(0).await;
        assert_eq!(*connector.accepted_offers.lock().await, vec!["first"]);
    }

    #[tokio::test]
    async fn rightful_caller_ignores_colliding_offer() {
        let mut h = harness("Alice");
        h.negotiator.connect("Bob").await;
        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("their-offer"), "Bob", "Alice", 1))
            .await;

        // Our offer proceeds: no answer sent, our connector untouched.
        assert_eq!(h.signaling.kinds().await, vec![SignalKind::Offer]);
        let connector = h.factory.connector(0).await;
        assert!(!connector.closed.load(Ordering::SeqCst));
        assert_eq!(h.negotiator.state("Bob"), Some(ConnectionState::HaveLocalOffer));
    }

    #[tokio::test(start_paused = true)]
    async fn rightful_callee_yields_colliding_offer() {
        let mut h = harness("Bob");
        h.negotiator.connect("Alice").await;
        // Force our own offer via the fallback timer, creating the collision.
        tokio::time::advance(CONNECTION_REQUEST_TIMEOUT + CONNECTION_REQUEST_JITTER).await;
        let timer = h.timers_rx.recv().await.unwrap();
        h.negotiator.handle_tick(timer).await;
        assert_eq!(h.negotiator.state("Alice"), Some(ConnectionState::HaveLocalOffer));

        h.negotiator
            .handle_envelope(envelope(SignalKind::Offer, Some("their-offer"), "Alice", "Bob", 1))
            .await;

        // Our forced offer was aborted and the inbound one answered.
        let ours = h.factory.connector(0).await;
        assert!(ours.closed.load(Ordering::SeqCst));
        let theirs = h.factory.connector(1).await;
        assert_eq!(*theirs.accepted_offers.lock().await, vec!["their-offer"]);
        assert_eq!(
            h.signaling.kinds().await,
            vec![SignalKind::ConnectionRequest, SignalKind::Offer, SignalKind::Answer]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn callee_forces_offer_when_none_arrives() {
        let mut h = harness("Bob");
        h.negotiator.connect("Alice").await;
        assert_eq!(h.signaling.kinds().await, vec![SignalKind::ConnectionRequest]);

        tokio::time::advance(CONNECTION_REQUEST_TIMEOUT + CONNECTION_REQUEST_JITTER).await;
        let timer = h.timers_rx.recv().await.unwrap();
        assert!(matches!(timer, TimerEvent::OfferWaitExpired { .. }));
        h.negotiator.handle_tick(timer).await;

        assert_eq!(
            h.signaling.kinds().await,
            vec![SignalKind::ConnectionRequest, SignalKind::Offer]
        );
        assert_eq!(h.factory.made.lock().await[0].0, Role::Caller);
    }

    #[tokio::test]
    async fn connection_request_makes_the_caller_offer() {
        let mut h = harness("Alice");
        h.negotiator
            .handle_envelope(envelope(SignalKind::ConnectionRequest, None, "Bob", "Alice", 1))
            .await;
        assert_eq!(h.signaling.kinds().await, vec![SignalKind::Offer]);
    }

    #[tokio::test]
    async fn answer_in_wrong_state_resets_the_session() {
        let mut h = harness("Alice");
        // A session with no outstanding offer.
        h.negotiator
            .handle_envelope(envelope(SignalKind::Candidate, Some("cand"), "Bob", "Alice", 1))
            .await;
        h.negotiator
            .handle_envelope(envelope(SignalKind::Answer, Some("bogus"), "Bob", "Alice", 2))
            .await;

        assert_eq!(h.negotiator.state("Bob"), Some(ConnectionState::Reconnecting));
    }

    #[tokio::test]
    async fn channel_open_drains_queue_and_reports_connected() {
        let mut h = harness("Alice");
        h.negotiator.connect("Bob").await;
        h.negotiator
            .transport_mut("Bob")
            .unwrap()
            .send_control(crate::protocol::ControlMessage::Message { text: "hi".into() })
            .await
            .unwrap();

        let channel = FakeChannel::new(true);
        h.negotiator
            .handle_connector_event("Bob", ConnectorEvent::ChannelAttached(channel.clone()))
            .await;
        let out = h
            .negotiator
            .handle_connector_event("Bob", ConnectorEvent::ChannelOpen)
            .await;

        assert!(matches!(out, Some(SessionOutput::Opened)));
        assert!(h.negotiator.is_connected("Bob"));
        assert_eq!(channel.sent_text.lock().await.len(), 1);
        assert!(matches!(
            h.events_rx.try_recv(),
            Ok(NodeEvent::PeerConnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_fails_exactly_once() {
        let mut h = harness("Alice");
        h.negotiator.connect("Bob").await;
        h.negotiator
            .handle_connector_event("Bob", ConnectorEvent::ChannelAttached(FakeChannel::new(true)))
            .await;
        h.negotiator
            .handle_connector_event("Bob", ConnectorEvent::ChannelOpen)
            .await;

        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds <= 10, "exhaustion never reached");
            let out = h
                .negotiator
                .handle_connector_event("Bob", ConnectorEvent::Failed)
                .await;
            if let Some(SessionOutput::Failed { attempts }) = out {
                assert_eq!(attempts, NodeConfig::default().reconnect_max_attempts);
                break;
            }
            tokio::time::advance(RECONNECT_MAX_DELAY).await;
            let timer = h.timers_rx.recv().await.unwrap();
            h.negotiator.handle_tick(timer).await;
        }

        assert!(h.negotiator.state("Bob").is_none(), "session torn down");
        // Further failure events for the dead session are inert.
        let out = h
            .negotiator
            .handle_connector_event("Bob", ConnectorEvent::Failed)
            .await;
        assert!(out.is_none());

        let mut failures = 0;
        while let Ok(event) = h.events_rx.try_recv() {
            if let NodeEvent::PeerFailed { attempts, .. } = event {
                failures += 1;
                assert_eq!(attempts, NodeConfig::default().reconnect_max_attempts);
            }
        }
        assert_eq!(failures, 1, "terminal failure emitted exactly once");
    }

    #[tokio::test]
    async fn disconnect_forgets_the_session() {
        let mut h = harness("Alice");
        h.negotiator.connect("Bob").await;
        h.negotiator.disconnect("Bob").await;

        assert!(h.negotiator.state("Bob").is_none());
        let connector = h.factory.connector(0).await;
        assert!(connector.closed.load(Ordering::SeqCst));
    }
}
