//! The hub: one dispatch loop driving every peer.
//!
//! Commands from the application, envelopes from the relay, connector events
//! and timer ticks all funnel into a single `select!` loop that owns the
//! negotiator and the transfer coordinators. Ordering and exclusivity are
//! explicit: nothing mutates session state except this loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::event::NodeEvent;
use crate::negotiation::{ConnectorEvent, ConnectorFactory, Negotiator, SessionOutput, TimerEvent};
use crate::protocol::ControlMessage;
use crate::signaling::{SignalEnvelope, SignalingChannel};
use crate::transfer::{
    ChunkSource, DownloadCoordinator, FileSource, TransferRegistry, UploadCoordinator,
};
use crate::transport::Inbound;

/// Application commands consumed by the hub loop.
pub enum Command {
    Connect { peer: String },
    Disconnect { peer: String },
    SendMessage { peer: String, text: String },
    OfferFile {
        peer: String,
        file_name: String,
        source: Arc<dyn ChunkSource>,
    },
    AcceptFile { file_id: String },
    DeclineFile { file_id: String },
    CancelUpload { file_id: String },
    CancelDownload { file_id: String },
    PauseUpload { file_id: String },
    ResumeUpload { file_id: String },
    /// An envelope forwarded from the relay.
    Signal { envelope: SignalEnvelope },
    Shutdown,
}

/// Cloneable handle for talking to a running hub.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Signaling("node loop has stopped".into()))
    }

    pub fn connect(&self, peer: &str) -> Result<()> {
        self.send(Command::Connect { peer: peer.into() })
    }

    pub fn disconnect(&self, peer: &str) -> Result<()> {
        self.send(Command::Disconnect { peer: peer.into() })
    }

    pub fn send_message(&self, peer: &str, text: &str) -> Result<()> {
        self.send(Command::SendMessage {
            peer: peer.into(),
            text: text.into(),
        })
    }

    pub fn offer_file(
        &self,
        peer: &str,
        file_name: &str,
        source: Arc<dyn ChunkSource>,
    ) -> Result<()> {
        self.send(Command::OfferFile {
            peer: peer.into(),
            file_name: file_name.into(),
            source,
        })
    }

    /// Convenience: offer a file straight from disk.
    pub async fn offer_path(&self, peer: &str, path: &std::path::Path) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        let source = Arc::new(FileSource::open(path).await?);
        self.offer_file(peer, &file_name, source)
    }

    pub fn accept_file(&self, file_id: &str) -> Result<()> {
        self.send(Command::AcceptFile { file_id: file_id.into() })
    }

    pub fn decline_file(&self, file_id: &str) -> Result<()> {
        self.send(Command::DeclineFile { file_id: file_id.into() })
    }

    pub fn cancel_upload(&self, file_id: &str) -> Result<()> {
        self.send(Command::CancelUpload { file_id: file_id.into() })
    }

    pub fn cancel_download(&self, file_id: &str) -> Result<()> {
        self.send(Command::CancelDownload { file_id: file_id.into() })
    }

    pub fn pause_upload(&self, file_id: &str) -> Result<()> {
        self.send(Command::PauseUpload { file_id: file_id.into() })
    }

    pub fn resume_upload(&self, file_id: &str) -> Result<()> {
        self.send(Command::ResumeUpload { file_id: file_id.into() })
    }

    /// Feed an inbound signaling envelope from the relay.
    pub fn signal(&self, envelope: SignalEnvelope) -> Result<()> {
        self.send(Command::Signal { envelope })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

/// Owns the negotiator, the transfer coordinators and the shared registry.
pub struct PeerHub {
    negotiator: Negotiator,
    registry: Arc<TransferRegistry>,
    upload: UploadCoordinator,
    download: DownloadCoordinator,
    events: mpsc::UnboundedSender<NodeEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    connectors: mpsc::UnboundedReceiver<(String, ConnectorEvent)>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl PeerHub {
    pub fn new(
        local: impl Into<String>,
        config: NodeConfig,
        factory: Arc<dyn ConnectorFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> (Self, NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connectors_tx, connectors_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = TransferRegistry::new();
        let upload = UploadCoordinator::new(registry.clone(), events_tx.clone(), &config);
        let download = DownloadCoordinator::new(registry.clone(), events_tx.clone(), &config);
        let negotiator = Negotiator::new(
            local,
            config,
            factory,
            signaling,
            connectors_tx,
            timers_tx,
            events_tx.clone(),
        );

        let hub = Self {
            negotiator,
            registry,
            upload,
            download,
            events: events_tx,
            commands: commands_rx,
            connectors: connectors_rx,
            timers: timers_rx,
        };
        let handle = NodeHandle {
            commands: commands_tx,
        };
        (hub, handle, events_rx)
    }

    /// Build a hub and run its loop on a spawned task.
    pub fn spawn(
        local: impl Into<String>,
        config: NodeConfig,
        factory: Arc<dyn ConnectorFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> (NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
        let (hub, handle, events) = Self::new(local, config, factory, signaling);
        tokio::spawn(hub.run());
        (handle, events)
    }

    /// The dispatch loop. Returns when a shutdown command arrives or every
    /// input channel closes.
    pub async fn run(mut self) {
        info!(event = "node_started", local = %self.negotiator.local());
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some((peer, event)) = self.connectors.recv() => {
                    self.handle_connector(&peer, event).await;
                }
                Some(timer) = self.timers.recv() => {
                    self.handle_timer(timer).await;
                }
            }
        }
        for peer in self.negotiator.peers() {
            self.negotiator.disconnect(&peer).await;
        }
        info!(event = "node_stopped", local = %self.negotiator.local());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer } => {
                let out = self.negotiator.connect(&peer).await;
                self.apply_output(&peer, out).await;
            }
            Command::Disconnect { peer } => {
                self.negotiator.disconnect(&peer).await;
                self.registry.remove_peer(&peer).await;
            }
            Command::SendMessage { peer, text } => {
                self.ensure_peer(&peer).await;
                let result = match self.negotiator.transport_mut(&peer) {
                    Some(transport) => {
                        transport.send_control(ControlMessage::Message { text }).await
                    }
                    None => Err(Error::ChannelNotOpen { peer: peer.clone() }),
                };
                if let Err(e) = result {
                    self.report_error(Some(&peer), e);
                }
            }
            Command::OfferFile {
                peer,
                file_name,
                source,
            } => {
                self.ensure_peer(&peer).await;
                match self.upload.prepare(&peer, &file_name, source).await {
                    // The offer rides the transport queue, so it reaches the
                    // peer whenever the channel (re)opens.
                    Ok(_id) => self.flush_offers(&peer).await,
                    Err(e) => self.report_error(Some(&peer), e),
                }
            }
            Command::AcceptFile { file_id } => {
                let peer = self.download_peer(&file_id).await;
                let notice = self.download.accept(&file_id).await;
                self.notify(peer.as_deref(), notice, &file_id).await;
            }
            Command::DeclineFile { file_id } => {
                let peer = self.download_peer(&file_id).await;
                let notice = self.download.decline(&file_id).await;
                self.notify(peer.as_deref(), notice, &file_id).await;
            }
            Command::CancelUpload { file_id } => {
                let peer = self.upload_peer(&file_id).await;
                let notice = self.upload.cancel(&file_id).await;
                self.notify(peer.as_deref(), notice, &file_id).await;
            }
            Command::CancelDownload { file_id } => {
                let peer = self.download_peer(&file_id).await;
                let notice = self.download.cancel(&file_id).await;
                self.notify(peer.as_deref(), notice, &file_id).await;
            }
            Command::PauseUpload { file_id } => self.upload.pause(&file_id).await,
            Command::ResumeUpload { file_id } => {
                let Some(peer) = self.upload_peer(&file_id).await else {
                    self.report_error(None, Error::UnknownTransfer(file_id));
                    return;
                };
                match self.negotiator.channel(&peer) {
                    Some(channel) => self.upload.resume(&file_id, channel).await,
                    None => warn!(
                        event = "resume_without_channel",
                        peer = %peer,
                        transfer_id = %file_id,
                        "Cannot resume until the peer's channel is back"
                    ),
                }
            }
            Command::Signal { envelope } => {
                let peer = envelope.from.clone();
                let out = self.negotiator.handle_envelope(envelope).await;
                self.apply_output(&peer, out).await;
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    async fn handle_connector(&mut self, peer: &str, event: ConnectorEvent) {
        let out = self.negotiator.handle_connector_event(peer, event).await;
        self.apply_output(peer, out).await;
    }

    async fn handle_timer(&mut self, timer: TimerEvent) {
        let peer = match &timer {
            TimerEvent::Retry { peer, .. } | TimerEvent::OfferWaitExpired { peer, .. } => {
                peer.clone()
            }
        };
        let out = self.negotiator.handle_tick(timer).await;
        self.apply_output(&peer, out).await;
    }

    async fn apply_output(&mut self, peer: &str, output: Option<SessionOutput>) {
        match output {
            None => {}
            Some(SessionOutput::Opened) => {
                self.flush_offers(peer).await;
                if let Some(channel) = self.negotiator.channel(peer) {
                    self.upload.resume_for_peer(peer, channel).await;
                }
            }
            Some(SessionOutput::Inbound(Inbound::Control(message))) => {
                self.route_control(peer, message).await;
            }
            Some(SessionOutput::Inbound(Inbound::Chunk(frame))) => {
                self.download.handle_chunk(peer, frame).await;
            }
            Some(SessionOutput::Failed { attempts }) => {
                self.registry.remove_peer(peer).await;
                self.report_error(
                    Some(peer),
                    Error::ReconnectExhausted {
                        peer: peer.to_string(),
                        attempts,
                    },
                );
            }
        }
    }

    async fn route_control(&mut self, peer: &str, message: ControlMessage) {
        debug!(event = "control_received", peer = %peer, transfer_id = ?message.file_id());
        match message {
            ControlMessage::Message { text } => {
                let _ = self.events.send(NodeEvent::MessageReceived {
                    peer: peer.to_string(),
                    text,
                });
            }
            ControlMessage::FileOffer {
                file_id,
                file_name,
                file_size,
                file_hash,
            } => {
                self.download
                    .handle_offer(peer, &file_id, &file_name, file_size, file_hash)
                    .await;
            }
            ControlMessage::FileAccept { file_id } => match self.negotiator.channel(peer) {
                Some(channel) => self.upload.handle_accept(peer, &file_id, channel).await,
                None => warn!(
                    event = "accept_without_channel",
                    peer = %peer,
                    transfer_id = %file_id,
                    "file-accept arrived but the channel is gone"
                ),
            },
            ControlMessage::FileDecline { file_id } => {
                self.upload.handle_decline(peer, &file_id).await;
            }
            ControlMessage::FileCancelUpload { file_id } => {
                self.download.handle_cancel_upload(peer, &file_id).await;
            }
            ControlMessage::FileCancelDownload { file_id } => {
                self.upload.handle_cancel_download(peer, &file_id).await;
            }
        }
    }

    /// Emit every not-yet-offered transfer to `peer` through its transport.
    async fn flush_offers(&mut self, peer: &str) {
        let offers = self.upload.pending_offers(peer).await;
        for offer in offers {
            self.send_control(peer, offer).await;
        }
    }

    /// Negotiation for `peer` starts implicitly on the first application
    /// message to it.
    async fn ensure_peer(&mut self, peer: &str) {
        if self.negotiator.state(peer).is_none() {
            let out = self.negotiator.connect(peer).await;
            self.apply_output(peer, out).await;
        }
    }

    async fn send_control(&mut self, peer: &str, message: ControlMessage) {
        let result = match self.negotiator.transport_mut(peer) {
            Some(transport) => transport.send_control(message).await,
            None => Err(Error::ChannelNotOpen { peer: peer.into() }),
        };
        if let Err(e) = result {
            self.report_error(Some(peer), e);
        }
    }

    /// Forward a coordinator's notice (accept/decline/cancel) to its peer.
    async fn notify(&mut self, peer: Option<&str>, notice: Option<ControlMessage>, file_id: &str) {
        match (peer, notice) {
            (Some(peer), Some(notice)) => {
                let peer = peer.to_string();
                self.send_control(&peer, notice).await;
            }
            _ => self.report_error(None, Error::UnknownTransfer(file_id.to_string())),
        }
    }

    async fn download_peer(&self, file_id: &str) -> Option<String> {
        self.registry
            .downloads
            .lock()
            .await
            .get(file_id)
            .map(|d| d.peer.clone())
    }

    async fn upload_peer(&self, file_id: &str) -> Option<String> {
        self.registry
            .uploads
            .lock()
            .await
            .get(file_id)
            .map(|u| u.peer.clone())
    }

    fn report_error(&self, peer: Option<&str>, error: Error) {
        warn!(event = "hub_error", peer = ?peer, error = %error);
        let _ = self.events.send(NodeEvent::Error {
            peer: peer.map(str::to_string),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_chunk;
    use crate::negotiation::tests::{FakeFactory, FakeSignaling};
    use crate::signaling::SignalKind;
    use crate::transfer::MemorySource;
    use crate::transport::tests::FakeChannel;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        hub: PeerHub,
        factory: Arc<FakeFactory>,
        signaling: Arc<FakeSignaling>,
        events: mpsc::UnboundedReceiver<NodeEvent>,
    }

    fn harness(local: &str) -> Harness {
        let factory = FakeFactory::new();
        let signaling = FakeSignaling::new();
        let (hub, _handle, events) = PeerHub::new(
            local,
            NodeConfig::default(),
            factory.clone(),
            signaling.clone(),
        );
        Harness {
            hub,
            factory,
            signaling,
            events,
        }
    }

    impl Harness {
        /// Bring the data channel for `peer` up, as the connector would.
        async fn open_channel(&mut self, peer: &str) -> Arc<FakeChannel> {
            let channel = FakeChannel::new(true);
            self.hub
                .handle_connector(peer, ConnectorEvent::ChannelAttached(channel.clone()))
                .await;
            self.hub
                .handle_connector(peer, ConnectorEvent::ChannelOpen)
                .await;
            channel
        }

        async fn next_event(&mut self) -> NodeEvent {
            timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        async fn wait_for(&mut self, want: impl Fn(&NodeEvent) -> bool) -> NodeEvent {
            loop {
                let event = self.next_event().await;
                if want(&event) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn message_before_open_is_queued_then_delivered() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::SendMessage {
                peer: "Bob".into(),
                text: "hello".into(),
            })
            .await;

        // Negotiation started implicitly (we are the caller).
        assert_eq!(h.signaling.kinds().await, vec![SignalKind::Offer]);

        let channel = h.open_channel("Bob").await;
        let texts = channel.sent_text.lock().await;
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("hello"));
    }

    #[tokio::test]
    async fn offered_file_streams_after_remote_accept() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::Connect { peer: "Bob".into() })
            .await;
        let channel = h.open_channel("Bob").await;

        let source = Arc::new(MemorySource::new(vec![7u8; 1000]));
        h.hub
            .handle_command(Command::OfferFile {
                peer: "Bob".into(),
                file_name: "blob.bin".into(),
                source,
            })
            .await;

        let texts = channel.sent_text.lock().await;
        assert_eq!(texts.len(), 1, "offer sent immediately on open channel");
        let offer: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(offer["type"], "file-offer");
        let file_id = offer["payload"]["fileId"].as_str().unwrap().to_string();
        drop(texts);

        let accept = serde_json::to_string(&ControlMessage::FileAccept {
            file_id: file_id.clone(),
        })
        .unwrap();
        h.hub
            .handle_connector("Bob", ConnectorEvent::Text(accept))
            .await;

        h.wait_for(|e| matches!(e, NodeEvent::UploadComplete { .. })).await;
        // Default 256 KiB chunks: 1000 bytes is a single frame.
        assert_eq!(channel.sent_binary.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn inbound_offer_accept_and_chunks_complete_a_download() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::Connect { peer: "Bob".into() })
            .await;
        let channel = h.open_channel("Bob").await;

        let offer = serde_json::to_string(&ControlMessage::FileOffer {
            file_id: "f1".into(),
            file_name: "pic.png".into(),
            file_size: 4,
            file_hash: None,
        })
        .unwrap();
        h.hub
            .handle_connector("Bob", ConnectorEvent::Text(offer))
            .await;
        h.wait_for(|e| matches!(e, NodeEvent::FileOffered { .. })).await;

        h.hub
            .handle_command(Command::AcceptFile { file_id: "f1".into() })
            .await;
        let texts = channel.sent_text.lock().await;
        assert!(texts.iter().any(|t| t.contains("file-accept")));
        drop(texts);

        let frame = Bytes::from(encode_chunk("f1", 0, 1, b"data"));
        h.hub
            .handle_connector("Bob", ConnectorEvent::Binary(frame))
            .await;

        let event = h
            .wait_for(|e| matches!(e, NodeEvent::DownloadComplete { .. }))
            .await;
        if let NodeEvent::DownloadComplete { data, .. } = event {
            assert_eq!(data, b"data");
        }
    }

    #[tokio::test]
    async fn declined_offer_notifies_the_sender() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::Connect { peer: "Bob".into() })
            .await;
        let channel = h.open_channel("Bob").await;

        let offer = serde_json::to_string(&ControlMessage::FileOffer {
            file_id: "f2".into(),
            file_name: "big.iso".into(),
            file_size: 10,
            file_hash: None,
        })
        .unwrap();
        h.hub
            .handle_connector("Bob", ConnectorEvent::Text(offer))
            .await;
        h.hub
            .handle_command(Command::DeclineFile { file_id: "f2".into() })
            .await;

        let texts = channel.sent_text.lock().await;
        assert!(texts.iter().any(|t| t.contains("file-decline")));
        drop(texts);
        // Sending a chunk anyway: the download is gone, nothing completes.
        let frame = Bytes::from(encode_chunk("f2", 0, 1, b"xx"));
        h.hub
            .handle_connector("Bob", ConnectorEvent::Binary(frame))
            .await;
        assert!(h.hub.registry.downloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_transfers_for_that_peer() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::Connect { peer: "Bob".into() })
            .await;
        h.open_channel("Bob").await;
        h.hub
            .handle_command(Command::OfferFile {
                peer: "Bob".into(),
                file_name: "a".into(),
                source: Arc::new(MemorySource::new(vec![1u8; 4])),
            })
            .await;
        assert_eq!(h.hub.registry.uploads.lock().await.len(), 1);

        h.hub
            .handle_command(Command::Disconnect { peer: "Bob".into() })
            .await;
        assert!(h.hub.registry.uploads.lock().await.is_empty());
        assert!(h.hub.negotiator.state("Bob").is_none());
        let connector = h.factory.connector(0).await;
        assert!(connector.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn accepting_an_unknown_transfer_surfaces_an_error() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::AcceptFile { file_id: "nope".into() })
            .await;

        let event = h
            .wait_for(|e| matches!(e, NodeEvent::Error { .. }))
            .await;
        match event {
            NodeEvent::Error { message, .. } => assert!(message.contains("nope")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_session_clears_transfers_and_reports() {
        let mut h = harness("Alice");
        h.hub
            .handle_command(Command::Connect { peer: "Bob".into() })
            .await;
        h.open_channel("Bob").await;
        h.hub
            .handle_command(Command::OfferFile {
                peer: "Bob".into(),
                file_name: "a".into(),
                source: Arc::new(MemorySource::new(vec![1u8; 4])),
            })
            .await;
        assert_eq!(h.hub.registry.uploads.lock().await.len(), 1);

        h.hub
            .apply_output("Bob", Some(SessionOutput::Failed { attempts: 5 }))
            .await;
        assert!(h.hub.registry.uploads.lock().await.is_empty());
        let event = h
            .wait_for(|e| matches!(e, NodeEvent::Error { .. }))
            .await;
        match event {
            NodeEvent::Error { peer, message } => {
                assert_eq!(peer.as_deref(), Some("Bob"));
                assert!(message.contains("5 reconnect attempts"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
