//! WebRTC bindings for the connector seam.
//!
//! Thin adapter: all negotiation policy lives in `negotiation`, this module
//! only translates between the connector traits and webrtc-rs. SDP travels
//! as the JSON-serialized session description; ICE candidates as the
//! JSON-serialized candidate init, trickled as they are discovered rather
//! than waiting for gathering to complete.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::negotiation::{ConnectorEvent, ConnectorFactory, PeerConnector, Role};
use crate::transport::DataChannelHandle;

const DATA_CHANNEL_LABEL: &str = "data";

fn rtc_err(peer: &str, e: webrtc::Error) -> Error {
    Error::Negotiation {
        peer: peer.to_string(),
        reason: e.to_string(),
    }
}

/// Builds one peer connection per negotiation round.
pub struct RtcConnectorFactory {
    ice_servers: Vec<String>,
}

impl RtcConnectorFactory {
    pub fn new(config: &NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            ice_servers: config.ice_servers.clone(),
        })
    }
}

#[async_trait]
impl ConnectorFactory for RtcConnectorFactory {
    async fn connect(
        &self,
        _local: &str,
        peer: &str,
        role: Role,
        events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
    ) -> Result<Arc<dyn PeerConnector>> {
        let mut media = MediaEngine::default();
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(|e| rtc_err(peer, e))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| rtc_err(peer, e))?,
        );

        wire_peer_connection(&pc, peer, &events);

        match role {
            Role::Caller => {
                // The offerer creates the channel up front so it is in the
                // offer's SDP.
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(|e| rtc_err(peer, e))?;
                wire_data_channel(peer.to_string(), dc, events);
            }
            Role::Callee => {
                let peer = peer.to_string();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let peer = peer.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        debug!(event = "data_channel_received", peer = %peer, label = %dc.label());
                        wire_data_channel(peer, dc, events);
                    })
                }));
            }
        }

        Ok(Arc::new(RtcConnector {
            peer: peer.to_string(),
            pc,
        }))
    }
}

fn wire_peer_connection(
    pc: &Arc<RTCPeerConnection>,
    peer: &str,
    events: &mpsc::UnboundedSender<(String, ConnectorEvent)>,
) {
    {
        let peer = peer.to_string();
        let events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(event = "ice_gathering_complete", peer = %peer);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = events.send((peer, ConnectorEvent::LocalCandidate(json)));
                        }
                        Err(e) => warn!(event = "candidate_encode_failure", peer = %peer, error = %e),
                    },
                    Err(e) => warn!(event = "candidate_encode_failure", peer = %peer, error = %e),
                }
            })
        }));
    }

    {
        let peer = peer.to_string();
        let events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!(event = "connection_state", peer = %peer, state = %state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send((peer, ConnectorEvent::Connected));
                    }
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => {
                        let _ = events.send((peer, ConnectorEvent::Failed));
                    }
                    _ => {}
                }
            })
        }));
    }
}

fn wire_data_channel(
    peer: String,
    dc: Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<(String, ConnectorEvent)>,
) {
    let handle: Arc<dyn DataChannelHandle> = Arc::new(RtcChannel {
        peer: peer.clone(),
        dc: dc.clone(),
    });
    let _ = events.send((peer.clone(), ConnectorEvent::ChannelAttached(handle)));

    {
        let peer = peer.clone();
        let events = events.clone();
        dc.on_open(Box::new(move || {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send((peer, ConnectorEvent::ChannelOpen));
            })
        }));
    }

    {
        let peer = peer.clone();
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send((peer, ConnectorEvent::ChannelClosed));
            })
        }));
    }

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let peer = peer.clone();
        let events = events.clone();
        Box::pin(async move {
            let event = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ConnectorEvent::Text(text),
                    Err(e) => {
                        warn!(event = "text_decode_failure", peer = %peer, error = %e);
                        return;
                    }
                }
            } else {
                ConnectorEvent::Binary(msg.data)
            };
            let _ = events.send((peer, event));
        })
    }));
}

struct RtcConnector {
    peer: String,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_err(&self.peer, e))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| rtc_err(&self.peer, e))?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation {
                peer: self.peer.clone(),
                reason: "no local description after offer".into(),
            })?;
        Ok(serde_json::to_string(&desc)?)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| rtc_err(&self.peer, e))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_err(&self.peer, e))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| rtc_err(&self.peer, e))?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation {
                peer: self.peer.clone(),
                reason: "no local description after answer".into(),
            })?;
        Ok(serde_json::to_string(&desc)?)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| rtc_err(&self.peer, e))
    }

    async fn add_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| rtc_err(&self.peer, e))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "close_failure", peer = %self.peer, error = %e);
        }
    }
}

/// [`DataChannelHandle`] over a live RTCDataChannel.
struct RtcChannel {
    peer: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for RtcChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelNotOpen {
                peer: self.peer.clone(),
            })
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelNotOpen {
                peer: self.peer.clone(),
            })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }
}
