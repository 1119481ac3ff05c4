//! WebRTC peer connection management.
//!
//! The core owns the peer connection, the VP8 video track, and the two data
//! channels (`control` and `frames`). It never calls back into the session
//! layer: everything observable is emitted as an [`RtcEvent`] on an mpsc
//! channel the session loop consumes, and the session drives it through
//! plain async methods. This keeps the object graph acyclic and the event
//! ordering testable.

use anyhow::{Context, Result};
use bytes::Bytes;
use p2prd_protocol::{FrameHeader, TurnConfig, encode_envelope};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::encoder::CLOCK_RATE;

pub const CONTROL_CHANNEL: &str = "control";
pub const FRAMES_CHANNEL: &str = "frames";

/// Connection state surfaced to the session layer and the operator UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl ConnState {
    /// States that warrant a recovery re-offer while a lease is held.
    pub fn needs_reoffer(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl From<RTCIceConnectionState> for ConnState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New | RTCIceConnectionState::Checking => Self::Negotiating,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => Self::Connected,
            RTCIceConnectionState::Failed => Self::Failed,
            RTCIceConnectionState::Disconnected => Self::Disconnected,
            RTCIceConnectionState::Closed => Self::Closed,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Frames,
}

#[derive(Debug)]
pub enum RtcEvent {
    /// Local description is set; the offer SDP is ready to signal.
    OfferReady { sdp: String },
    LocalCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    IceState(ConnState),
    ChannelOpen(ChannelKind),
    ChannelClosed(ChannelKind),
    /// UTF-8 JSON received on the control channel.
    ControlMessage(String),
}

struct ActivePeer {
    pc: Arc<RTCPeerConnection>,
    control: Arc<RTCDataChannel>,
    frames: Arc<RTCDataChannel>,
    video: Arc<TrackLocalStaticRTP>,
}

pub struct WebRtcCore {
    events: mpsc::Sender<RtcEvent>,
    peer: Mutex<Option<ActivePeer>>,
}

impl WebRtcCore {
    pub fn new(events: mpsc::Sender<RtcEvent>) -> Self {
        Self {
            events,
            peer: Mutex::new(None),
        }
    }

    /// Tear down any prior connection, build a fresh one advertising VP8 plus
    /// the two data channels, and emit the offer once the local description
    /// is set (so the offer always precedes its candidates on the wire).
    pub async fn start_offer(&self, stun: &[String], turn: Option<&TurnConfig>) -> Result<()> {
        self.reset().await;

        let mut media = MediaEngine::default();
        let feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
        ];
        media.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: feedback,
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = Vec::new();
        if !stun.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: stun.to_vec(),
                ..Default::default()
            });
        }
        if let Some(turn) = turn.filter(|t| t.is_configured()) {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .context("Failed to create peer connection")?,
        );

        let video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: CLOCK_RATE,
                ..Default::default()
            },
            "video".to_string(),
            "p2prd".to_string(),
        ));
        pc.add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        let control = pc
            .create_data_channel(CONTROL_CHANNEL, None)
            .await
            .context("Failed to create control channel")?;
        let frames = pc
            .create_data_channel(FRAMES_CHANNEL, None)
            .await
            .context("Failed to create frames channel")?;

        self.wire_channel(&control, ChannelKind::Control, true);
        self.wire_channel(&frames, ChannelKind::Frames, false);

        let ice_tx = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let _ = tx.try_send(RtcEvent::LocalCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            });
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
            })
        }));

        let state_tx = self.events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = state_tx.try_send(RtcEvent::IceState(ConnState::from(state)));
            Box::pin(async {})
        }));

        let offer = pc.create_offer(None).await.context("Failed to create offer")?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .context("Failed to set local description")?;

        {
            let mut slot = self.peer.lock().await;
            *slot = Some(ActivePeer {
                pc,
                control,
                frames,
                video,
            });
        }

        info!("WebRTC offer ready");
        // try_send keeps this safe to call from the event consumer itself;
        // a full queue here means the session is already wedged and the next
        // ICE failure will re-offer.
        if self.events.try_send(RtcEvent::OfferReady { sdp }).is_err() {
            warn!("Event queue full, offer not signaled");
        }
        Ok(())
    }

    fn wire_channel(&self, dc: &Arc<RTCDataChannel>, kind: ChannelKind, read_messages: bool) {
        let open_tx = self.events.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.try_send(RtcEvent::ChannelOpen(kind));
            Box::pin(async {})
        }));
        let close_tx = self.events.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.try_send(RtcEvent::ChannelClosed(kind));
            Box::pin(async {})
        }));
        if read_messages {
            let msg_tx = self.events.clone();
            dc.on_message(Box::new(move |msg| {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = msg_tx.try_send(RtcEvent::ControlMessage(text));
                    }
                    Err(_) => warn!("Non-UTF-8 payload on control channel dropped"),
                }
                Box::pin(async {})
            }));
        }
    }

    /// Apply the operator's SDP answer. A no-op with a warning when no
    /// connection is active (stale answer after a reset).
    pub async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let slot = self.peer.lock().await;
        let Some(peer) = slot.as_ref() else {
            warn!("SDP answer with no active connection, ignoring");
            return Ok(());
        };
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse SDP answer")?;
        peer.pc
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        debug!("Remote description applied");
        Ok(())
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let slot = self.peer.lock().await;
        let Some(peer) = slot.as_ref() else {
            warn!("ICE candidate with no active connection, ignoring");
            return Ok(());
        };
        peer.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.to_string(),
                sdp_mid,
                sdp_mline_index,
                ..Default::default()
            })
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    /// UTF-8 JSON over the control channel if it is open.
    pub async fn try_send_control(&self, json: &str) -> bool {
        let slot = self.peer.lock().await;
        let Some(peer) = slot.as_ref() else {
            return false;
        };
        if peer.control.ready_state() != RTCDataChannelState::Open {
            return false;
        }
        peer.control.send_text(json.to_string()).await.is_ok()
    }

    /// Binary envelope over the frames channel if it is open.
    pub async fn try_send_frame(&self, header: &FrameHeader, payload: &[u8]) -> bool {
        let slot = self.peer.lock().await;
        let Some(peer) = slot.as_ref() else {
            return false;
        };
        if peer.frames.ready_state() != RTCDataChannelState::Open {
            return false;
        }
        let buf = Bytes::from(encode_envelope(header, payload));
        peer.frames.send(&buf).await.is_ok()
    }

    /// Push pre-packetized RTP onto the video track. False until the track is
    /// bound by a completed negotiation.
    pub async fn try_send_video(&self, packets: &[webrtc::rtp::packet::Packet]) -> bool {
        let slot = self.peer.lock().await;
        let Some(peer) = slot.as_ref() else {
            return false;
        };
        for packet in packets {
            if peer.video.write_rtp(packet).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Close and discard the connection and all derived state.
    pub async fn reset(&self) {
        let peer = self.peer.lock().await.take();
        if let Some(peer) = peer {
            if let Err(e) = peer.pc.close().await {
                debug!("Peer connection close failed: {e}");
            }
            info!("WebRTC connection reset");
        }
    }
}
