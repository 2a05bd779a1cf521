//! WebRTC PeerConnection adapter
//!
//! The coordinator only sees the [`PeerConnectionAdapter`] capability
//! surface. [`WebRtcPeerConnection`] implements it on top of the `webrtc`
//! crate as a thin pass-through: no retries live here.

use super::signaling::{force_setup_role, Role};
use super::{AddCandidateError, ApplyError, WebRTCError};
use crate::config::{VideoCodec, WebRTCConfig};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// An immutable session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    /// Copy of this description with the DTLS setup role fixed for `role`
    pub fn with_setup_role(&self, role: Role) -> Self {
        Self {
            kind: self.kind,
            sdp: force_setup_role(&self.sdp, role.setup_role()),
        }
    }
}

/// A discovered network path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: i32,
    pub sdp_mid: String,
}

/// ICE connection state as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// A transport path has been found
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

impl From<RTCIceConnectionState> for ConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => ConnectionState::Checking,
            RTCIceConnectionState::Connected => ConnectionState::Connected,
            RTCIceConnectionState::Completed => ConnectionState::Completed,
            RTCIceConnectionState::Failed => ConnectionState::Failed,
            RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCIceConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Callback for locally discovered candidates
pub type LocalCandidateCallback = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// Capability surface of a transport-layer peer connection
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync {
    /// Synthesize an offer (offerer) or answer (answerer)
    async fn create_local_description(&self, role: Role) -> Result<SessionDescription, ApplyError>;

    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), ApplyError>;

    /// Fails if `desc.kind` is not what the negotiation stage expects
    async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), ApplyError>;

    /// Re-adding a known candidate is a no-op
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), AddCandidateError>;

    fn connection_state(&self) -> ConnectionState;

    /// Subscribe to connection state changes
    fn watch_connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Replace the local candidate callback
    fn on_local_candidate_discovered(&self, callback: LocalCandidateCallback);

    async fn close(&self) -> Result<(), WebRTCError>;
}

/// [`PeerConnectionAdapter`] backed by the `webrtc` crate
pub struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    candidate_callback: Arc<Mutex<Option<LocalCandidateCallback>>>,
    known_remote: Mutex<HashSet<IceCandidate>>,
}

impl WebRtcPeerConnection {
    /// Create a peer connection for `role`.
    ///
    /// The offerer carries a send-only video transceiver, the answerer a
    /// receive-only one.
    pub async fn new(config: &WebRTCConfig, role: Role) -> Result<Self, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        register_video_codec(&mut media_engine, config.video_codec)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?,
        );

        let direction = match role {
            Role::Offerer => RTCRtpTransceiverDirection::Sendonly,
            Role::Answerer => RTCRtpTransceiverDirection::Recvonly,
        };
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to add video transceiver: {}", e)))?;

        let (state_tx, _) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let candidate_callback: Arc<Mutex<Option<LocalCandidateCallback>>> = Arc::new(Mutex::new(None));

        let state_for_callback = state_tx.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let state_tx = state_for_callback.clone();
            Box::pin(async move {
                let state = ConnectionState::from(state);
                info!("ICE connection state changed: {:?}", state);
                state_tx.send_replace(state);
            })
        }));

        let callback_slot = candidate_callback.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let callback_slot = callback_slot.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        debug!("Dropping unserializable local candidate: {}", e);
                        return;
                    }
                };
                let candidate = IceCandidate {
                    candidate: init.candidate,
                    sdp_mline_index: init.sdp_mline_index.map(i32::from).unwrap_or(0),
                    sdp_mid: init.sdp_mid.unwrap_or_default(),
                };
                if let Some(callback) = callback_slot.lock().as_ref() {
                    callback(candidate);
                }
            })
        }));

        Ok(Self {
            peer_connection,
            state_tx,
            candidate_callback,
            known_remote: Mutex::new(HashSet::new()),
        })
    }

    fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, ApplyError> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        parsed.map_err(|e| ApplyError::Rejected(format!("Invalid SDP {}: {}", desc.kind, e)))
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcPeerConnection {
    async fn create_local_description(&self, role: Role) -> Result<SessionDescription, ApplyError> {
        match role {
            Role::Offerer => {
                let offer = self
                    .peer_connection
                    .create_offer(None)
                    .await
                    .map_err(|e| ApplyError::Rejected(format!("Failed to create offer: {}", e)))?;
                Ok(SessionDescription::new(SdpKind::Offer, offer.sdp))
            }
            Role::Answerer => {
                if self.peer_connection.signaling_state() != RTCSignalingState::HaveRemoteOffer {
                    return Err(ApplyError::OutOfOrder(
                        "answer requested before a remote offer was applied".to_string(),
                    ));
                }
                let answer = self
                    .peer_connection
                    .create_answer(None)
                    .await
                    .map_err(|e| ApplyError::Rejected(format!("Failed to create answer: {}", e)))?;
                Ok(SessionDescription::new(SdpKind::Answer, answer.sdp))
            }
        }
    }

    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), ApplyError> {
        let rtc = Self::to_rtc(desc)?;
        self.peer_connection
            .set_local_description(rtc)
            .await
            .map_err(|e| ApplyError::Rejected(format!("Failed to set local description: {}", e)))
    }

    async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), ApplyError> {
        let expected = match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SdpKind::Answer,
            RTCSignalingState::Stable => SdpKind::Offer,
            other => {
                return Err(ApplyError::OutOfOrder(format!(
                    "cannot apply a remote description in signaling state {}",
                    other
                )))
            }
        };
        if desc.kind != expected {
            return Err(ApplyError::WrongKind {
                expected,
                actual: desc.kind,
            });
        }

        let rtc = Self::to_rtc(desc)?;
        self.peer_connection
            .set_remote_description(rtc)
            .await
            .map_err(|e| ApplyError::Rejected(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), AddCandidateError> {
        if matches!(
            self.connection_state(),
            ConnectionState::Completed | ConnectionState::Closed
        ) {
            return Err(AddCandidateError::ConnectionFinished);
        }
        if self.peer_connection.remote_description().await.is_none() {
            return Err(AddCandidateError::NoRemoteDescription);
        }
        if self.known_remote.lock().contains(candidate) {
            return Ok(());
        }

        let sdp_mline_index = u16::try_from(candidate.sdp_mline_index)
            .map_err(|_| AddCandidateError::Rejected(format!("Invalid m-line index {}", candidate.sdp_mline_index)))?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(sdp_mline_index),
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| AddCandidateError::Rejected(e.to_string()))?;

        self.known_remote.lock().insert(candidate.clone());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn on_local_candidate_discovered(&self, callback: LocalCandidateCallback) {
        *self.candidate_callback.lock() = Some(callback);
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.candidate_callback.lock().take();
        self.peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::CloseFailed(format!("Failed to close connection: {}", e)))?;
        self.state_tx.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

/// Register the configured video codec in the media engine
fn register_video_codec(media_engine: &mut MediaEngine, codec: VideoCodec) -> Result<(), WebRTCError> {
    let (mime_type, fmtp) = match codec {
        VideoCodec::H264 => (
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
        VideoCodec::VP8 => (MIME_TYPE_VP8, ""),
        VideoCodec::VP9 => (MIME_TYPE_VP9, "profile-id=0"),
    };

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: codec.rtp_payload_type(),
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register {}: {}", codec.as_str(), e)))
}
