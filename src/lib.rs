//! pairsignal - two-party WebRTC signaling over a broadcast relay
//!
//! Negotiates one peer connection between an offerer and an answerer that
//! can only reach each other through an unaddressed, lossy relay.

pub mod config;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use crate::config::{Config, VideoCodec, WebRTCConfig};
pub use crate::transport::{LocalChannel, RelayChannel, SignalingChannel};
// `webrtc` alone would also name the external crate
pub use crate::webrtc::{
    CoordinatorHandle, NegotiationCoordinator, NegotiationError, NegotiationOutcome,
    NegotiationState, Role, SideTags, SignalEnvelope,
};
