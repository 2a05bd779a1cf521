//! WebRTC negotiation
//!
//! This module provides the two-party handshake that runs over the
//! broadcast relay:
//! - Signaling envelopes and role filtering
//! - Peer connection capability surface
//! - Retry-until-acknowledged publishing
//! - The offerer/answerer negotiation coordinator

pub mod peer_connection;
pub mod retry;
#[cfg(test)]
pub(crate) mod scripted;
pub mod session;
pub mod signaling;

pub use peer_connection::{
    ConnectionState, IceCandidate, PeerConnectionAdapter, SdpKind, SessionDescription,
    WebRtcPeerConnection,
};
pub use retry::{RetryOutcome, RetryPublisher, RetryTask};
pub use session::{
    CoordinatorHandle, NegotiationCoordinator, NegotiationOutcome, NegotiationState,
};
pub use signaling::{Role, SideTags, SignalEnvelope};

use std::error::Error;
use std::fmt;

/// Peer connection construction and teardown errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// Closing the peer connection failed
    CloseFailed(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::CloseFailed(msg) => write!(f, "Close failed: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

/// Creating or applying a session description failed.
///
/// Fatal to a coordinator: re-applying the same input cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The description kind does not match the negotiation stage
    WrongKind { expected: SdpKind, actual: SdpKind },
    /// The operation was called out of order
    OutOfOrder(String),
    /// The transport rejected the description
    Rejected(String),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::WrongKind { expected, actual } => {
                write!(f, "Expected {} description, got {}", expected, actual)
            }
            ApplyError::OutOfOrder(msg) => write!(f, "Out of order: {}", msg),
            ApplyError::Rejected(msg) => write!(f, "Description rejected: {}", msg),
        }
    }
}

impl Error for ApplyError {}

/// A remote candidate could not be added. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddCandidateError {
    /// No remote description has been applied yet
    NoRemoteDescription,
    /// The connection is past the point where candidates matter
    ConnectionFinished,
    /// The transport rejected the candidate
    Rejected(String),
}

impl fmt::Display for AddCandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddCandidateError::NoRemoteDescription => write!(f, "No remote description applied"),
            AddCandidateError::ConnectionFinished => write!(f, "Connection no longer accepts candidates"),
            AddCandidateError::Rejected(msg) => write!(f, "Candidate rejected: {}", msg),
        }
    }
}

impl Error for AddCandidateError {}

/// Why a coordinator aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The adapter could not synthesize the local description
    CreateDescription(ApplyError),
    /// Applying a local or remote description failed
    Apply(ApplyError),
    /// The signaling channel stopped delivering envelopes
    ChannelClosed,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::CreateDescription(e) => {
                write!(f, "Failed to create local description: {}", e)
            }
            NegotiationError::Apply(e) => write!(f, "Failed to apply description: {}", e),
            NegotiationError::ChannelClosed => write!(f, "Signaling channel closed"),
        }
    }
}

impl Error for NegotiationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NegotiationError::CreateDescription(e) | NegotiationError::Apply(e) => Some(e),
            NegotiationError::ChannelClosed => None,
        }
    }
}
