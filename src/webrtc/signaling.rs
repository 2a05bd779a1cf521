//! Signaling envelopes
//!
//! The relay is an unaddressed two-party bus: every participant sees every
//! envelope, including its own. Envelopes carry a free-text `side` tag and
//! each role only reacts to the tags of its peer.

use super::peer_connection::{IceCandidate, SdpKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed negotiation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiates the handshake
    Offerer,
    /// Responds to the offerer
    Answerer,
}

impl Role {
    /// The other participant
    pub fn peer(self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }

    /// DTLS setup value forced into this role's outgoing description
    pub fn setup_role(self) -> &'static str {
        match self {
            Role::Offerer => "active",
            Role::Answerer => "passive",
        }
    }

    /// Kind of description this role produces locally
    pub fn local_kind(self) -> SdpKind {
        match self {
            Role::Offerer => SdpKind::Offer,
            Role::Answerer => SdpKind::Answer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four `side` tags used on the bus.
///
/// SDP and ICE tags live in separate namespaces so a subscriber for one
/// never consumes the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideTags {
    #[serde(default = "default_offerer_sdp")]
    pub offerer_sdp: String,
    #[serde(default = "default_answerer_sdp")]
    pub answerer_sdp: String,
    #[serde(default = "default_offerer_ice")]
    pub offerer_ice: String,
    #[serde(default = "default_answerer_ice")]
    pub answerer_ice: String,
}

impl Default for SideTags {
    fn default() -> Self {
        Self {
            offerer_sdp: default_offerer_sdp(),
            answerer_sdp: default_answerer_sdp(),
            offerer_ice: default_offerer_ice(),
            answerer_ice: default_answerer_ice(),
        }
    }
}

impl SideTags {
    /// Tag a role puts on its session descriptions
    pub fn sdp_tag(&self, role: Role) -> &str {
        match role {
            Role::Offerer => &self.offerer_sdp,
            Role::Answerer => &self.answerer_sdp,
        }
    }

    /// Tag a role puts on its candidates
    pub fn ice_tag(&self, role: Role) -> &str {
        match role {
            Role::Offerer => &self.offerer_ice,
            Role::Answerer => &self.answerer_ice,
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            &self.offerer_sdp,
            &self.answerer_sdp,
            &self.offerer_ice,
            &self.answerer_ice,
        ]
    }
}

fn default_offerer_sdp() -> String {
    "streamer".to_string()
}

fn default_answerer_sdp() -> String {
    "reciver".to_string()
}

fn default_offerer_ice() -> String {
    "IceStreamer".to_string()
}

fn default_answerer_ice() -> String {
    "IceReciever".to_string()
}

/// Messages carried by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEnvelope {
    /// Session description body
    OfferData { side: String, sdp: String },

    /// A single ICE candidate
    IceCandidate {
        side: String,
        candidate: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: i32,
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
    },
}

impl SignalEnvelope {
    pub fn offer_data(side: &str, sdp: &str) -> Self {
        SignalEnvelope::OfferData {
            side: side.to_string(),
            sdp: sdp.to_string(),
        }
    }

    pub fn ice_candidate(side: &str, candidate: &IceCandidate) -> Self {
        SignalEnvelope::IceCandidate {
            side: side.to_string(),
            candidate: candidate.candidate.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid.clone(),
        }
    }

    /// Parse an envelope from a relay text frame
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to a relay text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn side(&self) -> &str {
        match self {
            SignalEnvelope::OfferData { side, .. } => side,
            SignalEnvelope::IceCandidate { side, .. } => side,
        }
    }
}

/// An envelope that a role has accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The peer's session description body
    RemoteDescription(String),
    /// One of the peer's candidates
    RemoteCandidate(IceCandidate),
}

/// Decide whether `role` reacts to `envelope`.
///
/// Only envelopes carrying the peer's tag in the matching namespace are
/// accepted; everything else, including this role's own echoes, is `None`.
pub fn accept(envelope: &SignalEnvelope, role: Role, tags: &SideTags) -> Option<Inbound> {
    let peer = role.peer();
    match envelope {
        SignalEnvelope::OfferData { side, sdp } if side == tags.sdp_tag(peer) => {
            Some(Inbound::RemoteDescription(sdp.clone()))
        }
        SignalEnvelope::IceCandidate {
            side,
            candidate,
            sdp_mline_index,
            sdp_mid,
        } if side == tags.ice_tag(peer) => Some(Inbound::RemoteCandidate(IceCandidate {
            candidate: candidate.clone(),
            sdp_mline_index: *sdp_mline_index,
            sdp_mid: sdp_mid.clone(),
        })),
        _ => None,
    }
}

/// Rewrite every `a=setup:` attribute to `setup`, keeping line endings.
pub fn force_setup_role(sdp: &str, setup: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        if body.starts_with("a=setup:") {
            out.push_str("a=setup:");
            out.push_str(setup);
            out.push_str(&line[body.len()..]);
        } else {
            out.push_str(line);
        }
    }
    out
}
