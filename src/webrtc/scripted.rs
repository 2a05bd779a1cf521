//! In-memory peer connection for coordinator tests.
//!
//! Two peers created with [`ScriptedPeer::pair`] share a link and both
//! report `Connected` once each side has applied a local description, the
//! remote description and at least one remote candidate.

use super::peer_connection::{
    ConnectionState, IceCandidate, LocalCandidateCallback, PeerConnectionAdapter, SdpKind,
    SessionDescription,
};
use super::signaling::Role;
use super::{AddCandidateError, ApplyError, WebRTCError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Default, Clone, Copy)]
struct Readiness {
    local: bool,
    remote: bool,
    candidate: bool,
}

impl Readiness {
    fn ready(&self) -> bool {
        self.local && self.remote && self.candidate
    }
}

struct Link {
    sides: Mutex<[Readiness; 2]>,
    states: [watch::Sender<ConnectionState>; 2],
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sides: Mutex::new([Readiness::default(); 2]),
            states: [
                watch::channel(ConnectionState::New).0,
                watch::channel(ConnectionState::New).0,
            ],
        })
    }

    fn update(&self, slot: usize, f: impl FnOnce(&mut Readiness)) {
        let both_ready = {
            let mut sides = self.sides.lock();
            f(&mut sides[slot]);
            sides[0].ready() && sides[1].ready()
        };
        if both_ready {
            for state in &self.states {
                state.send_if_modified(|s| {
                    if matches!(s, ConnectionState::New | ConnectionState::Checking) {
                        *s = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}

#[derive(Default)]
struct Script {
    created: Option<SessionDescription>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    add_calls: usize,
    closed: bool,
}

pub(crate) struct ScriptedPeer {
    role: Role,
    slot: usize,
    link: Arc<Link>,
    script: Mutex<Script>,
    callback: Mutex<Option<LocalCandidateCallback>>,
    local_candidates: Vec<IceCandidate>,
    fail_create: bool,
    reject_remote: bool,
}

impl ScriptedPeer {
    /// A peer whose counterpart never shows up
    pub(crate) fn new(role: Role) -> Self {
        Self::on_link(role, Link::new())
    }

    /// Two peers that connect to each other
    pub(crate) fn pair() -> (Self, Self) {
        let link = Link::new();
        (
            Self::on_link(Role::Offerer, link.clone()),
            Self::on_link(Role::Answerer, link),
        )
    }

    fn on_link(role: Role, link: Arc<Link>) -> Self {
        let slot = match role {
            Role::Offerer => 0,
            Role::Answerer => 1,
        };
        let host = 10 + slot;
        let local_candidates = (0..2)
            .map(|i| IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 10.0.0.{} {} typ host",
                    i + 1,
                    host,
                    50000 + i
                ),
                sdp_mline_index: 0,
                sdp_mid: "0".to_string(),
            })
            .collect();
        Self {
            role,
            slot,
            link,
            script: Mutex::new(Script::default()),
            callback: Mutex::new(None),
            local_candidates,
            fail_create: false,
            reject_remote: false,
        }
    }

    pub(crate) fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub(crate) fn rejecting_remote(mut self) -> Self {
        self.reject_remote = true;
        self
    }

    pub(crate) fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.script.lock().remote.clone()
    }

    pub(crate) fn local_description(&self) -> Option<SessionDescription> {
        self.script.lock().local.clone()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.script.lock().applied.clone()
    }

    pub(crate) fn add_candidate_calls(&self) -> usize {
        self.script.lock().add_calls
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.script.lock().closed
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.link.states[self.slot].send_replace(state);
    }
}

#[async_trait]
impl PeerConnectionAdapter for ScriptedPeer {
    async fn create_local_description(&self, role: Role) -> Result<SessionDescription, ApplyError> {
        if self.fail_create {
            return Err(ApplyError::Rejected("scripted failure".to_string()));
        }
        let mut script = self.script.lock();
        if script.local.is_some() {
            return Err(ApplyError::OutOfOrder("local description already set".to_string()));
        }
        let created = match role {
            Role::Offerer => SessionDescription::new(
                SdpKind::Offer,
                format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 97\r\na=setup:actpass\r\na=mid:0\r\n", self.role),
            ),
            Role::Answerer => {
                if script.remote.as_ref().map(|d| d.kind) != Some(SdpKind::Offer) {
                    return Err(ApplyError::OutOfOrder("no remote offer".to_string()));
                }
                SessionDescription::new(
                    SdpKind::Answer,
                    format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 97\r\na=setup:active\r\na=mid:0\r\n", self.role),
                )
            }
        };
        script.created = Some(created.clone());
        Ok(created)
    }

    async fn apply_local_description(&self, desc: &SessionDescription) -> Result<(), ApplyError> {
        {
            // Like a real peer connection, only the description it created is accepted
            let mut script = self.script.lock();
            if script.created.as_ref() != Some(desc) {
                return Err(ApplyError::Rejected(format!(
                    "{} does not match the last created description",
                    desc.kind
                )));
            }
            script.local = Some(desc.clone());
        }
        self.link.update(self.slot, |r| r.local = true);

        // Gathering starts once the local description is in place
        if let Some(callback) = self.callback.lock().as_ref() {
            for candidate in &self.local_candidates {
                callback(candidate.clone());
            }
        }
        Ok(())
    }

    async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), ApplyError> {
        if self.reject_remote {
            return Err(ApplyError::Rejected("scripted rejection".to_string()));
        }
        {
            let mut script = self.script.lock();
            let expected = match (&script.local, &script.remote) {
                (Some(local), None) if local.kind == SdpKind::Offer => SdpKind::Answer,
                (None, None) => SdpKind::Offer,
                _ => return Err(ApplyError::OutOfOrder("remote description already set".to_string())),
            };
            if desc.kind != expected {
                return Err(ApplyError::WrongKind {
                    expected,
                    actual: desc.kind,
                });
            }
            script.remote = Some(desc.clone());
        }
        self.link.update(self.slot, |r| r.remote = true);
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), AddCandidateError> {
        {
            let mut script = self.script.lock();
            script.add_calls += 1;
            if script.closed || self.connection_state() == ConnectionState::Completed {
                return Err(AddCandidateError::ConnectionFinished);
            }
            if script.remote.is_none() {
                return Err(AddCandidateError::NoRemoteDescription);
            }
            if script.applied.contains(candidate) {
                return Ok(());
            }
            script.applied.push(candidate.clone());
        }
        self.link.update(self.slot, |r| r.candidate = true);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.link.states[self.slot].borrow()
    }

    fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.states[self.slot].subscribe()
    }

    fn on_local_candidate_discovered(&self, callback: LocalCandidateCallback) {
        *self.callback.lock() = Some(callback);
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.script.lock().closed = true;
        self.callback.lock().take();
        self.link.states[self.slot].send_replace(ConnectionState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_candidate_is_a_no_op() {
        let peer = ScriptedPeer::new(Role::Answerer);
        let offer = SessionDescription::new(SdpKind::Offer, "v=0\r\n");
        peer.apply_remote_description(&offer).await.unwrap();

        let candidate = peer.local_candidates()[0].clone();
        peer.add_candidate(&candidate).await.unwrap();
        let state_after_once = peer.connection_state();
        peer.add_candidate(&candidate).await.unwrap();

        assert_eq!(peer.connection_state(), state_after_once);
        assert_eq!(peer.applied_candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn test_rewritten_local_description_is_rejected() {
        let peer = ScriptedPeer::new(Role::Offerer);
        let offer = peer.create_local_description(Role::Offerer).await.unwrap();

        let forced = offer.with_setup_role(Role::Offerer);
        assert!(matches!(
            peer.apply_local_description(&forced).await,
            Err(ApplyError::Rejected(_))
        ));
        assert!(peer.local_description().is_none());

        peer.apply_local_description(&offer).await.unwrap();
        assert_eq!(peer.local_description(), Some(offer));
    }
}
