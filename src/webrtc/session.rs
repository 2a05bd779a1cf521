//! Offer/answer negotiation coordinator
//!
//! One coordinator drives one role of the handshake:
//! - Listens for the peer's description and candidates on the shared channel
//! - Publishes its own description and every local candidate until acknowledged
//! - Owns one cancellation token shared by every publisher it starts
//!
//! The coordinator runs as a single task. Background publishers only read
//! predicates (an atomic flag or the connection state watch) and never touch
//! coordinator state.

use super::peer_connection::{ConnectionState, IceCandidate, PeerConnectionAdapter, SessionDescription};
use super::retry::{RetryOutcome, RetryPublisher, RetryTask};
use super::signaling::{self, Inbound, Role, SideTags, SignalEnvelope};
use super::NegotiationError;
use crate::config::NegotiationConfig;
use crate::transport::{SignalingChannel, Subscription};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Progress of one coordinator through the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    LocalDescriptionReady,
    AwaitingRemoteDescription,
    /// Terminal success: both descriptions are in place
    RemoteDescriptionApplied,
    /// Terminal failure, reached on cancellation or adapter error
    Aborted,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "Idle",
            NegotiationState::LocalDescriptionReady => "LocalDescriptionReady",
            NegotiationState::AwaitingRemoteDescription => "AwaitingRemoteDescription",
            NegotiationState::RemoteDescriptionApplied => "RemoteDescriptionApplied",
            NegotiationState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// How a coordinator that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Torn down on request
    Cancelled,
    /// The peer connection was closed underneath the coordinator
    ConnectionClosed,
}

/// Drives one side of the handshake over a shared signaling channel
pub struct NegotiationCoordinator {
    role: Role,
    adapter: Arc<dyn PeerConnectionAdapter>,
    channel: Arc<dyn SignalingChannel>,
    tags: SideTags,
    description_publisher: RetryPublisher,
    candidate_publisher: RetryPublisher,
    cancel: CancellationToken,
    state_tx: watch::Sender<NegotiationState>,
    remote_arrived: Arc<AtomicBool>,
    remote_applied: bool,
    publishers: FuturesUnordered<RetryTask>,
    applied_candidates: HashSet<IceCandidate>,
    pending_candidates: Vec<IceCandidate>,
}

impl NegotiationCoordinator {
    pub fn new(
        role: Role,
        adapter: Arc<dyn PeerConnectionAdapter>,
        channel: Arc<dyn SignalingChannel>,
        negotiation: &NegotiationConfig,
        tags: SideTags,
    ) -> Self {
        let description_publisher = RetryPublisher::new(channel.clone(), negotiation.retry_interval());
        let candidate_publisher = description_publisher
            .clone()
            .with_max_sends(negotiation.candidate_max_broadcasts);
        let (state_tx, _) = watch::channel(NegotiationState::Idle);

        Self {
            role,
            adapter,
            channel,
            tags,
            description_publisher,
            candidate_publisher,
            cancel: CancellationToken::new(),
            state_tx,
            remote_arrived: Arc::new(AtomicBool::new(false)),
            remote_applied: false,
            publishers: FuturesUnordered::new(),
            applied_candidates: HashSet::new(),
            pending_candidates: Vec::new(),
        }
    }

    /// Start the coordinator task
    pub fn spawn(self) -> CoordinatorHandle {
        let role = self.role;
        let cancel = self.cancel.clone();
        let state_rx = self.state_tx.subscribe();
        let task = tokio::spawn(self.run());

        CoordinatorHandle {
            role,
            cancel,
            state_rx,
            task: Some(task),
        }
    }

    async fn run(mut self) -> Result<NegotiationOutcome, NegotiationError> {
        // Subscribe before anything is published so no reply can be missed
        let mut subscription = Some(self.channel.subscribe());

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
        self.adapter.on_local_candidate_discovered(Box::new(move |candidate| {
            let _ = candidate_tx.send(candidate);
        }));
        let mut connection = self.adapter.watch_connection_state();
        let mut connection_open = true;

        let started = match self.role {
            Role::Offerer => self.begin_offer().await,
            Role::Answerer => {
                self.set_state(NegotiationState::AwaitingRemoteDescription);
                Ok(())
            }
        };
        if let Err(e) = started {
            return self.abort(e).await;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    return Ok(NegotiationOutcome::Cancelled);
                }
                envelope = next_envelope(&mut subscription) => match envelope {
                    Some(envelope) => {
                        if let Err(e) = self.handle_envelope(envelope).await {
                            return self.abort(e).await;
                        }
                    }
                    None => {
                        subscription = None;
                        if !self.remote_applied {
                            return self.abort(NegotiationError::ChannelClosed).await;
                        }
                        warn!("[{}] Signaling channel closed after negotiation", self.role);
                    }
                },
                Some(candidate) = candidate_rx.recv() => self.publish_local_candidate(candidate),
                Some(finished) = self.publishers.next(), if !self.publishers.is_empty() => {
                    log_publisher(self.role, finished);
                }
                changed = connection.changed(), if connection_open => {
                    if changed.is_err() {
                        connection_open = false;
                        continue;
                    }
                    let state = *connection.borrow_and_update();
                    info!("[{}] Connection state: {:?}", self.role, state);
                    if state == ConnectionState::Closed {
                        self.teardown().await;
                        return Ok(NegotiationOutcome::ConnectionClosed);
                    }
                }
            }
        }
    }

    async fn begin_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self.prepare_local_description().await?;

        let remote_arrived = self.remote_arrived.clone();
        let envelope = SignalEnvelope::offer_data(self.tags.sdp_tag(self.role), &offer.sdp);
        let task = self.description_publisher.start(
            envelope,
            move || remote_arrived.load(Ordering::SeqCst),
            self.cancel.clone(),
        );
        self.publishers.push(task);

        self.set_state(NegotiationState::AwaitingRemoteDescription);
        Ok(())
    }

    /// Create and apply the local description, then return the copy to
    /// publish with this role's DTLS setup forced.
    ///
    /// The adapter only accepts the description exactly as it created it,
    /// so the rewrite applies to the published copy alone.
    async fn prepare_local_description(&mut self) -> Result<SessionDescription, NegotiationError> {
        let local = self
            .adapter
            .create_local_description(self.role)
            .await
            .map_err(NegotiationError::CreateDescription)?;

        self.adapter
            .apply_local_description(&local)
            .await
            .map_err(NegotiationError::Apply)?;

        self.set_state(NegotiationState::LocalDescriptionReady);
        Ok(local.with_setup_role(self.role))
    }

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) -> Result<(), NegotiationError> {
        match signaling::accept(&envelope, self.role, &self.tags) {
            Some(Inbound::RemoteDescription(sdp)) => self.on_remote_description(sdp).await,
            Some(Inbound::RemoteCandidate(candidate)) => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn on_remote_description(&mut self, sdp: String) -> Result<(), NegotiationError> {
        // Rebroadcasts keep arriving until the peer sees us connect
        if self.remote_arrived.swap(true, Ordering::SeqCst) {
            debug!("[{}] Ignoring repeated remote description", self.role);
            return Ok(());
        }
        info!("[{}] Remote description received", self.role);

        let remote = SessionDescription::new(self.role.peer().local_kind(), sdp);
        self.adapter
            .apply_remote_description(&remote)
            .await
            .map_err(NegotiationError::Apply)?;

        if self.role == Role::Answerer {
            let answer = self.prepare_local_description().await?;
            let connection = self.adapter.watch_connection_state();
            let envelope = SignalEnvelope::offer_data(self.tags.sdp_tag(self.role), &answer.sdp);
            let task = self.description_publisher.start(
                envelope,
                move || connection.borrow().is_established(),
                self.cancel.clone(),
            );
            self.publishers.push(task);
        }

        self.remote_applied = true;
        self.set_state(NegotiationState::RemoteDescriptionApplied);

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!("[{}] Applying {} held candidates", self.role, pending.len());
        }
        for candidate in pending {
            self.on_remote_candidate(candidate).await;
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.adapter.connection_state() == ConnectionState::Completed {
            debug!("[{}] Discarding candidate after ICE completed", self.role);
            return;
        }
        if self.applied_candidates.contains(&candidate) {
            return;
        }
        if !self.remote_applied {
            if !self.pending_candidates.contains(&candidate) {
                debug!("[{}] Holding candidate until the remote description is applied", self.role);
                self.pending_candidates.push(candidate);
            }
            return;
        }

        match self.adapter.add_candidate(&candidate).await {
            Ok(()) => {
                debug!("[{}] Applied remote candidate {}", self.role, candidate.candidate);
                self.applied_candidates.insert(candidate);
            }
            Err(e) => warn!("[{}] Failed to add remote candidate: {}", self.role, e),
        }
    }

    fn publish_local_candidate(&mut self, candidate: IceCandidate) {
        debug!("[{}] Publishing local candidate {}", self.role, candidate.candidate);
        let connection = self.adapter.watch_connection_state();
        let envelope = SignalEnvelope::ice_candidate(self.tags.ice_tag(self.role), &candidate);
        let task = self.candidate_publisher.start(
            envelope,
            move || connection.borrow().is_established(),
            self.cancel.clone(),
        );
        self.publishers.push(task);
    }

    fn set_state(&self, next: NegotiationState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!("[{}] {} -> {}", self.role, previous, next);
        }
    }

    async fn abort(mut self, err: NegotiationError) -> Result<NegotiationOutcome, NegotiationError> {
        error!("[{}] Negotiation aborted: {}", self.role, err);
        self.teardown().await;
        Err(err)
    }

    /// Stop every publisher, release the adapter, then report `Aborted`
    async fn teardown(&mut self) {
        self.cancel.cancel();
        while let Some(finished) = self.publishers.next().await {
            log_publisher(self.role, finished);
        }

        self.adapter.on_local_candidate_discovered(Box::new(|_| {}));
        if let Err(e) = self.adapter.close().await {
            warn!("[{}] {}", self.role, e);
        }
        self.set_state(NegotiationState::Aborted);
    }
}

async fn next_envelope(subscription: &mut Option<Subscription>) -> Option<SignalEnvelope> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn log_publisher(role: Role, finished: Result<RetryOutcome, tokio::task::JoinError>) {
    match finished {
        Ok(outcome @ RetryOutcome::Exhausted { .. }) => {
            warn!("[{}] Publisher gave up after {} broadcasts", role, outcome.sends())
        }
        Ok(outcome) => debug!("[{}] Publisher finished after {} broadcasts: {:?}", role, outcome.sends(), outcome),
        Err(e) => error!("[{}] Publisher task failed: {}", role, e),
    }
}

/// Owner's view of a running coordinator. Dropping it cancels the coordinator.
pub struct CoordinatorHandle {
    role: Role,
    cancel: CancellationToken,
    state_rx: watch::Receiver<NegotiationState>,
    task: Option<JoinHandle<Result<NegotiationOutcome, NegotiationError>>>,
}

impl CoordinatorHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state_rx.clone()
    }

    /// Request teardown. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the coordinator to finish
    pub async fn join(mut self) -> Result<NegotiationOutcome, NegotiationError> {
        let Some(task) = self.task.take() else {
            return Ok(NegotiationOutcome::Cancelled);
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(NegotiationOutcome::Cancelled),
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
