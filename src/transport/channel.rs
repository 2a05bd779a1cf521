//! Signaling channel abstraction
//!
//! A channel is a fire-and-forget broadcast bus: no acknowledgment, no
//! addressing, and every participant (the sender included) receives every
//! envelope.

use crate::webrtc::SignalEnvelope;
use log::{debug, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Per-subscriber buffer before slow subscribers start lagging
pub(crate) const SUBSCRIBER_BUFFER: usize = 256;

/// The relay could not be reached
#[derive(Debug)]
pub enum ConnectError {
    /// The endpoint is not a usable WebSocket URL
    InvalidEndpoint(String),
    /// The connection attempt failed
    Unreachable(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidEndpoint(msg) => write!(f, "Invalid endpoint: {}", msg),
            ConnectError::Unreachable(msg) => write!(f, "Relay unreachable: {}", msg),
        }
    }
}

impl Error for ConnectError {}

/// A broadcast did not leave this process. Transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The transport is down and reconnecting
    NotConnected,
    /// The channel was closed
    Closed,
    /// The envelope could not be encoded
    Encode(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotConnected => write!(f, "Signaling channel not connected"),
            SendError::Closed => write!(f, "Signaling channel closed"),
            SendError::Encode(msg) => write!(f, "Failed to encode envelope: {}", msg),
        }
    }
}

impl Error for SendError {}

/// Broadcast bus shared by every coordinator in a process
pub trait SignalingChannel: Send + Sync {
    /// Broadcast an envelope to every participant
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), SendError>;

    /// Receive every envelope delivered from now on
    fn subscribe(&self) -> Subscription;

    /// Release the connection. Subscriptions end once drained.
    fn close(&self);
}

/// Scoped receive handle. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<SignalEnvelope>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<SignalEnvelope>) -> Self {
        Self { rx }
    }

    /// A subscription on a channel that is already closed
    pub(crate) fn closed() -> Self {
        let (_, rx) = broadcast::channel(1);
        Self { rx }
    }

    /// Next envelope in receipt order, `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} envelopes skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Invoke `handler` once per envelope until the returned guard is dropped
    pub fn spawn_handler<F>(mut self, mut handler: F) -> SubscriptionGuard
    where
        F: FnMut(SignalEnvelope) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                handler(envelope);
            }
            debug!("Subscription handler finished");
        });
        SubscriptionGuard { handle }
    }
}

/// Detaches a spawned subscription handler on drop
pub struct SubscriptionGuard {
    handle: JoinHandle<()>,
}

impl SubscriptionGuard {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Decides whether an envelope is lost in transit
pub type DropFilter = Box<dyn Fn(&SignalEnvelope) -> bool + Send + Sync>;

/// In-process broadcast bus
pub struct LocalChannel {
    sender: Mutex<Option<broadcast::Sender<SignalEnvelope>>>,
    drop_filter: Option<DropFilter>,
    sent: AtomicU64,
}

impl LocalChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            sender: Mutex::new(Some(sender)),
            drop_filter: None,
            sent: AtomicU64::new(0),
        }
    }

    /// A bus that silently loses every envelope for which `filter` is true
    pub fn with_drop_filter(filter: impl Fn(&SignalEnvelope) -> bool + Send + Sync + 'static) -> Self {
        Self {
            drop_filter: Some(Box::new(filter)),
            ..Self::new()
        }
    }

    /// Envelopes accepted by `send`, lost ones included
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingChannel for LocalChannel {
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), SendError> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(SendError::Closed)?;
        self.sent.fetch_add(1, Ordering::Relaxed);

        if self.drop_filter.as_ref().is_some_and(|lost| lost(envelope)) {
            debug!("Envelope from {} lost in transit", envelope.side());
            return Ok(());
        }

        // No subscribers is not an error on a broadcast bus
        let _ = sender.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        match self.sender.lock().as_ref() {
            Some(sender) => Subscription::new(sender.subscribe()),
            None => Subscription::closed(),
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_envelope() {
        let channel = LocalChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        channel.send(&SignalEnvelope::offer_data("streamer", "a")).unwrap();
        channel.send(&SignalEnvelope::offer_data("reciver", "b")).unwrap();

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await.unwrap().side(), "streamer");
            assert_eq!(sub.recv().await.unwrap().side(), "reciver");
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_history() {
        let channel = LocalChannel::new();
        channel.send(&SignalEnvelope::offer_data("streamer", "early")).unwrap();

        let mut late = channel.subscribe();
        channel.send(&SignalEnvelope::offer_data("streamer", "late")).unwrap();
        assert_eq!(
            late.recv().await,
            Some(SignalEnvelope::offer_data("streamer", "late"))
        );
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let channel = LocalChannel::new();
        let mut sub = channel.subscribe();
        channel.close();
        assert_eq!(sub.recv().await, None);
        assert_eq!(
            channel.send(&SignalEnvelope::offer_data("streamer", "x")),
            Err(SendError::Closed)
        );
        assert!(channel.subscribe().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_filter_loses_envelopes() {
        let channel = LocalChannel::with_drop_filter(|env| env.side() == "streamer");
        let mut sub = channel.subscribe();

        channel.send(&SignalEnvelope::offer_data("streamer", "lost")).unwrap();
        channel.send(&SignalEnvelope::offer_data("reciver", "kept")).unwrap();

        assert_eq!(sub.recv().await.unwrap().side(), "reciver");
        assert_eq!(channel.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_handler_detaches_on_drop() {
        let channel = LocalChannel::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let guard = channel.subscribe().spawn_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.send(&SignalEnvelope::offer_data("streamer", "1")).unwrap();
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(!guard.is_finished());
        drop(guard);
        tokio::task::yield_now().await;
        channel.send(&SignalEnvelope::offer_data("streamer", "2")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_finishes_when_channel_closes() {
        let channel = LocalChannel::new();
        let guard = channel.subscribe().spawn_handler(|_| {});

        channel.close();
        for _ in 0..50 {
            if guard.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(guard.is_finished());
    }
}
