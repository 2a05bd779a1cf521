//! WebSocket relay client
//!
//! Keeps a connection to the broadcast relay open for the lifetime of the
//! channel, reconnecting on drop with a two-tier delay schedule.

use super::channel::{ConnectError, SendError, SignalingChannel, Subscription, SUBSCRIBER_BUFFER};
use crate::config::SignalingConfig;
use crate::webrtc::SignalEnvelope;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay schedule between reconnect attempts: a first delay, then a fixed
/// delay for every further attempt, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub first_delay: Duration,
    pub retry_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.first_delay
        } else {
            self.retry_delay
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SignalingConfig::default())
    }
}

impl From<&SignalingConfig> for ReconnectPolicy {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            first_delay: Duration::from_millis(config.first_reconnect_delay_ms),
            retry_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

/// State shared between the channel and its connection supervisor
struct Inner {
    endpoint: String,
    inbound: Mutex<Option<broadcast::Sender<SignalEnvelope>>>,
    /// `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn dispatch(&self, text: &str) {
        match SignalEnvelope::from_json(text) {
            Ok(envelope) => {
                if let Some(sender) = self.inbound.lock().as_ref() {
                    let _ = sender.send(envelope);
                }
            }
            Err(e) => debug!("Dropping malformed relay frame: {}", e),
        }
    }
}

/// [`SignalingChannel`] backed by a WebSocket connection to the relay
pub struct RelayChannel {
    inner: Arc<Inner>,
}

impl RelayChannel {
    /// Connect to the relay.
    ///
    /// Only the first attempt is surfaced; later drops are recovered in the
    /// background according to `policy` until [`SignalingChannel::close`].
    pub async fn connect(endpoint: &str, policy: ReconnectPolicy) -> Result<Self, ConnectError> {
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ConnectError::InvalidEndpoint(endpoint.to_string()));
        }

        let stream = open(endpoint).await?;
        info!("Connected to signaling relay {}", endpoint);

        let (inbound, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let inner = Arc::new(Inner {
            endpoint: endpoint.to_string(),
            inbound: Mutex::new(Some(inbound)),
            outbound: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.outbound.lock() = Some(tx);
        tokio::spawn(supervise(inner.clone(), (stream, rx), policy));

        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }
}

impl SignalingChannel for RelayChannel {
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), SendError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        let text = envelope.to_json().map_err(|e| SendError::Encode(e.to_string()))?;
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(SendError::NotConnected)?;
        tx.send(text).map_err(|_| SendError::NotConnected)
    }

    fn subscribe(&self) -> Subscription {
        match self.inner.inbound.lock().as_ref() {
            Some(sender) => Subscription::new(sender.subscribe()),
            None => Subscription::closed(),
        }
    }

    fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Closing signaling channel to {}", self.inner.endpoint);
        }
        self.inner.shutdown.cancel();
        self.inner.outbound.lock().take();
        self.inner.inbound.lock().take();
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open(endpoint: &str) -> Result<WsStream, ConnectError> {
    let (stream, _) = connect_async(endpoint)
        .await
        .map_err(|e| ConnectError::Unreachable(format!("{}: {}", endpoint, e)))?;
    Ok(stream)
}

/// Drive the live connection, then reconnect until shutdown
async fn supervise(
    inner: Arc<Inner>,
    first: (WsStream, mpsc::UnboundedReceiver<String>),
    policy: ReconnectPolicy,
) {
    let mut stream = Some(first);
    let mut attempt: u32 = 0;

    loop {
        if let Some((ws, rx)) = stream.take() {
            attempt = 0;
            run_connection(&inner, ws, rx).await;
        }
        if inner.shutdown.is_cancelled() {
            break;
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting to {} in {:?} (attempt {})", inner.endpoint, delay, attempt);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match open(&inner.endpoint).await {
            Ok(ws) => {
                info!("Reconnected to signaling relay {}", inner.endpoint);
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.lock() = Some(tx);
                stream = Some((ws, rx));
            }
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }

    debug!("Signaling supervisor for {} stopped", inner.endpoint);
}

/// Pump one connection until it drops or the channel shuts down
async fn run_connection(inner: &Inner, ws: WsStream, mut rx: mpsc::UnboundedReceiver<String>) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(text) = rx.recv() => {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.dispatch(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Signaling relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Signaling relay error: {}", e);
                    break;
                }
            }
        }
    }

    inner.outbound.lock().take();
}
