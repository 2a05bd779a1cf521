//! Broadcast relay server
//!
//! A stateless fan-out bus: every valid envelope received from any
//! participant is rebroadcast to all connected participants, the sender
//! included. Nothing is stored, so late joiners never see earlier traffic.

use crate::config::RelayConfig;
use crate::webrtc::SignalEnvelope;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Frames buffered per participant before it starts lagging
const RELAY_BUFFER: usize = 1024;

struct RelayState {
    bus: broadcast::Sender<String>,
    participants: AtomicUsize,
    shutdown: CancellationToken,
}

/// Build the relay router with the WebSocket route at `path`
pub fn router(path: &str, shutdown: CancellationToken) -> Router {
    let (bus, _) = broadcast::channel(RELAY_BUFFER);
    let state = Arc::new(RelayState {
        bus,
        participants: AtomicUsize::new(0),
        shutdown,
    });

    Router::new()
        .route(path, get(relay_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the relay on an already bound listener until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    path: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("Signaling relay listening on ws://{}{}", addr, path);

    let app = router(path, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Bind according to `config` and serve until `shutdown` fires
pub async fn run_relay_server(config: &RelayConfig, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    serve(listener, &config.path, shutdown).await
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "participants": state.participants.load(Ordering::Relaxed),
    }))
}

async fn relay_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_participant(socket, state))
        .into_response()
}

async fn handle_participant(socket: WebSocket, state: Arc<RelayState>) {
    let participant = uuid::Uuid::new_v4();
    let count = state.participants.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Participant {} joined ({} connected)", participant, count);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut bus_rx = state.bus.subscribe();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            frame = bus_rx.recv() => match frame {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Participant {} lagged, {} frames skipped", participant, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str();
                    match SignalEnvelope::from_json(text) {
                        Ok(envelope) => {
                            debug!("Relaying {} frame from {}", envelope.side(), participant);
                            let _ = state.bus.send(text.to_string());
                        }
                        Err(e) => debug!("Dropping malformed frame from {}: {}", participant, e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Participant {} connection error: {}", participant, e);
                    break;
                }
            }
        }
    }

    let count = state.participants.fetch_sub(1, Ordering::Relaxed) - 1;
    info!("Participant {} left ({} connected)", participant, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{SendError, SignalingChannel};
    use crate::transport::websocket::{RelayChannel, ReconnectPolicy};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_relay() -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = serve(listener, "/chat", token).await;
        });
        (format!("ws://{}/chat", addr), shutdown)
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let (endpoint, shutdown) = start_relay().await;
        let offerer = RelayChannel::connect(&endpoint, ReconnectPolicy::default()).await.unwrap();
        let answerer = RelayChannel::connect(&endpoint, ReconnectPolicy::default()).await.unwrap();
        let mut offerer_sub = offerer.subscribe();
        let mut answerer_sub = answerer.subscribe();

        // The relay registers a participant slightly after the handshake
        // completes, so rebroadcast until the frame comes through.
        let envelope = SignalEnvelope::offer_data("streamer", "v=0\r\n");
        let mut received = None;
        for _ in 0..50 {
            offerer.send(&envelope).unwrap();
            if let Ok(got) = timeout(Duration::from_millis(100), answerer_sub.recv()).await {
                received = got;
                break;
            }
        }
        assert_eq!(received, Some(envelope.clone()));

        let echo = timeout(Duration::from_secs(5), offerer_sub.recv()).await.unwrap();
        assert_eq!(echo, Some(envelope));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_send_fails_while_relay_is_down() {
        let (endpoint, shutdown) = start_relay().await;
        let policy = ReconnectPolicy {
            first_delay: Duration::from_secs(60),
            retry_delay: Duration::from_secs(60),
        };
        let channel = RelayChannel::connect(&endpoint, policy).await.unwrap();
        assert!(channel.is_connected());

        shutdown.cancel();
        timeout(Duration::from_secs(5), async {
            while channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            channel.send(&SignalEnvelope::offer_data("streamer", "x")),
            Err(SendError::NotConnected)
        );

        channel.close();
        assert_eq!(
            channel.send(&SignalEnvelope::offer_data("streamer", "x")),
            Err(SendError::Closed)
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = format!("ws://{}/chat", addr);

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, "/chat", shutdown.clone()));

        let policy = ReconnectPolicy {
            first_delay: Duration::ZERO,
            retry_delay: Duration::from_millis(100),
        };
        let channel = RelayChannel::connect(&endpoint, policy).await.unwrap();
        let mut sub = channel.subscribe();

        shutdown.cancel();
        server.await.unwrap().unwrap();
        timeout(Duration::from_secs(5), async {
            while channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Same address, fresh relay
        let listener = TcpListener::bind(addr).await.unwrap();
        let restarted = CancellationToken::new();
        tokio::spawn(serve(listener, "/chat", restarted.clone()));

        timeout(Duration::from_secs(10), async {
            while !channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let envelope = SignalEnvelope::offer_data("streamer", "x");
        let mut echo = None;
        for _ in 0..50 {
            let _ = channel.send(&envelope);
            if let Ok(got) = timeout(Duration::from_millis(100), sub.recv()).await {
                echo = got;
                break;
            }
        }
        assert_eq!(echo, Some(envelope));

        channel.close();
        restarted.cancel();
    }
}
