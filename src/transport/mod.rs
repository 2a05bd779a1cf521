//! Transport layer for signaling
//!
//! Carries envelopes between the two peers:
//! - The `SignalingChannel` broadcast abstraction and an in-process bus
//! - A WebSocket client for the relay, with automatic reconnect
//! - The relay server itself

pub mod channel;
pub mod relay_server;
pub mod websocket;

pub use channel::{
    ConnectError, LocalChannel, SendError, SignalingChannel, Subscription, SubscriptionGuard,
};
pub use relay_server::run_relay_server;
pub use websocket::{ReconnectPolicy, RelayChannel};
