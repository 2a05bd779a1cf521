//! Retry-until-acknowledged publishing
//!
//! A publisher rebroadcasts one envelope on a fixed cadence from a
//! background task until its stop predicate holds or its cancellation
//! token fires. The caller is never blocked: it awaits the returned
//! [`RetryTask`] whenever it wants the outcome.

use super::signaling::SignalEnvelope;
use crate::transport::SignalingChannel;
use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// How a publisher finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The stop predicate held; `sends` broadcasts went out
    Completed { sends: u32 },
    /// The cancellation token fired
    Cancelled { sends: u32 },
    /// The broadcast cap was reached before the predicate held
    Exhausted { sends: u32 },
}

impl RetryOutcome {
    pub fn sends(&self) -> u32 {
        match *self {
            RetryOutcome::Completed { sends }
            | RetryOutcome::Cancelled { sends }
            | RetryOutcome::Exhausted { sends } => sends,
        }
    }
}

/// Starts background rebroadcast loops on a shared channel
#[derive(Clone)]
pub struct RetryPublisher {
    channel: Arc<dyn SignalingChannel>,
    interval: Duration,
    max_sends: Option<u32>,
}

impl RetryPublisher {
    pub fn new(channel: Arc<dyn SignalingChannel>, interval: Duration) -> Self {
        Self {
            channel,
            interval,
            max_sends: None,
        }
    }

    /// Give up after `max_sends` broadcasts
    pub fn with_max_sends(mut self, max_sends: Option<u32>) -> Self {
        self.max_sends = max_sends;
        self
    }

    /// Rebroadcast `payload` until `should_stop` holds or `cancel` fires.
    ///
    /// Each tick checks the predicate, sends, then sleeps. Send failures
    /// are absorbed: the next tick simply tries again.
    pub fn start<F>(&self, payload: SignalEnvelope, should_stop: F, cancel: CancellationToken) -> RetryTask
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let channel = self.channel.clone();
        let interval = self.interval;
        let max_sends = self.max_sends;

        let handle = tokio::spawn(async move {
            let mut sends: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return RetryOutcome::Cancelled { sends };
                }
                if should_stop() {
                    return RetryOutcome::Completed { sends };
                }
                if max_sends.is_some_and(|max| sends >= max) {
                    return RetryOutcome::Exhausted { sends };
                }

                match channel.send(&payload) {
                    Ok(()) => debug!("Broadcast {} (attempt {})", payload.side(), sends + 1),
                    Err(e) => debug!("Broadcast {} failed, retrying next tick: {}", payload.side(), e),
                }
                sends += 1;

                tokio::select! {
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled { sends },
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        RetryTask { handle }
    }
}

/// Handle to a running publisher; resolves exactly once with its outcome
pub struct RetryTask {
    handle: JoinHandle<RetryOutcome>,
}

impl RetryTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for RetryTask {
    type Output = Result<RetryOutcome, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}
