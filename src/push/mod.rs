//! The push channel: a long-lived subscription delivering newly created items.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::Rng;
use serde::Serialize;

use crate::models::settings::TimelineSettings;

pub mod channel;
pub mod listener;
pub mod messages;

pub use listener::PushListener;
pub use messages::{PushMessage, SubscribeHandshake};

/// Text frames of one subscription. The stream ending, or yielding an error, means the connection dropped.
pub type FrameStream = BoxStream<'static, anyhow::Result<String>>;

/// Opens push subscriptions. The transport itself (websocket, SSE, ...) is up to the adapter.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Connects and sends `handshake`, returning the frames of that connection.
    async fn subscribe(&self, handshake: SubscribeHandshake) -> anyhow::Result<FrameStream>;
}

/// Whether the push subscription is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PushConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Torn down, no further reconnection.
    Closed,
}

/// Exponential reconnect delays with random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &TimelineSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_base_delay_ms),
            Duration::from_millis(settings.reconnect_max_delay_ms),
            settings.reconnect_jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
