//! Re-establishing a dropped ComfyUI WebSocket.
//!
//! The session hands its [`ComfyUIClient`] to [`reestablish`], which keeps
//! dialing with growing pauses until a connection is up again or the
//! session is shut down. The client id is reused, so prompts queued before
//! the drop keep routing to this session.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Pause schedule between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause before the first attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Infinite sequence of pauses: `initial`, `initial * m`, ... capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            config,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_delay);
        Some(current)
    }
}

/// Dial `client` until it connects.
///
/// Each attempt is preceded by the next [`Backoff`] pause. Returns `None`
/// once `cancel` fires.
pub async fn reestablish(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    for (attempt, pause) in Backoff::new(config.clone()).enumerate() {
        let attempt = attempt + 1;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }

        tracing::info!(
            client_id = %client.client_id(),
            attempt,
            pause_ms = pause.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.connect() => result,
        };
        match result {
            Ok(conn) => {
                tracing::info!(client_id = %client.client_id(), attempt, "ComfyUI connection restored");
                return Some(conn);
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }

    tracing::debug!(client_id = %client.client_id(), "Reconnect abandoned on shutdown");
    None
}
