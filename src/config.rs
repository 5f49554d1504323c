//! Listener configuration.
//!
//! Defaults match the constants below; every field can be overridden through
//! serde (`#[serde(default)]`) or directly on the struct.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum payload carried by a single data frame (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum encoded frame size accepted from the wire.
/// Slightly larger than MAX_PAYLOAD_SIZE to leave room for the envelope.
pub const MAX_FRAME_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Timeout for the initial TCP connect to the signaling server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one complete join handshake (challenge included).
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command channel capacity for the listener actor.
pub const DEFAULT_COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the listener event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 64;

/// Frames queued for the control socket before data writers wait.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Chunks buffered per inbound byte channel before it is ended.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_frame_size: u64,
    pub command_channel_size: usize,
    pub event_channel_size: usize,
    pub outbound_queue_size: usize,
    pub channel_buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            max_frame_size: MAX_FRAME_SIZE,
            command_channel_size: DEFAULT_COMMAND_CHANNEL_SIZE,
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Reconnection behaviour of a control connection after it drops.
///
/// Delays double after each failed attempt, capped at `max_delay`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempt < max)
    }
}
