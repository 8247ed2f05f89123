//! Construction-time configuration for a per-device driver instance.
//!
//! The teacher's `Cli`/`CanServerConfig` structs are the idiomatic way this
//! codebase expresses typed, serde-capable configuration; this mirrors that
//! shape without the CLI-parsing attributes, which belong to the (out of
//! scope) surrounding application.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::suppressor::SuppressionMode;

/// §4.4/§9: the pubsub-flush/link-disconnect/ll-close-pend states have no
/// documented timeout in the source; the spec asks the implementer to pick
/// one and recommends 1s. Recorded as an Open Question decision in DESIGN.md.
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Device generation: affects whether the current-range suppressor (C3)
    /// and the legacy stream-frame header are active.
    pub generation: DeviceGeneration,

    /// Timeout applied while waiting in `pubsub-flush` for the echoed pong.
    #[serde(with = "duration_millis")]
    pub pubsub_flush_timeout: Duration,
    /// Timeout applied while waiting in `link-disconnect` for the ack.
    #[serde(with = "duration_millis")]
    pub link_disconnect_timeout: Duration,
    /// Timeout applied while waiting in `ll-close-pend` to advance.
    #[serde(with = "duration_millis")]
    pub ll_close_pend_timeout: Duration,

    /// Ceiling the event loop blocks on when both queues are empty (§5: 5s).
    #[serde(with = "duration_millis")]
    pub queue_wait_ceiling: Duration,

    /// Current-range suppressor configuration (C3); ignored on devices
    /// without a front-panel current-range channel.
    pub suppressor: SuppressorConfig,

    /// Per-device send-side window size for memory-op writes (C6), bytes.
    pub memory_write_buffer_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            generation: DeviceGeneration::Streaming,
            pubsub_flush_timeout: DEFAULT_STATE_TIMEOUT,
            link_disconnect_timeout: DEFAULT_STATE_TIMEOUT,
            ll_close_pend_timeout: DEFAULT_STATE_TIMEOUT,
            queue_wait_ceiling: Duration::from_secs(5),
            suppressor: SuppressorConfig::default(),
            memory_write_buffer_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceGeneration {
    /// The older streaming-sample device (front-panel current-range
    /// suppressor, legacy stream-frame header).
    Streaming,
    /// The newer framed-protocol device.
    Framed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SuppressorConfig {
    pub mode: SuppressionMode,
    /// Samples replaced before a transition, clamped to the spec's max of 8.
    pub pre: u8,
    /// Samples replaced after a transition, clamped to the spec's max of 8.
    pub post: u8,
}

impl Default for SuppressorConfig {
    fn default() -> Self {
        Self {
            mode: SuppressionMode::Interp,
            pre: 1,
            post: 1,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
