//! Error kinds surfaced by the driver core (spec §7).
//!
//! Recoverable decode-time anomalies (`Framing`, `LengthCheck`, `LinkCheck`,
//! `FrameIdGap`) are still modeled as `Result` so the caller can choose to
//! log-and-continue, matching how `frames.rs` in the gs_usb driver returns
//! `Option`/`io::Result` from parse helpers even though most callers just log
//! and move on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("framing error: expected sof1=0x55 sof2 high nibble=0x0, got sof1={sof1:#04x} sof2={sof2:#04x}")]
    Framing { sof1: u8, sof2: u8 },

    #[error("length_check mismatch: frame length={length} expected check={expected:#04x} got={actual:#04x}")]
    LengthCheck {
        length: u8,
        expected: u8,
        actual: u8,
    },

    #[error("link_check mismatch: expected={expected:#010x} got={actual:#010x}")]
    LinkCheck { expected: u32, actual: u32 },

    #[error("frame_id gap: expected={expected} received={received}")]
    FrameIdGap { expected: u16, received: u16 },

    #[error("stream decode corrupt on port {port}: {reason}")]
    StreamDecode { port: u16, reason: &'static str },

    #[error("parameter invalid: {0}")]
    ParameterInvalid(String),

    #[error("payload size out of range: {len} words (must be 1..=125)")]
    PayloadSize { len: usize },

    #[error("device not present")]
    NotFound,

    #[error("operation invalid while connection is not closed")]
    InUse,

    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("memory-op offset out of sequence: expected={expected} got={got}")]
    Synchronization { expected: u32, got: u32 },

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("requested size too big: {requested} exceeds limit {limit}")]
    TooBig { requested: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, DriverError>;
