//! PubSub service payload helpers (spec §3 "Service payloads", §4.5, §6).
//!
//! A pubsub data frame's payload is a fixed 32-byte NUL-terminated topic
//! followed by a typed value. `metadata[7:0]` carries the value's type tag;
//! `metadata[9:8]` carries the low 2 bits of the value's byte length — the
//! high bits are implied by the frame's word count, since the topic and
//! value are padded together to the next 32-bit word.
//!
//! The distilled spec's single worked example (Scenario 1) gives a metadata
//! value whose stated result is arithmetically inconsistent with a 32-bit
//! word-aligned frame (see DESIGN.md); this module reconstructs the value
//! length structurally from the frame's word count and the `size_lsb`
//! remainder instead of the literal expression in that scenario, which keeps
//! it internally consistent with the frame model in spec §3.

use crate::error::{DriverError, Result};
use crate::frame::PUBSUB_TOPIC_LEN;

/// Value type tag recognized in `metadata[7:0]`. Only the string tag
/// (`0x20`) is pinned by the spec's worked example; the rest follow the
/// conventional small/ordered scheme documented in DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTypeTag {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x03,
    U64 = 0x04,
    I8 = 0x05,
    I16 = 0x06,
    I32 = 0x07,
    I64 = 0x08,
    F32 = 0x10,
    F64 = 0x11,
    Str = 0x20,
    Bin = 0x21,
}

impl ValueTypeTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => ValueTypeTag::U8,
            0x02 => ValueTypeTag::U16,
            0x03 => ValueTypeTag::U32,
            0x04 => ValueTypeTag::U64,
            0x05 => ValueTypeTag::I8,
            0x06 => ValueTypeTag::I16,
            0x07 => ValueTypeTag::I32,
            0x08 => ValueTypeTag::I64,
            0x10 => ValueTypeTag::F32,
            0x11 => ValueTypeTag::F64,
            0x20 => ValueTypeTag::Str,
            0x21 => ValueTypeTag::Bin,
            _ => return None,
        })
    }
}

/// A decoded pubsub publish: topic plus raw value bytes (the caller
/// interprets `value` per `value_type`, e.g. via [`ValueTypeTag`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    pub value_type: u8,
    pub value: Vec<u8>,
}

const TOPIC_WORDS: usize = PUBSUB_TOPIC_LEN / 4;

/// Pack `topic` into the fixed 32-byte NUL-terminated field.
pub fn pack_topic(topic: &str) -> Result<[u8; PUBSUB_TOPIC_LEN]> {
    let bytes = topic.as_bytes();
    // Reserve room for the terminator.
    if bytes.len() >= PUBSUB_TOPIC_LEN {
        return Err(DriverError::ParameterInvalid(format!(
            "topic {topic:?} exceeds {PUBSUB_TOPIC_LEN} bytes including terminator"
        )));
    }
    let mut buf = [0u8; PUBSUB_TOPIC_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Unpack a topic field. Per spec invariant, the first unused byte is
/// treated as zero/terminator on reception, so this simply stops at the
/// first NUL (or the field end).
pub fn unpack_topic(bytes: &[u8]) -> Result<String> {
    if bytes.len() < PUBSUB_TOPIC_LEN {
        return Err(DriverError::ParameterInvalid(
            "topic field shorter than 32 bytes".to_string(),
        ));
    }
    let end = bytes[..PUBSUB_TOPIC_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(PUBSUB_TOPIC_LEN);
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|_| DriverError::ParameterInvalid("topic is not valid utf-8".to_string()))
}

/// Build the metadata word and 32-bit payload words for a pubsub publish.
pub fn encode_publish(topic: &str, value_type: u8, value: &[u8]) -> Result<(u16, Vec<u32>)> {
    let topic_bytes = pack_topic(topic)?;

    let mut bytes = Vec::with_capacity(PUBSUB_TOPIC_LEN + value.len());
    bytes.extend_from_slice(&topic_bytes);
    bytes.extend_from_slice(value);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    let size_lsb = (value.len() % 4) as u16;
    let metadata = (value_type as u16) | (size_lsb << 8);

    let words = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    Ok((metadata, words))
}

/// Recover a [`PubSubMessage`] from a decoded data frame's `metadata` and
/// `payload` (the 32-bit-word-aligned byte slice C1 hands back).
pub fn decode_publish(metadata: u16, payload: &[u8]) -> Result<PubSubMessage> {
    if payload.len() < PUBSUB_TOPIC_LEN {
        return Err(DriverError::ParameterInvalid(
            "pubsub payload shorter than topic field".to_string(),
        ));
    }
    let value_type = (metadata & 0xFF) as u8;
    let size_lsb = ((metadata >> 8) & 0x03) as usize;

    let value_words = payload.len() / 4 - TOPIC_WORDS;
    let value_len = if size_lsb == 0 {
        value_words * 4
    } else {
        value_words.saturating_sub(1) * 4 + size_lsb
    };

    let topic = unpack_topic(&payload[..PUBSUB_TOPIC_LEN])?;
    let value_end = PUBSUB_TOPIC_LEN + value_len;
    if value_end > payload.len() {
        return Err(DriverError::ParameterInvalid(
            "pubsub value length exceeds payload".to_string(),
        ));
    }
    let value = payload[PUBSUB_TOPIC_LEN..value_end].to_vec();

    Ok(PubSubMessage {
        topic,
        value_type,
        value,
    })
}
