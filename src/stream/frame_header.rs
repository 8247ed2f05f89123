//! Legacy stream-frame header (spec §3 "Stream frame (older device)"):
//! a packed 32-bit header prefixing each 512-byte bulk-in frame on the
//! streaming-sample device, ahead of the per-port decompressed payload
//! C2/C7 consume.
//!
//! The spec gives the header's fields (`frame_id`, `port_id`, payload
//! length in bytes) but not their exact bit widths. This module's packing
//! (11/5/16 bits, little-endian, summing to 32) is an implementer decision
//! recorded in DESIGN.md, chosen to give `frame_id` the same 11-bit/2048
//! range as the C1 frame codec's `frame_id` (spec §3 invariants) and
//! `port_id` 5 bits (0..31, covering the reserved 0..15 and data 16+ ranges
//! spec §3 describes).

use crate::error::{DriverError, Result};

const FRAME_ID_BITS: u32 = 11;
const PORT_ID_BITS: u32 = 5;
const FRAME_ID_MASK: u32 = (1 << FRAME_ID_BITS) - 1;
const PORT_ID_MASK: u32 = (1 << PORT_ID_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrameHeader {
    pub frame_id: u16,
    pub port_id: u16,
    pub payload_len: u16,
}

impl StreamFrameHeader {
    pub const LEN: usize = 4;

    pub fn encode(self) -> [u8; 4] {
        let word = (self.frame_id as u32 & FRAME_ID_MASK)
            | ((self.port_id as u32 & PORT_ID_MASK) << FRAME_ID_BITS)
            | ((self.payload_len as u32) << (FRAME_ID_BITS + PORT_ID_BITS));
        word.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < Self::LEN {
            return Err(DriverError::Framing {
                sof1: bytes.first().copied().unwrap_or(0),
                sof2: 0,
            });
        }
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let frame_id = (word & FRAME_ID_MASK) as u16;
        let port_id = ((word >> FRAME_ID_BITS) & PORT_ID_MASK) as u16;
        let payload_len = (word >> (FRAME_ID_BITS + PORT_ID_BITS)) as u16;
        let rest = &bytes[Self::LEN..];
        if rest.len() < payload_len as usize {
            return Err(DriverError::Framing { sof1: 0, sof2: 0 });
        }
        Ok((
            StreamFrameHeader {
                frame_id,
                port_id,
                payload_len,
            },
            &rest[..payload_len as usize],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_roundtrips() {
        let header = StreamFrameHeader {
            frame_id: 1234,
            port_id: 17,
            payload_len: 64,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0xAAu8; 64]);
        let (decoded, payload) = StreamFrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload.len(), 64);
        assert!(payload.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn frame_id_wraps_within_eleven_bits() {
        let header = StreamFrameHeader {
            frame_id: 2047,
            port_id: 0,
            payload_len: 0,
        };
        let bytes = header.encode();
        let (decoded, _) = StreamFrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_id, 2047);
    }
}
