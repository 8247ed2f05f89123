//! Stream reassembly (C7, spec §4.7): accumulates C2's decoded samples into
//! per-port outbound buffers and emits them at sample-count or byte
//! thresholds, tracking sample-id continuity along the way.

use crate::frame::MAX_PAYLOAD_BYTES;
use crate::stream::decompress::DecodedSamples;
use crate::stream::port_map::{ElementType, PortDescriptor};

/// 2 Msps sample-ids of elapsed coverage before a pending buffer is flushed
/// even if it has room left, bounding publish latency.
pub const EMIT_SAMPLE_ID_THRESHOLD: u32 = 100_000;

/// A buffer ready to hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassembledBuffer {
    pub starting_sample_id: u32,
    pub field_id: u16,
    pub field_index: u16,
    pub element_type: ElementType,
    pub bit_size_pow2: u8,
    pub element_count: usize,
    /// Decoded samples packed tightly at their native bit width
    /// (little-endian per element for byte-or-wider types; LSB-first bit/
    /// nibble packing for the sub-byte u1/u4 types).
    pub raw: Vec<u8>,
    /// Set when this buffer's first sample did not follow the previous
    /// buffer's last expected sample-id.
    pub discontinuity: bool,
}

struct PendingBuffer {
    starting_sample_id: u32,
    field_id: u16,
    field_index: u16,
    element_type: ElementType,
    bit_size_pow2: u8,
    element_count: usize,
    raw: Vec<u8>,
    /// Bits already used in the last byte of `raw`, for sub-byte packing.
    partial_bits: u8,
    sample_ids_covered: u32,
    discontinuity: bool,
}

impl PendingBuffer {
    fn new(port: &PortDescriptor, starting_sample_id: u32) -> Self {
        PendingBuffer {
            starting_sample_id,
            field_id: port.field_id,
            field_index: port.field_index,
            element_type: port.element_type,
            bit_size_pow2: port.bit_size_pow2,
            element_count: 0,
            raw: Vec::new(),
            partial_bits: 0,
            sample_ids_covered: 0,
            discontinuity: false,
        }
    }

    fn push_bit(&mut self, value: u8) {
        if self.partial_bits == 0 {
            self.raw.push(0);
        }
        let last = self.raw.last_mut().unwrap();
        *last |= (value & 1) << self.partial_bits;
        self.partial_bits = (self.partial_bits + 1) % 8;
    }

    fn push_nibble(&mut self, value: u8) {
        if self.partial_bits == 0 {
            self.raw.push(value & 0x0F);
        } else {
            let last = self.raw.last_mut().unwrap();
            *last |= (value & 0x0F) << 4;
        }
        self.partial_bits = (self.partial_bits + 4) % 8;
    }

    fn append(&mut self, samples: &DecodedSamples) {
        match samples {
            DecodedSamples::F32(v) => v.iter().for_each(|x| self.raw.extend_from_slice(&x.to_le_bytes())),
            DecodedSamples::U32(v) => v.iter().for_each(|x| self.raw.extend_from_slice(&x.to_le_bytes())),
            DecodedSamples::I32(v) => v.iter().for_each(|x| self.raw.extend_from_slice(&x.to_le_bytes())),
            DecodedSamples::U16(v) => v.iter().for_each(|x| self.raw.extend_from_slice(&x.to_le_bytes())),
            DecodedSamples::I16(v) => v.iter().for_each(|x| self.raw.extend_from_slice(&x.to_le_bytes())),
            DecodedSamples::U8(v) => self.raw.extend_from_slice(v),
            DecodedSamples::I8(v) => v.iter().for_each(|&x| self.raw.push(x as u8)),
            DecodedSamples::U4(v) => v.iter().for_each(|&x| self.push_nibble(x)),
            DecodedSamples::U1(v) => v.iter().for_each(|&x| self.push_bit(x)),
        }
        self.element_count += samples.len();
    }

    fn into_emitted(self) -> ReassembledBuffer {
        ReassembledBuffer {
            starting_sample_id: self.starting_sample_id,
            field_id: self.field_id,
            field_index: self.field_index,
            element_type: self.element_type,
            bit_size_pow2: self.bit_size_pow2,
            element_count: self.element_count,
            raw: self.raw,
            discontinuity: self.discontinuity,
        }
    }

    fn would_overflow(&self, incoming: &DecodedSamples) -> bool {
        let bits_per_element = 1u32 << self.bit_size_pow2;
        let incoming_bits = bits_per_element as usize * incoming.len();
        let existing_bits = self.raw.len() * 8 - if self.partial_bits > 0 { 8 - self.partial_bits as usize } else { 0 };
        (existing_bits + incoming_bits).div_ceil(8) > MAX_PAYLOAD_BYTES
    }
}

/// Per-port reassembly state. One instance per streaming port.
#[derive(Default)]
pub struct PortReassembly {
    pending: Option<PendingBuffer>,
    expected_next: Option<u32>,
}

impl PortReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded port payload. Returns any buffers that must now be
    /// emitted to the broker, in order.
    pub fn ingest(
        &mut self,
        port: &PortDescriptor,
        sample_id: u32,
        samples: DecodedSamples,
    ) -> Vec<ReassembledBuffer> {
        let mut emitted = Vec::new();

        let discontinuous = self
            .expected_next
            .is_some_and(|expected| expected != sample_id);

        if discontinuous {
            if let Some(mut pending) = self.pending.take() {
                pending.discontinuity = true;
                emitted.push(pending.into_emitted());
            }
        }

        if self.pending.is_none() {
            self.pending = Some(PendingBuffer::new(port, sample_id));
        }

        let pending = self.pending.as_mut().unwrap();
        // Only pre-emptively flush when there's already content to protect;
        // a single arrival that alone exceeds the cap (a heavily
        // run-length-expanded group) is accepted as its own oversized
        // buffer rather than split.
        if pending.element_count > 0 && pending.would_overflow(&samples) {
            let full = self.pending.take().unwrap();
            emitted.push(full.into_emitted());
            self.pending = Some(PendingBuffer::new(port, sample_id));
        }

        let pending = self.pending.as_mut().unwrap();
        pending.append(&samples);
        let advance = samples.len() as u32 * port.downsample;
        pending.sample_ids_covered = pending.sample_ids_covered.saturating_add(advance);
        self.expected_next = Some(sample_id.wrapping_add(advance));

        if pending.sample_ids_covered > EMIT_SAMPLE_ID_THRESHOLD {
            let full = self.pending.take().unwrap();
            emitted.push(full.into_emitted());
        }

        emitted
    }
}
