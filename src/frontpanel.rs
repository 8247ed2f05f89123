//! Front-panel sample combiner: joins the streaming device's six
//! synchronously-sampled front-panel channels (current, voltage, power,
//! current-range, gpi0, gpi1 — spec §3 "Current-range suppressor" ring
//! buffer fields) back into the joint `{current, voltage, power,
//! current_range, gpi0, gpi1}` record the suppressor (C3) needs, since the
//! wire splits them onto six separate per-port streams (spec §3 "Port map")
//! for topic-routing convenience.
//!
//! This recombination is purely internal to feeding C3 one aligned sample
//! at a time; it is not the cross-port sample-time alignment the spec's
//! Non-goals exclude (that refers to aligning *output* topics for
//! consumers at possibly different downsample rates). All six front-panel
//! ports share `downsample = 1` against the raw 2 Msps timebase, so a
//! single running id per role is sufficient to detect misalignment.

use std::collections::VecDeque;

use crate::stream::decompress::DecodedSamples;
use crate::suppressor::{RawSample, Suppressor, SuppressorOutput};

/// The six front-panel roles, keyed to their port ids (spec §3 Port map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Current,
    Voltage,
    Power,
    CurrentRange,
    Gpi0,
    Gpi1,
}

impl Role {
    pub fn from_port_id(port_id: u16) -> Option<Self> {
        Some(match port_id {
            16 => Role::Current,
            17 => Role::Voltage,
            18 => Role::Power,
            19 => Role::CurrentRange,
            20 => Role::Gpi0,
            21 => Role::Gpi1,
            _ => return None,
        })
    }

    pub fn port_id(self) -> u16 {
        match self {
            Role::Current => 16,
            Role::Voltage => 17,
            Role::Power => 18,
            Role::CurrentRange => 19,
            Role::Gpi0 => 20,
            Role::Gpi1 => 21,
        }
    }
}

#[derive(Default)]
struct RoleQueue {
    next_id: Option<u32>,
    values: VecDeque<f32>,
}

impl RoleQueue {
    fn push(&mut self, sample_id: u32, values: impl IntoIterator<Item = f32>, role: Role) {
        match self.next_id {
            Some(expected) if expected != sample_id => {
                log::warn!(
                    "front-panel role {:?}: sample-id discontinuity (expected={} got={}), resynchronizing",
                    role,
                    expected,
                    sample_id
                );
                self.values.clear();
                self.next_id = Some(sample_id);
            }
            None => self.next_id = Some(sample_id),
            Some(_) => {}
        }
        self.values.extend(values);
    }

    fn pop_front(&mut self) -> Option<(u32, f32)> {
        let id = self.next_id?;
        let v = self.values.pop_front()?;
        self.next_id = Some(id.wrapping_add(1));
        Some((id, v))
    }
}

/// Joins the six front-panel port streams and runs the joint samples
/// through a [`Suppressor`], then splits the (possibly replaced) result
/// back into per-port decoded-sample batches of length 1.
pub struct FrontPanelCombiner {
    suppressor: Suppressor,
    current: RoleQueue,
    voltage: RoleQueue,
    power: RoleQueue,
    range: RoleQueue,
    gpi0: RoleQueue,
    gpi1: RoleQueue,
}

impl FrontPanelCombiner {
    pub fn new(suppressor: Suppressor) -> Self {
        FrontPanelCombiner {
            suppressor,
            current: RoleQueue::default(),
            voltage: RoleQueue::default(),
            power: RoleQueue::default(),
            range: RoleQueue::default(),
            gpi0: RoleQueue::default(),
            gpi1: RoleQueue::default(),
        }
    }

    /// Delay, in samples, the suppressor imposes on every role's stream.
    pub fn delay(&self) -> u64 {
        self.suppressor.delay()
    }

    fn queue_mut(&mut self, role: Role) -> &mut RoleQueue {
        match role {
            Role::Current => &mut self.current,
            Role::Voltage => &mut self.voltage,
            Role::Power => &mut self.power,
            Role::CurrentRange => &mut self.range,
            Role::Gpi0 => &mut self.gpi0,
            Role::Gpi1 => &mut self.gpi1,
        }
    }

    /// Feed one port's decoded samples in. `power` is ignored on input
    /// (the device's own `p` channel is informational only; the suppressor
    /// recomputes `power = i*v` for any sample it touches, per spec §4.3) but
    /// still queued so untouched samples pass the device's own value through.
    pub fn ingest(&mut self, port_id: u16, sample_id: u32, samples: &DecodedSamples) {
        let Some(role) = Role::from_port_id(port_id) else {
            return;
        };
        let values: Vec<f32> = match (role, samples) {
            (Role::Current | Role::Voltage | Role::Power, DecodedSamples::F32(v)) => v.clone(),
            (Role::CurrentRange, DecodedSamples::U4(v)) => v.iter().map(|&x| x as f32).collect(),
            (Role::Gpi0 | Role::Gpi1, DecodedSamples::U1(v)) => v.iter().map(|&x| x as f32).collect(),
            _ => {
                log::warn!("front-panel role {role:?}: unexpected decoded sample shape");
                return;
            }
        };
        self.queue_mut(role).push(sample_id, values, role);
    }

    /// Drain every fully-aligned joint sample currently available, running
    /// each through the suppressor. Returns, per role, the (sample_id,
    /// DecodedSamples) batches ready to hand to that port's reassembly.
    pub fn drain(&mut self) -> Vec<(u16, u32, DecodedSamples)> {
        let mut current_out = Vec::new();
        let mut voltage_out = Vec::new();
        let mut power_out = Vec::new();
        let mut range_out = Vec::new();
        let mut gpi0_out = Vec::new();
        let mut gpi1_out = Vec::new();
        let mut start_id = None;

        loop {
            if self.current.values.is_empty()
                || self.voltage.values.is_empty()
                || self.power.values.is_empty()
                || self.range.values.is_empty()
                || self.gpi0.values.is_empty()
                || self.gpi1.values.is_empty()
            {
                break;
            }
            let ids = [
                self.current.next_id,
                self.voltage.next_id,
                self.power.next_id,
                self.range.next_id,
                self.gpi0.next_id,
                self.gpi1.next_id,
            ];
            if ids.iter().any(|id| *id != ids[0]) {
                log::warn!("front-panel roles misaligned at ids {ids:?}, dropping oldest element per role");
                self.current.pop_front();
                self.voltage.pop_front();
                self.power.pop_front();
                self.range.pop_front();
                self.gpi0.pop_front();
                self.gpi1.pop_front();
                continue;
            }

            let (id, current) = self.current.pop_front().unwrap();
            let (_, voltage) = self.voltage.pop_front().unwrap();
            let (_, _device_power) = self.power.pop_front().unwrap();
            let (_, range) = self.range.pop_front().unwrap();
            let (_, g0) = self.gpi0.pop_front().unwrap();
            let (_, g1) = self.gpi1.pop_front().unwrap();

            if start_id.is_none() {
                start_id = Some(id);
            }

            let input = RawSample {
                current,
                voltage,
                power: current * voltage,
                current_range: range as u8,
                gpi0: g0 != 0.0,
                gpi1: g1 != 0.0,
            };
            if let SuppressorOutput::Sample(out) = self.suppressor.process(input) {
                current_out.push(out.current);
                voltage_out.push(out.voltage);
                power_out.push(out.power);
                range_out.push(out.current_range);
                gpi0_out.push(out.gpi0 as u8);
                gpi1_out.push(out.gpi1 as u8);
            }
        }

        let Some(start_id) = start_id else {
            return Vec::new();
        };
        // The suppressor delays the stream by `delay()` samples, so the
        // output batch's leading sample-id trails the input batch's by the
        // same amount.
        let out_start = start_id.wrapping_sub(current_out.len() as u32);

        let mut out = Vec::new();
        if !current_out.is_empty() {
            out.push((16, out_start, DecodedSamples::F32(current_out)));
            out.push((17, out_start, DecodedSamples::F32(voltage_out)));
            out.push((18, out_start, DecodedSamples::F32(power_out)));
            out.push((19, out_start, DecodedSamples::U4(range_out)));
            out.push((20, out_start, DecodedSamples::U1(gpi0_out)));
            out.push((21, out_start, DecodedSamples::U1(gpi1_out)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suppressor::{aggressive_matrix, SuppressionMode};

    #[test]
    fn aligned_samples_pass_through_once_warmed_up() {
        let suppressor = Suppressor::new(SuppressionMode::Interp, 1, 1, aggressive_matrix());
        let mut combiner = FrontPanelCombiner::new(suppressor);

        let n = 40u32;
        combiner.ingest(16, 0, &DecodedSamples::F32(vec![1.0; n as usize]));
        combiner.ingest(17, 0, &DecodedSamples::F32(vec![2.0; n as usize]));
        combiner.ingest(18, 0, &DecodedSamples::F32(vec![0.0; n as usize]));
        combiner.ingest(19, 0, &DecodedSamples::U4(vec![2; n as usize]));
        combiner.ingest(20, 0, &DecodedSamples::U1(vec![0; n as usize]));
        combiner.ingest(21, 0, &DecodedSamples::U1(vec![1; n as usize]));

        let out = combiner.drain();
        assert_eq!(out.len(), 6);
        let (port, _, samples) = &out[0];
        assert_eq!(*port, 16);
        assert_eq!(samples.len(), (n - combiner.delay() as u32) as usize);
    }

    #[test]
    fn misaligned_ids_resynchronize_rather_than_panic() {
        let suppressor = Suppressor::new(SuppressionMode::Off, 0, 0, aggressive_matrix());
        let mut combiner = FrontPanelCombiner::new(suppressor);
        combiner.ingest(16, 0, &DecodedSamples::F32(vec![1.0; 5]));
        combiner.ingest(17, 1, &DecodedSamples::F32(vec![2.0; 5])); // off by one
        combiner.ingest(18, 0, &DecodedSamples::F32(vec![0.0; 5]));
        combiner.ingest(19, 0, &DecodedSamples::U4(vec![2; 5]));
        combiner.ingest(20, 0, &DecodedSamples::U1(vec![0; 5]));
        combiner.ingest(21, 0, &DecodedSamples::U1(vec![1; 5]));
        // Should not panic; alignment logic drops/resyncs as needed.
        let _ = combiner.drain();
    }
}
