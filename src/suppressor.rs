//! Current-range suppressor (C3, spec §3 "Current-range suppressor", §4.3):
//! interpolates or NaN-fills the transient samples produced when the
//! front-panel current shunt switches range, on the older streaming device.
//!
//! Follows the same "power-of-two ring, masked index" shape the spec's
//! design notes call out (§9: "the same data structure is appropriate in
//! any target language") as the teacher's bulk-read scratch buffers use
//! fixed capacity sized up front rather than growing per-sample.

use serde::{Deserialize, Serialize};

/// `current_range` value meaning the shunt is switched off.
pub const RANGE_OFF: u8 = 7;
/// `current_range` value used when the sample itself is missing.
pub const RANGE_MISSING: u8 = 8;
/// One past the largest real shunt range id (0..=6 are real ranges).
const RANGE_COUNT: usize = 9;

/// Upper bound on the configured pre-window, in samples.
pub const PRE_MAX: u8 = 8;
/// Upper bound on the configured post-window, in samples.
pub const POST_MAX: u8 = 8;
/// Upper bound on the matrix-selected suppression window, in samples.
pub const SUPPRESS_WINDOW_MAX: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressionMode {
    /// Linearly interpolate current and voltage; recompute power as i*v.
    Interp,
    /// Replace current, voltage, and power with NaN.
    Nan,
    /// No suppression.
    Off,
}

/// One 2 Msps sample as carried through the suppressor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub current: f32,
    pub voltage: f32,
    pub power: f32,
    pub current_range: u8,
    pub gpi0: bool,
    pub gpi1: bool,
}

impl RawSample {
    pub fn missing(current_range: u8) -> Self {
        RawSample {
            current: f32::NAN,
            voltage: f32::NAN,
            power: f32::NAN,
            current_range,
            gpi0: false,
            gpi1: false,
        }
    }
}

/// Output of [`Suppressor::process`] for a single input sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuppressorOutput {
    /// The warm-up window (`pre + window + post + 1` samples) is not yet
    /// full; no output sample is available for this input yet.
    Missing,
    Sample(RawSample),
}

/// `M[to][from]`, in samples at 2 Msps, selecting the suppression window for
/// a transition into range `to` from range `from`. Rows/columns for
/// `RANGE_OFF`/`RANGE_MISSING` are zero per spec §3.
pub type SuppressionMatrix = [[u16; RANGE_COUNT]; RANGE_COUNT];

/// Tighter min/max distortion, shorter windows.
pub fn aggressive_matrix() -> SuppressionMatrix {
    build_matrix(|to, from| if to == from { 0 } else { 4 + ((to as i32 - from as i32).unsigned_abs() as u16) })
}

/// Less distortion, longer windows.
pub fn conservative_matrix() -> SuppressionMatrix {
    build_matrix(|to, from| if to == from { 0 } else { 7 + ((to as i32 - from as i32).unsigned_abs() as u16) })
}

fn build_matrix(f: impl Fn(usize, usize) -> u16) -> SuppressionMatrix {
    let mut m = [[0u16; RANGE_COUNT]; RANGE_COUNT];
    for to in 0..RANGE_COUNT {
        for from in 0..RANGE_COUNT {
            if to >= 7 || from >= 7 {
                // RANGE_OFF / RANGE_MISSING rows and columns: no suppression.
                m[to][from] = 0;
                continue;
            }
            m[to][from] = f(to, from).min(SUPPRESS_WINDOW_MAX);
        }
    }
    m
}

/// Ring buffer entry plus the bookkeeping `process` needs per position.
#[derive(Debug, Clone, Copy)]
struct Slot {
    sample: RawSample,
    /// `Some(count)` when this sample falls inside a scheduled suppression
    /// window and should be replaced on output; `count` is unused bookkeeping
    /// kept for clarity, replacement itself is driven by `suppressed_until`.
    filled: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            sample: RawSample::missing(RANGE_MISSING),
            filled: false,
        }
    }
}

/// Transient replacement window scheduled relative to the ring buffer's
/// monotonic sample counter.
#[derive(Debug, Clone, Copy)]
struct PendingWindow {
    /// First absolute sample index to replace (inclusive).
    start: u64,
    /// Last absolute sample index to replace (inclusive).
    end: u64,
}

/// Delays the stream by `pre + window + post + 1` samples and replaces the
/// samples around each current-range transition per the configured mode.
pub struct Suppressor {
    mode: SuppressionMode,
    pre: u8,
    post: u8,
    matrix: SuppressionMatrix,
    /// Power-of-two sized ring; capacity >= pre + window_max + post + 1.
    ring: Box<[Slot]>,
    mask: u64,
    /// Absolute index (monotonic, never wraps within a process lifetime)
    /// of the next input sample.
    head: u64,
    /// Absolute index of the next sample `process` will emit.
    tail: u64,
    /// Range of the previous input sample, for transition detection.
    prev_range: Option<u8>,
    pending: Option<PendingWindow>,
    /// Last-known-good sample before the earliest open pending window,
    /// used as the left anchor for interpolation.
    last_good: Option<RawSample>,
}

impl Suppressor {
    pub fn new(mode: SuppressionMode, pre: u8, post: u8, matrix: SuppressionMatrix) -> Self {
        let pre = pre.min(PRE_MAX);
        let post = post.min(POST_MAX);
        let min_capacity = pre as usize + SUPPRESS_WINDOW_MAX as usize + post as usize + 1;
        let capacity = min_capacity.next_power_of_two();
        Suppressor {
            mode,
            pre,
            post,
            matrix,
            ring: vec![Slot::default(); capacity].into_boxed_slice(),
            mask: (capacity - 1) as u64,
            head: 0,
            tail: 0,
            prev_range: None,
            pending: None,
            last_good: None,
        }
    }

    fn slot_mut(&mut self, index: u64) -> &mut Slot {
        let i = (index & self.mask) as usize;
        &mut self.ring[i]
    }

    fn slot(&self, index: u64) -> &Slot {
        let i = (index & self.mask) as usize;
        &self.ring[i]
    }

    /// Delay, in samples, between an input sample and its corresponding
    /// output sample (spec §8 "Suppressor delay").
    pub fn delay(&self) -> u64 {
        self.pre as u64 + SUPPRESS_WINDOW_MAX as u64 + self.post as u64 + 1
    }

    /// Feed one 2 Msps input sample; returns the output sample `delay()`
    /// positions behind it, or `Missing` during warm-up.
    pub fn process(&mut self, sample: RawSample) -> SuppressorOutput {
        let index = self.head;
        self.head += 1;

        *self.slot_mut(index) = Slot {
            sample,
            filled: false,
        };

        if self.mode != SuppressionMode::Off {
            self.detect_transition(index, sample.current_range);
        }
        self.prev_range = Some(sample.current_range);

        if index + 1 < self.delay() {
            return SuppressorOutput::Missing;
        }

        let out_index = self.tail;
        self.tail += 1;
        SuppressorOutput::Sample(self.resolve(out_index))
    }

    fn detect_transition(&mut self, index: u64, to: u8) {
        let Some(from) = self.prev_range else {
            return;
        };
        if from == to {
            return;
        }
        // §4.3 tie-break: transitions to/from OFF or MISSING use row/column
        // 0 of the matrix, i.e. no suppression.
        let window = if to >= RANGE_OFF || from >= RANGE_OFF {
            0
        } else {
            self.matrix[to as usize][from as usize]
        };
        if window == 0 {
            return;
        }

        // The matrix window starts at the transition's first new-range
        // sample and runs forward `window` samples; `pre`/`post` pad only
        // the outer edges (spec §8 Scenario 3: pre=1, window=7, post=1,
        // transition at 100 -> replaced range 99..107).
        let start = index.saturating_sub(self.pre as u64);
        let end = index + window as u64 - 1 + self.post as u64;

        self.pending = Some(match self.pending.take() {
            // §4.3: overlapping transitions extend, not replace, the
            // pending window; cap the total at SUPPRESS_WINDOW_MAX + pre + post.
            Some(existing) => {
                let cap = SUPPRESS_WINDOW_MAX as u64 + self.pre as u64 + self.post as u64;
                let merged_start = existing.start.min(start);
                let merged_end = existing.end.max(end);
                let merged_end = merged_end.min(merged_start + cap);
                PendingWindow {
                    start: merged_start,
                    end: merged_end,
                }
            }
            None => PendingWindow { start, end },
        });
    }

    /// Produce the output sample at absolute index `out_index`, replacing it
    /// if it falls within a (now-fully-buffered) pending suppression window.
    fn resolve(&mut self, out_index: u64) -> RawSample {
        let raw = self.slot(out_index).sample;

        let Some(window) = self.pending else {
            self.last_good = Some(raw);
            return raw;
        };
        if out_index < window.start {
            self.last_good = Some(raw);
            return raw;
        }
        if out_index > window.end {
            self.pending = None;
            self.last_good = Some(raw);
            return raw;
        }

        self.slot_mut(out_index).filled = true;
        let replaced = match self.mode {
            SuppressionMode::Off => raw,
            SuppressionMode::Nan => RawSample {
                current: f32::NAN,
                voltage: f32::NAN,
                power: f32::NAN,
                current_range: raw.current_range,
                gpi0: raw.gpi0,
                gpi1: raw.gpi1,
            },
            SuppressionMode::Interp => {
                let left = self.last_good.unwrap_or(raw);
                let right = self.slot(window.end.min(self.head.saturating_sub(1))).sample;
                let span = (window.end - window.start) as f32;
                let t = if span > 0.0 {
                    (out_index - window.start) as f32 / span
                } else {
                    0.0
                };
                let current = left.current + (right.current - left.current) * t;
                let voltage = left.voltage + (right.voltage - left.voltage) * t;
                RawSample {
                    current,
                    voltage,
                    power: current * voltage,
                    current_range: raw.current_range,
                    gpi0: raw.gpi0,
                    gpi1: raw.gpi1,
                }
            }
        };

        if out_index == window.end {
            self.pending = None;
            self.last_good = Some(replaced);
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_sample(range: u8, value: f32) -> RawSample {
        RawSample {
            current: value,
            voltage: value,
            power: value * value,
            current_range: range,
            gpi0: false,
            gpi1: false,
        }
    }

    #[test]
    fn identity_when_no_range_changes() {
        let mut s = Suppressor::new(SuppressionMode::Interp, 1, 1, aggressive_matrix());
        let delay = s.delay();
        let mut outputs = Vec::new();
        for i in 0..(delay as usize + 20) {
            match s.process(flat_sample(2, i as f32)) {
                SuppressorOutput::Missing => {}
                SuppressorOutput::Sample(sample) => outputs.push(sample),
            }
        }
        for (i, sample) in outputs.iter().enumerate() {
            assert_eq!(sample.current, i as f32);
        }
    }

    #[test]
    fn warms_up_for_exactly_delay_samples() {
        let mut s = Suppressor::new(SuppressionMode::Off, 1, 1, aggressive_matrix());
        let delay = s.delay();
        let mut missing_count = 0;
        let mut sample_count = 0;
        for i in 0..(delay as usize * 2) {
            match s.process(flat_sample(2, i as f32)) {
                SuppressorOutput::Missing => missing_count += 1,
                SuppressorOutput::Sample(_) => sample_count += 1,
            }
        }
        assert_eq!(missing_count, delay as usize);
        assert_eq!(sample_count, delay as usize);
    }

    #[test]
    fn transition_to_off_produces_no_suppression() {
        let mut s = Suppressor::new(SuppressionMode::Nan, 1, 1, conservative_matrix());
        let delay = s.delay() as usize;
        let mut outputs = Vec::new();
        for i in 0..30 {
            let range = if i == 10 { RANGE_OFF } else { 2 };
            if let SuppressorOutput::Sample(sample) = s.process(flat_sample(range, i as f32)) {
                outputs.push(sample);
            }
        }
        // None of the collected outputs should be NaN since the only
        // transition involved range 7 (off).
        assert!(outputs.iter().all(|s| !s.current.is_nan()));
        let _ = delay;
    }

    #[test]
    fn detect_transition_matches_spec_scenario_3_window_bounds() {
        // spec §8 Scenario 3: pre=1, window=M_N[3][2]=7, post=1, transition's
        // first new-range sample at input index 100 -> replaced range 99..107.
        let mut matrix = [[0u16; RANGE_COUNT]; RANGE_COUNT];
        matrix[3][2] = 7;
        let mut s = Suppressor::new(SuppressionMode::Interp, 1, 1, matrix);
        for i in 0..100u32 {
            s.process(flat_sample(2, i as f32));
        }
        s.process(flat_sample(3, 999.0)); // absolute input index 100
        let window = s.pending.expect("transition should schedule a pending window");
        assert_eq!(window.start, 99);
        assert_eq!(window.end, 107);
    }

    #[test]
    fn transition_schedules_interpolation_window() {
        let mut s = Suppressor::new(SuppressionMode::Interp, 1, 1, aggressive_matrix());
        let mut outputs = Vec::new();
        for i in 0..120u32 {
            let (range, value) = if i < 100 { (2, 10.0) } else { (3, 50.0) };
            if let SuppressorOutput::Sample(sample) = s.process(flat_sample(range, value)) {
                outputs.push(sample);
            }
        }
        // Power is recomputed as i*v for every output sample, suppressed or not.
        for sample in &outputs {
            assert_eq!(sample.power, sample.current * sample.voltage);
        }
        // Samples inside the suppression window are interpolated strictly
        // between the two flat plateaus; they equal neither input value.
        let distorted = outputs
            .iter()
            .filter(|sample| sample.current > 10.0 && sample.current < 50.0)
            .count();
        assert!(distorted > 0, "expected some samples to be suppressed near the transition");
    }
}
