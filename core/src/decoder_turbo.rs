//! Direct (turbo) edge detection over the resampled input.

use std::fmt;
use std::str::FromStr;

use crate::bitfield::Bitfield;
use crate::error::TapeError;
use crate::DATA_SAMPLE_RATE;

/// Edge detection strategy for direct-coded (turbo) recordings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TurboDecodeAlgorithm {
    SlopeNoFilter,
    SlopeFilter,
    #[default]
    PeakFilter,
    /// Peak detection, then evens out space-then-mark pulse pairs.
    PeakLoHi,
    /// Peak detection, then evens out mark-then-space pulse pairs.
    PeakHiLo,
}

impl TurboDecodeAlgorithm {
    pub const ALL: [TurboDecodeAlgorithm; 5] = [
        TurboDecodeAlgorithm::SlopeNoFilter,
        TurboDecodeAlgorithm::SlopeFilter,
        TurboDecodeAlgorithm::PeakFilter,
        TurboDecodeAlgorithm::PeakLoHi,
        TurboDecodeAlgorithm::PeakHiLo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TurboDecodeAlgorithm::SlopeNoFilter => "slopeNoFilter",
            TurboDecodeAlgorithm::SlopeFilter => "slopeFilter",
            TurboDecodeAlgorithm::PeakFilter => "peakFilter",
            TurboDecodeAlgorithm::PeakLoHi => "peakLoHi",
            TurboDecodeAlgorithm::PeakHiLo => "peakHiLo",
        }
    }

    fn uses_prefilter(self) -> bool {
        self != TurboDecodeAlgorithm::SlopeNoFilter
    }
}

impl fmt::Display for TurboDecodeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TurboDecodeAlgorithm {
    type Err = TapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TapeError::InvalidInput(format!("unknown turbo decode algorithm '{s}'")))
    }
}

/// Turns the (optionally filtered) signal into a bit per sample.
pub trait EdgeDetector {
    fn detect(&mut self, x: f32) -> bool;

    /// Value written to trace slot 4 for the sample just detected.
    fn trace_level(&self, x: f32) -> f32 {
        x
    }
}

/// Tracks the sign of large slopes against a fast-attack, slow-release AGC.
pub struct SlopeDetector {
    agc: f32,
    prev_level: f32,
    state: bool,
}

impl SlopeDetector {
    pub fn new() -> Self {
        Self {
            agc: 0.0,
            prev_level: 0.0,
            state: true,
        }
    }
}

impl Default for SlopeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeDetector for SlopeDetector {
    fn detect(&mut self, x: f32) -> bool {
        let y = x - self.prev_level;
        self.prev_level = x;

        let z = y.abs();
        if z > self.agc * 0.25 {
            self.state = y > 0.0;
        }

        if z > self.agc {
            self.agc += (z - self.agc) * 0.40;
        } else {
            self.agc += (z - self.agc) * 0.05;
        }

        self.state
    }
}

/// Locates signal peaks between stable sign changes and places the edge at
/// the peak. Output lags the input by 62 samples through a shift register
/// so that edges can be placed retroactively.
pub struct PeakDetector {
    window: [f32; 64],
    window_idx: usize,
    sign_counter: i32,
    last_stable: bool,
    last_polarity: bool,
    peak_offset: u32,
    peak_window_count: u32,
    peak_value: f32,
    peak_sign: f32,
    shift_reg: u64,
}

impl PeakDetector {
    pub fn new() -> Self {
        Self {
            window: [0.0; 64],
            window_idx: 0,
            sign_counter: 3,
            last_stable: true,
            last_polarity: true,
            peak_offset: 0,
            peak_window_count: 0,
            peak_value: 0.0,
            peak_sign: 1.0,
            shift_reg: u64::MAX,
        }
    }

    #[inline]
    fn slot(&self, back: usize) -> usize {
        self.window_idx.wrapping_sub(back) & 63
    }
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn pow2(n: u32) -> u64 {
    1u64.checked_shl(n).unwrap_or(0)
}

impl EdgeDetector for PeakDetector {
    fn detect(&mut self, x: f32) -> bool {
        self.sign_counter += if x >= 0.0 { 1 } else { -1 };
        self.sign_counter -= if self.window[self.slot(3)] >= 0.0 { 1 } else { -1 };
        let idx = self.window_idx & 63;
        self.window[idx] = x;
        let x2 = self.window[self.slot(1)];
        self.window_idx = self.window_idx.wrapping_add(1);

        let polarity = (self.shift_reg >> 62) & 1 != 0;

        let stable = self.sign_counter <= -2 || self.sign_counter >= 2;
        if stable && !self.last_stable {
            let new_polarity = x2 >= 0.0;
            let count = self.peak_window_count;

            if count > 0 {
                // rewrite the delayed history so the edge lands on the peak
                if self.last_polarity == new_polarity {
                    if !new_polarity {
                        self.shift_reg = self.shift_reg.wrapping_sub(pow2(count)).wrapping_add(1);
                    }
                } else if count < 63 {
                    let at_peak = pow2(count - self.peak_offset);
                    if !new_polarity {
                        self.shift_reg = self.shift_reg.wrapping_sub(at_peak).wrapping_add(1);
                    } else {
                        self.shift_reg = self.shift_reg.wrapping_sub(pow2(count)).wrapping_add(at_peak);
                    }
                }

                self.peak_window_count = 0;
                self.peak_offset = 0;
                self.peak_value = 0.0;
            }

            self.last_polarity = new_polarity;
            self.peak_sign = if new_polarity { 1.0 } else { -1.0 };
        }

        if self.peak_window_count < 64 {
            let val = x2 * self.peak_sign;
            if val > self.peak_value {
                self.peak_value = val;
                self.peak_offset = self.peak_window_count;
            }
            self.peak_window_count += 1;
        }

        self.shift_reg = (self.shift_reg << 1).wrapping_add(1);
        self.last_stable = stable;

        polarity
    }

    fn trace_level(&self, _x: f32) -> f32 {
        self.window[self.window_idx & 63]
    }
}

/// Single-pole high-pass formed by subtracting a one-pole low-pass.
#[derive(Clone, Copy, Debug)]
pub struct HighPassFilter {
    factor: f32,
    state: f32,
}

impl HighPassFilter {
    /// A negative cutoff selects a fixed, very low corner.
    pub fn new(cutoff_hz: f32) -> Self {
        let factor = if cutoff_hz < 0.0 {
            0.9999
        } else {
            let y = 2.0 - (std::f32::consts::TAU / DATA_SAMPLE_RATE as f32 * cutoff_hz).cos();
            y - (y * y - 1.0).sqrt()
        };

        Self { factor, state: 0.0 }
    }

    #[inline]
    pub fn apply(&mut self, x: f32) -> f32 {
        let y = x - self.state;
        self.state += self.factor * y;
        y
    }
}

/// Direct (turbo) decoder: optional high-pass, then a pluggable edge detector.
pub struct TurboDecoder {
    algorithm: TurboDecodeAlgorithm,
    prefilter: Option<HighPassFilter>,
    detector: Box<dyn EdgeDetector>,
    bits: Bitfield,
}

impl TurboDecoder {
    pub fn new(algorithm: TurboDecodeAlgorithm, hpf_cutoff_hz: f32) -> Self {
        let detector: Box<dyn EdgeDetector> = match algorithm {
            TurboDecodeAlgorithm::SlopeNoFilter | TurboDecodeAlgorithm::SlopeFilter => Box::new(SlopeDetector::new()),
            _ => Box::new(PeakDetector::new()),
        };

        Self {
            algorithm,
            prefilter: algorithm.uses_prefilter().then(|| HighPassFilter::new(hpf_cutoff_hz)),
            detector,
            bits: Bitfield::new(),
        }
    }

    pub fn algorithm(&self) -> TurboDecodeAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> u32 {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Decodes `samples`; with `trace`, fills slots 4 and 5 of each 6-float frame.
    pub fn process(&mut self, samples: &[i16], mut trace: Option<&mut [f32]>) {
        for (i, &s) in samples.iter().enumerate() {
            let mut x = s as f32;
            if let Some(hpf) = self.prefilter.as_mut() {
                x = hpf.apply(x);
            }

            let bit = self.detector.detect(x);
            self.bits.push(bit);

            if let Some(frame) = trace.as_deref_mut().and_then(|t| t.get_mut(i * 6 + 4..i * 6 + 6)) {
                frame[0] = self.detector.trace_level(x) / 32767.0;
                frame[1] = if bit { 0.8 } else { -0.8 };
            }
        }
    }

    /// Returns the decoded bits, balancing pulse pairs for the LoHi/HiLo variants.
    pub fn finalize(self) -> Bitfield {
        let mut bits = self.bits;
        match self.algorithm {
            TurboDecodeAlgorithm::PeakLoHi => rebalance(&mut bits, false),
            TurboDecodeAlgorithm::PeakHiLo => rebalance(&mut bits, true),
            _ => {}
        }
        bits
    }
}

/// Splits each in-range pulse pair evenly, keeping its total length. Pairs
/// are found starting with a `first` run but are always rewritten space then
/// mark; both runs must be within 1/4400 s..1/900 s.
fn rebalance(bits: &mut Bitfield, first: bool) {
    let capture_min = (DATA_SAMPLE_RATE / 4400.0 + 0.5) as u32;
    let capture_max = (DATA_SAMPLE_RATE / 900.0 + 0.5) as u32;
    let capture = capture_min..=capture_max;

    let n = bits.len();
    let mut pos = 0;

    while pos < n {
        let pair_start = pos;

        let mut lo = 0;
        while pos < n && bits.get(pos) == first {
            lo += 1;
            pos += 1;
        }

        let mut hi = 0;
        while pos < n && bits.get(pos) != first {
            hi += 1;
            pos += 1;
        }

        if capture.contains(&lo) && capture.contains(&hi) {
            let total = lo + hi;
            let new_lo = total >> 1;
            bits.fill(pair_start, new_lo, false);
            bits.fill(pair_start + new_lo, total - new_lo, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(half_period: usize, cycles: usize, amplitude: i16) -> Vec<i16> {
        (0..half_period * 2 * cycles)
            .map(|i| if (i / half_period) % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in TurboDecodeAlgorithm::ALL {
            assert_eq!(algorithm.to_string().parse::<TurboDecodeAlgorithm>().unwrap(), algorithm);
        }
        assert!("bogus".parse::<TurboDecodeAlgorithm>().is_err());
        assert_eq!(TurboDecodeAlgorithm::default(), TurboDecodeAlgorithm::PeakFilter);
    }

    #[test]
    fn test_high_pass_blocks_dc() {
        let mut hpf = HighPassFilter::new(5327.0);
        let mut y = 0.0;
        for _ in 0..200 {
            y = hpf.apply(1000.0);
        }
        assert!(y.abs() < 1.0);
    }

    #[test]
    fn test_slope_follows_square_wave() {
        let mut decoder = TurboDecoder::new(TurboDecodeAlgorithm::SlopeNoFilter, 5327.0);
        let signal = square(10, 20, 8000);
        decoder.process(&signal, None);
        let bits = decoder.finalize();

        assert_eq!(bits.len(), signal.len() as u32);
        // edges land on the sample where the level jumps
        for i in 40..signal.len() as u32 {
            assert_eq!(bits.get(i), signal[i as usize] > 0, "sample {i}");
        }
    }

    #[test]
    fn test_peak_detector_tracks_with_delay() {
        let mut decoder = TurboDecoder::new(TurboDecodeAlgorithm::PeakFilter, 5327.0);
        let signal = square(12, 40, 8000);
        decoder.process(&signal, None);
        let bits = decoder.finalize();

        // the output is delayed but keeps the input's duty cycle
        let ones = bits.count_ones(200, 480);
        assert!(ones.abs_diff(240) <= 24, "ones={ones}");

        let mut transitions = 0;
        for i in 201..680 {
            transitions += (bits.get(i) != bits.get(i - 1)) as u32;
        }
        assert!((36..=44).contains(&transitions), "transitions={transitions}");
    }

    #[test]
    fn test_rebalance_evens_pairs() {
        let mut bits = Bitfield::new();
        // space 10 / mark 20 pair, both inside the capture range
        for i in 0..30 {
            bits.push(i >= 10);
        }
        rebalance(&mut bits, false);
        assert_eq!(bits.count_ones(0, 15), 0);
        assert_eq!(bits.count_ones(15, 15), 15);

        let mut bits = Bitfield::new();
        for i in 0..30 {
            bits.push(i < 20);
        }
        rebalance(&mut bits, true);
        assert_eq!(bits.count_ones(0, 15), 0);
        assert_eq!(bits.count_ones(15, 15), 15);
    }

    #[test]
    fn test_hi_lo_pairs_are_rewritten_space_first() {
        // mark 12 / space 8, then a trailing mark run
        let mut bits = Bitfield::new();
        for i in 0..40 {
            bits.push(i < 12 || i >= 20);
        }
        rebalance(&mut bits, true);

        assert!(!bits.get(0));
        assert_eq!(bits.count_ones(0, 10), 0);
        assert_eq!(bits.count_ones(10, 10), 10);
        assert_eq!(bits.count_ones(20, 20), 20);
    }

    #[test]
    fn test_rebalance_skips_out_of_range_pairs() {
        let mut bits = Bitfield::new();
        for i in 0..203 {
            bits.push(i >= 3);
        }
        let before = bits.clone();
        rebalance(&mut bits, false);
        assert_eq!(bits, before);
    }

    #[test]
    fn test_trace_slots() {
        let mut decoder = TurboDecoder::new(TurboDecodeAlgorithm::SlopeFilter, 5327.0);
        let signal = square(8, 4, 16000);
        let mut trace = vec![0.0f32; signal.len() * 6];
        decoder.process(&signal, Some(&mut trace));

        for frame in trace.chunks(6) {
            assert_eq!(&frame[..4], &[0.0; 4]);
            assert!(frame[5] == 0.8 || frame[5] == -0.8);
        }
    }
}
