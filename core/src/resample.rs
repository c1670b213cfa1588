//! Fixed-point polyphase resampling of stereo 16-bit audio.
//!
//! The read position is a 32.32 accumulator over input frames. Each output
//! frame applies an 8-tap filter whose coefficients are linearly interpolated
//! between two of 33 kernel phases. Kernels are chosen once per process; the
//! SSE2 path produces bit-identical output to the scalar path.

use std::sync::OnceLock;

/// Interleaved left/right frame.
pub type Frame = [i16; 2];

/// Number of input frames each output frame reads.
pub const TAPS: usize = 8;

#[rustfmt::skip]
static KERNEL: [[i16; 8]; 33] = [
    [ 0x0000,  0x0000,  0x0000,  0x4000,  0x0000,  0x0000,  0x0000,  0x0000],
    [-0x000a,  0x0052, -0x0179,  0x3fe2,  0x019f, -0x005b,  0x000c,  0x0000],
    [-0x0013,  0x009c, -0x02cc,  0x3f86,  0x0362, -0x00c0,  0x001a,  0x0000],
    [-0x001a,  0x00dc, -0x03f9,  0x3eef,  0x054a, -0x012c,  0x002b,  0x0000],
    [-0x001f,  0x0113, -0x0500,  0x3e1d,  0x0753, -0x01a0,  0x003d,  0x0000],
    [-0x0023,  0x0141, -0x05e1,  0x3d12,  0x097c, -0x021a,  0x0050, -0x0001],
    [-0x0026,  0x0166, -0x069e,  0x3bd0,  0x0bc4, -0x029a,  0x0066, -0x0001],
    [-0x0027,  0x0182, -0x0738,  0x3a5a,  0x0e27, -0x031f,  0x007d, -0x0002],
    [-0x0028,  0x0197, -0x07b0,  0x38b2,  0x10a2, -0x03a7,  0x0096, -0x0003],
    [-0x0027,  0x01a5, -0x0807,  0x36dc,  0x1333, -0x0430,  0x00af, -0x0005],
    [-0x0026,  0x01ab, -0x083f,  0x34db,  0x15d5, -0x04ba,  0x00ca, -0x0007],
    [-0x0024,  0x01ac, -0x085b,  0x32b3,  0x1886, -0x0541,  0x00e5, -0x0008],
    [-0x0022,  0x01a6, -0x085d,  0x3068,  0x1b40, -0x05c6,  0x0101, -0x000b],
    [-0x001f,  0x019c, -0x0846,  0x2dfe,  0x1e00, -0x0644,  0x011c, -0x000d],
    [-0x001c,  0x018e, -0x0819,  0x2b7a,  0x20c1, -0x06bb,  0x0136, -0x0010],
    [-0x0019,  0x017c, -0x07d9,  0x28e1,  0x2380, -0x0727,  0x014f, -0x0013],
    [-0x0016,  0x0167, -0x0788,  0x2637,  0x2637, -0x0788,  0x0167, -0x0016],
    [-0x0013,  0x014f, -0x0727,  0x2380,  0x28e1, -0x07d9,  0x017c, -0x0019],
    [-0x0010,  0x0136, -0x06bb,  0x20c1,  0x2b7a, -0x0819,  0x018e, -0x001c],
    [-0x000d,  0x011c, -0x0644,  0x1e00,  0x2dfe, -0x0846,  0x019c, -0x001f],
    [-0x000b,  0x0101, -0x05c6,  0x1b40,  0x3068, -0x085d,  0x01a6, -0x0022],
    [-0x0008,  0x00e5, -0x0541,  0x1886,  0x32b3, -0x085b,  0x01ac, -0x0024],
    [-0x0007,  0x00ca, -0x04ba,  0x15d5,  0x34db, -0x083f,  0x01ab, -0x0026],
    [-0x0005,  0x00af, -0x0430,  0x1333,  0x36dc, -0x0807,  0x01a5, -0x0027],
    [-0x0003,  0x0096, -0x03a7,  0x10a2,  0x38b2, -0x07b0,  0x0197, -0x0028],
    [-0x0002,  0x007d, -0x031f,  0x0e27,  0x3a5a, -0x0738,  0x0182, -0x0027],
    [-0x0001,  0x0066, -0x029a,  0x0bc4,  0x3bd0, -0x069e,  0x0166, -0x0026],
    [-0x0001,  0x0050, -0x021a,  0x097c,  0x3d12, -0x05e1,  0x0141, -0x0023],
    [ 0x0000,  0x003d, -0x01a0,  0x0753,  0x3e1d, -0x0500,  0x0113, -0x001f],
    [ 0x0000,  0x002b, -0x012c,  0x054a,  0x3eef, -0x03f9,  0x00dc, -0x001a],
    [ 0x0000,  0x001a, -0x00c0,  0x0362,  0x3f86, -0x02cc,  0x009c, -0x0013],
    [ 0x0000,  0x000c, -0x005b,  0x019f,  0x3fe2, -0x0179,  0x0052, -0x000a],
    [ 0x0000,  0x0000,  0x0000,  0x0000,  0x4000,  0x0000,  0x0000,  0x0000],
];

/// Filter taps for the sub-sample phase of `accum`.
#[inline]
fn coefficients(accum: u64) -> [i16; 8] {
    let row = ((accum as u32) >> 27) as usize;
    let frac = (((accum as u32) >> 12) & 0x7FFF) as i32;
    let (f0, f1) = (&KERNEL[row], &KERNEL[row + 1]);

    let mut out = [0i16; 8];
    for (i, c) in out.iter_mut().enumerate() {
        let a = f0[i] as i32;
        let b = f1[i] as i32;
        *c = (a + (((b - a) * frac) >> 15)) as i16;
    }
    out
}

/// Per-channel extremes over a run of frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StereoRange {
    pub min: Frame,
    pub max: Frame,
}

impl StereoRange {
    pub const EMPTY: Self = Self {
        min: [i16::MAX; 2],
        max: [i16::MIN; 2],
    };

    pub fn include(&mut self, other: &StereoRange) {
        for ch in 0..2 {
            self.min[ch] = self.min[ch].min(other.min[ch]);
            self.max[ch] = self.max[ch].max(other.max[ch]);
        }
    }
}

impl Default for StereoRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

pub type ResampleFn = fn(&mut [Frame], &[Frame], u64, u64) -> u64;
pub type MinMaxFn = fn(&[Frame]) -> StereoRange;

/// A matched set of inner-loop kernels.
#[derive(Clone, Copy)]
pub struct Kernels {
    pub name: &'static str,
    /// Fills `dst` reading from `src` at `accum`, stepping by `step`; returns
    /// the advanced accumulator. `src` must hold `TAPS` frames past the last
    /// integer position read.
    pub resample: ResampleFn,
    pub min_max: MinMaxFn,
}

impl Kernels {
    pub const SCALAR: Kernels = Kernels {
        name: "scalar",
        resample: scalar::resample,
        min_max: scalar::min_max,
    };

    #[cfg(target_arch = "x86_64")]
    pub const SSE2: Kernels = Kernels {
        name: "sse2",
        resample: sse2::resample,
        min_max: sse2::min_max,
    };

    /// The best kernels for this CPU, detected on first use.
    pub fn detect() -> &'static Kernels {
        static SELECTED: OnceLock<Kernels> = OnceLock::new();
        SELECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            if std::arch::is_x86_feature_detected!("sse2") {
                log::debug!("using sse2 resampling kernels");
                return Kernels::SSE2;
            }

            Kernels::SCALAR
        })
    }
}

mod scalar {
    use super::*;

    pub(super) fn resample(dst: &mut [Frame], src: &[Frame], accum: u64, step: u64) -> u64 {
        let mut accum = accum;

        for out in dst.iter_mut() {
            let base = (accum >> 32) as usize;
            let taps = &src[base..base + TAPS];
            let coeff = coefficients(accum);
            accum = accum.wrapping_add(step);

            let mut l = 0x2000i32;
            let mut r = 0x2000i32;
            for (frame, &c) in taps.iter().zip(coeff.iter()) {
                l += frame[0] as i32 * c as i32;
                r += frame[1] as i32 * c as i32;
            }

            *out = [
                (l >> 14).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                (r >> 14).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            ];
        }

        accum
    }

    pub(super) fn min_max(src: &[Frame]) -> StereoRange {
        src.iter().fold(StereoRange::EMPTY, |mut acc, frame| {
            for ch in 0..2 {
                acc.min[ch] = acc.min[ch].min(frame[ch]);
                acc.max[ch] = acc.max[ch].max(frame[ch]);
            }
            acc
        })
    }
}

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use super::*;
    use std::arch::x86_64::*;

    pub(super) fn resample(dst: &mut [Frame], src: &[Frame], accum: u64, step: u64) -> u64 {
        let mut accum = accum;

        for out in dst.iter_mut() {
            let base = (accum >> 32) as usize;
            let taps = &src[base..base + TAPS];
            let coeff = coefficients(accum);
            accum = accum.wrapping_add(step);

            // SAFETY: `taps` holds 8 frames (32 bytes) and `coeff` 8 lanes;
            // all loads are unaligned and SSE2 is part of the x86_64 baseline.
            let packed = unsafe {
                let c = _mm_loadu_si128(coeff.as_ptr() as *const __m128i);
                let x0 = _mm_loadu_si128(taps.as_ptr() as *const __m128i);
                let x1 = _mm_loadu_si128(taps.as_ptr().add(4) as *const __m128i);

                // LRLR -> LLRR within each half so madd pairs taps per channel
                let y0 = _mm_shufflehi_epi16::<0xd8>(_mm_shufflelo_epi16::<0xd8>(x0));
                let y1 = _mm_shufflehi_epi16::<0xd8>(_mm_shufflelo_epi16::<0xd8>(x1));

                let z0 = _mm_madd_epi16(y0, _mm_shuffle_epi32::<0x50>(c));
                let z1 = _mm_madd_epi16(y1, _mm_shuffle_epi32::<0xfa>(c));

                let a = _mm_add_epi32(z0, z1);
                let b = _mm_add_epi32(a, _mm_shuffle_epi32::<0xee>(a));
                let r = _mm_srai_epi32::<14>(_mm_add_epi32(b, _mm_set1_epi32(0x2000)));

                _mm_cvtsi128_si32(_mm_packs_epi32(r, r))
            };

            *out = [packed as i16, (packed >> 16) as i16];
        }

        accum
    }

    pub(super) fn min_max(src: &[Frame]) -> StereoRange {
        let chunks = src.chunks_exact(4);
        let tail = chunks.remainder();

        // SAFETY: each chunk is four frames (16 bytes), loaded unaligned.
        let mut range = unsafe {
            let mut lo = _mm_set1_epi16(i16::MAX);
            let mut hi = _mm_set1_epi16(i16::MIN);

            for chunk in chunks {
                let v = _mm_loadu_si128(chunk.as_ptr() as *const __m128i);
                lo = _mm_min_epi16(lo, v);
                hi = _mm_max_epi16(hi, v);
            }

            lo = _mm_min_epi16(lo, _mm_shuffle_epi32::<0xee>(lo));
            hi = _mm_max_epi16(hi, _mm_shuffle_epi32::<0xee>(hi));
            lo = _mm_min_epi16(lo, _mm_shuffle_epi32::<0x55>(lo));
            hi = _mm_max_epi16(hi, _mm_shuffle_epi32::<0x55>(hi));

            StereoRange {
                min: [_mm_extract_epi16::<0>(lo) as i16, _mm_extract_epi16::<1>(lo) as i16],
                max: [_mm_extract_epi16::<0>(hi) as i16, _mm_extract_epi16::<1>(hi) as i16],
            }
        };

        range.include(&scalar::min_max(tail));
        range
    }
}

/// Streaming rate converter from a source rate to a fixed target rate.
pub struct Resampler {
    kernels: &'static Kernels,
    input: Vec<Frame>,
    accum: u64,
    step: u64,
}

impl Resampler {
    pub fn new(src_rate: u32, dst_rate: f64) -> Self {
        Self::with_kernels(src_rate, dst_rate, Kernels::detect())
    }

    pub fn with_kernels(src_rate: u32, dst_rate: f64, kernels: &'static Kernels) -> Self {
        let step = (src_rate as f64 / dst_rate * 4_294_967_296.0).round() as u64;

        Self {
            kernels,
            input: Vec::new(),
            accum: 0,
            step: step.max(1),
        }
    }

    pub fn kernels(&self) -> &'static Kernels {
        self.kernels
    }

    /// Number of outputs computable from `input_len` buffered frames.
    fn available(&self) -> usize {
        let len = self.input.len();
        if len < TAPS {
            return 0;
        }

        let max_accum = (((len - (TAPS - 1)) as u64) << 32) - 1;
        if max_accum < self.accum {
            return 0;
        }

        ((max_accum - self.accum) / self.step + 1) as usize
    }

    /// Queues source frames and appends every output frame that can now be
    /// produced to `out`.
    pub fn process(&mut self, frames: &[Frame], out: &mut Vec<Frame>) -> usize {
        self.input.extend_from_slice(frames);

        let count = self.available();
        if count == 0 {
            return 0;
        }

        let start = out.len();
        out.resize(start + count, [0, 0]);
        self.accum = (self.kernels.resample)(&mut out[start..], &self.input, self.accum, self.step);

        let consumed = ((self.accum >> 32) as usize).min(self.input.len());
        self.input.drain(..consumed);
        self.accum -= (consumed as u64) << 32;

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: f64, freq: f64, amplitude: f64, len: usize) -> Vec<Frame> {
        (0..len)
            .map(|i| {
                let v = (amplitude * (std::f64::consts::TAU * freq * i as f64 / rate).sin()).round() as i16;
                [v, -v]
            })
            .collect()
    }

    #[test]
    fn test_available_matches_accumulator_bounds() {
        let mut r = Resampler::with_kernels(1, 1.0, &Kernels::SCALAR);
        r.input = vec![[0, 0]; 8];

        r.step = 0x1_0000_0000;
        assert_eq!(r.available(), 1);
        r.step = 0x1000_0000;
        assert_eq!(r.available(), 16);
        r.accum = 0x0FFF_FFFF;
        assert_eq!(r.available(), 16);
        r.accum = 0x1000_0000;
        assert_eq!(r.available(), 15);

        r.input.push([0, 0]);
        r.accum = 0;
        assert_eq!(r.available(), 32);
    }

    #[test]
    fn test_unity_phase_passes_through() {
        let src: Vec<Frame> = (0..16).map(|i| [i * 100, -i * 100]).collect();
        let mut dst = vec![[0, 0]; 9];
        let accum = (Kernels::SCALAR.resample)(&mut dst, &src, 0, 1 << 32);

        assert_eq!(accum, 9 << 32);
        for (i, frame) in dst.iter().enumerate() {
            assert_eq!(frame[0], src[i + 3][0]);
            assert_eq!(frame[1], src[i + 3][1]);
        }
    }

    #[test]
    fn test_output_saturates() {
        let src = vec![[i16::MAX, i16::MIN]; 16];
        let mut dst = vec![[0, 0]; 8];
        // full-scale DC stays pinned to the rails at every phase
        (Kernels::SCALAR.resample)(&mut dst, &src, 0x8000_0000, 0x1000_0000);
        assert!(dst.iter().all(|f| f[0] > 32000 && f[1] < -32000));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_sse2_matches_scalar() {
        let src: Vec<Frame> = (0..4096)
            .map(|i: i32| {
                let l = ((i * 7919) % 65536 - 32768) as i16;
                let r = ((i * 104_729) % 65536 - 32768) as i16;
                [l, r]
            })
            .collect();

        for step in [0x0_4000_0000u64, 0x1_2345_6789, 0x1_5F00_0000, 0x2_0000_0001] {
            let count = (((src.len() - 8) as u64) << 32) / step;
            let mut a = vec![[0, 0]; count as usize];
            let mut b = vec![[0, 0]; count as usize];
            let acc_a = (Kernels::SCALAR.resample)(&mut a, &src, 0x1234, step);
            let acc_b = (Kernels::SSE2.resample)(&mut b, &src, 0x1234, step);
            assert_eq!(acc_a, acc_b);
            assert_eq!(a, b, "step={step:#x}");
        }

        for len in [0usize, 1, 3, 4, 5, 17, 4096] {
            assert_eq!((Kernels::SCALAR.min_max)(&src[..len]), (Kernels::SSE2.min_max)(&src[..len]));
        }
    }

    #[test]
    fn test_sine_amplitude_and_slew_are_preserved() {
        let dst_rate = crate::DATA_SAMPLE_RATE;
        let freq = 1000.0;
        let amplitude = 16000.0;

        for src_rate in [22050u32, 44100, 48000, 96000] {
            let src = sine(src_rate as f64, freq, amplitude, src_rate as usize / 4);
            let mut resampler = Resampler::new(src_rate, dst_rate);
            let mut out = Vec::new();

            for chunk in src.chunks(512) {
                resampler.process(chunk, &mut out);
            }

            // skip the filter's start-up region
            let settled = &out[64..out.len() - 64];
            let peak = settled.iter().map(|f| f[0].unsigned_abs() as f64).fold(0.0, f64::max);
            assert!((peak - amplitude).abs() < amplitude * 0.02, "rate={src_rate} peak={peak}");

            let max_slew = std::f64::consts::TAU * freq * amplitude / dst_rate;
            for w in settled.windows(2) {
                let slew = (w[1][0] as f64 - w[0][0] as f64).abs();
                assert!(slew <= max_slew * 1.05 + 2.0, "rate={src_rate} slew={slew}");
            }

            // the right channel carries the inverted signal
            assert!(settled.iter().all(|f| (f[0] as i32 + f[1] as i32).abs() <= 2));
        }
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let src = sine(44100.0, 3000.0, 12000.0, 5000);

        let mut one = Resampler::with_kernels(44100, crate::DATA_SAMPLE_RATE, &Kernels::SCALAR);
        let mut whole = Vec::new();
        one.process(&src, &mut whole);

        let mut chunked = Resampler::with_kernels(44100, crate::DATA_SAMPLE_RATE, &Kernels::SCALAR);
        let mut pieces = Vec::new();
        for chunk in src.chunks(37) {
            chunked.process(chunk, &mut pieces);
        }

        assert_eq!(whole, pieces);
    }
}
