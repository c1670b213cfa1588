//! FSK tone detection: one mark/space decision per data sample.

use std::sync::OnceLock;

use crate::bitfield::Bitfield;

/// Samples in the DFT window; at the data rate the space tone lands in bin 3
/// and the mark tone in bin 4.
const WINDOW: usize = 24;

/// Output delay of the detector in samples (half the window).
pub const FSK_FILTER_DELAY: usize = WINDOW / 2;

/// Per-phase rotation factors `[cos3, sin3, cos4, sin4]` scaled by 4096.
fn rotation_table() -> &'static [[i32; 4]; WINDOW] {
    static TABLE: OnceLock<[[i32; 4]; WINDOW]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let sin24 = |k: usize| (std::f64::consts::TAU * (k % WINDOW) as f64 / WINDOW as f64).sin();
        let q = |v: f64| (v * 4096.0).round() as i32;

        let mut table = [[0i32; 4]; WINDOW];
        for (i, row) in table.iter_mut().enumerate() {
            *row = [q(sin24(6 + i * 3)), q(sin24(i * 3)), q(sin24(6 + i * 4)), q(sin24(i * 4))];
        }
        table
    })
}

/// Space/mark tone detector.
///
/// Runs two bins of a 24-point sliding DFT in integer arithmetic so that long
/// leaders do not accumulate rounding error. Each input sample yields one bit:
/// mark when the mark bin carries at least as much energy as the space bin.
/// There is no squelch; very quiet recordings still decode.
pub struct FskDecoder {
    acc: [i64; 4],
    index: usize,
    history: [i32; WINDOW],
}

impl Default for FskDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FskDecoder {
    pub fn new() -> Self {
        Self {
            acc: [0; 4],
            index: 0,
            history: [0; WINDOW],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advances the filter by one sample and returns `(space, mark)` energies.
    #[inline]
    fn step(&mut self, x: i16) -> (f32, f32) {
        let slot = self.index;
        self.index = (self.index + 1) % WINDOW;

        let y = (x as i32 - self.history[slot]) as i64;
        self.history[slot] = x as i32;

        let rot = &rotation_table()[self.index];
        for (acc, &r) in self.acc.iter_mut().zip(rot.iter()) {
            *acc += r as i64 * y;
        }

        let [a0r, a0i, a1r, a1i] = self.acc.map(|v| v as f32);
        (a0r * a0r + a0i * a0i, a1r * a1r + a1i * a1i)
    }

    /// Feeds samples through the filter without producing bits.
    pub fn prime(&mut self, samples: &[i16]) {
        for &x in samples {
            self.step(x);
        }
    }

    /// Demodulates `samples`, appending one bit per sample to `bits`.
    ///
    /// With `trace`, fills slots 0..4 of each 6-float frame: the input delayed
    /// by the filter latency, space energy, mark energy and the decision.
    pub fn process(&mut self, samples: &[i16], bits: &mut Bitfield, mut trace: Option<&mut [f32]>) {
        const ENERGY_SCALE: f32 = 1.0 / 32767.0 / 4096.0 / 12.0;

        for (i, &x) in samples.iter().enumerate() {
            let slot = self.index;
            let (space, mark) = self.step(x);
            let bit = mark >= space;

            if let Some(frame) = trace.as_deref_mut().and_then(|t| t.get_mut(i * 6..i * 6 + 4)) {
                let delayed = self.history[(slot + FSK_FILTER_DELAY) % WINDOW];
                frame[0] = delayed as f32 / 32767.0;
                frame[1] = space.sqrt() * ENERGY_SCALE;
                frame[2] = mark.sqrt() * ENERGY_SCALE;
                frame[3] = if mark > space { 0.8 } else { -0.8 };
            }

            bits.push(bit);
        }
    }
}
