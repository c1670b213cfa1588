//! Segment content blocks.
//!
//! A block owns the samples behind one or more timeline segments and answers
//! bit queries in block-local sample coordinates. Mark (idle) is `true`.

use std::sync::OnceLock;

use crate::bitfield::Bitfield;
use crate::{
    CYCLES_PER_DATA_SAMPLE, CYCLES_PER_SYNC_SAMPLE, DATA_SAMPLE_RATE, MACHINE_CLOCK_HZ,
    MARK_TONE_HZ, SPACE_TONE_HZ,
};

const TWO_POW_32: f64 = 4_294_967_296.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Blank,
    DecodedBytes,
    RawSignal,
    RawAudio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FindBitResult {
    pub pos: u32,
    pub found: bool,
}

/// Playback position in audio samples plus machine cycles into the current sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AudioPosition {
    pub sample: u32,
    pub cycle: u32,
}

impl AudioPosition {
    pub fn new(sample: u32) -> Self {
        Self { sample, cycle: 0 }
    }

    /// Advances by `n` sync-mixer samples.
    pub fn advance(&mut self, n: usize) {
        let cycles = self.cycle as u64 + n as u64 * CYCLES_PER_SYNC_SAMPLE as u64;
        self.sample += (cycles / CYCLES_PER_DATA_SAMPLE as u64) as u32;
        self.cycle = (cycles % CYCLES_PER_DATA_SAMPLE as u64) as u32;
    }
}

/// 1024-entry sine table centred on 0x80 used for synthesized playback tones.
fn audio_phase_table() -> &'static [u8; 1024] {
    static TABLE: OnceLock<[u8; 1024]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u8; 1024];
        for (i, entry) in table.iter_mut().enumerate() {
            let t = i as f32 * (std::f32::consts::TAU / 1024.0);
            let v = (0.5 + 0.25 * t.sin()) * 255.0;
            *entry = v.round().clamp(0.0, 255.0) as u8;
        }
        table
    })
}

#[derive(Clone, Debug)]
pub enum TapeBlock {
    Blank,
    DecodedBytes(DecodedByteBlock),
    RawSignal(RawSignalBlock),
    RawAudio(RawAudioBlock),
}

impl TapeBlock {
    pub fn block_type(&self) -> BlockType {
        match self {
            TapeBlock::Blank => BlockType::Blank,
            TapeBlock::DecodedBytes(_) => BlockType::DecodedBytes,
            TapeBlock::RawSignal(_) => BlockType::RawSignal,
            TapeBlock::RawAudio(_) => BlockType::RawAudio,
        }
    }

    pub fn bit(&self, pos: u32, bypass_fsk: bool) -> bool {
        match self {
            TapeBlock::DecodedBytes(b) => b.bit(pos),
            TapeBlock::RawSignal(b) => b.field(bypass_fsk).get(pos),
            TapeBlock::Blank | TapeBlock::RawAudio(_) => true,
        }
    }

    pub fn bit_sum(&self, pos: u32, n: u32, bypass_fsk: bool) -> u32 {
        match self {
            TapeBlock::DecodedBytes(b) => b.bit_sum(pos, n),
            TapeBlock::RawSignal(b) => b.field(bypass_fsk).count_ones(pos, n),
            TapeBlock::Blank | TapeBlock::RawAudio(_) => n,
        }
    }

    /// Finds the first sample at or after `pos` equal to `polarity`. Hits past
    /// `limit` are allowed; `found == false` means the block ran out first.
    pub fn find_bit(&self, pos: u32, limit: u32, polarity: bool, bypass_fsk: bool) -> FindBitResult {
        match self {
            TapeBlock::DecodedBytes(b) => b.find_bit(pos, limit, polarity),
            TapeBlock::RawSignal(b) => {
                let (pos, found) = b.field(bypass_fsk).find(pos, limit, polarity);
                FindBitResult { pos, found }
            }
            TapeBlock::Blank | TapeBlock::RawAudio(_) => {
                if polarity {
                    FindBitResult { pos, found: true }
                } else {
                    FindBitResult { pos: limit, found: false }
                }
            }
        }
    }

    /// Returns `(transitions, mark_samples)` over `[pos, pos + n)`.
    pub fn transition_counts(&self, pos: u32, n: u32, last_polarity: bool, bypass_fsk: bool) -> (u32, u32) {
        match self {
            TapeBlock::DecodedBytes(b) => b.transition_counts(pos, n, last_polarity),
            TapeBlock::RawSignal(b) => b.field(bypass_fsk).transition_counts(pos, n, last_polarity),
            TapeBlock::Blank | TapeBlock::RawAudio(_) => ((n > 0 && !last_polarity) as u32, n),
        }
    }

    /// Mixes up to `dst.len()` sync-rate samples into `dst` starting at the
    /// block-local position `pos`, advancing it. Returns the number of output
    /// samples consumed.
    pub fn accumulate_audio(&self, dst: &mut [f32], pos: &mut AudioPosition, volume: f32) -> usize {
        match self {
            TapeBlock::Blank => accumulate_mark_tone(dst, pos, volume),
            TapeBlock::DecodedBytes(b) => b.accumulate_audio(dst, pos, volume),
            TapeBlock::RawAudio(b) => b.accumulate_audio(dst, pos, volume),
            TapeBlock::RawSignal(_) => {
                pos.advance(dst.len());
                dst.len()
            }
        }
    }
}

fn accumulate_mark_tone(dst: &mut [f32], pos: &mut AudioPosition, volume: f32) -> usize {
    // 12 machine clocks per tone cycle.
    const PHASE_PER_SYNC_SAMPLE: u32 = 0x1555_5555;
    const PHASE_PER_CYCLE: u32 = PHASE_PER_SYNC_SAMPLE / CYCLES_PER_SYNC_SAMPLE;

    let cycle = pos.sample.wrapping_mul(CYCLES_PER_DATA_SAMPLE).wrapping_add(pos.cycle);
    let mut phase = cycle.wrapping_mul(PHASE_PER_CYCLE);
    let table = audio_phase_table();

    for out in dst.iter_mut() {
        *out += (table[(phase >> 22) as usize] as i32 - 0x80) as f32 * volume;
        phase = phase.wrapping_add(PHASE_PER_SYNC_SAMPLE);
    }

    pos.advance(dst.len());
    dst.len()
}

fn samples_per_byte_f32(baud_rate: u32) -> u64 {
    (DATA_SAMPLE_RATE * 10.0 * TWO_POW_32 / baud_rate as f64 + 0.5) as u64
}

/// Bytes re-expanded into start/data/stop bits at a fixed baud rate.
///
/// Positions are mapped to bytes with 32.32 fixed point so that long blocks
/// do not drift. Past the end of the data the block reads as mark.
#[derive(Clone, Debug)]
pub struct DecodedByteBlock {
    baud_rate: u32,
    data: Vec<u8>,
    /// Running count of one bits (mod 24) before each byte; one longer than `data`.
    phase_sums: Vec<u8>,
    samples_per_byte_f32: u64,
    bytes_per_sample_f32: u64,
    bytes_per_cycle_f32: u64,
    bits_per_sync_sample_f32: u32,
    phase_per_one_bit_lo: u32,
    phase_per_one_bit_hi: u32,
}

impl DecodedByteBlock {
    pub fn new(baud_rate: u32) -> Self {
        let baud_rate = baud_rate.max(1);
        let baud = baud_rate as f64;
        let bytes_per_cycle_f32 = (baud * (TWO_POW_32 / 10.0) / MACHINE_CLOCK_HZ + 0.5) as u64;

        // A one bit advances the tone 1/12 of a cycle per sync sample instead of 1/16.
        let sync_rate = MACHINE_CLOCK_HZ / CYCLES_PER_SYNC_SAMPLE as f64;
        let phase_delta = (TWO_POW_32 * (1.0 / 12.0 - 1.0 / 16.0) * (sync_rate / baud)) as u64;

        Self {
            baud_rate,
            data: Vec::new(),
            phase_sums: vec![0],
            samples_per_byte_f32: samples_per_byte_f32(baud_rate),
            bytes_per_sample_f32: (baud / (DATA_SAMPLE_RATE * 10.0) * TWO_POW_32 + 0.5) as u64,
            bytes_per_cycle_f32,
            bits_per_sync_sample_f32: (bytes_per_cycle_f32 * 10 * CYCLES_PER_SYNC_SAMPLE as u64) as u32,
            phase_per_one_bit_lo: phase_delta as u32,
            phase_per_one_bit_hi: (phase_delta >> 32) as u32,
        }
    }

    /// Sample length of a new block holding `bytes` bytes at `baud_rate`.
    pub fn estimate_new_block_len(bytes: u32, baud_rate: u32) -> u32 {
        if baud_rate == 0 {
            return 0;
        }

        ((bytes as u128 * samples_per_byte_f32(baud_rate) as u128) >> 32) as u32
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);

        let mut phase = self.phase_sums.last().copied().unwrap_or(0);
        for &byte in data {
            phase = (phase + byte.count_ones() as u8 + 1) % 24;
            self.phase_sums.push(phase);
        }
    }

    /// Samples that appending `len` bytes would add.
    pub fn estimate_add_data(&self, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }

        let data_len = self.data.len() as u128;
        let spb = self.samples_per_byte_f32 as u128;
        let samples0 = (data_len * spb) >> 32;
        let samples1 = ((data_len + len as u128) * spb) >> 32;
        (samples1 - samples0) as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count64().min(u32::MAX as u64) as u32
    }

    pub fn sample_count64(&self) -> u64 {
        ((self.data.len() as u128 * self.samples_per_byte_f32 as u128) >> 32) as u64
    }

    #[inline]
    fn bit_at_byte_pos(&self, byte_pos_f32: u64) -> bool {
        let byte_index = (byte_pos_f32 >> 32) as usize;
        match self.data.get(byte_index) {
            None => true,
            Some(&byte) => {
                let framed = byte as u32 * 2 + 0x200;
                let bit = (((byte_pos_f32 as u32) as u64 * 10) >> 32) as u32;
                (framed >> bit) & 1 != 0
            }
        }
    }

    pub fn bit(&self, pos: u32) -> bool {
        self.bit_at_byte_pos(self.bytes_per_sample_f32 * pos as u64)
    }

    pub fn bit_sum(&self, pos: u32, n: u32) -> u32 {
        let mut byte_pos = self.bytes_per_sample_f32 * pos as u64;
        let mut sum = 0;
        for _ in 0..n {
            sum += self.bit_at_byte_pos(byte_pos) as u32;
            byte_pos += self.bytes_per_sample_f32;
        }
        sum
    }

    /// Jumps straight to the next framed bit of the wanted polarity. The
    /// answer may lie past `limit`.
    pub fn find_bit(&self, pos: u32, limit: u32, polarity: bool) -> FindBitResult {
        let byte_pos_f32 = self.bytes_per_sample_f32 * pos as u64;
        let byte_index = (byte_pos_f32 >> 32) as usize;

        let Some(&byte) = self.data.get(byte_index) else {
            return if polarity {
                FindBitResult { pos, found: true }
            } else {
                FindBitResult { pos: limit, found: false }
            };
        };

        let bit_index = (((byte_pos_f32 as u32) as u64 * 10) >> 32) as u32;
        let mut stream = (byte as u32 * 2 + 0x200) >> bit_index;
        if !polarity {
            stream = !stream;
        }

        if stream & 1 != 0 {
            return FindBitResult { pos, found: true };
        }

        // Within at most ten bits we hit either the match or the next start bit.
        let found_bit = bit_index + stream.trailing_zeros();
        let found_byte_pos_f32 =
            ((byte_index as u64) << 32) + (((found_bit as u64) << 32) + 9) / 10;
        let found_pos = (found_byte_pos_f32 - 1) / self.bytes_per_sample_f32 + 1;

        FindBitResult {
            pos: found_pos.min(u32::MAX as u64) as u32,
            found: ((found_byte_pos_f32 >> 32) as usize) < self.data.len(),
        }
    }

    pub fn transition_counts(&self, pos: u32, n: u32, last_polarity: bool) -> (u32, u32) {
        let mut byte_pos = self.bytes_per_sample_f32 * pos as u64;
        let mut prev = last_polarity;
        let mut xsum = 0;
        let mut msum = 0;

        for _ in 0..n {
            let bit = self.bit_at_byte_pos(byte_pos);
            msum += bit as u32;
            xsum += (bit != prev) as u32;
            prev = bit;
            byte_pos += self.bytes_per_sample_f32;
        }

        (xsum, msum)
    }

    fn framed_bit(&self, byte_index: usize, bit_index: u32) -> bool {
        match self.data.get(byte_index) {
            None => true,
            Some(&byte) => ((byte as u32 * 2 + 0x200) >> bit_index) & 1 != 0,
        }
    }

    /// Synthesizes phase-continuous FSK tones for the framed bits.
    fn accumulate_audio(&self, dst: &mut [f32], pos: &mut AudioPosition, volume: f32) -> usize {
        // Space bits run 16 clocks per tone cycle, mark bits 12; the base rate
        // is the space rate and each one bit adds the difference.
        const PHASE_PER_SYNC_SAMPLE: u32 = 0x1000_0000;
        const PHASE_PER_CYCLE: u32 = PHASE_PER_SYNC_SAMPLE / CYCLES_PER_SYNC_SAMPLE;

        let cycle = pos.sample as u64 * CYCLES_PER_DATA_SAMPLE as u64 + pos.cycle as u64;
        let byte_pos_f32 = cycle.wrapping_mul(self.bytes_per_cycle_f32);
        let mut byte_index = (byte_pos_f32 >> 32) as usize;
        let bit_pos_f32 = (byte_pos_f32 as u32) as u64 * 10;
        let mut bit_index = (bit_pos_f32 >> 32) as u32;

        let lo = self.phase_per_one_bit_lo;
        let hi = self.phase_per_one_bit_hi;
        let add_one_time = |phase: u32, t: u32| {
            phase
                .wrapping_add(hi.wrapping_mul(t))
                .wrapping_add(((lo as u64 * t as u64) >> 32) as u32)
        };

        let (one_bits, mut current) = match self.data.get(byte_index) {
            None => (self.phase_sums.last().copied().unwrap_or(0) as u32, true),
            Some(&byte) => {
                let framed = byte as u32 * 2 + 0x200;
                let below = (framed & ((1u32 << bit_index) - 1)).count_ones();
                (self.phase_sums[byte_index] as u32 + below, (framed >> bit_index) & 1 != 0)
            }
        };

        let mut phase = (cycle as u32)
            .wrapping_mul(PHASE_PER_CYCLE)
            .wrapping_add(one_bits.wrapping_mul(lo));
        if current {
            phase = add_one_time(phase, bit_pos_f32 as u32);
        }

        let table = audio_phase_table();
        let mut bit_accum = bit_pos_f32 as u32;

        for out in dst.iter_mut() {
            *out += (table[(phase >> 22) as usize] as i32 - 0x80) as f32 * volume;

            let new_bit_accum = bit_accum.wrapping_add(self.bits_per_sync_sample_f32);
            let mut one_time: u32 = 0;

            if new_bit_accum < bit_accum {
                if current {
                    one_time = one_time.wrapping_sub(bit_accum);
                }

                bit_index += 1;
                if bit_index >= 10 {
                    bit_index = 0;
                    byte_index += 1;
                }

                current = self.framed_bit(byte_index, bit_index);
                if current {
                    one_time = one_time.wrapping_add(new_bit_accum);
                }
            } else if current {
                one_time = new_bit_accum - bit_accum;
            }

            phase = add_one_time(phase, one_time).wrapping_add(PHASE_PER_SYNC_SAMPLE);
            bit_accum = new_bit_accum;
        }

        pos.advance(dst.len());
        dst.len()
    }
}

fn tone_increment(freq: f64) -> u64 {
    (0.5 + freq / DATA_SAMPLE_RATE * TWO_POW_32) as u64
}

/// Captured signal at full sample resolution.
///
/// Holds the FSK-demodulated bits and the direct (turbo) bits side by side;
/// queries pick one with `bypass_fsk`.
#[derive(Clone, Debug, Default)]
pub struct RawSignalBlock {
    raw: Bitfield,
    fsk: Bitfield,
    tone_phase: u64,
}

impl RawSignalBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps decoder output. The shorter field is padded with space.
    pub fn from_bitfields(mut fsk: Bitfield, mut raw: Bitfield) -> Self {
        if fsk.len() < raw.len() {
            fsk.extend_zeros(raw.len() - fsk.len());
        } else if raw.len() < fsk.len() {
            raw.extend_zeros(fsk.len() - raw.len());
        }

        Self { raw, fsk, tone_phase: 0 }
    }

    pub fn sample_count(&self) -> u32 {
        self.fsk.len()
    }

    pub fn field(&self, bypass_fsk: bool) -> &Bitfield {
        if bypass_fsk {
            &self.raw
        } else {
            &self.fsk
        }
    }

    /// Appends an FSK pulse; the raw field receives the matching tone as a square wave.
    pub fn add_fsk_pulse(&mut self, polarity: bool, samples: u32) {
        if samples == 0 {
            return;
        }

        let start = self.fsk.len();
        self.fsk.extend_zeros(samples);
        self.raw.extend_zeros(samples);

        if polarity {
            self.fsk.fill(start, samples, true);
        }

        let inc = tone_increment(if polarity { MARK_TONE_HZ } else { SPACE_TONE_HZ });
        for i in 0..samples {
            self.tone_phase = self.tone_phase.wrapping_add(inc);
            if self.tone_phase & 0x8000_0000 != 0 {
                self.raw.set(start + i, true);
            }
        }
    }

    /// Appends a direct-coded pulse; the FSK field reads mark underneath it.
    pub fn add_direct_pulse(&mut self, polarity: bool, samples: u32) {
        if samples == 0 {
            return;
        }

        let start = self.fsk.len();
        self.fsk.extend_zeros(samples);
        self.raw.extend_zeros(samples);

        if polarity {
            self.raw.fill(start, samples, true);
        }

        self.fsk.fill(start, samples, true);
        self.tone_phase = self
            .tone_phase
            .wrapping_add(tone_increment(MARK_TONE_HZ).wrapping_mul(samples as u64));
    }

    /// Appends run lengths of `[offset, offset + max_samples)` to `pulses`.
    ///
    /// Even indices of `pulses` are space and odd indices mark; the first run
    /// continues that parity, emitting a zero-length run if needed.
    pub fn extract_pulses(&self, pulses: &mut Vec<u32>, offset: u32, max_samples: u32, bypass_fsk: bool) {
        let field = self.field(bypass_fsk);
        let n = field.len();
        if offset >= n {
            return;
        }

        let limit = offset + max_samples.min(n - offset);
        let mut polarity = pulses.len() % 2 == 1;
        let mut pulse_len = 0u32;

        for i in offset..limit {
            let bit = field.get(i);
            if bit != polarity {
                polarity = bit;
                pulses.push(pulse_len);
                pulse_len = 0;
            }
            pulse_len += 1;
        }

        if pulse_len > 0 {
            pulses.push(pulse_len);
        }
    }
}

/// Unsigned 8-bit audio samples at the data sample rate.
#[derive(Clone, Debug, Default)]
pub struct RawAudioBlock {
    samples: Vec<u8>,
}

impl RawAudioBlock {
    pub fn new(samples: Vec<u8>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn sample_count(&self) -> u32 {
        self.samples.len() as u32
    }

    /// `(min, max)` over `[offset, offset + len)`; an empty range yields `(0xFF, 0x00)`.
    pub fn min_max(&self, offset: u32, len: u32) -> (u8, u8) {
        let start = (offset as usize).min(self.samples.len());
        let end = (start + len as usize).min(self.samples.len());

        self.samples[start..end]
            .iter()
            .fold((0xFF, 0x00), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }

    fn accumulate_audio(&self, dst: &mut [f32], pos: &mut AudioPosition, volume: f32) -> usize {
        for (i, out) in dst.iter_mut().enumerate() {
            let Some(&v) = self.samples.get(pos.sample as usize) else {
                return i;
            };

            *out += (v as i32 - 0x80) as f32 * volume;
            pos.advance(1);
        }

        dst.len()
    }
}
