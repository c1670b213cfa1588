//! Downsampled min/max summaries of the data and audio tracks.
//!
//! Each peak covers [`PEAK_BLOCK_SAMPLES`] data samples and is stored as a
//! `(min, max)` pair of unsigned 8-bit levels centred on 0x80. Edits only
//! mark a dirty sample range; peaks are recomputed lazily before a read.

use crate::block::TapeBlock;
use crate::resample::{Frame, Kernels, StereoRange};
use crate::timeline::Timeline;
use crate::{DATA_SAMPLE_RATE, PEAK_BLOCK_SAMPLES};

/// Peaks per second of tape.
pub const PEAK_SAMPLE_RATE: f64 = DATA_SAMPLE_RATE / PEAK_BLOCK_SAMPLES as f64;

/// One display column: normalized `[min, max]` for each track.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakColumn {
    pub data: [f32; 2],
    pub audio: [f32; 2],
}

#[derive(Clone, Debug)]
pub struct PeakMaps {
    data: Vec<u8>,
    audio: Vec<u8>,
    dirty_start: u32,
    dirty_end: u32,
}

impl Default for PeakMaps {
    fn default() -> Self {
        Self::new()
    }
}

impl PeakMaps {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            audio: Vec::new(),
            dirty_start: u32::MAX,
            dirty_end: 0,
        }
    }

    pub fn data_map(&self) -> &[u8] {
        &self.data
    }

    pub fn audio_map(&self) -> &[u8] {
        &self.audio
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_end > self.dirty_start
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn invalidate_all(&mut self) {
        self.dirty_start = 0;
        self.dirty_end = u32::MAX;
    }

    /// Marks `[start, end)` dirty.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        if start < end {
            self.dirty_start = self.dirty_start.min(start);
            self.dirty_end = self.dirty_end.max(end);
        }
    }

    pub fn invalidate_len(&mut self, start: u32, len: u32) {
        self.invalidate_range(start, start.saturating_add(len));
    }

    /// Marks everything from `start` onwards dirty; used when content shifts.
    pub fn invalidate_from(&mut self, start: u32) {
        self.dirty_start = self.dirty_start.min(start);
        self.dirty_end = u32::MAX;
    }

    /// Seeds the audio map from the data map once a separate audio track exists.
    pub fn copy_data_to_audio(&mut self) {
        self.audio = self.data.clone();
    }

    /// Recomputes dirty peaks. `audio` is `None` while the audio track
    /// still aliases the data track.
    pub fn update(&mut self, data: &Timeline, audio: Option<&Timeline>) {
        if !self.is_dirty() {
            return;
        }

        refresh_from_data(&mut self.data, data, self.dirty_start, self.dirty_end);
        if let Some(audio) = audio {
            refresh_from_audio(&mut self.audio, audio, self.dirty_start, self.dirty_end);
        }

        self.dirty_start = u32::MAX;
        self.dirty_end = 0;
    }

    /// Reduces the stored peaks into `out.len()` columns of `dt` seconds each,
    /// starting at `t0` seconds. Columns outside the map clamp to its edges.
    pub fn read(&self, t0: f32, dt: f32, out: &mut [PeakColumn], audio_created: bool) {
        let audio_map = if audio_created { &self.audio } else { &self.data };
        let limit = (self.data.len().min(audio_map.len()) / 2) as i64;

        if limit == 0 {
            out.fill(PeakColumn::default());
            return;
        }

        let rate = PEAK_SAMPLE_RATE as f32;
        let mut x0 = t0 * rate;
        let dx = dt * rate;
        let level = |v: u8| (v as f32 - 128.0) / 127.0;

        for column in out.iter_mut() {
            let x1 = x0 + dx;
            let ix0 = ((x0 - 0.5).ceil() as i64).clamp(0, limit - 1);
            let ix1 = ((x1 - 0.5).ceil() as i64).clamp(ix0 + 1, limit);
            x0 = x1;

            let (ix0, ix1) = (ix0 as usize, ix1 as usize);
            let mut data = (self.data[ix0 * 2], self.data[ix0 * 2 + 1]);
            let mut audio = (audio_map[ix0 * 2], audio_map[ix0 * 2 + 1]);

            for ix in ix0 + 1..ix1 {
                data.0 = data.0.min(self.data[ix * 2]);
                data.1 = data.1.max(self.data[ix * 2 + 1]);
                audio.0 = audio.0.min(audio_map[ix * 2]);
                audio.1 = audio.1.max(audio_map[ix * 2 + 1]);
            }

            *column = PeakColumn {
                data: [level(data.0), level(data.1)],
                audio: [level(audio.0), level(audio.1)],
            };
        }
    }
}

/// Peak slots covering `[start, end)` clipped to the track, resizing the map
/// to the track when the range reaches its end.
fn prepare_map(map: &mut Vec<u8>, track_len: u32, start: u32, end: u32) -> Option<std::ops::RangeInclusive<u32>> {
    let block = PEAK_BLOCK_SAMPLES;
    let total = track_len.div_ceil(block) as usize * 2;

    if end >= track_len {
        map.truncate(total);
    }

    let end = end.min(track_len);
    if end <= start {
        return None;
    }

    let first = start / block;
    let last = (end - 1) / block;

    let required = (last as usize + 1) * 2;
    if map.len() < required {
        map.resize(required, 0x80);
    }

    Some(first..=last)
}

fn refresh_from_data(map: &mut Vec<u8>, track: &Timeline, start: u32, end: u32) {
    let Some(peaks) = prepare_map(map, track.len(), start, end) else {
        return;
    };

    for peak in peaks {
        let block_start = peak * PEAK_BLOCK_SAMPLES;
        let block_len = PEAK_BLOCK_SAMPLES.min(track.len() - block_start);

        let marks = track.bit_sum(block_start, block_len, false) as u64;
        let delta = 127 - (marks * 127 / block_len as u64) as u8;

        map[peak as usize * 2] = 128 - delta;
        map[peak as usize * 2 + 1] = 128 + delta;
    }
}

fn refresh_from_audio(map: &mut Vec<u8>, track: &Timeline, start: u32, end: u32) {
    let Some(peaks) = prepare_map(map, track.len(), start, end) else {
        return;
    };

    let block = PEAK_BLOCK_SAMPLES as i64;
    let spans = track.spans();

    for peak in peaks {
        let mut range_start = peak * PEAK_BLOCK_SAMPLES;
        let range_end = range_start + PEAK_BLOCK_SAMPLES.min(track.len() - range_start);

        let mut min_acc = 0x80 * block + block / 2;
        let mut max_acc = min_acc;

        let mut idx = track.find_span(range_start);
        while let Some(content) = spans[idx].block.as_deref() {
            let span = &spans[idx];
            if span.start >= range_end {
                break;
            }

            let offset = range_start - span.start + span.offset;
            let len = range_end.min(spans[idx + 1].start) - range_start;

            match content {
                TapeBlock::RawAudio(raw) => {
                    let (lo, hi) = raw.min_max(offset, len);
                    min_acc += (lo as i64 - 0x80) * len as i64;
                    max_acc += (hi as i64 - 0x80) * len as i64;
                }
                _ => {
                    // spaces swing full scale, marks stay at the centre line
                    let spaces = (len - content.bit_sum(offset, len, false)) as i64;
                    min_acc -= spaces * 127;
                    max_acc += spaces * 127;
                }
            }

            range_start += len;
            idx += 1;
        }

        map[peak as usize * 2] = (min_acc / block).clamp(0, 255) as u8;
        map[peak as usize * 2 + 1] = (max_acc / block).clamp(0, 255) as u8;
    }
}

/// Builds peak maps straight from source audio frames while decoding, so
/// that the display shows the recording rather than the decoded bits.
/// The right channel feeds the data map and the left channel the audio map.
pub struct PeakMapProcessor {
    stereo: bool,
    kernels: &'static Kernels,
    range: StereoRange,
    scanned: bool,
    accum: u64,
    step: u64,
    frames_left: u32,
    data: Vec<u8>,
    audio: Vec<u8>,
}

const ZERO_RANGE: StereoRange = StereoRange {
    min: [0, 0],
    max: [0, 0],
};

impl PeakMapProcessor {
    pub fn new(stereo: bool, src_rate: u32) -> Self {
        let step = (src_rate as f64 / PEAK_SAMPLE_RATE * 4294967296.0).round() as u64;
        let mut processor = Self {
            stereo,
            kernels: Kernels::detect(),
            range: ZERO_RANGE,
            scanned: false,
            accum: 0x8000_0000,
            step,
            frames_left: 0,
            data: Vec::new(),
            audio: Vec::new(),
        };
        processor.advance();
        processor
    }

    fn advance(&mut self) {
        self.accum += self.step;
        self.frames_left = (self.accum >> 32) as u32;
        self.accum &= 0xFFFF_FFFF;
    }

    fn emit(&mut self) {
        let quantize = |v: i16| (v as f32 * 127.0 / 32767.0 + 128.0).round().clamp(0.0, 255.0) as u8;

        self.data.push(quantize(self.range.min[1]));
        self.data.push(quantize(self.range.max[1]));
        if self.stereo {
            self.audio.push(quantize(self.range.min[0]));
            self.audio.push(quantize(self.range.max[0]));
        }

        self.range = ZERO_RANGE;
        self.scanned = false;
    }

    pub fn process(&mut self, mut frames: &[Frame]) {
        while !frames.is_empty() {
            while self.frames_left == 0 {
                self.emit();
                self.advance();
            }

            let n = frames.len().min(self.frames_left as usize);
            let (head, tail) = frames.split_at(n);
            self.range.include(&(self.kernels.min_max)(head));
            self.scanned = true;
            self.frames_left -= n as u32;
            frames = tail;
        }
    }

    /// Flushes any partially filled peak and returns the finished maps.
    pub fn finish(mut self) -> PeakMaps {
        if self.scanned {
            self.emit();
        }

        let audio = if self.stereo { self.audio } else { self.data.clone() };
        PeakMaps {
            data: self.data,
            audio,
            dirty_start: u32::MAX,
            dirty_end: 0,
        }
    }
}
