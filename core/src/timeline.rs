//! Tape timeline: a piece table of spans over shared content blocks.
//!
//! Spans are kept strictly ascending and always end with a sentinel span
//! whose block is `None` and whose start is the timeline length. Blocks are
//! shared through `Arc`; appending to a block goes through `Arc::make_mut`
//! so that clips and the audio track never observe the change.

use std::cell::Cell;
use std::sync::Arc;

use crate::block::{AudioPosition, BlockType, DecodedByteBlock, RawSignalBlock, TapeBlock};
use crate::{SAMPLE_LIMIT, WRITE_HEADROOM};

#[derive(Clone, Debug)]
pub struct Span {
    pub start: u32,
    pub offset: u32,
    pub block: Option<Arc<TapeBlock>>,
}

impl Span {
    fn sentinel(start: u32) -> Self {
        Self {
            start,
            offset: 0,
            block: None,
        }
    }

    pub fn block_type(&self) -> Option<BlockType> {
        self.block.as_deref().map(TapeBlock::block_type)
    }

    fn is_blank(&self) -> bool {
        matches!(self.block.as_deref(), Some(TapeBlock::Blank))
    }

    fn in_middle_of_block(&self, pos: u32) -> bool {
        pos > self.start && self.block.is_some()
    }

    fn can_fuse_with_next(&self, next: &Span) -> bool {
        match (&self.block, &next.block) {
            (Some(a), Some(b)) => {
                (self.is_blank() && next.is_blank())
                    || (Arc::ptr_eq(a, b) && next.offset == self.offset + (next.start - self.start))
            }
            _ => false,
        }
    }
}

/// A self-contained, zero-based run of spans; the unit of copy and paste.
#[derive(Clone, Debug)]
pub struct SpanList {
    spans: Vec<Span>,
}

impl Default for SpanList {
    fn default() -> Self {
        Self {
            spans: vec![Span::sentinel(0)],
        }
    }
}

impl SpanList {
    pub fn len(&self) -> u32 {
        self.spans.last().map_or(0, |s| s.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spans including the trailing sentinel.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn span_count(&self) -> usize {
        self.spans.len() - 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCursor {
    pub position: u32,
    cached_span: usize,
}

impl WriteCursor {
    pub fn new(position: u32) -> Self {
        Self {
            position,
            cached_span: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pulse {
    pub polarity: bool,
    pub samples: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionType {
    Mark,
    Raw,
    DecodedData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub region_type: RegionType,
    pub region_start: u32,
    pub region_len: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextBit {
    pub pos: u32,
    pub bit: bool,
}

/// Transition and level totals over a window.
///
/// `mark_bits`/`space_bits` count every sample. The `steady_*` counts leave
/// out the samples at which the level changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionInfo {
    pub transition_bits: u32,
    pub mark_bits: u32,
    pub space_bits: u32,
    pub steady_mark_bits: u32,
    pub steady_space_bits: u32,
}

impl TransitionInfo {
    fn from_sums(n: u32, polarity0: bool, xsum: u32, msum: u32) -> Self {
        let space = n - msum;
        let (into_mark, into_space) = if polarity0 {
            (xsum / 2, (xsum + 1) / 2)
        } else {
            ((xsum + 1) / 2, xsum / 2)
        };

        Self {
            transition_bits: xsum,
            mark_bits: msum,
            space_bits: space,
            steady_mark_bits: msum.saturating_sub(into_mark),
            steady_space_bits: space.saturating_sub(into_space),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Timeline {
    list: SpanList,
    cached_span: Cell<usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn span_list(&self) -> &SpanList {
        &self.list
    }

    /// Spans including the trailing sentinel.
    pub fn spans(&self) -> &[Span] {
        self.list.spans()
    }

    pub fn clear(&mut self) {
        self.list = SpanList::default();
        self.cached_span.set(0);
    }

    /// Replaces the whole timeline with one block covering `[0, len)`.
    pub fn reset_to_block(&mut self, block: TapeBlock, len: u32) {
        self.clear();
        if len > 0 {
            self.list.spans = vec![
                Span {
                    start: 0,
                    offset: 0,
                    block: Some(Arc::new(block)),
                },
                Span::sentinel(len.min(SAMPLE_LIMIT)),
            ];
        }
    }

    /// Index of the span covering `pos`; the sentinel index when `pos >= len()`.
    pub fn find_span(&self, pos: u32) -> usize {
        if pos == 0 {
            return 0;
        }

        let spans = &self.list.spans;
        let cached = self.cached_span.get();
        if cached + 1 < spans.len() && spans[cached].start <= pos && pos < spans[cached + 1].start {
            return cached;
        }

        let idx = spans.partition_point(|s| s.start <= pos).saturating_sub(1);
        self.cached_span.set(idx);
        idx
    }

    pub fn region_info(&self, pos: u32) -> RegionInfo {
        if pos >= self.len() {
            return RegionInfo {
                region_type: RegionType::Mark,
                region_start: pos,
                region_len: 1,
            };
        }

        let idx = self.find_span(pos);
        let span = &self.list.spans[idx];
        let region_type = match span.block_type() {
            Some(BlockType::DecodedBytes) => RegionType::DecodedData,
            Some(BlockType::RawSignal) => RegionType::Raw,
            _ => RegionType::Mark,
        };

        RegionInfo {
            region_type,
            region_start: span.start,
            region_len: self.list.spans[idx + 1].start - span.start,
        }
    }

    /// Checks the structural invariants, describing the first violation.
    pub fn validate(&self) -> Result<(), String> {
        let spans = &self.list.spans;
        let Some((last, body)) = spans.split_last() else {
            return Err("missing sentinel".into());
        };

        if last.block.is_some() {
            return Err("last span is not a sentinel".into());
        }

        if spans[0].start != 0 {
            return Err(format!("first span starts at {}", spans[0].start));
        }

        for (i, span) in body.iter().enumerate() {
            let next = &spans[i + 1];
            let Some(block) = span.block.as_deref() else {
                return Err(format!("span {i} has no block"));
            };

            if next.start <= span.start {
                return Err(format!("span {i} is empty or out of order"));
            }

            if span.is_blank() && next.is_blank() {
                return Err(format!("spans {i} and {} are both blank", i + 1));
            }

            let capacity = match block {
                TapeBlock::Blank => u32::MAX,
                TapeBlock::DecodedBytes(b) => b.sample_count(),
                TapeBlock::RawSignal(b) => b.sample_count(),
                TapeBlock::RawAudio(b) => b.sample_count(),
            };

            if span.offset as u64 + (next.start - span.start) as u64 > capacity as u64 {
                return Err(format!("span {i} runs past the end of its block"));
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Writes

    pub fn write_blank_data(&mut self, cursor: &mut WriteCursor, len0: u32, insert: bool) -> bool {
        cursor.position = cursor.position.min(SAMPLE_LIMIT);

        let room = if insert {
            SAMPLE_LIMIT - self.len()
        } else {
            SAMPLE_LIMIT - cursor.position
        };
        let clamped = len0.min(room);
        let mut len = clamped;

        // a cursor past the end pads from the current end
        if cursor.position > self.len() {
            len += cursor.position - self.len();
            cursor.position = self.len();
        }

        if len == 0 {
            return clamped == len0;
        }

        self.update_write_cached_span(cursor);
        let mut idx = cursor.cached_span;

        if self.list.spans[idx].start == cursor.position {
            if idx == 0 || !self.list.spans[idx - 1].is_blank() {
                self.insert_new_block(idx, TapeBlock::Blank);
                idx += 1;
            }
        } else {
            if !self.list.spans[idx].is_blank() {
                idx = self.split_span(idx, cursor.position);
                self.insert_new_block(idx, TapeBlock::Blank);
            }
            idx += 1;
        }

        cursor.position += len;

        if insert {
            self.shift_spans_right(idx, len);
        } else {
            self.trim_spans(idx, cursor.position);
        }

        self.merge_blank_spans(idx);

        if cursor.position < self.list.spans[idx].start {
            idx -= 1;
        }
        cursor.cached_span = idx;

        clamped == len0
    }

    pub fn write_std_data(&mut self, cursor: &mut WriteCursor, data: &[u8], baud_rate: u32, insert: bool) -> bool {
        self.write_clamp_and_extend(cursor);

        if data.is_empty() {
            return true;
        }

        if cursor.position >= SAMPLE_LIMIT {
            return false;
        }

        let room = if insert {
            SAMPLE_LIMIT - self.len()
        } else {
            SAMPLE_LIMIT - cursor.position
        };
        let needed = DecodedByteBlock::estimate_new_block_len(data.len() as u32, baud_rate);
        if room < WRITE_HEADROOM.max(needed.saturating_add(1)) {
            return false;
        }

        self.update_write_cached_span(cursor);
        let mut idx = cursor.cached_span;

        if cursor.position != self.list.spans[idx].start {
            idx = self.split_span(idx, cursor.position);
        }

        if !self.can_append_std(idx, cursor.position, baud_rate) {
            self.insert_new_block(idx, TapeBlock::DecodedBytes(DecodedByteBlock::new(baud_rate)));
            idx += 1;
        }

        let span = &mut self.list.spans[idx - 1];
        let (start, offset) = (span.start, span.offset);
        let Some(TapeBlock::DecodedBytes(block)) = span.block.as_mut().map(Arc::make_mut) else {
            return false;
        };

        block.add_data(data);
        let new_pos = start + (block.sample_count() - offset);
        let delta = new_pos - cursor.position;

        cursor.position = new_pos;
        cursor.cached_span = idx;

        if insert {
            self.shift_spans_right(idx, delta);
        } else {
            self.trim_spans(idx, new_pos);
        }

        true
    }

    /// Samples that `write_std_data` would add at `cursor`, without writing.
    pub fn estimate_write_std_data(&self, cursor: &WriteCursor, num_bytes: u32, baud_rate: u32) -> u32 {
        if num_bytes == 0 {
            return 0;
        }

        if cursor.position > self.len() {
            return DecodedByteBlock::estimate_new_block_len(num_bytes, baud_rate);
        }

        let idx = self.find_span(cursor.position);
        if cursor.position != self.list.spans[idx].start || !self.can_append_std(idx, cursor.position, baud_rate) {
            return DecodedByteBlock::estimate_new_block_len(num_bytes, baud_rate);
        }

        match self.list.spans[idx - 1].block.as_deref() {
            Some(TapeBlock::DecodedBytes(block)) => block.estimate_add_data(num_bytes),
            _ => DecodedByteBlock::estimate_new_block_len(num_bytes, baud_rate),
        }
    }

    /// Writes a pulse train into a raw-signal block. `fsk` selects FSK pulses
    /// (tones) over direct-coded pulses.
    pub fn write_pulses(&mut self, cursor: &mut WriteCursor, pulses: &[Pulse], insert: bool, fsk: bool) -> bool {
        self.write_clamp_and_extend(cursor);

        let samples0 = pulses.iter().fold(0u32, |acc, p| acc.saturating_add(p.samples));
        if samples0 == 0 {
            return true;
        }

        let room = if insert {
            SAMPLE_LIMIT - self.len()
        } else {
            SAMPLE_LIMIT - cursor.position
        };
        let samples = samples0.min(room);
        if samples == 0 {
            return false;
        }

        self.update_write_cached_span(cursor);
        let mut idx = cursor.cached_span;

        // only append to a raw block when writing exactly at its untrimmed end
        let can_append = idx > 0 && {
            let prev = &self.list.spans[idx - 1];
            let next = &self.list.spans[idx];
            match prev.block.as_deref() {
                Some(TapeBlock::RawSignal(raw)) => {
                    next.start == cursor.position
                        && (next.start - prev.start) + prev.offset == raw.sample_count()
                }
                _ => false,
            }
        };

        if !can_append {
            idx = self.split_span(idx, cursor.position);
            self.insert_new_block(idx, TapeBlock::RawSignal(RawSignalBlock::new()));
            idx += 1;
        }

        let Some(TapeBlock::RawSignal(raw)) = self.list.spans[idx - 1].block.as_mut().map(Arc::make_mut) else {
            return false;
        };

        let mut left = samples;
        for pulse in pulses {
            let len = pulse.samples.min(left);
            if fsk {
                raw.add_fsk_pulse(pulse.polarity, len);
            } else {
                raw.add_direct_pulse(pulse.polarity, len);
            }

            left -= len;
            if left == 0 {
                break;
            }
        }

        cursor.position += samples;
        cursor.cached_span = idx;

        if insert {
            self.shift_spans_right(idx, samples);
        } else {
            self.trim_spans(idx, cursor.position);
        }

        samples == samples0
    }

    // ---------------------------------------------------------------------
    // Range edits

    /// Opens a gap of `clip.len()` at `start` and fills it with the clip.
    ///
    /// Returns `None`, leaving the timeline untouched, when the padded result
    /// would not fit below [`SAMPLE_LIMIT`].
    pub fn insert_range(&mut self, start: u32, clip: &SpanList) -> Option<u32> {
        if start.max(self.len()) as u64 + clip.len() as u64 > SAMPLE_LIMIT as u64 {
            return None;
        }

        let mut cursor = WriteCursor::new(start);
        if !self.write_blank_data(&mut cursor, clip.len(), true) {
            return None;
        }
        self.replace_range(start, clip);
        Some(start + clip.len())
    }

    /// Overwrites `[start, start + clip.len())` with the clip, extending the
    /// timeline if needed.
    pub fn replace_range(&mut self, start: u32, clip: &SpanList) -> u32 {
        let mut cursor = WriteCursor::new(start);
        self.write_clamp_and_extend(&mut cursor);

        if start >= SAMPLE_LIMIT || clip.spans.len() <= 1 {
            return start;
        }

        self.update_write_cached_span(&mut cursor);
        let insert_idx = self.split_span(cursor.cached_span, start);

        let len = clip.len().min(SAMPLE_LIMIT - start);
        let body = &clip.spans[..clip.spans.len() - 1];
        let count = body.partition_point(|s| s.start <= len - 1);

        let inserted = body[..count].iter().map(|s| Span {
            start: s.start + start,
            offset: s.offset,
            block: s.block.clone(),
        });
        self.list.spans.splice(insert_idx..insert_idx, inserted);

        self.trim_spans(insert_idx + count, start + len);

        // may become a three-way fuse for a single-span clip
        self.fuse_spans(insert_idx + count);
        self.fuse_spans(insert_idx);

        start + len
    }

    pub fn delete_range(&mut self, start: u32, end: u32) {
        let end = end.min(self.len());
        if start >= end {
            return;
        }

        let start_idx = self.split_span(self.find_span(start), start);
        self.trim_spans(start_idx, end);

        let len = end - start;
        for span in &mut self.list.spans[start_idx..] {
            span.start -= len;
        }

        self.merge_blank_spans(start_idx);
    }

    /// Zero-based copy of `[start, start + len)` sharing the underlying blocks.
    pub fn copy_range(&self, start: u32, len: u32) -> SpanList {
        if start >= self.len() || len == 0 {
            return SpanList::default();
        }

        let len = len.min(self.len() - start);
        let end = start + len;
        let start_idx = self.find_span(start);
        let end_idx = self.find_span(end);
        let end_idx = end_idx + self.list.spans[end_idx].in_middle_of_block(end) as usize;

        let mut spans: Vec<Span> = self.list.spans[start_idx..end_idx]
            .iter()
            .map(|span| {
                let mut span = span.clone();
                if span.start < start {
                    span.offset += start - span.start;
                    span.start = start;
                }
                span.start -= start;
                span
            })
            .collect();

        spans.push(Span::sentinel(len));
        SpanList { spans }
    }

    // ---------------------------------------------------------------------
    // Bit queries

    pub fn bit(&self, pos: u32, bypass_fsk: bool) -> bool {
        if pos >= self.len() {
            return true;
        }

        let spans = &self.list.spans;
        let mut idx = self.find_span(pos);
        while let Some(block) = spans[idx].block.as_deref() {
            if spans[idx + 1].start > pos {
                return block.bit(pos - spans[idx].start + spans[idx].offset, bypass_fsk);
            }
            idx += 1;
        }

        true
    }

    /// Number of mark samples in `[pos, pos + len)`; the region past the end
    /// counts as mark.
    pub fn bit_sum(&self, pos: u32, len: u32, bypass_fsk: bool) -> u32 {
        let length = self.len();
        if pos >= length {
            return len;
        }

        let mut len = len;
        let mut sum = 0;
        if length - pos < len {
            sum = len - (length - pos);
            len = length - pos;
        }

        let spans = &self.list.spans;
        let mut pos = pos;
        let mut idx = self.find_span(pos);

        while len > 0 {
            let span = &spans[idx];
            let Some(block) = span.block.as_deref() else {
                sum += len;
                break;
            };

            let next_start = spans[idx + 1].start;
            if next_start > pos {
                let section = (next_start - pos).min(len);
                sum += block.bit_sum(pos - span.start + span.offset, section, bypass_fsk);
                pos += section;
                len -= section;
            }
            idx += 1;
        }

        sum
    }

    /// Hysteresis read: `sum < threshold` is space, `sum > period - threshold`
    /// is mark, anything between keeps `prev_bit`.
    pub fn bit_with_hysteresis(&self, pos: u32, period: u32, threshold: u32, prev_bit: bool, bypass_fsk: bool) -> bool {
        let sum = self.bit_sum(pos, period, bypass_fsk);

        if sum < threshold {
            false
        } else if sum > period.saturating_sub(threshold) {
            true
        } else {
            prev_bit
        }
    }

    /// Finds the first sample in `[pos, limit]` equal to `level`.
    ///
    /// An exhausted search returns `{limit, !level}`. Past the end of the
    /// tape the line is mark forever: a mark search succeeds at `pos`, a space
    /// search returns `{u32::MAX, true}`.
    pub fn find_next_bit(&self, pos: u32, limit: u32, level: bool, bypass_fsk: bool) -> NextBit {
        let past_end = |pos: u32| NextBit {
            pos: if level { pos } else { u32::MAX },
            bit: true,
        };
        let exhausted = NextBit { pos: limit, bit: !level };

        if pos >= self.len() {
            return past_end(pos);
        }

        let spans = &self.list.spans;
        let mut pos = pos;
        let mut idx = self.find_span(pos);

        loop {
            if pos > limit {
                return exhausted;
            }

            let span = &spans[idx];
            let Some(block) = span.block.as_deref() else {
                return past_end(pos);
            };

            let section_end = spans[idx + 1].start;
            if pos < section_end {
                let delta = span.offset.wrapping_sub(span.start);
                let search_limit = limit.min(section_end - 1) + 1;
                let local_limit = search_limit.wrapping_add(delta);
                let r = block.find_bit(pos.wrapping_add(delta), local_limit, level, bypass_fsk);

                if r.found && r.pos < local_limit {
                    return NextBit {
                        pos: r.pos.wrapping_sub(delta),
                        bit: level,
                    };
                }

                if search_limit < section_end {
                    return exhausted;
                }

                pos = section_end;
            }

            idx += 1;
        }
    }

    /// Counts transitions and levels over `[pos, pos + n)`. The sample before
    /// `pos` (mark at 0) seeds the first comparison; the region past the end
    /// is mark.
    pub fn transition_info(&self, pos: u32, n: u32, bypass_fsk: bool) -> TransitionInfo {
        if pos > self.len() {
            return TransitionInfo::from_sums(n, true, 0, n);
        }

        let polarity0 = pos == 0 || self.bit(pos - 1, bypass_fsk);
        let mut polarity = polarity0;
        let mut xsum = 0;
        let mut msum = 0;
        let mut remaining = n;
        let mut pos = pos;

        let spans = &self.list.spans;
        let mut idx = self.find_span(pos);

        while remaining > 0 {
            let span = &spans[idx];
            let Some(block) = span.block.as_deref() else {
                break;
            };

            let next_start = spans[idx + 1].start;
            if next_start > pos {
                let section = (next_start - pos).min(remaining);
                let (x, m) = block.transition_counts(pos - span.start + span.offset, section, polarity, bypass_fsk);
                xsum += x;
                msum += m;
                if x & 1 != 0 {
                    polarity = !polarity;
                }
                pos += section;
                remaining -= section;
            }
            idx += 1;
        }

        if remaining > 0 {
            if !polarity {
                xsum += 1;
            }
            msum += remaining;
        }

        TransitionInfo::from_sums(n, polarity0, xsum, msum)
    }

    /// Mixes playback audio for this track into `dst` from `pos` onward.
    pub fn accumulate_audio(&self, dst: &mut [f32], pos: &mut AudioPosition, volume: f32) {
        let spans = &self.list.spans;
        let mut idx = self.find_span(pos.sample);
        let mut written = 0;

        while written < dst.len() {
            let span = &spans[idx];
            let Some(block) = span.block.as_deref() else {
                break;
            };

            let next_start = spans[idx + 1].start;
            if next_start > pos.sample {
                // sync samples left before this span ends
                let cycles_left = (next_start - pos.sample) as u64 * crate::CYCLES_PER_DATA_SAMPLE as u64;
                let limit = (cycles_left - pos.cycle as u64 + crate::CYCLES_PER_SYNC_SAMPLE as u64 - 1)
                    / crate::CYCLES_PER_SYNC_SAMPLE as u64;
                let take = (dst.len() - written).min(limit as usize);

                let mut local = AudioPosition {
                    sample: pos.sample - span.start + span.offset,
                    cycle: pos.cycle,
                };
                let produced = block.accumulate_audio(&mut dst[written..written + take], &mut local, volume);

                written += produced;
                pos.sample = local.sample + span.start - span.offset;
                pos.cycle = local.cycle;

                if produced < take {
                    // block ran dry before the span ended; skip to the next span
                    pos.sample = next_start;
                    pos.cycle = 0;
                }
            }
            idx += 1;
        }
    }

    // ---------------------------------------------------------------------
    // Span surgery

    fn can_append_std(&self, idx: usize, pos: u32, baud_rate: u32) -> bool {
        if idx == 0 {
            return false;
        }

        let prev = &self.list.spans[idx - 1];
        match prev.block.as_deref() {
            Some(TapeBlock::DecodedBytes(block)) => {
                block.baud_rate() == baud_rate
                    && prev.offset as u64 + (pos - prev.start) as u64 == block.sample_count() as u64
            }
            _ => false,
        }
    }

    /// Splits the span at `idx` so that a span starts at `split_pt`; returns
    /// the index of the span starting there.
    fn split_span(&mut self, idx: usize, split_pt: u32) -> usize {
        let spans = &mut self.list.spans;
        let pos1 = spans[idx].start;
        if split_pt == pos1 {
            return idx;
        }

        let pos2 = spans[idx + 1].start;
        if split_pt != pos2 {
            let mut tail = spans[idx].clone();
            tail.offset += split_pt - pos1;
            tail.start = split_pt;
            spans.insert(idx + 1, tail);
        }

        idx + 1
    }

    /// Inserts a zero-length span for a fresh block before `idx`.
    fn insert_new_block(&mut self, idx: usize, block: TapeBlock) {
        let start = self.list.spans[idx].start;
        self.list.spans.insert(
            idx,
            Span {
                start,
                offset: 0,
                block: Some(Arc::new(block)),
            },
        );
    }

    /// Drops or trims spans from `idx` so that the first remaining one starts
    /// at `pos`; reaching the sentinel extends the timeline to `pos`.
    fn trim_spans(&mut self, idx: usize, pos: u32) {
        let spans = &mut self.list.spans;
        let mut i = idx;

        loop {
            let start = spans[i].start;
            if start >= pos {
                break;
            }

            if spans[i].block.is_none() {
                spans[i].start = pos;
                break;
            }

            if spans[i + 1].start > pos {
                spans[i].offset += pos - start;
                spans[i].start = pos;
                break;
            }

            i += 1;
        }

        spans.drain(idx..i);
    }

    fn fuse_spans(&mut self, idx: usize) -> bool {
        if idx == 0 || idx >= self.list.span_count() {
            return false;
        }

        if self.list.spans[idx - 1].can_fuse_with_next(&self.list.spans[idx]) {
            self.list.spans.remove(idx);
            return true;
        }

        false
    }

    fn shift_spans_right(&mut self, idx: usize, delta: u32) {
        let delta = delta.min(SAMPLE_LIMIT - self.len());
        for span in &mut self.list.spans[idx..] {
            span.start += delta;
        }
    }

    fn merge_blank_spans(&mut self, idx: usize) {
        if idx == 0 || !self.list.spans[idx - 1].is_blank() {
            return;
        }

        let mut end = idx;
        while self.list.spans[end].is_blank() {
            end += 1;
        }

        if end > idx {
            let pos = self.list.spans[end].start;
            self.trim_spans(idx, pos);
        }
    }

    fn write_clamp_and_extend(&mut self, cursor: &mut WriteCursor) {
        cursor.position = cursor.position.min(SAMPLE_LIMIT);

        let pos = cursor.position;
        if pos > self.len() {
            cursor.position = self.len();
            self.write_blank_data(cursor, pos - self.len(), false);
        }
    }

    fn update_write_cached_span(&self, cursor: &mut WriteCursor) {
        let spans = &self.list.spans;
        let idx = cursor.cached_span;
        if idx + 1 < spans.len() && spans[idx].start <= cursor.position && cursor.position < spans[idx + 1].start {
            return;
        }

        cursor.cached_span = self.find_span(cursor.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SAMPLE_RATE;

    fn blank(len: u32) -> Timeline {
        let mut t = Timeline::new();
        assert!(t.write_blank_data(&mut WriteCursor::new(0), len, false));
        t
    }

    fn pulses(spec: &[(bool, u32)]) -> Vec<Pulse> {
        spec.iter()
            .map(|&(polarity, samples)| Pulse { polarity, samples })
            .collect()
    }

    fn bits(t: &Timeline, range: std::ops::Range<u32>) -> Vec<bool> {
        range.map(|p| t.bit(p, false)).collect()
    }

    #[test]
    fn test_empty_timeline() {
        let t = Timeline::new();
        assert_eq!(t.len(), 0);
        assert_eq!(t.find_span(0), 0);
        assert_eq!(t.find_span(100), 0);
        assert!(t.bit(0, false));
        assert_eq!(t.bit_sum(0, 50, false), 50);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_blank_writes_extend_and_merge() {
        let mut t = Timeline::new();
        let mut cursor = WriteCursor::new(0);
        t.write_blank_data(&mut cursor, 100, false);
        t.write_blank_data(&mut cursor, 100, false);
        assert_eq!(t.len(), 200);
        assert_eq!(t.span_list().span_count(), 1);

        // writing past the end pads with blank first
        let mut cursor = WriteCursor::new(400);
        t.write_blank_data(&mut cursor, 100, false);
        assert_eq!(cursor.position, 500);
        assert_eq!(t.len(), 500);
        assert_eq!(t.bit_sum(0, 500, false), 500);
        assert_eq!(t.span_list().span_count(), 1);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_pulse_overwrite_inside_blank() {
        let mut t = blank(500);
        let mut cursor = WriteCursor::new(150);
        assert!(t.write_pulses(&mut cursor, &pulses(&[(false, 100)]), false, true));
        assert_eq!(cursor.position, 250);
        assert_eq!(t.len(), 500);
        assert_eq!(t.bit_sum(0, 500, false), 400);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_std_write_position() {
        let mut t = blank(500);
        let mut cursor = WriteCursor::new(50);
        assert!(t.write_std_data(&mut cursor, &[0xAA], 600, false));

        let byte_len = (DATA_SAMPLE_RATE / 60.0) as u32;
        assert!(cursor.position.abs_diff(50 + byte_len) <= 1);

        let ones = t.bit_sum(50, cursor.position - 50, false);
        // 0xAA framed has five ones out of ten bits
        assert!(ones.abs_diff(byte_len / 2) <= 6);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_std_writes_append_to_same_block() {
        let mut t = Timeline::new();
        let mut cursor = WriteCursor::new(0);
        t.write_std_data(&mut cursor, &[1, 2, 3], 600, false);
        let expected = t.estimate_write_std_data(&cursor, 2, 600);
        let before = cursor.position;
        t.write_std_data(&mut cursor, &[4, 5], 600, false);
        assert_eq!(cursor.position - before, expected);
        assert_eq!(t.span_list().span_count(), 1);

        // a baud change starts a new block
        t.write_std_data(&mut cursor, &[6], 1200, false);
        assert_eq!(t.span_list().span_count(), 2);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_std_write_refused_near_limit() {
        let mut t = Timeline::new();
        let mut cursor = WriteCursor::new(SAMPLE_LIMIT - 10);
        assert!(!t.write_std_data(&mut cursor, &[0], 600, false));
    }

    #[test]
    fn test_blank_write_clamps_at_limit() {
        let mut t = Timeline::new();
        let mut cursor = WriteCursor::new(0);
        assert!(!t.write_blank_data(&mut cursor, u32::MAX, false));
        assert_eq!(t.len(), SAMPLE_LIMIT);
    }

    #[test]
    fn test_region_info() {
        let mut t = blank(100);
        let mut cursor = WriteCursor::new(100);
        t.write_std_data(&mut cursor, &[0x00], 600, false);
        t.write_pulses(&mut cursor, &pulses(&[(false, 10), (true, 10)]), false, true);

        assert_eq!(t.region_info(50).region_type, RegionType::Mark);
        let std = t.region_info(150);
        assert_eq!(std.region_type, RegionType::DecodedData);
        assert_eq!(std.region_start, 100);
        assert_eq!(t.region_info(cursor.position - 1).region_type, RegionType::Raw);
        assert_eq!(t.region_info(cursor.position + 5).region_len, 1);
    }

    #[test]
    fn test_copy_insert_at_same_position_preserves_bits() {
        let mut t = blank(200);
        let mut cursor = WriteCursor::new(50);
        t.write_pulses(&mut cursor, &pulses(&[(false, 30), (true, 5), (false, 40)]), false, true);

        let before = bits(&t, 0..t.len());
        let clip = t.copy_range(60, 50);
        assert_eq!(clip.len(), 50);

        let after_pos = t.insert_range(60, &clip);
        assert_eq!(after_pos, Some(110));
        assert_eq!(t.len(), 250);
        assert!(t.validate().is_ok());

        // content before and after the inserted copy is unchanged, and the
        // copy reproduces the original window
        let now = bits(&t, 0..t.len());
        assert_eq!(&now[..110], &before[..110]);
        assert_eq!(&now[110..], &before[60..]);
        assert_eq!(&now[60..110], &before[60..110]);
    }

    #[test]
    fn test_insert_past_end_refuses_to_truncate() {
        let clip = blank(100).copy_range(0, 100);

        let mut t = Timeline::new();
        assert_eq!(t.insert_range(SAMPLE_LIMIT - 10, &clip), None);
        assert_eq!(t.len(), 0);

        let mut t = blank(50);
        assert_eq!(t.insert_range(SAMPLE_LIMIT - 50, &clip), None);
        assert_eq!(t.len(), 50);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_insert_then_delete_restores() {
        let mut t = blank(300);
        let mut cursor = WriteCursor::new(100);
        t.write_std_data(&mut cursor, &[0x12, 0x34], 1200, false);

        let before = bits(&t, 0..t.len());
        let len_before = t.len();

        let mut source = Timeline::new();
        source.write_pulses(&mut WriteCursor::new(0), &pulses(&[(false, 17), (true, 9), (false, 4)]), false, true);
        let clip = source.copy_range(0, source.len());

        assert_eq!(t.insert_range(120, &clip), Some(150));
        assert_eq!(t.len(), len_before + 30);
        t.delete_range(120, 150);

        assert_eq!(t.len(), len_before);
        assert_eq!(bits(&t, 0..t.len()), before);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_replace_range_extends_past_end() {
        let mut t = blank(100);
        let mut source = Timeline::new();
        source.write_pulses(&mut WriteCursor::new(0), &pulses(&[(false, 60)]), false, true);
        let clip = source.copy_range(0, 60);

        assert_eq!(t.replace_range(80, &clip), 140);
        assert_eq!(t.len(), 140);
        assert_eq!(t.bit_sum(0, 140, false), 80);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_delete_merges_blanks() {
        let mut t = blank(100);
        let mut cursor = WriteCursor::new(100);
        t.write_pulses(&mut cursor, &pulses(&[(false, 50)]), false, true);
        t.write_blank_data(&mut cursor, 100, false);
        assert_eq!(t.span_list().span_count(), 3);

        t.delete_range(100, 150);
        assert_eq!(t.len(), 200);
        assert_eq!(t.span_list().span_count(), 1);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_delete_empty_range_is_noop() {
        let mut t = blank(100);
        t.delete_range(40, 40);
        t.delete_range(150, 200);
        assert_eq!(t.len(), 100);
    }

    #[test]
    fn test_copy_out_of_range_is_empty() {
        let t = blank(100);
        assert!(t.copy_range(100, 10).is_empty());
        assert!(t.copy_range(10, 0).is_empty());
        assert_eq!(t.copy_range(90, 50).len(), 10);
    }

    #[test]
    fn test_clip_is_isolated_from_later_appends() {
        let mut t = Timeline::new();
        let mut cursor = WriteCursor::new(0);
        t.write_pulses(&mut cursor, &pulses(&[(false, 20)]), false, true);
        let clip = t.copy_range(0, 20);

        // appending at the block's end mutates a private copy
        t.write_pulses(&mut cursor, &pulses(&[(true, 20)]), false, true);
        assert_eq!(t.span_list().span_count(), 1);
        match clip.spans()[0].block.as_deref() {
            Some(TapeBlock::RawSignal(raw)) => assert_eq!(raw.sample_count(), 20),
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_find_next_bit() {
        let mut t = blank(100);
        let mut cursor = WriteCursor::new(40);
        t.write_pulses(&mut cursor, &pulses(&[(false, 10)]), false, true);

        assert_eq!(t.find_next_bit(0, 99, false, false), NextBit { pos: 40, bit: false });
        assert_eq!(t.find_next_bit(40, 99, true, false), NextBit { pos: 50, bit: true });
        assert_eq!(t.find_next_bit(0, 30, false, false), NextBit { pos: 30, bit: true });
        assert_eq!(t.find_next_bit(100, 200, false, false), NextBit { pos: u32::MAX, bit: true });
        assert_eq!(t.find_next_bit(120, 200, true, false), NextBit { pos: 120, bit: true });
    }

    #[test]
    fn test_transition_info_matches_scan() {
        let mut t = blank(50);
        let mut cursor = WriteCursor::new(50);
        t.write_std_data(&mut cursor, &[0x55, 0xC3], 2400, false);
        t.write_pulses(&mut cursor, &pulses(&[(false, 7), (true, 3), (false, 11), (true, 2)]), false, true);
        let len = t.len();

        for pos in (0..len + 5).step_by(3) {
            for n in [1u32, 9, 40, 200] {
                let info = t.transition_info(pos, n, false);
                let mut prev = pos == 0 || t.bit(pos - 1, false);
                let mut marks = 0;
                let mut transitions = 0;
                for p in pos..pos + n {
                    let b = t.bit(p, false);
                    marks += b as u32;
                    transitions += (b != prev) as u32;
                    prev = b;
                }
                assert_eq!(info.mark_bits, marks, "pos={pos} n={n}");
                assert_eq!(info.space_bits, n - marks);
                assert_eq!(info.transition_bits, transitions, "pos={pos} n={n}");
                assert!(info.steady_mark_bits <= info.mark_bits);
            }
        }
    }

    #[test]
    fn test_hysteresis_holds_in_dead_band() {
        let mut t = blank(100);
        let mut cursor = WriteCursor::new(10);
        t.write_pulses(&mut cursor, &pulses(&[(false, 4)]), false, true);

        // window [8, 16) holds 4 spaces: inside the dead band for threshold 3
        assert!(t.bit_with_hysteresis(8, 8, 3, true, false));
        assert!(!t.bit_with_hysteresis(8, 8, 3, false, false));
        // window [10, 14) is all space
        assert!(!t.bit_with_hysteresis(10, 4, 1, true, false));
    }
}
