//! Incremental hysteresis decoding over a moving window of the data track.
//!
//! Rather than summing the window at every sample, the cursor tracks the
//! next polarity change at the window head and tail and projects the window
//! sum linearly between them, stopping early wherever the sum would cross a
//! threshold.

use crate::timeline::{NextBit, Timeline};

/// Bounds a single forward search so one update never scans far ahead.
const SEARCH_LIMIT: u32 = 10000;

#[derive(Clone, Copy, Debug, Default)]
struct SampleCursor {
    next_transition: u32,
    current: bool,
    next: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitSumNext {
    /// Decoded mark samples within the range.
    pub sum: u32,
    /// Decoded value at the end of the range.
    pub next_bit: bool,
}

#[derive(Clone, Debug)]
pub struct SlidingWindowCursor {
    head: SampleCursor,
    tail: SampleCursor,
    next_count: u32,
    next_transition: u32,
    current: bool,
    primed: bool,
    /// Samples in the window; must be below the search limit of 10000.
    pub window: u32,
    /// Distance from the window start to the decoded sample.
    pub offset: u32,
    /// The decoded value drops to space when the window sum is below this.
    pub threshold_lo: u32,
    /// The decoded value rises to mark when the window sum is above this.
    pub threshold_hi: u32,
    pub bypass_fsk: bool,
}

impl SlidingWindowCursor {
    pub fn new(window: u32, offset: u32, threshold_lo: u32, threshold_hi: u32, bypass_fsk: bool) -> Self {
        Self {
            head: SampleCursor::default(),
            tail: SampleCursor::default(),
            next_count: 0,
            next_transition: 0,
            current: false,
            primed: false,
            window,
            offset,
            threshold_lo,
            threshold_hi,
            bypass_fsk,
        }
    }

    /// Forgets the tracked state; required before moving backwards.
    pub fn reset(&mut self) {
        self.primed = false;
        self.next_transition = 0;
    }

    /// Window sum with samples before the start of tape counted as mark.
    fn window_sum(&self, tape: &Timeline, pos: u32) -> u32 {
        let preroll = self.offset.saturating_sub(pos);
        let start = pos + preroll - self.offset;
        preroll + tape.bit_sum(start, self.window - preroll, self.bypass_fsk)
    }

    fn prime(&mut self, tape: &Timeline, pos: u32) {
        let head_offset = self.window - self.offset;

        self.head.current = tape.bit(pos + head_offset, self.bypass_fsk);
        let next_head = tape.find_next_bit(pos + head_offset + 1, pos + SEARCH_LIMIT, !self.head.current, self.bypass_fsk);
        self.head.next_transition = next_head.pos.saturating_sub(head_offset);
        self.head.next = next_head.bit;

        // the tail may start before the tape, which reads as mark
        self.tail.current = pos < self.offset || tape.bit(pos - self.offset, self.bypass_fsk);
        let next_tail = tape.find_next_bit(
            pos.max(self.offset) - self.offset,
            pos + SEARCH_LIMIT,
            !self.tail.current,
            self.bypass_fsk,
        );
        self.tail.next_transition = next_tail.pos.saturating_add(self.offset);
        self.tail.next = next_tail.bit;

        self.next_count = self.window_sum(tape, pos);
        self.current = self.next_count >= self.window >> 1;
        self.next_transition = pos;
        self.primed = true;
    }

    /// Advances the decoder to `pos`. Positions must not go backwards
    /// without a `reset`.
    pub fn update(&mut self, tape: &Timeline, pos: u32) {
        while !self.primed || pos >= self.next_transition {
            if !self.primed {
                self.prime(tape, pos);
            }

            debug_assert_eq!(self.next_count, self.window_sum(tape, self.next_transition));

            if self.next_count < self.threshold_lo {
                self.current = false;
            } else if self.next_count > self.threshold_hi {
                self.current = true;
            }

            let head_offset = self.window - self.offset;

            if self.next_transition == self.head.next_transition {
                self.head.current = self.head.next;

                let next_head = tape.find_next_bit(
                    self.next_transition + head_offset + 1,
                    self.next_transition + SEARCH_LIMIT,
                    !self.head.current,
                    self.bypass_fsk,
                );
                self.head.next_transition = next_head.pos.saturating_sub(head_offset);
                self.head.next = next_head.bit;
            }

            if self.next_transition == self.tail.next_transition {
                self.tail.current = self.tail.next;

                let next_tail = tape.find_next_bit(
                    self.next_transition - self.offset + 1,
                    self.next_transition + SEARCH_LIMIT,
                    !self.tail.current,
                    self.bypass_fsk,
                );
                // an endless search result must not wrap around
                self.tail.next_transition = next_tail.pos.checked_add(self.offset).unwrap_or(u32::MAX);
                self.tail.next = next_tail.bit;
            }

            let slope = self.head.current as i64 - self.tail.current as i64;
            let mut dist = self.head.next_transition.min(self.tail.next_transition) - self.next_transition;

            // stop where the projected sum would cross the active threshold
            if self.current {
                if slope < 0 && self.next_count >= self.threshold_lo {
                    dist = dist.min(self.next_count - self.threshold_lo + 1);
                }
            } else if slope > 0 && self.next_count <= self.threshold_hi {
                dist = dist.min(self.threshold_hi - self.next_count + 1);
            }

            self.next_transition = self.next_transition.saturating_add(dist);
            self.next_count = (self.next_count as i64 + slope * dist as i64) as u32;

            if self.next_transition == u32::MAX {
                break;
            }
        }
    }

    pub fn bit(&mut self, tape: &Timeline, pos: u32) -> bool {
        self.update(tape, pos);
        self.current
    }

    /// Sums decoded marks over `[pos, end)` and reports the value at `end`.
    pub fn bit_sum_and_next(&mut self, tape: &Timeline, pos: u32, end: u32) -> BitSumNext {
        self.update(tape, pos);

        if pos >= end {
            return BitSumNext {
                sum: 0,
                next_bit: self.current,
            };
        }

        let mut pos = pos;
        let mut sum = 0;
        loop {
            if self.next_transition >= end {
                if self.current {
                    sum += end - pos;
                }

                self.update(tape, end);
                return BitSumNext {
                    sum,
                    next_bit: self.current,
                };
            }

            if self.current {
                sum += self.next_transition - pos;
            }

            pos = self.next_transition;
            self.update(tape, pos);
        }
    }

    /// First position at or after `pos` whose decoded value is `polarity`.
    /// Returns `{limit + 1, current}` when nothing matches up to `limit`.
    pub fn find_next(&mut self, tape: &Timeline, pos: u32, polarity: bool, limit: u32) -> NextBit {
        let mut pos = pos;
        loop {
            self.update(tape, pos);

            if self.current == polarity {
                return NextBit { pos, bit: polarity };
            }

            pos = self.next_transition;
            if pos > limit {
                return NextBit {
                    pos: limit.saturating_add(1),
                    bit: self.current,
                };
            }
        }
    }
}
