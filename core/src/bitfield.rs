/// Growable bit vector packed MSB-first into `u32` words.
///
/// Bit `pos` lives in word `pos >> 5` under mask `0x8000_0000 >> (pos & 31)`.
/// Bits past `len` in the last word are always zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield {
    words: Vec<u32>,
    len: u32,
}

#[inline]
fn bit_mask(pos: u32) -> u32 {
    0x8000_0000 >> (pos & 31)
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn get(&self, pos: u32) -> bool {
        pos < self.len && self.words[(pos >> 5) as usize] & bit_mask(pos) != 0
    }

    pub fn push(&mut self, bit: bool) {
        if self.len & 31 == 0 {
            self.words.push(0);
        }

        if bit {
            if let Some(last) = self.words.last_mut() {
                *last |= bit_mask(self.len);
            }
        }

        self.len += 1;
    }

    pub fn set(&mut self, pos: u32, bit: bool) {
        if pos >= self.len {
            return;
        }

        let word = &mut self.words[(pos >> 5) as usize];
        if bit {
            *word |= bit_mask(pos);
        } else {
            *word &= !bit_mask(pos);
        }
    }

    /// Grows the field by `n` zero bits.
    pub fn extend_zeros(&mut self, n: u32) {
        self.len += n;
        self.words.resize(((self.len as usize) + 31) >> 5, 0);
    }

    /// Forces `n` bits starting at `start` to `bit`, clamped to the current length.
    pub fn fill(&mut self, start: u32, n: u32, bit: bool) {
        let end = (start as u64 + n as u64).min(self.len as u64) as u32;
        if start >= end {
            return;
        }

        let last = end - 1;
        let idx1 = (start >> 5) as usize;
        let idx2 = (last >> 5) as usize;
        let first_mask = u32::MAX >> (start & 31);
        let last_mask = u32::MAX << (31 - (last & 31));

        let apply = |word: &mut u32, mask: u32| {
            if bit {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        };

        if idx1 == idx2 {
            apply(&mut self.words[idx1], first_mask & last_mask);
        } else {
            apply(&mut self.words[idx1], first_mask);
            for word in &mut self.words[idx1 + 1..idx2] {
                apply(word, u32::MAX);
            }
            apply(&mut self.words[idx2], last_mask);
        }
    }

    /// Number of set bits in `[pos, pos + n)`, clamped to the field length.
    pub fn count_ones(&self, pos: u32, n: u32) -> u32 {
        let end = (pos as u64 + n as u64).min(self.len as u64) as u32;
        if pos >= end {
            return 0;
        }

        let last = end - 1;
        let idx1 = (pos >> 5) as usize;
        let idx2 = (last >> 5) as usize;
        let first_mask = u32::MAX >> (pos & 31);
        let last_mask = u32::MAX << (31 - (last & 31));

        if idx1 == idx2 {
            return (self.words[idx1] & first_mask & last_mask).count_ones();
        }

        let middle: u32 = self.words[idx1 + 1..idx2]
            .iter()
            .map(|w| w.count_ones())
            .sum();

        (self.words[idx1] & first_mask).count_ones()
            + middle
            + (self.words[idx2] & last_mask).count_ones()
    }

    /// Finds the first bit equal to `polarity` at or after `pos`.
    ///
    /// Scans whole words up to the one containing `limit`; a hit may land past
    /// `limit` and callers must bound it. Returns `(pos, false)` when nothing
    /// matched before the scan stopped.
    pub fn find(&self, pos: u32, limit: u32, polarity: bool) -> (u32, bool) {
        if pos >= self.len {
            return (pos, false);
        }

        let flip = if polarity { 0 } else { u32::MAX };
        let idx_limit = (((limit as u64 + 31) >> 5) as usize).min(self.words.len());
        let mut idx = (pos >> 5) as usize;
        let mut v = (self.words[idx] ^ flip) & (u32::MAX >> (pos & 31));

        loop {
            if v != 0 {
                return (((idx as u32) << 5) + v.leading_zeros(), true);
            }

            idx += 1;
            if idx >= idx_limit {
                break;
            }

            v = self.words[idx] ^ flip;
        }

        ((idx as u32) << 5, false)
    }

    /// Returns `(transitions, ones)` over `[pos, pos + n)`; the bit before
    /// `pos` is taken to be `last_polarity`.
    pub fn transition_counts(&self, pos: u32, n: u32, last_polarity: bool) -> (u32, u32) {
        let end = (pos as u64 + n as u64).min(self.len as u64) as u32;
        if pos >= end {
            return (0, 0);
        }

        let last = end - 1;
        let idx1 = (pos >> 5) as usize;
        let idx2 = (last >> 5) as usize;
        let first_mask = u32::MAX >> (pos & 31);
        let last_mask = u32::MAX << (31 - (last & 31));

        let mut prev = if last_polarity { u32::MAX } else { 0 };
        let mut v = (self.words[idx1] & first_mask) | (prev & !first_mask);
        let delta_of = |v: u32, prev: u32| v ^ ((v >> 1) | (prev << 31));

        if idx1 == idx2 {
            let mask = first_mask & last_mask;
            let delta = delta_of(v, prev);
            return ((delta & mask).count_ones(), (v & mask).count_ones());
        }

        let mut xsum = (delta_of(v, prev) & first_mask).count_ones();
        let mut msum = (v & first_mask).count_ones();
        prev = v;

        for &word in &self.words[idx1 + 1..idx2] {
            xsum += delta_of(word, prev).count_ones();
            msum += word.count_ones();
            prev = word;
        }

        v = self.words[idx2];
        xsum += (delta_of(v, prev) & last_mask).count_ones();
        msum += (v & last_mask).count_ones();

        (xsum, msum)
    }
}
