//! CAS container: an 8-byte-header chunk stream of decoded records and
//! raw FSK pulse trains.
//!
//! Each chunk header is `{id: [u8; 4], len: u16, aux: u16}` in little-endian
//! order. Pulse chunks hold 16-bit durations in 10 µs units that alternate
//! space and mark, starting with space.

use std::io::{BufWriter, Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::block::TapeBlock;
use crate::checksum::{ChecksumReader, ImageChecksums};
use crate::config::LoadContext;
use crate::error::{Result, TapeError};
use crate::progress::Progress;
use crate::timeline::{Pulse, Timeline, WriteCursor};
use crate::{
    CAS_FOOTER_GAP_SECS, CAS_LEADING_GAP_SECS, CAS_PULSE_UNITS_PER_SECOND, DATA_SAMPLE_RATE,
    DEFAULT_BAUD_RATE,
};

const CHUNK_HEADER_LEN: u64 = 8;

/// Largest pulse count per `fsk ` chunk. The 16-bit length field allows
/// 32767 pulses; one fewer keeps the count even so the next chunk starts on
/// a space pulse.
const MAX_PULSES_PER_CHUNK: usize = 0x7FFE;

const MAX_DATA_PER_CHUNK: usize = 0xFFFF;
const MAX_GAP_MS: u32 = 0xFFFF;

fn seconds_to_samples(seconds: f64) -> u32 {
    (0.5 + DATA_SAMPLE_RATE * seconds) as u32
}

fn timestamp(samples: u32) -> String {
    let pos = samples as f64 / DATA_SAMPLE_RATE;
    let mins = (pos / 60.0) as u32;
    let secs = pos - mins as f64 * 60.0;
    format!("{mins:3}:{secs:06.3}")
}

fn is_printable_id(id: &[u8]) -> bool {
    id.iter().all(|&c| (0x20..0x80).contains(&c))
}

/// Parses a CAS stream into a data timeline. `size_hint` is the stream
/// length in bytes, used only for progress.
pub fn parse_cas<R: Read>(
    source: R,
    ctx: &LoadContext,
    progress: &mut dyn Progress,
    size_hint: u64,
) -> Result<(Timeline, ImageChecksums)> {
    let mut cs = ChecksumReader::new(source);
    let mut tape = Timeline::new();
    let mut cursor = WriteCursor::new(0);

    let mut baud_rate = DEFAULT_BAUD_RATE;
    // at least this much leader before the first record
    let mut min_gap = CAS_LEADING_GAP_SECS;
    // fraction of a sample carried between pulses, 32.32
    let mut sub_sample_accum: u64 = 0;
    let units_to_samples = DATA_SAMPLE_RATE * 4294967296.0 / CAS_PULSE_UNITS_PER_SECOND as f64;

    progress.begin(size_hint >> 10, "Processing CAS file");

    loop {
        progress.update(cs.pos() >> 10);

        let mut header = [0u8; 8];
        if cs.read_data(&mut header)? != header.len() {
            break;
        }

        let offset = cs.pos() - CHUNK_HEADER_LEN;
        if !is_printable_id(&header[0..4]) {
            return Err(TapeError::MalformedChunk {
                offset,
                detail: format!("invalid chunk id {:02X?}", &header[0..4]),
            });
        }

        let mut len = LittleEndian::read_u16(&header[4..6]) as usize;
        let aux = LittleEndian::read_u16(&header[6..8]) as u32;

        match &header[0..4] {
            b"baud" => {
                if aux == 0 {
                    return Err(TapeError::MalformedChunk {
                        offset,
                        detail: "zero baud rate".into(),
                    });
                }
                baud_rate = aux;
            }

            b"data" => {
                if ctx.trace_blocks {
                    log::info!(
                        target: "tapewave::cas",
                        "Data block @ {}: {}ms gap, {} data bytes @ {} baud",
                        timestamp(tape.len()),
                        aux,
                        len,
                        baud_rate
                    );
                }

                let gap = min_gap.max(aux as f64 / 1000.0);
                if !tape.write_blank_data(&mut cursor, seconds_to_samples(gap), false) {
                    return Err(TapeError::TooLong);
                }
                min_gap = 0.0;

                while len > 0 {
                    let offset = cs.pos();
                    let chunk = cs.lock_read(len)?;
                    if chunk.is_empty() {
                        return Err(TapeError::UnexpectedEof { offset, wanted: len });
                    }

                    let n = chunk.len();
                    if !tape.write_std_data(&mut cursor, chunk, baud_rate, false) {
                        return Err(TapeError::TooLong);
                    }
                    len -= n;
                }
            }

            b"fsk " => {
                if len % 2 != 0 {
                    return Err(TapeError::MalformedChunk {
                        offset,
                        detail: "FSK chunk has an odd length".into(),
                    });
                }

                // decoded FSK is trusted as-is, so no minimum leader here
                if !tape.write_blank_data(&mut cursor, seconds_to_samples(aux as f64 / 1000.0), false) {
                    return Err(TapeError::TooLong);
                }
                min_gap = 0.0;

                if len > 0 {
                    let mut raw = vec![0u8; len];
                    cs.read_exact(&mut raw)?;

                    let mut pulses: Vec<Pulse> = Vec::with_capacity(len / 2);
                    let mut polarity = false;
                    let mut total: u64 = 0;

                    for duration in raw.chunks_exact(2).map(LittleEndian::read_u16) {
                        // a carried remainder may be "negative"; wrapping keeps the rounding exact
                        let samples_f32 =
                            sub_sample_accum.wrapping_add((duration as f64 * units_to_samples) as u64);
                        let samples = if samples_f32 < 1 << 63 {
                            (samples_f32.wrapping_add(0x8000_0000) >> 32) as u32
                        } else {
                            0
                        };
                        sub_sample_accum = samples_f32.wrapping_sub((samples as u64) << 32);

                        if samples > 0 {
                            match pulses.last_mut() {
                                Some(last) if last.polarity == polarity => last.samples += samples,
                                _ => pulses.push(Pulse { polarity, samples }),
                            }
                        }

                        polarity = !polarity;
                        total += samples as u64;
                    }

                    let ok = match pulses.as_slice() {
                        [only] if only.polarity => tape.write_blank_data(&mut cursor, only.samples, false),
                        _ => tape.write_pulses(&mut cursor, &pulses, false, true),
                    };
                    if !ok {
                        return Err(TapeError::TooLong);
                    }

                    if ctx.trace_blocks {
                        log::info!(
                            target: "tapewave::cas",
                            "FSK block @ {}: {}ms gap, {} transition{} ({:.1} ms)",
                            timestamp(tape.len()),
                            aux,
                            len / 2,
                            if len / 2 != 1 { "s" } else { "" },
                            total as f64 / DATA_SAMPLE_RATE * 1000.0
                        );
                    }

                    len = 0;
                }
            }

            b"pwml" | b"pwmd" => {
                return Err(TapeError::UnsupportedChunk {
                    offset,
                    kind: String::from_utf8_lossy(&header[0..4]).into_owned(),
                });
            }

            // FUJI, pwmc, pwms and anything unknown carry nothing we use
            _ => {}
        }

        // the payload still streams through the reader so it is digested
        cs.skip(len)?;
    }

    if !tape.write_blank_data(&mut cursor, seconds_to_samples(CAS_FOOTER_GAP_SECS), false) {
        return Err(TapeError::TooLong);
    }

    log::debug!("Parsed CAS image: {} samples in {} spans", tape.len(), tape.span_list().span_count());
    Ok((tape, cs.checksums()))
}

/// True if a decoded-byte span is trimmed, so that saving it as CAS must
/// fall back to pulses.
pub fn has_incompatible_std_blocks(tape: &Timeline) -> bool {
    tape.spans().windows(2).any(|w| match w[0].block.as_deref() {
        Some(TapeBlock::DecodedBytes(block)) => {
            w[0].offset != 0 || (w[1].start - w[0].start) as u64 != block.sample_count64()
        }
        _ => false,
    })
}

/// Merges runs separated by zero-length pulses: `[A 0 B 0 C]` becomes
/// `[A+B+C]`. An all-zero list becomes empty.
fn coalesce_pulses(pulses: &mut Vec<u32>) {
    if pulses.is_empty() {
        return;
    }

    let mut out = Vec::with_capacity(pulses.len());
    out.push(pulses[0]);

    let last = pulses.len() - 1;
    let mut i = 1;
    while i < last {
        if pulses[i] == 0 {
            if let Some(prev) = out.last_mut() {
                *prev += pulses[i + 1];
            }
            i += 2;
        } else {
            out.push(pulses[i]);
            i += 1;
        }
    }

    if i < pulses.len() && pulses[i] != 0 {
        out.push(pulses[i]);
    }

    if out.iter().all(|&v| v == 0) {
        out.clear();
    }

    *pulses = out;
}

/// Converts as much of a mark run as possible into whole milliseconds
/// without overshooting; the remainder stays in `gap_samples`.
fn convert_gap_samples_to_ms(gap_samples: &mut u32) -> u32 {
    let mut gap_ms = (*gap_samples as f64 * (1000.0 / DATA_SAMPLE_RATE)).round() as u32;

    let encoded = loop {
        let encoded = (gap_ms as f64 * (DATA_SAMPLE_RATE / 1000.0)).round() as u64;
        if encoded <= *gap_samples as u64 {
            break encoded as u32;
        }
        gap_ms -= 1;
    };

    *gap_samples -= encoded;
    gap_ms
}

/// Requantizes run lengths at the data sample rate into 10 µs pulse counts.
///
/// Edges are converted on absolute time so rounding never accumulates.
/// Same-polarity runs merge up to the 16-bit ceiling; longer runs are split
/// with zero-length pulses of the opposite polarity.
fn requantize_pulses(pulses: &[u32]) -> Vec<u16> {
    let scale = CAS_PULSE_UNITS_PER_SECOND as f64 / DATA_SAMPLE_RATE;
    let mut out: Vec<u16> = vec![0];
    let mut src_pos: u64 = 0;
    let mut dst_pos: u32 = 0;
    let mut can_append = true;

    for &pulse in pulses {
        src_pos += pulse as u64;
        let next_dst_pos = (0.5 + src_pos as f64 * scale) as u32;
        let mut len = next_dst_pos - dst_pos;
        dst_pos = next_dst_pos;

        if can_append && len > 0 {
            if let Some(back) = out.last_mut() {
                let add = (0xFFFF - *back as u32).min(len);
                *back += add as u16;
                len -= add;
            }
        }

        if len > 0 {
            if can_append {
                // previous pulse is full; keep polarity with an empty opposite pulse
                out.push(0);
                can_append = false;
            }

            while len > 0xFFFF {
                len -= 0xFFFF;
                out.push(0xFFFF);
                out.push(0);
            }

            if len > 0 {
                out.push(len as u16);
            } else {
                can_append = true;
            }
        } else {
            can_append = !can_append;
        }
    }

    while out.last() == Some(&0) {
        out.pop();
    }

    out
}

fn write_chunk_header<W: Write>(out: &mut W, id: &[u8; 4], len: u16, aux: u16) -> Result<()> {
    out.write_all(id)?;
    out.write_u16::<LittleEndian>(len)?;
    out.write_u16::<LittleEndian>(aux)?;
    Ok(())
}

struct CasEncoder<W: Write> {
    out: W,
    pulses: Vec<u32>,
    last_baud_rate: u32,
}

impl<W: Write> CasEncoder<W> {
    /// Writes the queued pulse runs as `fsk ` chunks, folding a leading mark
    /// run into the first chunk's gap field.
    fn flush_pulses(&mut self) -> Result<()> {
        coalesce_pulses(&mut self.pulses);

        let mut gap_ms = 0;
        if self.pulses.len() >= 2 && self.pulses[0] == 0 {
            if self.pulses[1] != 0 {
                gap_ms = convert_gap_samples_to_ms(&mut self.pulses[1]);
            }

            while gap_ms > MAX_GAP_MS {
                write_chunk_header(&mut self.out, b"fsk ", 0, MAX_GAP_MS as u16)?;
                gap_ms -= MAX_GAP_MS;
            }
        }

        let pulses16 = requantize_pulses(&self.pulses);
        for chunk in pulses16.chunks(MAX_PULSES_PER_CHUNK) {
            write_chunk_header(&mut self.out, b"fsk ", (chunk.len() * 2) as u16, gap_ms as u16)?;
            for &pulse in chunk {
                self.out.write_u16::<LittleEndian>(pulse)?;
            }
            gap_ms = 0;
        }

        self.pulses.clear();
        Ok(())
    }

    fn push_mark(&mut self, samples: u32) {
        if self.pulses.len() % 2 == 0 {
            self.pulses.push(0);
        }
        self.pulses.push(samples);
    }

    fn write_std_records(&mut self, data: &[u8], baud_rate: u32) -> Result<()> {
        // a trailing mark run becomes the record gap
        coalesce_pulses(&mut self.pulses);

        let mut gap_ms = 0;
        if self.pulses.len() >= 2 && self.pulses.len() % 2 == 0 {
            if let Some(back) = self.pulses.last_mut() {
                gap_ms = convert_gap_samples_to_ms(back);
            }

            while self.pulses.last() == Some(&0) {
                self.pulses.pop();
            }
        }

        self.flush_pulses()?;

        if self.last_baud_rate != baud_rate {
            self.last_baud_rate = baud_rate;
            write_chunk_header(&mut self.out, b"baud", 0, baud_rate as u16)?;
        }

        while gap_ms > MAX_GAP_MS {
            gap_ms -= MAX_GAP_MS;
            write_chunk_header(&mut self.out, b"data", 0, MAX_GAP_MS as u16)?;
        }

        for record in data.chunks(MAX_DATA_PER_CHUNK) {
            write_chunk_header(&mut self.out, b"data", record.len() as u16, gap_ms as u16)?;
            self.out.write_all(record)?;
            gap_ms = 0;
        }

        Ok(())
    }
}

/// Encodes the data timeline as CAS.
///
/// Decoded-byte spans become `data` records unless trimmed; everything else
/// becomes FSK pulse trains, with blank and audio regions read as mark.
pub fn save_cas<W: Write>(tape: &Timeline, writer: W) -> Result<()> {
    let mut enc = CasEncoder {
        out: BufWriter::with_capacity(65536, writer),
        pulses: Vec::new(),
        last_baud_rate: 0,
    };

    write_chunk_header(&mut enc.out, b"FUJI", 0, 0)?;

    for w in tape.spans().windows(2) {
        let (span, next) = (&w[0], &w[1]);
        let Some(block) = span.block.as_deref() else {
            continue;
        };

        let len = next.start - span.start;
        if len == 0 {
            continue;
        }

        match block {
            TapeBlock::Blank | TapeBlock::RawAudio(_) => enc.push_mark(len),
            TapeBlock::RawSignal(raw) => raw.extract_pulses(&mut enc.pulses, span.offset, len, false),
            TapeBlock::DecodedBytes(std_block) => {
                let block_len = std_block.sample_count64();

                if span.offset == 0 && len as u64 >= block_len {
                    enc.write_std_records(std_block.data(), std_block.baud_rate())?;
                    continue;
                }

                // trimmed records can only be written as pulses
                let visible = (len as u64).min(block_len.saturating_sub(span.offset as u64)) as u32;
                let end = span.offset + visible;
                let mut slot_polarity = enc.pulses.len() % 2 == 1;
                let mut scan = span.offset;

                while scan < end {
                    // the run in this slot lasts until the opposite level shows up;
                    // zero-length runs keep the parity of the list
                    let found = std_block.find_bit(scan, end, !slot_polarity);
                    enc.pulses.push(found.pos.min(end) - scan);
                    scan = found.pos;
                    slot_polarity = !slot_polarity;
                }
            }
        }
    }

    enc.flush_pulses()?;
    enc.out.flush()?;
    Ok(())
}
