//! Audio sources for the tape decoder.

use std::io::Read;

use hound::{SampleFormat, WavReader};

use crate::error::{Result, TapeError};
use crate::resample::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A source of interleaved stereo 16-bit frames. Mono sources duplicate
/// their single channel into both slots.
pub trait AudioReader {
    fn format(&self) -> AudioFormat;

    /// Total frames in the source.
    fn frame_count(&self) -> u64;

    /// Fills `dst` with the next frames and returns how many were read;
    /// fewer than `dst.len()` only at the end of the source.
    fn read_stereo16(&mut self, dst: &mut [Frame]) -> Result<usize>;

    /// Bytes of encoded audio consumed so far.
    fn data_pos(&self) -> u64;

    /// Total bytes of encoded audio.
    fn data_size(&self) -> u64;
}

/// WAV reader over `hound`, accepting 8 to 32-bit integer and 32-bit float PCM.
pub struct WavAudioReader<R: Read> {
    reader: WavReader<R>,
    format: AudioFormat,
    frames_read: u64,
}

impl<R: Read> WavAudioReader<R> {
    pub fn new(source: R) -> Result<Self> {
        let reader = WavReader::new(source)?;
        let spec = reader.spec();

        if spec.channels == 0 {
            return Err(TapeError::InvalidInput("WAV file has no channels".into()));
        }

        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 1..=32) | (SampleFormat::Float, 32) => {}
            (format, bits) => {
                return Err(TapeError::InvalidInput(format!(
                    "unsupported WAV sample format: {bits}-bit {format:?}"
                )))
            }
        }

        log::debug!(
            "WAV input: {} Hz, {} channel(s), {}-bit {:?}",
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );

        Ok(Self {
            format: AudioFormat {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
            },
            reader,
            frames_read: 0,
        })
    }

    fn block_align(&self) -> u64 {
        let spec = self.reader.spec();
        spec.channels as u64 * spec.bits_per_sample.div_ceil(8) as u64
    }
}

fn int_to_i16(v: i32, bits: u16) -> i16 {
    if bits >= 16 {
        (v >> (bits - 16)) as i16
    } else {
        (v << (16 - bits)) as i16
    }
}

fn float_to_i16(v: f32) -> i16 {
    (v * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

impl<R: Read> AudioReader for WavAudioReader<R> {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn frame_count(&self) -> u64 {
        self.reader.duration() as u64
    }

    fn read_stereo16(&mut self, dst: &mut [Frame]) -> Result<usize> {
        let spec = self.reader.spec();
        let channels = spec.channels as usize;
        let mut frame = [0i16; 2];
        let mut produced = 0;

        macro_rules! fill {
            ($samples:expr, $convert:expr) => {{
                let mut samples = $samples;
                'frames: for out in dst.iter_mut() {
                    for ch in 0..channels {
                        let Some(sample) = samples.next() else {
                            break 'frames;
                        };
                        let v = $convert(sample?);
                        if ch < 2 {
                            frame[ch] = v;
                        }
                    }

                    if channels == 1 {
                        frame[1] = frame[0];
                    }

                    *out = frame;
                    produced += 1;
                }
            }};
        }

        match spec.sample_format {
            SampleFormat::Int => {
                let bits = spec.bits_per_sample;
                fill!(self.reader.samples::<i32>(), |v: i32| int_to_i16(v, bits))
            }
            SampleFormat::Float => fill!(self.reader.samples::<f32>(), float_to_i16),
        }

        self.frames_read += produced as u64;
        Ok(produced)
    }

    fn data_pos(&self) -> u64 {
        self.frames_read * self.block_align()
    }

    fn data_size(&self) -> u64 {
        self.frame_count() * self.block_align()
    }
}

/// Frames already in memory, e.g. from a caller-side decoder.
pub struct MemoryAudioReader {
    format: AudioFormat,
    frames: Vec<Frame>,
    pos: usize,
}

impl MemoryAudioReader {
    pub fn new(sample_rate: u32, channels: u16, frames: Vec<Frame>) -> Self {
        Self {
            format: AudioFormat { sample_rate, channels },
            frames,
            pos: 0,
        }
    }
}

impl AudioReader for MemoryAudioReader {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    fn read_stereo16(&mut self, dst: &mut [Frame]) -> Result<usize> {
        let n = dst.len().min(self.frames.len() - self.pos);
        dst[..n].copy_from_slice(&self.frames[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn data_pos(&self) -> u64 {
        self.pos as u64 * 4
    }

    fn data_size(&self) -> u64 {
        self.frames.len() as u64 * 4
    }
}
