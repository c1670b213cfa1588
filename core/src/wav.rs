//! Audio import and export.
//!
//! Import resamples the source to the data rate and runs the FSK and turbo
//! decoders in lockstep. The FSK detector has a fixed output delay, so it is
//! fed [`FSK_FILTER_DELAY`] frames ahead of the turbo decoder and the stored
//! audio. Export renders the data track as an FSK tone at 44.1 kHz.

use std::io::{Seek, Write};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::audio_reader::AudioReader;
use crate::bitfield::Bitfield;
use crate::block::{RawAudioBlock, RawSignalBlock, TapeBlock};
use crate::config::LoadContext;
use crate::decoder_fsk::{FskDecoder, FSK_FILTER_DELAY};
use crate::decoder_turbo::TurboDecoder;
use crate::error::{Result, TapeError};
use crate::peak_map::{PeakMapProcessor, PeakMaps};
use crate::progress::Progress;
use crate::resample::{Frame, Resampler};
use crate::timeline::Timeline;
use crate::{
    ANALYSIS_SAMPLE_RATE, DATA_SAMPLE_RATE, MARK_TONE_HZ, SAMPLE_LIMIT, SPACE_TONE_HZ, WAV_OUTPUT_RATE,
};

/// Floats per analysis frame.
pub const ANALYSIS_CHANNELS: usize = 6;

const INPUT_CHUNK: usize = 512;

/// Receives the decoder's per-sample analysis frames: FSK input, space
/// energy, mark energy and decision in slots 0..4, turbo filter output and
/// decision in slots 4..6.
pub trait AnalysisSink {
    fn write_frames(&mut self, frames: &[f32]) -> Result<()>;
}

/// Writes analysis frames as a 6-channel float WAV.
///
/// WAV headers only carry integer rates, so the file is tagged 31961 Hz and
/// a frame is repeated every ~41144 frames to keep it aligned with the
/// fractional data rate.
pub struct AnalysisWriter<W: Write + Seek> {
    writer: WavWriter<W>,
    repeat_interval: u64,
    repeat_counter: u32,
    repeat_frac: u64,
}

impl<W: Write + Seek> AnalysisWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        let spec = WavSpec {
            channels: ANALYSIS_CHANNELS as u16,
            sample_rate: ANALYSIS_SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };

        let rate = ANALYSIS_SAMPLE_RATE as f64;
        let repeat_interval = (0.5 + 4294967296.0 * DATA_SAMPLE_RATE / (rate - DATA_SAMPLE_RATE)) as u64;
        let seed = repeat_interval + 0x8000_0000;

        Ok(Self {
            writer: WavWriter::new(writer, spec)?,
            repeat_interval,
            repeat_counter: (seed >> 32) as u32,
            repeat_frac: seed & 0xFFFF_FFFF,
        })
    }

    fn write_frame(&mut self, frame: &[f32]) -> Result<()> {
        for &v in frame {
            self.writer.write_sample(v)?;
        }
        Ok(())
    }

    /// Patches the header sizes and flushes.
    pub fn finalize(self) -> Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

impl<W: Write + Seek> AnalysisSink for AnalysisWriter<W> {
    fn write_frames(&mut self, frames: &[f32]) -> Result<()> {
        for frame in frames.chunks_exact(ANALYSIS_CHANNELS) {
            self.write_frame(frame)?;

            self.repeat_counter -= 1;
            if self.repeat_counter == 0 {
                self.repeat_frac += self.repeat_interval;
                self.repeat_counter = (self.repeat_frac >> 32) as u32;
                self.repeat_frac &= 0xFFFF_FFFF;

                self.write_frame(frame)?;
            }
        }
        Ok(())
    }
}

/// Tracks and summaries decoded from an audio source.
#[derive(Debug)]
pub struct DecodedAudio {
    pub data: Timeline,
    pub audio: Timeline,
    pub peaks: PeakMaps,
    /// FSK input and turbo filter output as 8-bit levels; empty unless
    /// waveform storage was requested.
    pub waveforms: [Vec<u8>; 2],
    /// The source had a separate (left) audio channel.
    pub audio_present: bool,
}

struct DecodePipeline<'a> {
    fsk: FskDecoder,
    turbo: TurboDecoder,
    fsk_bits: Bitfield,
    primed: bool,
    right: Vec<i16>,
    trace: Vec<f32>,
    want_trace: bool,
    store_waveform: bool,
    audio: Vec<u8>,
    waveforms: [Vec<u8>; 2],
    sink: Option<&'a mut dyn AnalysisSink>,
}

impl DecodePipeline<'_> {
    /// Decodes every buffered frame that has a full filter delay of lookahead
    /// behind it, keeping that lookahead in `stream`.
    fn drain(&mut self, stream: &mut Vec<Frame>) -> Result<()> {
        if !self.primed {
            if stream.len() < FSK_FILTER_DELAY {
                return Ok(());
            }

            let head: Vec<i16> = stream[..FSK_FILTER_DELAY].iter().map(|f| f[1]).collect();
            self.fsk.prime(&head);
            self.primed = true;
        }

        if stream.len() <= FSK_FILTER_DELAY {
            return Ok(());
        }

        let count = stream.len() - FSK_FILTER_DELAY;
        if self.audio.len() + count > SAMPLE_LIMIT as usize {
            return Err(TapeError::TooLong);
        }

        self.right.clear();
        self.right.extend(stream.iter().map(|f| f[1]));

        let trace = if self.want_trace {
            self.trace.clear();
            self.trace.resize(count * ANALYSIS_CHANNELS, 0.0);
            Some(self.trace.as_mut_slice())
        } else {
            None
        };

        match trace {
            Some(trace) => {
                self.fsk.process(&self.right[FSK_FILTER_DELAY..], &mut self.fsk_bits, Some(&mut *trace));
                self.turbo.process(&self.right[..count], Some(trace));
            }
            None => {
                self.fsk.process(&self.right[FSK_FILTER_DELAY..], &mut self.fsk_bits, None);
                self.turbo.process(&self.right[..count], None);
            }
        }

        self.audio
            .extend(stream[..count].iter().map(|f| ((f[0] >> 8) as i32 + 0x80) as u8));

        if self.store_waveform {
            let level = |v: f32| (v * 127.0 + 128.5).clamp(0.0, 255.0) as u8;
            for (i, waveform) in self.waveforms.iter_mut().enumerate() {
                let slot = if i == 0 { 0 } else { 4 };
                waveform.extend(self.trace.chunks_exact(ANALYSIS_CHANNELS).map(|c| level(c[slot])));
            }
        }

        if let Some(sink) = self.sink.as_deref_mut() {
            sink.write_frames(&self.trace)?;
        }

        stream.drain(..count);
        Ok(())
    }
}

/// Decodes an audio source into data and audio tracks.
///
/// The right channel drives both decoders; the left channel becomes the
/// audio track. Mono sources decode the same channel for both.
pub fn decode_audio(
    reader: &mut dyn AudioReader,
    ctx: &LoadContext,
    sink: Option<&mut dyn AnalysisSink>,
    progress: &mut dyn Progress,
) -> Result<DecodedAudio> {
    let format = reader.format();
    if format.sample_rate == 0 {
        return Err(TapeError::InvalidInput("audio source has a zero sample rate".into()));
    }

    log::info!(
        "Decoding {} frames at {} Hz ({} channel(s)), turbo decoder: {}",
        reader.frame_count(),
        format.sample_rate,
        format.channels,
        ctx.turbo_algorithm
    );

    progress.begin(reader.data_size() >> 10, "Processing raw waveform");

    let mut resampler = Resampler::new(format.sample_rate, DATA_SAMPLE_RATE);
    let mut peaks = PeakMapProcessor::new(format.channels > 1, format.sample_rate);
    let mut pipeline = DecodePipeline {
        fsk: FskDecoder::new(),
        turbo: TurboDecoder::new(ctx.turbo_algorithm, ctx.hpf_cutoff_hz),
        fsk_bits: Bitfield::new(),
        primed: false,
        right: Vec::new(),
        trace: Vec::new(),
        want_trace: ctx.store_waveform || sink.is_some(),
        store_waveform: ctx.store_waveform,
        audio: Vec::new(),
        waveforms: [Vec::new(), Vec::new()],
        sink,
    };

    let mut input = [[0i16; 2]; INPUT_CHUNK];
    let mut stream: Vec<Frame> = Vec::new();

    loop {
        let n = reader.read_stereo16(&mut input)?;
        if n == 0 {
            break;
        }

        peaks.process(&input[..n]);
        resampler.process(&input[..n], &mut stream);
        pipeline.drain(&mut stream)?;

        progress.update(reader.data_pos() >> 10);
    }

    // pad with the last frame so the FSK detector can catch up
    if let Some(&last) = stream.last() {
        stream.extend(std::iter::repeat(last).take(FSK_FILTER_DELAY));
        pipeline.drain(&mut stream)?;
    }

    let DecodePipeline {
        turbo,
        fsk_bits,
        audio,
        waveforms,
        ..
    } = pipeline;

    let mut data = Timeline::new();
    let len = fsk_bits.len();
    if len > 0 {
        data.reset_to_block(TapeBlock::RawSignal(RawSignalBlock::from_bitfields(fsk_bits, turbo.finalize())), len);
    }

    let mut audio_track = Timeline::new();
    let audio_len = audio.len() as u32;
    audio_track.reset_to_block(TapeBlock::RawAudio(RawAudioBlock::new(audio)), audio_len);

    log::info!(
        "Decoded {} samples ({:.1} s) of tape",
        len,
        len as f64 / DATA_SAMPLE_RATE
    );

    Ok(DecodedAudio {
        data,
        audio: audio_track,
        peaks: peaks.finish(),
        waveforms,
        audio_present: format.channels > 1,
    })
}

fn sine_table() -> [u8; 1024] {
    let mut table = [0u8; 1024];
    for (i, v) in table.iter_mut().enumerate() {
        let s = (i as f32 * std::f32::consts::TAU / 1024.0).sin();
        *v = (128.5 + 100.0 * s) as u8;
    }
    table
}

/// Renders the data track as a mono 8-bit 44.1 kHz FSK recording.
///
/// Bits are read with an 8-sample hysteresis window so single-sample
/// glitches do not chop the tone, and the oscillator phase is carried
/// across bit changes.
pub fn save_wav<W: Write + Seek>(tape: &Timeline, writer: W) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: WAV_OUTPUT_RATE,
        bits_per_sample: 8,
        sample_format: SampleFormat::Int,
    };
    let mut wav = WavWriter::new(writer, spec)?;

    let table = sine_table();
    let step = (0.5 + 4294967296.0 * (DATA_SAMPLE_RATE / WAV_OUTPUT_RATE as f64)) as u64;
    let inc_space = (0.5 + SPACE_TONE_HZ / DATA_SAMPLE_RATE * 4294967296.0) as u64 as u32;
    let inc_mark = (0.5 + MARK_TONE_HZ / DATA_SAMPLE_RATE * 4294967296.0) as u64 as u32;

    let len = ((tape.len() as u64) << 32) / step;
    let mut pos: u64 = 0;
    let mut phase: u32 = 0;
    let mut bit = true;
    let mut inc = inc_mark;

    log::debug!("Writing {len} output samples for {} tape samples", tape.len());

    for _ in 0..len {
        let start = pos;
        let end = pos + step;
        pos = end;

        if start >> 32 == (end - 1) >> 32 {
            phase = phase.wrapping_add(((inc as u64 * step) >> 32) as u32);
        } else {
            phase = phase.wrapping_add(((inc as u64 * (start as u32).wrapping_neg() as u64) >> 32) as u32);
            bit = tape.bit_with_hysteresis((start >> 32) as u32, 8, 3, bit, false);
            inc = if bit { inc_mark } else { inc_space };
            phase = phase.wrapping_add(((inc as u64 * (end as u32) as u64) >> 32) as u32);
        }

        let sample = table[(phase.wrapping_add(inc >> 1) >> 22) as usize];
        wav.write_sample((sample as i32 - 128) as i8)?;
    }

    wav.finalize()?;
    Ok(())
}
