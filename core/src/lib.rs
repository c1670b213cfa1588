//! Cassette tape images for Atari 8-bit emulation
//!
//! Models a tape as a timeline of signal spans, decodes recorded audio into
//! FSK and direct bit streams, and reads and writes CAS and WAV files.

pub mod error;
pub mod bitfield;
pub mod block;
pub mod timeline;
pub mod sliding_window;
pub mod resample;
pub mod decoder_fsk;
pub mod decoder_turbo;
pub mod peak_map;
pub mod checksum;
pub mod audio_reader;
pub mod progress;
pub mod config;
pub mod cas;
pub mod wav;
pub mod image;

pub use audio_reader::{AudioFormat, AudioReader, MemoryAudioReader, WavAudioReader};
pub use block::AudioPosition;
pub use checksum::ImageChecksums;
pub use config::LoadContext;
pub use decoder_turbo::TurboDecodeAlgorithm;
pub use error::{Result, TapeError};
pub use image::{CassetteImage, TapeClip, WaveformMinMax};
pub use peak_map::PeakColumn;
pub use progress::{LogProgress, NullProgress, Progress};
pub use sliding_window::SlidingWindowCursor;
pub use timeline::{NextBit, Pulse, RegionInfo, RegionType, Timeline, TransitionInfo, WriteCursor};
pub use wav::{AnalysisSink, AnalysisWriter};

// Timing
/// NTSC machine clock.
pub const MACHINE_CLOCK_HZ: f64 = 7159090.0 / 4.0;
pub const CYCLES_PER_DATA_SAMPLE: u32 = 56;
/// Audio mixing runs at twice the data rate.
pub const CYCLES_PER_SYNC_SAMPLE: u32 = 28;
/// Tape timeline rate, ~31960 Hz.
pub const DATA_SAMPLE_RATE: f64 = MACHINE_CLOCK_HZ / CYCLES_PER_DATA_SAMPLE as f64;

// Capacity
/// Longest tape in data samples (about 4.7 hours).
pub const SAMPLE_LIMIT: u32 = 0x1FFF_FFFF;
/// Room a decoded-byte write must leave below [`SAMPLE_LIMIT`].
pub const WRITE_HEADROOM: u32 = (DATA_SAMPLE_RATE * 12.0) as u32;

// Display
pub const PEAK_BLOCK_SAMPLES: u32 = 1024;

// FSK tones
pub const MARK_TONE_HZ: f64 = 5326.7;
pub const SPACE_TONE_HZ: f64 = 3995.0;

// WAV
pub const WAV_OUTPUT_RATE: u32 = 44100;
/// Closest integer rate above the data rate; see [`AnalysisWriter`].
pub const ANALYSIS_SAMPLE_RATE: u32 = 31961;

// CAS
/// Pulse durations are stored in 10 µs units.
pub const CAS_PULSE_UNITS_PER_SECOND: u32 = 10000;
pub const DEFAULT_BAUD_RATE: u32 = 600;
/// Minimum mark leader before the first record.
pub const CAS_LEADING_GAP_SECS: f64 = 10.0;
/// Mark tone appended after the last chunk.
pub const CAS_FOOTER_GAP_SECS: f64 = 2.0;
