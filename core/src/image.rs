//! The cassette image: a data track, an optional audio track, and the
//! display and checksum caches that follow their edits.

use std::io::{BufReader, Read, Seek, SeekFrom, Write};

use crate::audio_reader::{AudioReader, WavAudioReader};
use crate::block::AudioPosition;
use crate::cas;
use crate::checksum::ImageChecksums;
use crate::config::LoadContext;
use crate::error::{Result, TapeError};
use crate::peak_map::{PeakColumn, PeakMaps};
use crate::progress::Progress;
use crate::timeline::{NextBit, Pulse, RegionInfo, SpanList, Timeline, TransitionInfo, WriteCursor};
use crate::wav::{self, AnalysisSink, DecodedAudio};
use crate::SAMPLE_LIMIT;

/// A cut or copied range of both tracks.
#[derive(Clone, Debug, Default)]
pub struct TapeClip {
    data: SpanList,
    audio: Option<SpanList>,
}

impl TapeClip {
    pub fn len(&self) -> u32 {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn data(&self) -> &SpanList {
        &self.data
    }

    /// Audio spans for the clip, falling back to the data spans.
    pub fn audio_or_data(&self) -> &SpanList {
        self.audio.as_ref().unwrap_or(&self.data)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaveformMinMax {
    pub min: u8,
    pub max: u8,
}

#[derive(Clone, Debug, Default)]
pub struct CassetteImage {
    data: Timeline,
    audio: Timeline,
    /// Until set, the audio track aliases the data track.
    audio_created: bool,
    audio_present: bool,
    peaks: PeakMaps,
    waveforms: [Vec<u8>; 2],
    checksums: Option<ImageChecksums>,
}

impl CassetteImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_new(&mut self) {
        *self = Self::default();
    }

    /// Loads a WAV or CAS image, sniffed from its first four bytes.
    ///
    /// `analysis` receives the decoder trace and is only valid for audio
    /// input. On error the current image is left as it was.
    pub fn load<R: Read + Seek>(
        &mut self,
        mut source: R,
        ctx: &LoadContext,
        analysis: Option<&mut dyn AnalysisSink>,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let mut magic = Vec::with_capacity(4);
        (&mut source).take(4).read_to_end(&mut magic)?;
        source.seek(SeekFrom::Start(0))?;

        let image = match magic.as_slice() {
            b"RIFF" => {
                let mut reader = WavAudioReader::new(BufReader::new(source))?;
                Self::from_decoded(wav::decode_audio(&mut reader, ctx, analysis, progress)?)
            }
            // no FLAC reader is bundled; decode it elsewhere and use load_audio()
            b"fLaC" => return Err(TapeError::UnrecognizedFormat),
            _ if analysis.is_some() => {
                return Err(TapeError::InvalidInput(
                    "an analysis trace can only be written for audio input".into(),
                ))
            }
            b"FUJI" => {
                let size = source.seek(SeekFrom::End(0))?;
                source.seek(SeekFrom::Start(0))?;
                let (data, sums) = cas::parse_cas(BufReader::new(source), ctx, progress, size)?;
                Self::from_cas(data, sums)
            }
            _ => return Err(TapeError::UnrecognizedFormat),
        };

        *self = image;
        Ok(())
    }

    /// Decodes a caller-supplied audio source.
    pub fn load_audio(
        &mut self,
        reader: &mut dyn AudioReader,
        ctx: &LoadContext,
        analysis: Option<&mut dyn AnalysisSink>,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        *self = Self::from_decoded(wav::decode_audio(reader, ctx, analysis, progress)?);
        Ok(())
    }

    fn from_decoded(decoded: DecodedAudio) -> Self {
        Self {
            data: decoded.data,
            audio: decoded.audio,
            audio_created: true,
            audio_present: decoded.audio_present,
            peaks: decoded.peaks,
            waveforms: decoded.waveforms,
            checksums: None,
        }
    }

    fn from_cas(data: Timeline, checksums: ImageChecksums) -> Self {
        let mut peaks = PeakMaps::new();
        peaks.invalidate_all();

        Self {
            data,
            peaks,
            checksums: Some(checksums),
            ..Self::default()
        }
    }

    pub fn data_len(&self) -> u32 {
        self.data.len()
    }

    pub fn audio_len(&self) -> u32 {
        self.audio_track().len()
    }

    /// The source carried a separate audio channel.
    pub fn is_audio_present(&self) -> bool {
        self.audio_present
    }

    pub fn is_audio_created(&self) -> bool {
        self.audio_created
    }

    pub fn data_track(&self) -> &Timeline {
        &self.data
    }

    pub fn audio_track(&self) -> &Timeline {
        if self.audio_created {
            &self.audio
        } else {
            &self.data
        }
    }

    /// Gives the audio track its own copy of the data track.
    pub fn create_audio_track(&mut self) {
        self.audio = self.data.clone();
        self.peaks.copy_data_to_audio();
        self.audio_created = true;
    }

    // ---------------------------------------------------------------------
    // Writes

    fn mark_edited(&mut self, base: u32, end: u32, insert: bool) {
        if insert {
            self.peaks.invalidate_from(base);
        } else {
            self.peaks.invalidate_range(base, end);
        }
        self.checksums = None;
    }

    pub fn write_blank_data(&mut self, cursor: &mut WriteCursor, len: u32, insert: bool) -> Result<()> {
        let base = cursor.position;
        let mut audio_cursor = *cursor;

        let ok = self.data.write_blank_data(cursor, len, insert);
        if self.audio_created {
            self.audio.write_blank_data(&mut audio_cursor, len, insert);
        }

        self.mark_edited(base, base.saturating_add(len), insert);
        ok.then_some(()).ok_or(TapeError::TooLong)
    }

    /// Writes framed bytes at `baud_rate`; a zero baud rate writes nothing.
    pub fn write_std_data(&mut self, cursor: &mut WriteCursor, bytes: &[u8], baud_rate: u32, insert: bool) -> Result<()> {
        if baud_rate == 0 {
            return Ok(());
        }

        let base = cursor.position;
        let mut audio_cursor = *cursor;

        let ok = self.data.write_std_data(cursor, bytes, baud_rate, insert);
        if self.audio_created {
            self.audio.write_std_data(&mut audio_cursor, bytes, baud_rate, insert);
        }

        self.mark_edited(base, cursor.position, insert);
        ok.then_some(()).ok_or(TapeError::TooLong)
    }

    pub fn write_pulse(
        &mut self,
        cursor: &mut WriteCursor,
        polarity: bool,
        samples: u32,
        insert: bool,
        fsk: bool,
    ) -> Result<()> {
        let pulse = [Pulse { polarity, samples }];
        let base = cursor.position;
        let mut audio_cursor = *cursor;

        let ok = self.data.write_pulses(cursor, &pulse, insert, fsk);
        if self.audio_created {
            self.audio.write_pulses(&mut audio_cursor, &pulse, insert, fsk);
        }

        self.mark_edited(base, base.saturating_add(samples), insert);
        ok.then_some(()).ok_or(TapeError::TooLong)
    }

    /// Cursor position a [`Self::write_std_data`] call would leave behind.
    pub fn estimate_write_std_data(&self, cursor: &WriteCursor, num_bytes: u32, baud_rate: u32) -> u32 {
        if baud_rate == 0 {
            return cursor.position;
        }

        self.data.estimate_write_std_data(cursor, num_bytes, baud_rate)
    }

    // ---------------------------------------------------------------------
    // Range edits

    /// Prepares the audio track for a clip edit, returning whether the edit
    /// must be mirrored onto it.
    fn prepare_audio_for(&mut self, clip: &TapeClip) -> bool {
        if clip.has_audio() && !self.audio_created {
            self.create_audio_track();
        }
        self.audio_created
    }

    /// Inserts the clip at `start`, padding with blank tape when `start` is
    /// past the end.
    pub fn insert_range(&mut self, start: u32, clip: &TapeClip) -> Result<u32> {
        if start.max(self.data.len()) as u64 + clip.len() as u64 > SAMPLE_LIMIT as u64 {
            return Err(TapeError::TooLong);
        }

        let mirror = self.prepare_audio_for(clip);
        let after = self.data.insert_range(start, clip.data()).ok_or(TapeError::TooLong)?;
        if mirror {
            self.audio.insert_range(start, clip.audio_or_data());
        }

        self.peaks.invalidate_from(start);
        self.checksums = None;
        Ok(after)
    }

    pub fn replace_range(&mut self, start: u32, clip: &TapeClip) -> Result<u32> {
        if start as u64 + clip.len() as u64 > SAMPLE_LIMIT as u64 {
            return Err(TapeError::TooLong);
        }

        let mirror = self.prepare_audio_for(clip);
        let after = self.data.replace_range(start, clip.data());
        if mirror {
            self.audio.replace_range(start, clip.audio_or_data());
        }

        self.peaks.invalidate_len(start, clip.len());
        self.checksums = None;
        Ok(after)
    }

    pub fn delete_range(&mut self, start: u32, end: u32) {
        self.data.delete_range(start, end);
        if self.audio_created {
            self.audio.delete_range(start, end);
        }

        self.peaks.invalidate_from(start);
        self.checksums = None;
    }

    pub fn copy_range(&self, start: u32, len: u32) -> TapeClip {
        TapeClip {
            data: self.data.copy_range(start, len),
            audio: self.audio_created.then(|| self.audio.copy_range(start, len)),
        }
    }

    // ---------------------------------------------------------------------
    // Display

    /// Fills `out` with peak columns of `dt` seconds starting at `t0`,
    /// refreshing any peaks dirtied since the last read.
    pub fn read_peak_map(&mut self, t0: f32, dt: f32, out: &mut [PeakColumn]) {
        let audio = self.audio_created.then_some(&self.audio);
        self.peaks.update(&self.data, audio);
        self.peaks.read(t0, dt, out, self.audio_created);
    }

    /// Stored waveform length in samples; zero unless the image was decoded
    /// with waveform storage.
    pub fn waveform_len(&self) -> u32 {
        self.waveforms[0].len() as u32
    }

    /// Copies stored waveform levels from `pos` into `dst`, returning the
    /// count. `direct` selects the turbo filter output over the FSK input.
    pub fn read_waveform(&self, dst: &mut [u8], pos: u32, direct: bool) -> usize {
        let wf = &self.waveforms[direct as usize];
        let pos = pos as usize;
        if pos >= wf.len() {
            return 0;
        }

        let n = dst.len().min(wf.len() - pos);
        dst[..n].copy_from_slice(&wf[pos..pos + n]);
        n
    }

    pub fn read_waveform_min_max(&self, pos: u32, len: u32, direct: bool) -> WaveformMinMax {
        let wf = &self.waveforms[direct as usize];
        let pos = pos as usize;
        if pos >= wf.len() || len == 0 {
            return WaveformMinMax::default();
        }

        let end = pos + (len as usize).min(wf.len() - pos);
        wf[pos..end].iter().fold(WaveformMinMax { min: 255, max: 0 }, |acc, &v| WaveformMinMax {
            min: acc.min.min(v),
            max: acc.max.max(v),
        })
    }

    /// Mixes playback audio into `dst` from `pos` onward.
    pub fn accumulate_audio(&self, dst: &mut [f32], pos: &mut AudioPosition, volume: f32) {
        self.audio_track().accumulate_audio(dst, pos, volume);
    }

    // ---------------------------------------------------------------------
    // Bit queries

    pub fn bit(&self, pos: u32, bypass_fsk: bool) -> bool {
        self.data.bit(pos, bypass_fsk)
    }

    pub fn bit_sum(&self, pos: u32, len: u32, bypass_fsk: bool) -> u32 {
        self.data.bit_sum(pos, len, bypass_fsk)
    }

    pub fn bit_with_hysteresis(&self, pos: u32, period: u32, threshold: u32, prev_bit: bool, bypass_fsk: bool) -> bool {
        self.data.bit_with_hysteresis(pos, period, threshold, prev_bit, bypass_fsk)
    }

    pub fn find_next_bit(&self, pos: u32, limit: u32, level: bool, bypass_fsk: bool) -> NextBit {
        self.data.find_next_bit(pos, limit, level, bypass_fsk)
    }

    pub fn transition_info(&self, pos: u32, n: u32, bypass_fsk: bool) -> TransitionInfo {
        self.data.transition_info(pos, n, bypass_fsk)
    }

    pub fn region_info(&self, pos: u32) -> RegionInfo {
        self.data.region_info(pos)
    }

    // ---------------------------------------------------------------------
    // Persistence

    /// Checksums of the loaded file, until the first edit.
    pub fn checksums(&self) -> Option<ImageChecksums> {
        self.checksums
    }

    /// Decoded-byte spans that CAS can only store as pulses.
    pub fn has_cas_incompatible_std_blocks(&self) -> bool {
        cas::has_incompatible_std_blocks(&self.data)
    }

    pub fn save_cas<W: Write>(&self, writer: W) -> Result<()> {
        cas::save_cas(&self.data, writer)
    }

    pub fn save_wav<W: Write + Seek>(&self, writer: W) -> Result<()> {
        wav::save_wav(&self.data, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_reader::MemoryAudioReader;
    use crate::progress::NullProgress;
    use crate::timeline::RegionType;
    use std::io::Cursor;

    fn std_image(bytes: &[u8]) -> CassetteImage {
        let mut image = CassetteImage::new();
        let mut cursor = WriteCursor::new(0);
        image.write_blank_data(&mut cursor, 20000, false).unwrap();
        image.write_std_data(&mut cursor, bytes, 600, false).unwrap();
        image.write_blank_data(&mut cursor, 5000, false).unwrap();
        image
    }

    fn load_bytes(image: &mut CassetteImage, bytes: Vec<u8>) -> Result<()> {
        image.load(Cursor::new(bytes), &LoadContext::default(), None, &mut NullProgress)
    }

    #[test]
    fn test_new_image_reads_mark() {
        let image = CassetteImage::new();
        assert_eq!(image.data_len(), 0);
        assert_eq!(image.audio_len(), 0);
        assert!(!image.is_audio_created());
        assert!(image.bit(0, false));
        assert_eq!(image.find_next_bit(10, 100, false, false), NextBit { pos: u32::MAX, bit: true });
    }

    #[test]
    fn test_write_std_data_framing() {
        let mut image = CassetteImage::new();
        let mut cursor = WriteCursor::new(0);
        image.write_std_data(&mut cursor, &[0x00], 600, false).unwrap();

        // start bit and eight zero data bits, then the stop bit
        let cell = image.data_len() / 10;
        assert!(!image.bit(cell / 2, false));
        assert!(image.bit(image.data_len() - cell / 2, false));
        assert_eq!(image.region_info(0).region_type, RegionType::DecodedData);
        assert_eq!(image.estimate_write_std_data(&WriteCursor::new(0), 1, 0), 0);
    }

    #[test]
    fn test_zero_baud_is_noop() {
        let mut image = CassetteImage::new();
        let mut cursor = WriteCursor::new(0);
        image.write_std_data(&mut cursor, &[1, 2, 3], 0, false).unwrap();
        assert_eq!(cursor.position, 0);
        assert_eq!(image.data_len(), 0);
    }

    #[test]
    fn test_writes_mirror_to_created_audio() {
        let mut image = std_image(&[0x12]);
        image.create_audio_track();
        assert!(image.is_audio_created());

        let mut cursor = WriteCursor::new(image.data_len());
        image.write_pulse(&mut cursor, false, 300, false, true).unwrap();
        image.write_blank_data(&mut cursor, 700, true).unwrap();
        assert_eq!(image.audio_len(), image.data_len());
        assert_eq!(
            image.audio_track().bit_sum(0, image.data_len(), false),
            image.bit_sum(0, image.data_len(), false)
        );
    }

    #[test]
    fn test_clip_with_audio_creates_audio_track() {
        let mut source = std_image(&[0xA5, 0x5A]);
        source.create_audio_track();
        let clip = source.copy_range(20000, 2000);
        assert!(clip.has_audio());
        assert_eq!(clip.len(), 2000);

        let mut image = std_image(&[0x00]);
        let before = image.data_len();
        assert_eq!(image.insert_range(100, &clip).unwrap(), 2100);
        assert!(image.is_audio_created());
        assert_eq!(image.data_len(), before + 2000);
        assert_eq!(image.audio_len(), image.data_len());
    }

    #[test]
    fn test_plain_clip_mirrors_into_created_audio() {
        let clip = std_image(&[0xFF]).copy_range(0, 30000);
        assert!(!clip.has_audio());

        let mut image = std_image(&[0x00]);
        image.create_audio_track();
        image.replace_range(image.data_len(), &clip).unwrap();
        assert_eq!(image.audio_len(), image.data_len());

        image.delete_range(0, 1000);
        assert_eq!(image.audio_len(), image.data_len());
    }

    #[test]
    fn test_insert_past_limit_fails() {
        let mut image = CassetteImage::new();
        let mut cursor = WriteCursor::new(0);
        image.write_blank_data(&mut cursor, SAMPLE_LIMIT - 10, false).unwrap();

        let clip = image.copy_range(0, 100);
        assert!(matches!(image.insert_range(0, &clip), Err(TapeError::TooLong)));
        assert_eq!(image.data_len(), SAMPLE_LIMIT - 10);
    }

    #[test]
    fn test_insert_beyond_end_counts_padding() {
        let mut source = CassetteImage::new();
        source.write_blank_data(&mut WriteCursor::new(0), 100, false).unwrap();
        let clip = source.copy_range(0, 100);

        let mut image = CassetteImage::new();
        assert!(matches!(
            image.insert_range(SAMPLE_LIMIT - 10, &clip),
            Err(TapeError::TooLong)
        ));
        assert_eq!(image.data_len(), 0);

        assert_eq!(image.insert_range(SAMPLE_LIMIT - 100, &clip).unwrap(), SAMPLE_LIMIT);
        assert_eq!(image.data_len(), SAMPLE_LIMIT);
    }

    #[test]
    fn test_cas_load_captures_checksums_until_edit() {
        let mut bytes = Vec::new();
        std_image(&[1, 2, 3]).save_cas(&mut bytes).unwrap();

        let mut image = CassetteImage::new();
        load_bytes(&mut image, bytes.clone()).unwrap();

        let sums = image.checksums().unwrap();
        assert_eq!(sums.crc32, crc32fast::hash(&bytes));
        assert!(!image.is_audio_created());

        image.delete_range(0, 10);
        assert!(image.checksums().is_none());
    }

    #[test]
    fn test_load_errors_keep_image() {
        let mut image = std_image(&[0x42]);
        let len = image.data_len();

        assert!(matches!(
            load_bytes(&mut image, b"fLaC\0\0\0\0".to_vec()),
            Err(TapeError::UnrecognizedFormat)
        ));
        assert!(matches!(
            load_bytes(&mut image, b"junk".to_vec()),
            Err(TapeError::UnrecognizedFormat)
        ));
        assert!(matches!(load_bytes(&mut image, Vec::new()), Err(TapeError::UnrecognizedFormat)));

        // truncated CAS
        assert!(load_bytes(&mut image, b"FUJI\0\0\0\0data\x10\0\0\0abcd".to_vec()).is_err());
        assert_eq!(image.data_len(), len);
    }

    #[test]
    fn test_analysis_requires_audio_input() {
        struct Discard;
        impl AnalysisSink for Discard {
            fn write_frames(&mut self, _frames: &[f32]) -> Result<()> {
                Ok(())
            }
        }

        let mut bytes = Vec::new();
        std_image(&[1]).save_cas(&mut bytes).unwrap();

        let mut image = CassetteImage::new();
        let result = image.load(Cursor::new(bytes), &LoadContext::default(), Some(&mut Discard), &mut NullProgress);
        assert!(matches!(result, Err(TapeError::InvalidInput(_))));
    }

    #[test]
    fn test_wav_load_creates_audio_track() {
        let mut wav_bytes = Cursor::new(Vec::new());
        std_image(&[0x55]).save_wav(&mut wav_bytes).unwrap();

        let mut image = CassetteImage::new();
        let ctx = LoadContext::new().with_store_waveform(true);
        image
            .load(Cursor::new(wav_bytes.into_inner()), &ctx, None, &mut NullProgress)
            .unwrap();

        assert!(image.is_audio_created());
        assert!(!image.is_audio_present());
        assert_eq!(image.audio_len(), image.data_len());
        assert_eq!(image.waveform_len(), image.data_len());
        assert!(image.checksums().is_none());

        let mut buf = [0u8; 64];
        assert_eq!(image.read_waveform(&mut buf, 100, false), 64);
        assert_eq!(image.read_waveform(&mut buf, image.waveform_len() - 10, true), 10);
        assert_eq!(image.read_waveform(&mut buf, image.waveform_len(), true), 0);

        let mm = image.read_waveform_min_max(0, 2000, false);
        assert!(mm.min < 128 && mm.max > 128);
    }

    #[test]
    fn test_waveform_min_max_empty() {
        let image = CassetteImage::new();
        assert_eq!(image.read_waveform_min_max(0, 100, false), WaveformMinMax::default());
    }

    #[test]
    fn test_load_audio_from_memory() {
        let frames: Vec<[i16; 2]> = (0..20000)
            .map(|i| {
                let v = (9000.0 * (std::f64::consts::TAU * 5326.7 * i as f64 / 44100.0).sin()) as i16;
                [0, v]
            })
            .collect();
        let mut reader = MemoryAudioReader::new(44100, 2, frames);

        let mut image = CassetteImage::new();
        image
            .load_audio(&mut reader, &LoadContext::default(), None, &mut NullProgress)
            .unwrap();
        assert!(image.is_audio_present());
        assert_eq!(image.region_info(0).region_type, RegionType::Raw);

        let mut columns = [PeakColumn::default(); 4];
        image.read_peak_map(0.0, 0.1, &mut columns);
        assert!(columns[0].data[0] < -0.1);
        assert!(columns[0].data[1] > 0.1);
        assert_eq!(columns[0].audio, [0.0, 0.0]);
    }

    #[test]
    fn test_peak_map_follows_edits() {
        let mut image = CassetteImage::new();
        let mut cursor = WriteCursor::new(0);
        image.write_blank_data(&mut cursor, 4096, false).unwrap();

        let mut columns = [PeakColumn::default(); 1];
        let dt = 1024.0 / crate::DATA_SAMPLE_RATE as f32;
        image.read_peak_map(0.0, dt, &mut columns);
        assert_eq!(columns[0].data, [0.0, 0.0]);

        let mut cursor = WriteCursor::new(0);
        image.write_pulse(&mut cursor, false, 1024, false, true).unwrap();
        image.read_peak_map(0.0, dt, &mut columns);
        assert_eq!(columns[0].data, [-1.0, 1.0]);
    }

    #[test]
    fn test_trimmed_std_block_is_cas_incompatible() {
        let mut image = std_image(&[1, 2, 3, 4]);
        assert!(!image.has_cas_incompatible_std_blocks());

        image.delete_range(20100, 20200);
        assert!(image.has_cas_incompatible_std_blocks());
    }
}
