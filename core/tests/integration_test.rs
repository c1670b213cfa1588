// ============================================================================
// INTEGRATION TESTS
// ============================================================================
// End-to-end checks through the public image API: timeline edit algebra,
// CAS and WAV round trips, and audio decoding of rendered tapes.
//
// The WAV round trips resample a few seconds of audio and are noticeably
// faster in release mode:
//   cargo test -p tapewave-core --test integration_test --release
// ============================================================================

use std::io::Cursor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tapewave_core::{
    CassetteImage, LoadContext, MemoryAudioReader, NullProgress, Pulse, RegionType, Timeline,
    WriteCursor, DATA_SAMPLE_RATE,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn count_bits(tape: &Timeline, pos: u32, n: u32) -> (u32, u32) {
    let mut prev = if pos == 0 { true } else { tape.bit(pos - 1, false) };
    let mut marks = 0;
    let mut transitions = 0;

    for i in 0..n {
        let bit = tape.bit(pos + i, false);
        marks += bit as u32;
        transitions += (bit != prev) as u32;
        prev = bit;
    }

    (marks, transitions)
}

fn mixed_tape() -> Timeline {
    let mut tape = Timeline::new();
    let mut cursor = WriteCursor::new(0);

    assert!(tape.write_blank_data(&mut cursor, 3000, false));
    assert!(tape.write_std_data(&mut cursor, b"\x55\xAA\x00\xFF\x13", 600, false));

    let pulses: Vec<Pulse> = (0..40)
        .map(|i| Pulse {
            polarity: i % 2 == 1,
            samples: 5 + (i * 7) % 23,
        })
        .collect();
    assert!(tape.write_pulses(&mut cursor, &pulses, false, true));
    assert!(tape.write_std_data(&mut cursor, b"tape", 1200, false));
    assert!(tape.write_pulses(&mut cursor, &pulses, false, false));
    assert!(tape.write_blank_data(&mut cursor, 500, false));
    tape
}

/// Unsigned 8-bit WAV samples converted to the 16-bit frames an audio
/// reader would produce.
fn wav_to_frames(bytes: Vec<u8>) -> (u32, Vec<[i16; 2]>) {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).expect("WAV should parse");
    let rate = reader.spec().sample_rate;
    let frames = reader
        .samples::<i8>()
        .map(|s| {
            let v = (s.expect("sample") as i16) << 8;
            [v, v]
        })
        .collect();
    (rate, frames)
}

#[test]
fn test_transition_info_matches_bitwise_scan() {
    let tape = mixed_tape();
    let len = tape.len();

    let windows = [(0, len), (0, 1), (2990, 40), (3001, 700), (len - 300, 300), (len - 10, 50), (1234, 4321)];
    for &(pos, n) in &windows {
        let info = tape.transition_info(pos, n, false);
        let (marks, transitions) = count_bits(&tape, pos, n);
        assert_eq!(info.mark_bits, marks, "marks at {pos}+{n}");
        assert_eq!(info.transition_bits, transitions, "transitions at {pos}+{n}");
        assert_eq!(info.mark_bits + info.space_bits, n);
    }
}

#[test]
fn test_insert_delete_inverse() {
    let tape = mixed_tape();
    let clip = tape.copy_range(3100, 900);

    for start in [0, 50, 3100, 3333, tape.len() - 1, tape.len()] {
        let mut edited = tape.clone();
        assert_eq!(edited.insert_range(start, &clip), Some(start + 900));
        assert_eq!(edited.len(), tape.len() + 900);
        edited.validate().expect("valid after insert");

        edited.delete_range(start, start + 900);
        assert_eq!(edited.len(), tape.len());
        edited.validate().expect("valid after delete");

        for pos in (0..tape.len()).step_by(7) {
            assert_eq!(edited.bit(pos, false), tape.bit(pos, false), "bit {pos} after insert at {start}");
        }
    }
}

#[test]
fn test_copy_then_reinsert_duplicates_range() {
    let tape = mixed_tape();
    let (pos, len) = (3050, 1500);

    let mut edited = tape.clone();
    let clip = edited.copy_range(pos, len);
    assert_eq!(edited.insert_range(pos, &clip), Some(pos + len));

    for i in 0..len {
        assert_eq!(edited.bit(pos + i, false), tape.bit(pos + i, false));
    }
    for p in pos..tape.len() {
        assert_eq!(edited.bit(p + len, false), tape.bit(p, false));
    }
}

#[test]
fn test_concrete_600_baud_bit_sum() {
    let mut image = CassetteImage::new();
    let mut cursor = WriteCursor::new(0);
    image
        .write_std_data(&mut cursor, &[0x55, 0xAA, 0x00], 600, false)
        .expect("write should succeed");

    let len = image.data_len();
    assert_eq!(cursor.position, len);
    assert!((1597..=1599).contains(&len), "len {len}");

    // start bit, eight data bits LSB first, stop bit
    let framed: Vec<bool> = [0x55u8, 0xAA, 0x00]
        .iter()
        .flat_map(|&b| {
            let word = (b as u32) * 2 + 0x200;
            (0..10).map(move |i| word & (1 << i) != 0)
        })
        .collect();
    assert_eq!(framed.iter().filter(|&&b| b).count(), 11);

    let expected: u32 = (0..len)
        .map(|s| {
            let cell = ((s as f64 * 600.0 / DATA_SAMPLE_RATE) as usize).min(29);
            framed[cell] as u32
        })
        .sum();

    let sum = image.bit_sum(0, len, false);
    assert!(sum.abs_diff(expected) <= 6, "sum {sum} vs expected {expected}");
}

#[test]
fn test_cas_round_trip_preserves_records() {
    init_logging();
    let mut image = CassetteImage::new();
    let mut cursor = WriteCursor::new(0);
    image.write_blank_data(&mut cursor, 400_000, false).unwrap();
    image.write_std_data(&mut cursor, &[0x55, 0x55, 0xFC, 1, 2, 3, 4], 600, false).unwrap();
    image.write_blank_data(&mut cursor, 8000, false).unwrap();
    image.write_std_data(&mut cursor, b"second record", 600, false).unwrap();
    image.write_blank_data(&mut cursor, (DATA_SAMPLE_RATE * 2.0) as u32, false).unwrap();
    assert!(!image.has_cas_incompatible_std_blocks());

    let mut cas = Vec::new();
    image.save_cas(&mut cas).expect("save CAS");
    assert_eq!(&cas[..4], b"FUJI");

    let mut loaded = CassetteImage::new();
    loaded
        .load(Cursor::new(cas.clone()), &LoadContext::default(), None, &mut NullProgress)
        .expect("load CAS");
    assert_eq!(loaded.checksums().map(|c| c.crc32), Some(crc32fast::hash(&cas)));

    let records = |img: &CassetteImage| {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < img.data_len() {
            let region = img.region_info(pos);
            if region.region_type == RegionType::DecodedData {
                out.push((region.region_start, region.region_len, img.bit_sum(region.region_start, region.region_len, false)));
            }
            pos = region.region_start + region.region_len;
        }
        out
    };

    let original = records(&image);
    let reloaded = records(&loaded);
    assert_eq!(original.len(), 2);
    assert_eq!(reloaded.len(), 2);

    for (a, b) in original.iter().zip(&reloaded) {
        assert!(a.0.abs_diff(b.0) < 64, "record start {} vs {}", a.0, b.0);
        assert_eq!(a.1, b.1);
        assert_eq!(a.2, b.2);
    }

    assert!(loaded.data_len().abs_diff(image.data_len()) < 128);
}

#[test]
fn test_wav_round_trip_through_image() {
    init_logging();
    let mut image = CassetteImage::new();
    let mut cursor = WriteCursor::new(0);
    image.write_blank_data(&mut cursor, 10_000, false).unwrap();
    image.write_std_data(&mut cursor, b"\x55\x55\xFC\xA5\x0F", 600, false).unwrap();
    image.write_blank_data(&mut cursor, 10_000, false).unwrap();

    let mut wav = Cursor::new(Vec::new());
    image.save_wav(&mut wav).expect("save WAV");

    let mut loaded = CassetteImage::new();
    loaded
        .load(Cursor::new(wav.into_inner()), &LoadContext::default(), None, &mut NullProgress)
        .expect("load WAV");

    assert!(loaded.is_audio_created());
    assert_eq!(loaded.region_info(0).region_type, RegionType::Raw);

    let cell = DATA_SAMPLE_RATE / 600.0;
    for i in 0..50 {
        let pos = (10_000.0 + cell * (i as f64 + 0.5)) as u32;
        assert_eq!(loaded.bit(pos, false), image.bit(pos, false), "cell {i}");
    }
}

#[test]
fn test_noisy_audio_still_decodes() {
    init_logging();
    let mut image = CassetteImage::new();
    let mut cursor = WriteCursor::new(0);
    image.write_blank_data(&mut cursor, 6000, false).unwrap();
    image.write_std_data(&mut cursor, b"\x00\xFF\x5A", 600, false).unwrap();
    image.write_blank_data(&mut cursor, 6000, false).unwrap();

    let mut wav = Cursor::new(Vec::new());
    image.save_wav(&mut wav).unwrap();
    let (rate, mut frames) = wav_to_frames(wav.into_inner());

    let mut rng = StdRng::seed_from_u64(0x7A9E);
    let noise = Normal::new(0.0, 2000.0).unwrap();
    for frame in &mut frames {
        let v = (frame[1] as f64 + noise.sample(&mut rng)).clamp(-32768.0, 32767.0) as i16;
        *frame = [v, v];
    }

    let mut loaded = CassetteImage::new();
    let mut reader = MemoryAudioReader::new(rate, 1, frames);
    loaded
        .load_audio(&mut reader, &LoadContext::default(), None, &mut NullProgress)
        .unwrap();
    assert!(!loaded.is_audio_present());

    // majority vote over the middle half of each cell
    let cell = DATA_SAMPLE_RATE / 600.0;
    for i in 0..30 {
        let start = (6000.0 + cell * (i as f64 + 0.25)) as u32;
        let width = (cell / 2.0) as u32;
        let marks = loaded.bit_sum(start, width, false);
        let expected = image.bit(start + width / 2, false);
        assert_eq!(marks * 2 > width, expected, "cell {i}: {marks}/{width}");
    }
}

#[test]
fn test_random_edits_keep_invariants() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut tape = Timeline::new();
    let mut expected_len: u32 = 0;

    for step in 0..300 {
        let len = tape.len();
        match rng.gen_range(0..6) {
            0 => {
                let n = rng.gen_range(1..2000);
                let pos = rng.gen_range(0..=len);
                let insert = rng.gen_bool(0.5);
                let mut cursor = WriteCursor::new(pos);
                assert!(tape.write_blank_data(&mut cursor, n, insert));
                expected_len = if insert { len + n } else { len.max(pos + n) };
            }
            1 => {
                let bytes: Vec<u8> = (0..rng.gen_range(1..6)).map(|_| rng.gen()).collect();
                let baud = [300, 600, 1200][rng.gen_range(0..3)];
                let mut cursor = WriteCursor::new(len);
                assert!(tape.write_std_data(&mut cursor, &bytes, baud, false));
                expected_len = cursor.position;
            }
            2 => {
                let pulses: Vec<Pulse> = (0..rng.gen_range(1..20))
                    .map(|_| Pulse {
                        polarity: rng.gen(),
                        samples: rng.gen_range(1..60),
                    })
                    .collect();
                let total: u32 = pulses.iter().map(|p| p.samples).sum();
                let pos = rng.gen_range(0..=len);
                let mut cursor = WriteCursor::new(pos);
                assert!(tape.write_pulses(&mut cursor, &pulses, true, rng.gen()));
                expected_len = len + total;
            }
            3 if len > 0 => {
                let start = rng.gen_range(0..len);
                let n = rng.gen_range(0..=(len - start).min(3000));
                let clip = tape.copy_range(start, n);
                let at = rng.gen_range(0..=len);
                assert_eq!(tape.insert_range(at, &clip), Some(at + n));
                expected_len = len + n;
            }
            4 if len > 0 => {
                let start = rng.gen_range(0..len);
                let end = rng.gen_range(start..=len);
                tape.delete_range(start, end);
                expected_len = len - (end - start);
            }
            _ => continue,
        }

        assert_eq!(tape.len(), expected_len, "length after step {step}");
        tape.validate().unwrap_or_else(|e| panic!("step {step}: {e}"));

        let len = tape.len();
        if len > 0 {
            let pos = rng.gen_range(0..len);
            let n = rng.gen_range(0..=(len - pos).min(5000));
            let (marks, transitions) = count_bits(&tape, pos, n);
            let info = tape.transition_info(pos, n, false);
            assert_eq!(tape.bit_sum(pos, n, false), marks, "bit sum after step {step}");
            assert_eq!(info.mark_bits, marks);
            assert_eq!(info.transition_bits, transitions);
        }
    }
}
