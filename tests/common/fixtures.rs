//! Generated upload payloads
//!
//! The test server runs the in-process converter and engine, so payloads
//! only need to pass content sniffing; the fakes never decode them.
#![allow(dead_code)]

use super::constants::*;
use mastering_server::testing::FakeConverter;

/// A valid 44.1 kHz, 16-bit mono PCM WAV holding a short sine tone
pub fn wav_bytes() -> Vec<u8> {
    let sample_rate: u32 = 44_100;
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = (TEST_WAV_SAMPLES * block_align as usize) as u32;

    let mut bytes = Vec::with_capacity(TEST_WAV_SIZE_BYTES);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&byte_rate.to_le_bytes());
    bytes.extend_from_slice(&block_align.to_le_bytes());
    bytes.extend_from_slice(&bits_per_sample.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..TEST_WAV_SAMPLES {
        let t = i as f32 / sample_rate as f32;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Bytes the converter refuses to probe
pub fn corrupt_bytes() -> Vec<u8> {
    let mut bytes = FakeConverter::CORRUPT_MARKER.to_vec();
    bytes.extend_from_slice(&[0u8; 256]);
    bytes
}

/// A PNG signature followed by padding; sniffs as an image
pub fn image_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

