//! # PCM Codec
//!
//! Stateless conversions used on both sides of a live call:
//!
//! - **Outbound**: microphone floats in [-1.0, 1.0] → 16-bit little-endian PCM → base64 text
//! - **Inbound**: base64 text → 16-bit little-endian PCM → per-channel floats
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit signed PCM
//! - **Byte Order**: Little-endian
//! - **Layout**: Interleaved when more than one channel
//! - **Scale**: one unit of the float range is 32768 integer steps

use crate::error::CallError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

const PCM_SCALE: f32 = 32768.0;

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 16kHz mono, what the speech service expects from the microphone.
    pub fn capture() -> Self {
        Self::new(16000, 1)
    }

    /// 24kHz mono, what the speech service synthesizes.
    pub fn playback() -> Self {
        Self::new(24000, 1)
    }

    /// MIME type announced alongside outbound audio.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Decoded, de-interleaved audio ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Encode float samples as 16-bit little-endian PCM.
///
/// Out-of-range input is clamped, not rejected: 1.0 becomes 32767 and
/// anything below -1.0 becomes -32768, like audio hardware would do.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    for (out, &sample) in bytes.chunks_exact_mut(2).zip(samples) {
        let scaled = (sample * PCM_SCALE).clamp(-32768.0, 32767.0);
        // `as` truncates toward zero and maps NaN to 0
        LittleEndian::write_i16(out, scaled as i16);
    }
    bytes
}

/// Decode interleaved 16-bit little-endian PCM into per-channel floats.
///
/// ## Errors:
/// `MalformedFrame` when `channels` is zero or the byte length is not a
/// multiple of `2 * channels`.
pub fn decode_frame(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedAudio, CallError> {
    if channels == 0 {
        return Err(CallError::MalformedFrame("channel count must be at least 1".to_string()));
    }

    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(CallError::MalformedFrame(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit samples)",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let frames = bytes.len() / frame_bytes;
    let mut output = vec![Vec::with_capacity(frames); channels as usize];
    let mut cursor = Cursor::new(bytes);

    for _ in 0..frames {
        for channel in output.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| CallError::MalformedFrame(e.to_string()))?;
            channel.push(sample as f32 / PCM_SCALE);
        }
    }

    Ok(DecodedAudio {
        sample_rate,
        channels: output,
    })
}

/// Binary → transport text (standard base64 with padding).
pub fn bytes_to_transport_text(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Transport text → binary. Exact inverse of [`bytes_to_transport_text`].
pub fn transport_text_to_bytes(text: &str) -> Result<Vec<u8>, CallError> {
    BASE64
        .decode(text)
        .map_err(|e| CallError::MalformedFrame(format!("invalid base64 payload: {}", e)))
}

/// Decode an inbound audio chunk straight from its transport text.
pub fn decode_transport_audio(text: &str, format: AudioFormat) -> Result<DecodedAudio, CallError> {
    let bytes = transport_text_to_bytes(text)?;
    decode_frame(&bytes, format.sample_rate, format.channels)
}

/// Encode a microphone frame straight to transport text.
pub fn encode_transport_audio(samples: &[f32]) -> String {
    bytes_to_transport_text(&encode_frame(samples))
}

/// Parse a block of 32-bit float little-endian samples, as sent by browsers
/// that forward raw `Float32Array` microphone buffers.
pub fn samples_from_f32_le(bytes: &[u8]) -> Result<Vec<f32>, CallError> {
    if bytes.len() % 4 != 0 {
        return Err(CallError::MalformedFrame(format!(
            "{} bytes is not a whole number of f32 samples",
            bytes.len()
        )));
    }

    let mut samples = vec![0.0f32; bytes.len() / 4];
    Cursor::new(bytes)
        .read_f32_into::<LittleEndian>(&mut samples)
        .map_err(|e| CallError::MalformedFrame(e.to_string()))?;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scales_and_clamps() {
        let bytes = encode_frame(&[0.0, 0.5, -0.5, 1.0, -1.0, 2.0, -3.0]);
        let mut cursor = Cursor::new(bytes);
        let mut values = Vec::new();
        while let Ok(v) = cursor.read_i16::<LittleEndian>() {
            values.push(v);
        }
        assert_eq!(values, vec![0, 16384, -16384, 32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 * 0.05).sin() * 0.9).collect();
        let decoded = decode_frame(&encode_frame(&samples), 16000, 1).unwrap();

        assert_eq!(decoded.frames(), samples.len());
        for (original, restored) in samples.iter().zip(&decoded.channels[0]) {
            assert!((original - restored).abs() <= 1.0 / PCM_SCALE, "{} vs {}", original, restored);
        }
    }

    #[test]
    fn test_decode_deinterleaves_channels() {
        let interleaved = encode_frame(&[0.25, -0.25, 0.5, -0.5]);
        let decoded = decode_frame(&interleaved, 24000, 2).unwrap();
        assert_eq!(decoded.channels[0], vec![0.25, 0.5]);
        assert_eq!(decoded.channels[1], vec![-0.25, -0.5]);
    }

    #[test]
    fn test_decode_rejects_partial_frames() {
        assert!(matches!(decode_frame(&[0u8; 3], 24000, 1), Err(CallError::MalformedFrame(_))));
        // Even length but not a whole stereo frame
        assert!(matches!(decode_frame(&[0u8; 6], 24000, 2), Err(CallError::MalformedFrame(_))));
        assert!(matches!(decode_frame(&[0u8; 4], 24000, 0), Err(CallError::MalformedFrame(_))));
    }

    #[test]
    fn test_transport_text_is_lossless() {
        let cases: Vec<Vec<u8>> = vec![vec![], vec![0], vec![255, 0, 7], (0..=255).collect()];
        for bytes in cases {
            let text = bytes_to_transport_text(&bytes);
            assert_eq!(transport_text_to_bytes(&text).unwrap(), bytes);
        }
        assert_eq!(bytes_to_transport_text(&[]), "");
    }

    #[test]
    fn test_invalid_transport_text() {
        assert!(matches!(transport_text_to_bytes("not base64!"), Err(CallError::MalformedFrame(_))));
    }

    #[test]
    fn test_duration_at_playback_rate() {
        let samples = vec![0.1f32; 12000];
        let text = encode_transport_audio(&samples);
        let decoded = decode_transport_audio(&text, AudioFormat::playback()).unwrap();
        assert!((decoded.duration_seconds() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_f32_block_parsing() {
        let mut bytes = Vec::new();
        for v in [0.5f32, -0.25, 1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(samples_from_f32_le(&bytes).unwrap(), vec![0.5, -0.25, 1.0]);
        assert!(samples_from_f32_le(&bytes[..5]).is_err());
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(AudioFormat::capture().mime_type(), "audio/pcm;rate=16000");
    }
}
