//! Conversion between float samples and the wire representation
//!
//! The remote model speaks little-endian PCM16 wrapped in base64. Everything
//! in here is pure: no state, no I/O, no failure beyond rejecting malformed
//! input.

use crate::audio::resampler::resample_audio;
use crate::messages::AudioData;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("PCM16 payload has odd byte count {0}")]
    OddByteCount(usize),

    #[error("Channel count must be greater than 0")]
    ZeroChannels,

    #[error("Payload of {samples} samples is not a whole number of {channels}-channel frames")]
    RaggedFrames { samples: usize, channels: u16 },

    #[error("Resampling failed: {0}")]
    Resample(String),
}

/// Convert float samples to PCM16, clamping to [-1, 1] first.
///
/// Negative samples scale by 32768 and positive ones by 32767 so both ends
/// of the range map onto the full i16 span without wrapping.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32768.0).round() as i16
            } else {
                (s * 32767.0).round() as i16
            }
        })
        .collect()
}

/// Convert PCM16 back to float samples in [-1, 1], mirroring `to_pcm16`
pub fn from_pcm16(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| {
            if s < 0 {
                s as f32 / 32768.0
            } else {
                s as f32 / 32767.0
            }
        })
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteCount(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Encode one capture block for the wire: clamp, PCM16, base64
pub fn encode_frame(samples: &[f32]) -> String {
    encode_base64(&pcm16_to_bytes(&to_pcm16(samples)))
}

/// Decode a base64 PCM16 chunk into float samples at `target_rate`.
///
/// Samples stay interleaved when `channels > 1`. Rates that already match
/// are passed through without touching the resampler.
pub fn decode_chunk(
    payload: &str,
    source_rate: u32,
    target_rate: u32,
    channels: u16,
) -> Result<AudioData, CodecError> {
    if channels == 0 {
        return Err(CodecError::ZeroChannels);
    }

    let pcm = bytes_to_pcm16(&decode_base64(payload)?)?;
    if pcm.len() % channels as usize != 0 {
        return Err(CodecError::RaggedFrames {
            samples: pcm.len(),
            channels,
        });
    }

    let samples = from_pcm16(&pcm);
    let samples = resample_audio(&samples, source_rate, target_rate, channels)
        .map_err(|e| CodecError::Resample(e.to_string()))?;

    Ok(AudioData::new(samples, target_rate, channels))
}
