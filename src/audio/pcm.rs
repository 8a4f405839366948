use super::{AudioFrame, DEFAULT_INBOUND_SAMPLE_RATE_HZ, PlaybackBuffer};
use crate::error::DecodeError;
use crate::types::Blob;
use base64::Engine as _;

const PCM16_SCALE: f32 = i16::MAX as f32 + 1.0;

fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE)
        .clamp(i16::MIN as f32, i16::MAX as f32)
        .round() as i16
}

/// Serializes float samples as signed 16-bit little-endian PCM.
///
/// Samples outside [-1, 1] are clamped and NaN becomes silence, so this
/// never fails.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Reads signed 16-bit little-endian PCM back into floats in [-1, 1).
///
/// A trailing odd byte is reported rather than dropped: it means the
/// transport split a sample.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Decodes PCM recorded at `source_rate` into a buffer playable at `target_rate`.
pub fn decode_playback_buffer(
    bytes: &[u8],
    source_rate: u32,
    target_rate: u32,
) -> Result<PlaybackBuffer, DecodeError> {
    let samples = decode_pcm16(bytes)?;
    if source_rate == target_rate {
        return Ok(PlaybackBuffer::new(samples, target_rate));
    }
    if source_rate == 0 || target_rate == 0 {
        return Err(DecodeError::UnsupportedRate {
            from: source_rate,
            to: target_rate,
        });
    }

    #[cfg(feature = "audio-resampling")]
    {
        let resampled = super::resample::resample_mono(&samples, source_rate, target_rate)?;
        Ok(PlaybackBuffer::new(resampled, target_rate))
    }

    #[cfg(not(feature = "audio-resampling"))]
    {
        Err(DecodeError::UnsupportedRate {
            from: source_rate,
            to: target_rate,
        })
    }
}

/// Decodes a server `inlineData` blob. The source rate comes from the MIME
/// type and defaults to 24 kHz.
pub fn decode_inline_audio(blob: &Blob, target_rate: u32) -> Result<PlaybackBuffer, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&blob.data)
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let source_rate = blob.sample_rate().unwrap_or(DEFAULT_INBOUND_SAMPLE_RATE_HZ);
    decode_playback_buffer(&bytes, source_rate, target_rate)
}

/// Wraps an outbound frame as the blob carried by `realtimeInput.audio`.
pub fn frame_to_blob(frame: &AudioFrame) -> Blob {
    Blob {
        mime_type: format!("audio/pcm;rate={}", frame.sample_rate),
        data: base64::engine::general_purpose::STANDARD.encode(&frame.pcm),
    }
}
