//! PCM16 wire codec
//! Converts captured f32 samples to base64 little-endian PCM16 and back

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{LiveError, Result};

/// Full-scale multiplier between f32 samples and i16 words
const PCM16_SCALE: f32 = 32768.0;

/// Encoded audio chunk ready for the transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPayload {
    pub data: String,
    pub mime_type: String,
}

/// Mime tag for raw PCM16 at `rate`
pub fn pcm_mime_type(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Sample rates accepted from the wire
pub const SUPPORTED_RATES: std::ops::RangeInclusive<u32> = 8000..=192000;

/// Read the `rate=` parameter out of an audio mime type.
/// Rates outside `SUPPORTED_RATES` are treated as absent.
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .filter(|rate| SUPPORTED_RATES.contains(rate))
}

/// Quantize one sample, saturating instead of wrapping
fn quantize(sample: f32) -> i16 {
    (sample * PCM16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode f32 samples in [-1, 1] to a base64 PCM16 payload tagged with `rate`
pub fn encode(samples: &[f32], rate: u32) -> AudioPayload {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    AudioPayload {
        data: BASE64.encode(&bytes),
        mime_type: pcm_mime_type(rate),
    }
}

/// Decode a base64 PCM16 payload into samples
pub fn decode(data: &str) -> Result<Vec<i16>> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| LiveError::Decode(e.to_string()))?;

    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Convert PCM16 samples to f32 for a playback device
pub fn pcm_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM16_SCALE).collect()
}
