//! Small sample-level helpers shared by capture and playback

/// Average interleaved channels down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Simple linear resampling, `ratio` = output rate / input rate
pub fn resample(samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() || ratio <= 0.0 {
        return Vec::new();
    }

    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = src_idx - idx_floor as f64;

        let sample = match samples.get(idx_floor) {
            Some(&s1) => {
                let s2 = samples[idx_ceil];
                s1 + (s2 - s1) * frac as f32
            }
            None => 0.0,
        };

        output.push(sample);
    }

    output
}

/// f32 sample to a signed 16-bit device sample, saturating
pub fn to_i16_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// f32 sample to an unsigned 16-bit device sample centered on 32768
pub fn to_u16_sample(sample: f32) -> u16 {
    ((sample.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32).round() as u16
}

/// Calculate RMS of samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert RMS to a 0.0 - 1.0 level over a -60dB..0dB range
pub fn rms_to_level(rms: f32) -> f32 {
    let db = 20.0 * rms.max(1e-10).log10();
    let normalized = (db + 60.0) / 60.0;
    normalized.clamp(0.0, 1.0)
}
