//! Sample-rate conversion between synthesis, telephony and recognition rates

use serde::Deserialize;

/// Resampling applied to a pipeline's input audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMode {
    #[default]
    None,

    /// Synthesis audio at 24kHz decimated to the 8kHz telephony rate
    #[serde(alias = "downsample24kTo8k")]
    Downsample24kTo8k,

    /// Telephony audio at 8kHz doubled for 16kHz recognisers
    #[serde(alias = "upsample8kTo16k")]
    Upsample8kTo16k,
}

impl ResampleMode {
    /// Sample rate of audio leaving the resampler, given the rate entering it
    pub fn output_rate(self, input_rate: u32) -> u32 {
        match self {
            ResampleMode::None => input_rate,
            ResampleMode::Downsample24kTo8k => input_rate / 3,
            ResampleMode::Upsample8kTo16k => input_rate * 2,
        }
    }
}

/// N:1 decimation by averaging each group of `ratio` samples.
///
/// A trailing partial group is dropped, so callers feed multiples of
/// `ratio * 2` bytes to avoid clicks at chunk boundaries.
pub fn downsample(pcm: &[u8], ratio: usize) -> Vec<u8> {
    if ratio <= 1 {
        return pcm[..pcm.len() & !1].to_vec();
    }

    let group_bytes = ratio * 2;
    let mut out = Vec::with_capacity(pcm.len() / ratio);
    for group in pcm.chunks_exact(group_bytes) {
        let sum: i32 = group
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as i32)
            .sum();
        let avg = (sum / ratio as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&avg.to_le_bytes());
    }
    out
}

/// 8kHz to 16kHz upsampler: one-pole low-pass followed by midpoint interpolation.
///
/// Filter state carries across frames so chunk boundaries stay continuous.
#[derive(Debug, Clone)]
pub struct Upsampler {
    prev: i16,
    alpha: f32,
}

impl Default for Upsampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Upsampler {
    pub fn new() -> Self {
        Self {
            prev: 0,
            alpha: 0.15,
        }
    }

    pub fn process(&mut self, pcm: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for pair in pcm.chunks_exact(2) {
            let current = i16::from_le_bytes([pair[0], pair[1]]);
            let prev = self.prev as f32;
            let filtered = (prev + self.alpha * (current as f32 - prev)) as i16;
            let middle = ((self.prev as i32 + filtered as i32) / 2) as i16;

            out.extend_from_slice(&self.prev.to_le_bytes());
            out.extend_from_slice(&middle.to_le_bytes());
            self.prev = filtered;
        }
        out
    }

    pub fn reset(&mut self) {
        self.prev = 0;
    }
}
