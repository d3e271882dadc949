//! Per-session configuration
//!
//! Everything is fixed at session creation. JSON documents may omit any field;
//! missing fields take the production defaults.

use crate::backend::BackendConfig;
use crate::capture::CaptureConfig;
use crate::codec::Codec;
use crate::playback::PlaybackConfig;
use crate::resample::ResampleMode;
use crate::timeout::TimeoutConfig;
use crate::vad::VadConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Codec used on the outbound RTP leg
    pub codec: Codec,

    /// Local RTP address; port 0 picks a free port
    pub rtp_bind: String,

    /// Barge-in: caller speech cuts off playback
    pub automatic_interruption: bool,

    pub vad: VadConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub timeouts: TimeoutConfig,
    pub backends: BackendConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Pcma,
            rtp_bind: "0.0.0.0:0".to_string(),
            automatic_interruption: true,
            vad: VadConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            timeouts: TimeoutConfig::default(),
            backends: BackendConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.vad
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        // The capture VAD runs on decoded call audio
        if self.vad.sample_rate != self.codec.clock_rate() {
            return Err(ConfigError::Invalid(format!(
                "vad.sample_rate {}Hz does not match the {} clock rate of {}Hz",
                self.vad.sample_rate,
                self.codec.name(),
                self.codec.clock_rate()
            )));
        }

        if self.capture.pre_roll_ms as u64 > self.capture.buffer_seconds as u64 * 1000 {
            return Err(ConfigError::Invalid(format!(
                "pre-roll of {}ms does not fit in a {}s capture buffer",
                self.capture.pre_roll_ms, self.capture.buffer_seconds
            )));
        }
        if self.capture.asr_chunk_bytes == 0 || self.capture.asr_chunk_bytes % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "asr_chunk_bytes must be a positive even number, got {}",
                self.capture.asr_chunk_bytes
            )));
        }
        if self.capture.resample == ResampleMode::Downsample24kTo8k {
            return Err(ConfigError::Invalid("capture audio cannot be downsampled".into()));
        }
        if self.playback.resample == ResampleMode::Upsample8kTo16k {
            return Err(ConfigError::Invalid("playback audio cannot be upsampled".into()));
        }
        if self.playback.safe_chunk_bytes == 0 || self.playback.safe_chunk_bytes % 6 != 0 {
            return Err(ConfigError::Invalid(format!(
                "safe_chunk_bytes must be a positive multiple of 6, got {}",
                self.playback.safe_chunk_bytes
            )));
        }
        if self.playback.buffer_seconds == 0 || self.capture.buffer_seconds == 0 {
            return Err(ConfigError::Invalid("buffer lengths must be non-zero".into()));
        }
        Ok(())
    }

    /// VAD settings with the session's speech-complete timeout applied
    pub fn effective_vad(&self) -> VadConfig {
        VadConfig {
            min_silence_ms: self.timeouts.effective_min_silence_ms(self.vad.min_silence_ms),
            ..self.vad.clone()
        }
    }
}
