//! Voice activity detection
//!
//! Turns fixed-size PCM frames into `SpeechStart` / `SpeechEnd` events. A
//! speech-probability model is combined with an adaptive energy gate so that
//! steady hum or hiss the model misclassifies does not open an utterance.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, span, trace, warn, Level};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Error type for voice activity detection
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, VadError>;

/// Configuration for the VAD detector
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Sample rate of the frames fed to the detector
    pub sample_rate: u32,

    /// Samples per frame handed to the model
    pub frame_samples: usize,

    /// Probability at or above which speech may start
    pub start_threshold: f32,

    /// Probability below which silence is counted
    pub end_threshold: f32,

    /// Continuous silence required to end an utterance
    pub min_silence_ms: u32,

    /// Padding applied to reported start and end positions
    pub speech_pad_ms: u32,

    /// Energy gate = multiplier x running average frame energy
    pub energy_multiplier: f32,

    /// WebRTC aggressiveness, 0 (quality) to 3 (very aggressive)
    pub webrtc_mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            frame_samples: 1024,     // 128ms at 8kHz
            start_threshold: 0.4,
            end_threshold: 0.8,
            min_silence_ms: 300,
            speech_pad_ms: 500,
            energy_multiplier: 2.0,
            webrtc_mode: 3,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VadError::Config(format!(
                "sample rate must be 8000, 16000, 32000 or 48000 Hz, got {}",
                self.sample_rate
            )));
        }
        if self.frame_samples == 0 {
            return Err(VadError::Config("frame_samples must be non-zero".into()));
        }
        for (name, value) in [
            ("start_threshold", self.start_threshold),
            ("end_threshold", self.end_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(VadError::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if self.energy_multiplier < 0.0 {
            return Err(VadError::Config("energy_multiplier must not be negative".into()));
        }
        if self.webrtc_mode > 3 {
            return Err(VadError::Config(format!("webrtc_mode must be 0-3, got {}", self.webrtc_mode)));
        }
        Ok(())
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * 2
    }

    fn samples_for(&self, ms: u32) -> u64 {
        self.sample_rate as u64 * ms as u64 / 1000
    }
}

/// Speech probability model consulted once per frame
pub trait SpeechModel {
    /// Probability in [0, 1] that `frame` (normalised to [-1, 1]) holds speech
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32>;

    /// Clear any recurrent state
    fn reset(&mut self);
}

/// Builds a fresh model inside the thread that will own it
pub type ModelFactory = Arc<dyn Fn() -> Result<Box<dyn SpeechModel>> + Send + Sync>;

/// Speech boundary, positioned in samples since the last reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart { sample: u64 },
    SpeechEnd { sample: u64 },
}

/// Running frame-energy statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyStats {
    sum: f64,
    count: u64,
    min: f32,
    max: f32,
}

impl EnergyStats {
    fn update(&mut self, rms: f32) {
        if self.count == 0 {
            self.min = rms;
            self.max = rms;
        } else {
            self.min = self.min.min(rms);
            self.max = self.max.max(rms);
        }
        self.sum += rms as f64;
        self.count += 1;
    }

    pub fn average(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn frames(&self) -> u64 {
        self.count
    }
}

/// Two-signal (probability + energy) speech boundary detector
pub struct VadDetector {
    model: Box<dyn SpeechModel>,
    config: VadConfig,

    /// Inside an utterance
    triggered: bool,

    /// Start of the current run of quiet frames
    temp_end: Option<u64>,

    /// Samples processed since the last reset
    current_sample: u64,

    energy: EnergyStats,
    dynamic_threshold: f32,

    min_silence_samples: u64,
    speech_pad_samples: u64,
}

impl VadDetector {
    pub fn new(config: VadConfig, model: Box<dyn SpeechModel>) -> Result<Self> {
        config.validate()?;
        debug!(
            "VAD detector ready ({}Hz, {} samples/frame, start {}, end {}, silence {}ms)",
            config.sample_rate,
            config.frame_samples,
            config.start_threshold,
            config.end_threshold,
            config.min_silence_ms
        );

        Ok(Self {
            min_silence_samples: config.samples_for(config.min_silence_ms),
            speech_pad_samples: config.samples_for(config.speech_pad_ms),
            model,
            config,
            triggered: false,
            temp_end: None,
            current_sample: 0,
            energy: EnergyStats::default(),
            dynamic_threshold: 0.0,
        })
    }

    /// Feed one frame of little-endian 16-bit PCM
    pub fn process_frame(&mut self, pcm: &[u8]) -> Option<VadEvent> {
        let _span = span!(Level::TRACE, "vad.process_frame").entered();

        if pcm.len() < 2 || pcm.len() % 2 != 0 {
            warn!("Discarding malformed VAD frame of {} bytes", pcm.len());
            return None;
        }
        if pcm.len() != self.config.frame_bytes() {
            trace!(
                "VAD frame of {} bytes, expected {}",
                pcm.len(),
                self.config.frame_bytes()
            );
        }

        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32767.0)
            .collect();

        let rms = rms_energy(&samples);
        self.energy.update(rms);
        self.dynamic_threshold = self.config.energy_multiplier * self.energy.average();

        let frame_start = self.current_sample;
        self.current_sample += samples.len() as u64;

        let probability = match self.model.speech_probability(&samples) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                warn!("Speech model failed on frame at sample {}: {}", frame_start, e);
                return None;
            }
        };

        trace!(
            "frame @{} prob={:.2} rms={:.4} threshold={:.4}",
            frame_start,
            probability,
            rms,
            self.dynamic_threshold
        );

        if probability >= self.config.start_threshold && self.temp_end.is_some() {
            trace!("Speech resumed, cancelling pending end");
            self.temp_end = None;
        }

        if probability >= self.config.start_threshold && !self.triggered {
            if rms >= self.dynamic_threshold {
                self.triggered = true;
                let sample = self.current_sample.saturating_sub(self.speech_pad_samples);
                debug!("🗣️ Speech start at sample {} (rms {:.4})", sample, rms);
                return Some(VadEvent::SpeechStart { sample });
            }
            trace!(
                "Probability {:.2} passed but energy {:.4} below {:.4}, treating as noise",
                probability,
                rms,
                self.dynamic_threshold
            );
            return None;
        }

        if probability < self.config.end_threshold && self.triggered {
            let silence_start = *self.temp_end.get_or_insert(frame_start);
            if self.current_sample - silence_start >= self.min_silence_samples {
                let sample = silence_start + self.speech_pad_samples;
                self.temp_end = None;
                self.triggered = false;
                debug!("🤫 Speech end at sample {}", sample);
                return Some(VadEvent::SpeechEnd { sample });
            }
        }

        None
    }

    /// Zero every counter and clear the model's recurrent state
    pub fn reset(&mut self) {
        self.model.reset();
        self.triggered = false;
        self.temp_end = None;
        self.current_sample = 0;
        self.energy = EnergyStats::default();
        self.dynamic_threshold = 0.0;
    }

    pub fn is_speaking(&self) -> bool {
        self.triggered
    }

    pub fn current_sample(&self) -> u64 {
        self.current_sample
    }

    pub fn dynamic_threshold(&self) -> f32 {
        self.dynamic_threshold
    }

    pub fn energy_stats(&self) -> EnergyStats {
        self.energy
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

/// Root-mean-square energy of normalised samples
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// WebRTC VAD reporting the voiced fraction of 20ms sub-frames as a probability
pub struct WebRtcModel {
    vad: Vad,
    sample_rate: u32,
    mode: u8,
    sub_frame: usize,
}

impl WebRtcModel {
    pub fn new(sample_rate: u32, mode: u8) -> Result<Self> {
        let vad = Vad::new_with_rate_and_mode(webrtc_rate(sample_rate)?, webrtc_mode(mode)?);
        Ok(Self {
            vad,
            sample_rate,
            mode,
            sub_frame: sample_rate as usize / 50,
        })
    }

    /// Factory building a WebRTC model per capture thread
    pub fn factory(config: &VadConfig) -> ModelFactory {
        let sample_rate = config.sample_rate;
        let mode = config.webrtc_mode;
        Arc::new(move || {
            let model: Box<dyn SpeechModel> = Box::new(WebRtcModel::new(sample_rate, mode)?);
            Ok(model)
        })
    }
}

impl SpeechModel for WebRtcModel {
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32> {
        let pcm: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        let mut voiced = 0usize;
        let mut total = 0usize;
        for chunk in pcm.chunks_exact(self.sub_frame) {
            let is_voiced = self
                .vad
                .is_voice_segment(chunk)
                .map_err(|e| VadError::Model(format!("WebRTC VAD rejected frame: {:?}", e)))?;
            if is_voiced {
                voiced += 1;
            }
            total += 1;
        }

        if total == 0 {
            return Ok(0.0);
        }
        Ok(voiced as f32 / total as f32)
    }

    fn reset(&mut self) {
        // WebRTC VAD has no reset call, so rebuild it
        if let (Ok(rate), Ok(mode)) = (webrtc_rate(self.sample_rate), webrtc_mode(self.mode)) {
            self.vad = Vad::new_with_rate_and_mode(rate, mode);
        }
    }
}

fn webrtc_rate(sample_rate: u32) -> Result<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VadError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

fn webrtc_mode(mode: u8) -> Result<VadMode> {
    match mode {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        other => Err(VadError::Config(format!("VAD mode must be 0-3, got {}", other))),
    }
}
