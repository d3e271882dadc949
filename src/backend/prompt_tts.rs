//! Offline synthesis backends: recorded prompts and a test tone

use super::{TtsEngine, TtsError};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bytes handed to the playback pipeline per stream item
const CHUNK_BYTES: usize = 3200;

/// Streams `<dir>/<text>.wav` as 16-bit mono PCM.
///
/// The sample rate reported is that of the most common prompt format; each
/// file is checked against it when opened.
pub struct PromptTts {
    dir: PathBuf,
    sample_rate: u32,
}

impl PromptTts {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            sample_rate: 8000,
        }
    }

    pub fn with_sample_rate(dir: PathBuf, sample_rate: u32) -> Self {
        Self { dir, sample_rate }
    }

    /// Prompt names map to file names; anything that could escape `dir` is rejected
    fn prompt_path(&self, text: &str) -> Result<PathBuf, TtsError> {
        let name = text.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(TtsError::Synthesis(format!("invalid prompt name {:?}", text)));
        }
        Ok(self.dir.join(format!("{}.wav", name)))
    }
}

fn read_prompt(path: &Path, expected_rate: u32) -> Result<Vec<u8>, TtsError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(TtsError::Synthesis(format!(
            "{} must be 16-bit mono PCM, got {} channels at {} bits",
            path.display(),
            spec.channels,
            spec.bits_per_sample
        )));
    }
    if spec.sample_rate != expected_rate {
        return Err(TtsError::Synthesis(format!(
            "{} is {}Hz, expected {}Hz",
            path.display(),
            spec.sample_rate,
            expected_rate
        )));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    Ok(pcm)
}

impl TtsEngine for PromptTts {
    fn synthesize(&self, text: &str) -> BoxStream<'static, Result<Vec<u8>, TtsError>> {
        let pcm = self
            .prompt_path(text)
            .and_then(|path| {
                debug!("Loading prompt {}", path.display());
                read_prompt(&path, self.sample_rate)
            });

        match pcm {
            Ok(pcm) => {
                let chunks: Vec<_> = pcm.chunks(CHUNK_BYTES).map(|c| Ok(c.to_vec())).collect();
                stream::iter(chunks).boxed()
            }
            Err(e) => {
                warn!("Prompt synthesis failed for {:?}: {}", text, e);
                stream::once(async move { Err(e) }).boxed()
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// 440Hz tone lasting 60ms per character of input
pub struct ToneTts {
    sample_rate: u32,
}

impl ToneTts {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl TtsEngine for ToneTts {
    fn synthesize(&self, text: &str) -> BoxStream<'static, Result<Vec<u8>, TtsError>> {
        let samples = text.chars().count() * self.sample_rate as usize * 60 / 1000;
        let rate = self.sample_rate as f32;

        let mut pcm = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let t = i as f32 / rate;
            let s = (8000.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16;
            pcm.extend_from_slice(&s.to_le_bytes());
        }

        let chunks: Vec<_> = pcm.chunks(CHUNK_BYTES).map(|c| Ok(c.to_vec())).collect();
        stream::iter(chunks).boxed()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
