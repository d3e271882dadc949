//! Recognition and synthesis backends
//!
//! The pipelines depend only on the `AsrClient` and `TtsEngine` capabilities.
//! Concrete backends are picked by `BackendFactory` from the session config.

pub mod prompt_tts;
pub mod ws_asr;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

pub use prompt_tts::{PromptTts, ToneTts};
pub use ws_asr::WebSocketAsr;

/// Error type for recognition backends
#[derive(Debug, thiserror::Error)]
pub enum AsrError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

/// Error type for synthesis backends
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio format error: {0}")]
    Format(#[from] hound::Error),
}

/// Output of a recognition backend
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Partial(String),
    Final(String),
    Error(String),
}

/// Streaming speech recogniser.
///
/// `send_chunk` and `send_end_of_stream` only enqueue and never block, so
/// they are safe to call from the real-time capture thread. Results arrive
/// on the `RecognitionEvent` channel the client was built with.
pub trait AsrClient: Send + Sync {
    /// Open a fresh stream for the next utterance
    fn connect(&self) -> BoxFuture<'_, Result<(), AsrError>>;

    fn send_chunk(&self, pcm: Vec<u8>) -> Result<(), AsrError>;

    fn send_end_of_stream(&self) -> Result<(), AsrError>;
}

/// Text to speech producing an incremental stream of 16-bit PCM
pub trait TtsEngine: Send + Sync {
    fn synthesize(&self, text: &str) -> BoxStream<'static, Result<Vec<u8>, TtsError>>;

    /// Sample rate of the PCM produced by `synthesize`
    fn sample_rate(&self) -> u32;
}

/// Selects the recognition backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AsrBackend {
    /// Streaming JSON recogniser reached over a WebSocket
    WebSocket { url: String },

    /// Accept and drop audio; useful for loopback testing
    #[default]
    Discard,
}

/// Selects the synthesis backend
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TtsBackend {
    /// Play `<dir>/<text>.wav` prompt files recorded at `sample_rate`
    Prompt {
        dir: PathBuf,
        #[serde(default = "default_rate")]
        sample_rate: u32,
    },

    /// A fixed test tone whose length follows the text length
    Tone {
        #[serde(default = "default_rate")]
        sample_rate: u32,
    },
}

fn default_rate() -> u32 {
    8000
}

impl Default for TtsBackend {
    fn default() -> Self {
        TtsBackend::Tone {
            sample_rate: default_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub asr: AsrBackend,
    pub tts: TtsBackend,
}

/// Builds backend instances for new sessions
#[derive(Debug, Clone)]
pub struct BackendFactory {
    config: BackendConfig,
}

impl BackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Recogniser for one session, reporting results on `results`
    pub fn asr(&self, sample_rate: u32, results: UnboundedSender<RecognitionEvent>) -> Arc<dyn AsrClient> {
        match &self.config.asr {
            AsrBackend::WebSocket { url } => {
                info!("Using WebSocket ASR backend at {}", url);
                Arc::new(WebSocketAsr::new(url.clone(), sample_rate, results))
            }
            AsrBackend::Discard => {
                info!("Using discarding ASR backend");
                Arc::new(DiscardAsr)
            }
        }
    }

    pub fn tts(&self) -> Arc<dyn TtsEngine> {
        match &self.config.tts {
            TtsBackend::Prompt { dir, sample_rate } => {
                info!("Using prompt TTS backend from {} at {}Hz", dir.display(), sample_rate);
                Arc::new(PromptTts::with_sample_rate(dir.clone(), *sample_rate))
            }
            TtsBackend::Tone { sample_rate } => {
                info!("Using tone TTS backend at {}Hz", sample_rate);
                Arc::new(ToneTts::new(*sample_rate))
            }
        }
    }
}

/// Recogniser that accepts everything and never produces results
#[derive(Debug, Default)]
pub struct DiscardAsr;

impl AsrClient for DiscardAsr {
    fn connect(&self) -> BoxFuture<'_, Result<(), AsrError>> {
        Box::pin(async { Ok(()) })
    }

    fn send_chunk(&self, pcm: Vec<u8>) -> Result<(), AsrError> {
        debug!("Discarding {} bytes of recognition audio", pcm.len());
        Ok(())
    }

    fn send_end_of_stream(&self) -> Result<(), AsrError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_backend_config_from_json() {
        let config: BackendConfig = serde_json::from_str(
            r#"{"asr": {"type": "web_socket", "url": "ws://localhost:9000"}, "tts": {"type": "prompt", "dir": "/tmp/prompts"}}"#,
        )
        .unwrap();
        assert!(matches!(config.asr, AsrBackend::WebSocket { ref url } if url == "ws://localhost:9000"));
        assert!(matches!(config.tts, TtsBackend::Prompt { sample_rate: 8000, .. }));
    }

    #[test]
    fn test_prompt_rate_reaches_engine() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"tts": {"type": "prompt", "dir": "/tmp/prompts", "sample_rate": 24000}}"#)
                .unwrap();
        assert!(matches!(config.tts, TtsBackend::Prompt { sample_rate: 24000, .. }));
        assert_eq!(BackendFactory::new(config).tts().sample_rate(), 24000);
    }

    #[test]
    fn test_backend_config_defaults() {
        let config: BackendConfig = serde_json::from_str("{}").unwrap();
        assert!(matches!(config.asr, AsrBackend::Discard));
        assert!(matches!(config.tts, TtsBackend::Tone { sample_rate: 8000 }));
    }

    #[tokio::test]
    async fn test_factory_builds_default_backends() {
        let factory = BackendFactory::new(BackendConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let asr = factory.asr(8000, tx);
        asr.connect().await.unwrap();
        asr.send_chunk(vec![0; 320]).unwrap();
        asr.send_end_of_stream().unwrap();

        let tts = factory.tts();
        assert_eq!(tts.sample_rate(), 8000);
        let chunks: Vec<_> = tts.synthesize("hello").collect().await;
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.is_ok()));
    }
}
