//! Recognition-side capture pipeline
//!
//! Decoded call audio is buffered, run through the VAD, and forwarded to the
//! recogniser only while an utterance is open. A pre-roll of already buffered
//! audio is replayed when speech starts so the recogniser hears the onset.
//!
//! `CapturePipeline` is a synchronous state machine. `CaptureHandle` gives it a
//! dedicated thread fed by a single-consumer queue, which also carries the
//! completion of asynchronous recogniser connects back into the machine.

use crate::backend::{AsrClient, AsrError};
use crate::resample::{ResampleMode, Upsampler};
use crate::ring_buffer::{AudioRingBuffer, OverflowPolicy};
use crate::session::SessionError;
use crate::vad::{ModelFactory, VadConfig, VadDetector, VadEvent};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, span, warn, Level};

/// How captured audio is gated towards the recogniser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// One recogniser stream per VAD-detected utterance
    #[default]
    Dictation,

    /// Stream everything from the first packet until close, no VAD gating
    Transliterate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Length of the main replay buffer
    pub buffer_seconds: u32,

    /// Audio replayed from before the detected speech start
    pub pre_roll_ms: u32,

    /// Bytes per recogniser send
    pub asr_chunk_bytes: usize,

    /// VAD frames the small VAD buffer can hold before overwriting
    pub vad_ring_frames: usize,

    /// Give up on a recogniser connect after this long
    pub connect_timeout_ms: u64,

    pub resample: ResampleMode,
    pub mode: RecognitionMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 3,
            pre_roll_ms: 500,
            asr_chunk_bytes: 2048,
            vad_ring_frames: 4,
            connect_timeout_ms: 5000,
            resample: ResampleMode::None,
            mode: RecognitionMode::Dictation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications from the capture pipeline, in occurrence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    SpeechStarted { sample: u64 },
    SpeechEnded { sample: u64 },

    /// The recogniser could not be reached or rejected audio; the utterance is lost
    UtteranceDropped { reason: String },
}

/// Work items for the capture thread
#[derive(Debug)]
pub enum CaptureInput {
    Audio(Vec<u8>),
    ConnectFinished { attempt: u64, result: Result<(), AsrError> },
    Close,
}

pub struct CapturePipeline {
    channel: String,
    config: CaptureConfig,

    /// Authoritative replay source for the recogniser
    main: AudioRingBuffer,
    /// Holds a few VAD frames so detection never runs ahead of arrival
    vad_ring: AudioRingBuffer,
    vad: VadDetector,
    upsampler: Option<Upsampler>,

    asr: Arc<dyn AsrClient>,
    events: UnboundedSender<CaptureEvent>,
    inbox: UnboundedSender<CaptureInput>,
    runtime: Handle,

    state: ConnectionState,
    pending_flush_on_connect: bool,
    speaking: bool,
    attempt: u64,
    closed: bool,
}

impl CapturePipeline {
    pub fn new(
        channel: String,
        config: CaptureConfig,
        vad: VadDetector,
        asr: Arc<dyn AsrClient>,
        events: UnboundedSender<CaptureEvent>,
        inbox: UnboundedSender<CaptureInput>,
        runtime: Handle,
    ) -> Self {
        let input_rate = vad.config().sample_rate;
        let output_rate = config.resample.output_rate(input_rate);
        let vad_ring_bytes = vad.config().frame_bytes() * config.vad_ring_frames.max(1);

        info!(
            "🎙️ Capture pipeline for {} ({:?}, {}Hz in, {}Hz to recogniser, {}ms pre-roll)",
            channel, config.mode, input_rate, output_rate, config.pre_roll_ms
        );

        Self {
            main: AudioRingBuffer::new(output_rate, config.buffer_seconds, OverflowPolicy::FixedOverwrite),
            vad_ring: AudioRingBuffer::with_capacity(input_rate, vad_ring_bytes, OverflowPolicy::FixedOverwrite),
            upsampler: (config.resample == ResampleMode::Upsample8kTo16k).then(Upsampler::new),
            channel,
            config,
            vad,
            asr,
            events,
            inbox,
            runtime,
            state: ConnectionState::Disconnected,
            pending_flush_on_connect: false,
            speaking: false,
            attempt: 0,
            closed: false,
        }
    }

    /// Process one work item. Returns false once the pipeline is closed.
    pub fn handle(&mut self, input: CaptureInput) -> bool {
        match input {
            CaptureInput::Audio(pcm) => self.on_audio(&pcm),
            CaptureInput::ConnectFinished { attempt, result } => self.on_connect_finished(attempt, result),
            CaptureInput::Close => self.close(),
        }
        !self.closed
    }

    fn on_audio(&mut self, pcm: &[u8]) {
        let _span = span!(Level::DEBUG, "capture.on_audio", bytes = pcm.len()).entered();

        if self.closed {
            return;
        }
        if pcm.is_empty() || pcm.len() % 2 != 0 {
            warn!("Discarding malformed audio chunk of {} bytes on {}", pcm.len(), self.channel);
            return;
        }

        match self.upsampler.as_mut() {
            Some(upsampler) => {
                let upsampled = upsampler.process(pcm);
                self.main.write(&upsampled);
            }
            None => {
                self.main.write(pcm);
            }
        }

        if self.config.mode == RecognitionMode::Transliterate {
            match self.state {
                ConnectionState::Disconnected => self.begin_connect(),
                ConnectionState::Connected => self.drain_chunks(),
                ConnectionState::Connecting => {}
            }
            return;
        }

        self.vad_ring.write(pcm);
        let frame_bytes = self.vad.config().frame_bytes();
        if self.vad_ring.len() >= frame_bytes {
            let frame = self.vad_ring.read(frame_bytes);
            match self.vad.process_frame(&frame) {
                Some(VadEvent::SpeechStart { sample }) => self.on_speech_start(sample),
                Some(VadEvent::SpeechEnd { sample }) => self.on_speech_end(sample),
                None => {}
            }
        }

        if self.state == ConnectionState::Connected && self.speaking {
            self.drain_chunks();
        }
    }

    fn on_speech_start(&mut self, sample: u64) {
        self.speaking = true;
        let _ = self.events.send(CaptureEvent::SpeechStarted { sample });

        match self.state {
            ConnectionState::Disconnected => {
                let kept = self.main.move_read_pointer_back(self.config.pre_roll_ms);
                debug!("Replaying {} bytes of pre-roll on {}", kept, self.channel);
                self.begin_connect();
            }
            ConnectionState::Connecting => {
                // Speech resumed before the connection came up
                self.pending_flush_on_connect = false;
            }
            ConnectionState::Connected => {}
        }
    }

    fn on_speech_end(&mut self, sample: u64) {
        self.speaking = false;
        let _ = self.events.send(CaptureEvent::SpeechEnded { sample });

        match self.state {
            ConnectionState::Connecting => {
                debug!("Speech ended while connecting, flushing once connected");
                self.pending_flush_on_connect = true;
            }
            ConnectionState::Connected => self.flush_and_finish(),
            ConnectionState::Disconnected => {}
        }
    }

    fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.pending_flush_on_connect = false;
        self.attempt += 1;

        let attempt = self.attempt;
        let asr = self.asr.clone();
        let inbox = self.inbox.clone();
        let limit = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        info!("🔌 Opening recogniser stream for {} (attempt {})", self.channel, attempt);

        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(limit, asr.connect()).await {
                Ok(result) => result,
                Err(_) => Err(AsrError::Connect(format!("no answer within {:?}", limit))),
            };
            let _ = inbox.send(CaptureInput::ConnectFinished { attempt, result });
        });
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<(), AsrError>) {
        if self.closed || attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect result (attempt {})", attempt);
            return;
        }

        match result {
            Ok(()) => {
                info!("✅ Recogniser stream open for {}", self.channel);
                self.state = ConnectionState::Connected;
                if self.pending_flush_on_connect {
                    self.flush_and_finish();
                } else {
                    self.drain_chunks();
                }
            }
            Err(e) => {
                warn!("⚠️ Recogniser connection failed for {}: {}", self.channel, e);
                self.drop_utterance(e.to_string());
            }
        }
    }

    /// Forward whole chunks, keeping any partial remainder buffered
    fn drain_chunks(&mut self) {
        let chunk = self.config.asr_chunk_bytes.max(2);
        while self.main.len() >= chunk {
            let bytes = self.main.read(chunk);
            if let Err(e) = self.asr.send_chunk(bytes) {
                warn!("⚠️ Recogniser send failed for {}: {}", self.channel, e);
                self.drop_utterance(e.to_string());
                return;
            }
        }
    }

    /// Forward everything buffered then close the recogniser stream
    fn flush_and_finish(&mut self) {
        self.drain_chunks();
        if self.state != ConnectionState::Connected {
            return;
        }

        let rest = self.main.read_all();
        if !rest.is_empty() {
            if let Err(e) = self.asr.send_chunk(rest) {
                warn!("⚠️ Recogniser send failed for {}: {}", self.channel, e);
                self.drop_utterance(e.to_string());
                return;
            }
        }
        if let Err(e) = self.asr.send_end_of_stream() {
            warn!("⚠️ Recogniser end-of-stream failed for {}: {}", self.channel, e);
        }

        info!("📤 Utterance complete on {}", self.channel);
        self.state = ConnectionState::Disconnected;
        self.pending_flush_on_connect = false;
    }

    fn drop_utterance(&mut self, reason: String) {
        self.main.clear();
        self.state = ConnectionState::Disconnected;
        self.pending_flush_on_connect = false;
        let _ = self.events.send(CaptureEvent::UtteranceDropped { reason });
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.state == ConnectionState::Connected {
            self.flush_and_finish();
        }
        self.main.close();
        self.vad_ring.close();
        self.vad.reset();
        if let Some(upsampler) = self.upsampler.as_mut() {
            upsampler.reset();
        }
        self.state = ConnectionState::Disconnected;
        self.closed = true;
        info!("Capture pipeline for {} closed", self.channel);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn pending_flush_on_connect(&self) -> bool {
        self.pending_flush_on_connect
    }

    pub fn buffered_bytes(&self) -> usize {
        self.main.len()
    }
}

/// Owns the capture thread of one session
pub struct CaptureHandle {
    tx: UnboundedSender<CaptureInput>,
    closed: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl CaptureHandle {
    /// Start the capture thread. The speech model is built on that thread.
    pub async fn spawn(
        channel: &str,
        config: CaptureConfig,
        vad_config: VadConfig,
        model_factory: ModelFactory,
        asr: Arc<dyn AsrClient>,
        events: UnboundedSender<CaptureEvent>,
    ) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;
        vad_config.validate()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<CaptureInput>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let inbox = tx.clone();
        let name = channel.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("capture-{}", channel))
            .spawn(move || {
                let detector = match model_factory().and_then(|model| VadDetector::new(vad_config, model)) {
                    Ok(detector) => {
                        let _ = ready_tx.send(Ok(()));
                        detector
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut pipeline = CapturePipeline::new(name, config, detector, asr, events, inbox, runtime);
                while let Some(input) = rx.blocking_recv() {
                    if !pipeline.handle(input) {
                        break;
                    }
                }
                pipeline.close();
            })?;

        ready_rx
            .await
            .map_err(|_| SessionError::Runtime("capture thread exited during setup".into()))??;

        Ok(Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            _thread: thread,
        })
    }

    /// Queue decoded PCM. Returns false once the pipeline is closed.
    pub fn push_audio(&self, pcm: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(CaptureInput::Audio(pcm)).is_ok()
    }

    /// Safe to call from any thread, any number of times
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(CaptureInput::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}
