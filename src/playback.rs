//! Synthesis-side playback pipeline
//!
//! Raw synthesis PCM flows through two workers connected by channels:
//!
//! ```text
//! feed ──PlaybackInput──▶ encode worker ──EncodedChunk──▶ send worker ──▶ RTP
//!                        (input ring)                     (output ring)
//! ```
//!
//! Each ring is owned by exactly one worker. End-of-speech and interruption
//! travel as typed markers pinned to byte offsets beside the audio, so no
//! byte pattern in the audio itself can be mistaken for a control signal.

use crate::backend::TtsEngine;
use crate::codec::Codec;
use crate::resample::{downsample, ResampleMode};
use crate::ring_buffer::{pcm_bytes_for, AudioRingBuffer, OverflowPolicy};
use crate::rtp::{InterruptHandle, RtpTransmitter};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Initial length of each auto-expanding buffer
    pub buffer_seconds: u32,

    /// Bytes of raw PCM encoded at once; a multiple of every resample ratio
    pub safe_chunk_bytes: usize,

    /// Idle wait of the workers between checks of the stop flag
    pub poll_interval_ms: u64,

    /// Frames handed to the transmitter per send
    pub max_send_frames: usize,

    /// Keep the RTP stream alive with silence frames while nothing plays
    pub send_silence_when_idle: bool,

    pub resample: ResampleMode,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 30,
            safe_chunk_bytes: 3000,
            poll_interval_ms: 20,
            max_send_frames: 10,
            send_silence_when_idle: true,
            resample: ResampleMode::None,
        }
    }
}

impl PlaybackConfig {
    /// Rate of the PCM the pipeline accepts
    pub fn input_rate(&self, codec_rate: u32) -> u32 {
        match self.resample {
            ResampleMode::Downsample24kTo8k => codec_rate * 3,
            _ => codec_rate,
        }
    }
}

/// Control signal carried beside the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMarker {
    EndOfSpeech,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Everything of the current request has been sent
    Completed,
    Interrupted,
}

/// A ring buffer with markers pinned to absolute byte offsets
struct MarkedRing {
    ring: AudioRingBuffer,
    /// Total bytes ever written since the last clear
    written: u64,
    markers: VecDeque<(u64, StreamMarker)>,
}

impl MarkedRing {
    fn new(ring: AudioRingBuffer) -> Self {
        Self {
            ring,
            written: 0,
            markers: VecDeque::new(),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.ring.write(bytes);
        self.written += bytes.len() as u64;
    }

    /// Pin a marker after everything written so far
    fn mark(&mut self, marker: StreamMarker) {
        self.markers.push_back((self.written, marker));
    }

    fn consumed(&self) -> u64 {
        self.written - self.ring.len() as u64
    }

    /// Bytes that can be read before reaching the next marker
    fn readable(&self) -> usize {
        match self.markers.front() {
            Some(&(offset, _)) => offset.saturating_sub(self.consumed()) as usize,
            None => self.ring.len(),
        }
    }

    fn has_marker(&self) -> bool {
        !self.markers.is_empty()
    }

    fn read(&mut self, n: usize) -> Vec<u8> {
        self.ring.read(n.min(self.readable()))
    }

    /// Pop the next marker once every byte before it has been read
    fn take_marker(&mut self) -> Option<StreamMarker> {
        match self.markers.front() {
            Some(&(offset, marker)) if offset <= self.consumed() => {
                self.markers.pop_front();
                Some(marker)
            }
            _ => None,
        }
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.markers.clear();
        self.written = 0;
    }

    fn is_idle(&self) -> bool {
        self.ring.is_empty() && self.markers.is_empty()
    }
}

/// Flags shared between the pipeline handle and its workers
#[derive(Debug, Default)]
struct PlaybackControl {
    generation: AtomicU64,
    /// Generation handed to the latest request
    request: AtomicU64,
    interrupt_pending: AtomicBool,
    stopped: AtomicBool,
}

impl PlaybackControl {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn request(&self) -> u64 {
        self.request.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
enum PlaybackInput {
    Audio { generation: u64, pcm: Vec<u8> },
    End { generation: u64 },
}

impl PlaybackInput {
    fn generation(&self) -> u64 {
        match self {
            PlaybackInput::Audio { generation, .. } | PlaybackInput::End { generation } => *generation,
        }
    }
}

#[derive(Debug)]
struct EncodedChunk {
    generation: u64,
    bytes: Vec<u8>,
    marker: Option<StreamMarker>,
}

/// Producer side of one synthesis request
#[derive(Clone)]
pub struct SynthesisFeed {
    generation: u64,
    control: Arc<PlaybackControl>,
    tx: UnboundedSender<PlaybackInput>,
}

impl SynthesisFeed {
    /// False once a newer request or an interrupt has superseded this one
    pub fn is_current(&self) -> bool {
        !self.control.stopped() && self.control.generation() == self.generation
    }

    /// Queue raw PCM. Returns false if the request is stale and the audio was dropped.
    pub fn push(&self, pcm: Vec<u8>) -> bool {
        if !self.is_current() {
            return false;
        }
        self.tx
            .send(PlaybackInput::Audio {
                generation: self.generation,
                pcm,
            })
            .is_ok()
    }

    /// Mark the end of this request's audio
    pub fn finish(self) -> bool {
        if !self.is_current() {
            return false;
        }
        self.tx
            .send(PlaybackInput::End {
                generation: self.generation,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Cloneable handle that can interrupt playback from any thread
#[derive(Clone)]
pub struct PlaybackInterrupter {
    control: Arc<PlaybackControl>,
    transmitter_interrupt: InterruptHandle,
}

impl PlaybackInterrupter {
    /// Stop the in-flight frame, then supersede the current request
    pub fn interrupt(&self) {
        self.transmitter_interrupt.interrupt();
        self.control.interrupt_pending.store(true, Ordering::Release);
        let generation = self.control.bump();
        debug!("Interrupt requested, generation now {}", generation);
    }
}

pub struct PlaybackPipeline {
    control: Arc<PlaybackControl>,
    input_tx: UnboundedSender<PlaybackInput>,
    transmitter_interrupt: InterruptHandle,
    input_rate: u32,
    encode_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl PlaybackPipeline {
    /// Spawn the encode and send workers on the current runtime
    pub fn start(config: PlaybackConfig, transmitter: RtpTransmitter, events: UnboundedSender<PlaybackEvent>) -> Self {
        let codec = transmitter.codec();
        let codec_rate = codec.clock_rate();
        let input_rate = config.input_rate(codec_rate);
        let control = Arc::new(PlaybackControl::default());
        let transmitter_interrupt = transmitter.interrupt_handle();
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (encoded_tx, encoded_rx) = mpsc::unbounded_channel();

        info!(
            "🔊 Playback pipeline ({}, {}Hz in, resample {:?})",
            codec.name(),
            input_rate,
            config.resample
        );

        let encoder = EncodeWorker {
            control: control.clone(),
            rx: input_rx,
            out: encoded_tx,
            input: MarkedRing::new(AudioRingBuffer::new(input_rate, config.buffer_seconds, OverflowPolicy::AutoExpand)),
            generation: 0,
            codec,
            resample: config.resample,
            safe_chunk: config.safe_chunk_bytes.max(6),
            poll,
        };

        let sender = SendWorker {
            control: control.clone(),
            rx: encoded_rx,
            output: MarkedRing::new(AudioRingBuffer::with_capacity(
                codec_rate,
                codec_rate as usize * config.buffer_seconds as usize,
                OverflowPolicy::AutoExpand,
            )),
            generation: 0,
            active: false,
            reported: None,
            silence: vec![codec.silence_byte(); transmitter.frame_bytes()],
            transmitter,
            events,
            max_send_frames: config.max_send_frames.max(1),
            send_silence_when_idle: config.send_silence_when_idle,
            poll,
        };

        Self {
            encode_task: tokio::spawn(encoder.run()),
            send_task: tokio::spawn(sender.run()),
            control,
            input_tx,
            transmitter_interrupt,
            input_rate,
        }
    }

    /// Start a new request, superseding any previous one
    pub fn begin(&self) -> SynthesisFeed {
        let generation = self.control.bump();
        self.control.request.store(generation, Ordering::Release);
        debug!("Playback request generation {}", generation);
        SynthesisFeed {
            generation,
            control: self.control.clone(),
            tx: self.input_tx.clone(),
        }
    }

    /// Stream `text` from `tts` into a new request
    pub fn speak(&self, tts: Arc<dyn TtsEngine>, text: String) -> JoinHandle<()> {
        if tts.sample_rate() != self.input_rate {
            warn!(
                "Synthesis rate {}Hz does not match playback input rate {}Hz",
                tts.sample_rate(),
                self.input_rate
            );
        }

        let feed = self.begin();
        tokio::spawn(async move {
            info!("🗨️ Speaking {:?}", text);
            let mut stream = tts.synthesize(&text);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(pcm) => {
                        if !feed.push(pcm) {
                            debug!("Synthesis of generation {} superseded", feed.generation());
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("⚠️ Synthesis failed: {}", e);
                        break;
                    }
                }
            }
            feed.finish();
        })
    }

    /// Play a pause; `Completed` fires once it has been sent
    pub fn play_silence(&self, duration_ms: u32) {
        let feed = self.begin();
        let bytes = pcm_bytes_for(self.input_rate, duration_ms as u64);
        debug!("Queueing {}ms of silence ({} bytes)", duration_ms, bytes);
        feed.push(vec![0; bytes]);
        feed.finish();
    }

    /// Cut off the current request. Safe to call from any thread.
    pub fn interrupt(&self) {
        self.interrupter().interrupt();
    }

    pub fn interrupter(&self) -> PlaybackInterrupter {
        PlaybackInterrupter {
            control: self.control.clone(),
            transmitter_interrupt: self.transmitter_interrupt.clone(),
        }
    }

    /// Stop both workers within one poll interval
    pub fn stop(&self) {
        if !self.control.stopped.swap(true, Ordering::AcqRel) {
            self.transmitter_interrupt.interrupt();
            info!("Playback pipeline stopping");
        }
    }

    pub fn generation(&self) -> u64 {
        self.control.generation()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn is_finished(&self) -> bool {
        self.encode_task.is_finished() && self.send_task.is_finished()
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EncodeWorker {
    control: Arc<PlaybackControl>,
    rx: UnboundedReceiver<PlaybackInput>,
    out: UnboundedSender<EncodedChunk>,
    input: MarkedRing,
    generation: u64,
    codec: Codec,
    resample: ResampleMode,
    safe_chunk: usize,
    poll: Duration,
}

impl EncodeWorker {
    async fn run(mut self) {
        while !self.control.stopped() {
            self.observe_generation(self.control.generation());

            if let Some(chunk) = self.next_chunk() {
                if self.out.send(chunk).is_err() {
                    break;
                }
                continue;
            }

            match timeout(self.poll, self.rx.recv()).await {
                Ok(Some(input)) => self.accept(input),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        debug!("Playback encode worker stopped");
    }

    fn observe_generation(&mut self, generation: u64) {
        if generation > self.generation {
            if !self.input.is_idle() {
                debug!("Dropping queued synthesis of generation {}", self.generation);
            }
            self.input.clear();
            self.generation = generation;
        }
    }

    fn accept(&mut self, input: PlaybackInput) {
        let generation = input.generation();
        if generation != self.control.generation() {
            trace!("Dropping stale synthesis input of generation {}", generation);
            return;
        }
        self.observe_generation(generation);

        match input {
            PlaybackInput::Audio { pcm, .. } => self.input.write(&pcm),
            PlaybackInput::End { .. } => self.input.mark(StreamMarker::EndOfSpeech),
        }
    }

    /// A whole safe chunk, or everything up to a pending marker
    fn next_chunk(&mut self) -> Option<EncodedChunk> {
        let readable = self.input.readable();
        let (raw, marker) = if readable >= self.safe_chunk {
            (self.input.read(self.safe_chunk), None)
        } else if self.input.has_marker() {
            let raw = self.input.read(readable);
            (raw, self.input.take_marker())
        } else {
            return None;
        };

        let pcm = match self.resample {
            ResampleMode::Downsample24kTo8k => downsample(&raw, 3),
            _ => raw,
        };
        Some(EncodedChunk {
            generation: self.generation,
            bytes: self.codec.encode(&pcm),
            marker,
        })
    }
}

struct SendWorker {
    control: Arc<PlaybackControl>,
    rx: UnboundedReceiver<EncodedChunk>,
    output: MarkedRing,
    generation: u64,
    /// Audio of the current request has gone out and no marker has closed it
    active: bool,
    /// Request whose interruption was last reported
    reported: Option<u64>,
    silence: Vec<u8>,
    transmitter: RtpTransmitter,
    events: UnboundedSender<PlaybackEvent>,
    max_send_frames: usize,
    send_silence_when_idle: bool,
    poll: Duration,
}

impl SendWorker {
    async fn run(mut self) {
        while !self.control.stopped() {
            let interrupted = self.control.interrupt_pending.swap(false, Ordering::AcqRel);
            let previous = self.generation;
            let superseded = self.observe_generation(self.control.generation());
            let request = self.control.request();
            if interrupted {
                self.output.clear();
                self.transmitter.clear_interrupt();
            }

            // Repeated interrupts of one request report once
            let report = superseded || (interrupted && self.reported != Some(request));
            if interrupted || (superseded && request == previous) {
                self.reported = Some(request);
            }
            if report {
                self.output.mark(StreamMarker::Interrupted);
            }

            let mut disconnected = false;
            loop {
                match self.rx.try_recv() {
                    Ok(chunk) => self.accept(chunk),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }

            if let Some(marker) = self.output.take_marker() {
                self.fire(marker);
                continue;
            }

            if self.send_ready().await {
                continue;
            }

            if disconnected && self.output.is_idle() {
                break;
            }

            if self.send_silence_when_idle {
                self.transmitter.send(&self.silence).await;
            } else if let Ok(Some(chunk)) = timeout(self.poll, self.rx.recv()).await {
                self.accept(chunk);
            }
        }
        debug!("Playback send worker stopped after {} frames", self.transmitter.frames_sent());
    }

    /// Returns true if the previous request still had audio or a marker pending
    fn observe_generation(&mut self, generation: u64) -> bool {
        if generation <= self.generation {
            return false;
        }
        let in_flight = self.active || !self.output.is_idle();
        self.output.clear();
        self.generation = generation;
        self.active = false;
        in_flight
    }

    fn accept(&mut self, chunk: EncodedChunk) {
        if chunk.generation < self.generation {
            trace!("Dropping stale encoded chunk of generation {}", chunk.generation);
            return;
        }
        if self.observe_generation(chunk.generation) {
            self.output.mark(StreamMarker::Interrupted);
        }
        self.output.write(&chunk.bytes);
        if let Some(marker) = chunk.marker {
            self.output.mark(marker);
        }
    }

    /// Send whole frames; a final partial frame goes only when a marker follows it
    async fn send_ready(&mut self) -> bool {
        let frame = self.transmitter.frame_bytes();
        let readable = self.output.readable();
        let limit = frame * self.max_send_frames;

        let mut take = readable.min(limit);
        let is_final = self.output.has_marker() && take == readable;
        if !is_final {
            take -= take % frame;
        }
        if take == 0 {
            return false;
        }

        let bytes = self.output.read(take);
        self.active = true;
        self.transmitter.send(&bytes).await;
        true
    }

    fn fire(&mut self, marker: StreamMarker) {
        self.active = false;
        let event = match marker {
            StreamMarker::EndOfSpeech => {
                info!("✅ Playback completed");
                PlaybackEvent::Completed
            }
            StreamMarker::Interrupted => {
                info!("✋ Playback interrupted");
                PlaybackEvent::Interrupted
            }
        };
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{FrameTiming, RtpPacket};
    use std::time::Instant as StdInstant;
    use tokio::net::UdpSocket;

    async fn pipeline(config: PlaybackConfig) -> (PlaybackPipeline, UdpSocket, UnboundedReceiver<PlaybackEvent>) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transmitter = RtpTransmitter::connect(
            "127.0.0.1:0".parse().unwrap(),
            receiver.local_addr().unwrap(),
            Codec::Pcma,
            FrameTiming::default(),
        )
        .await
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (PlaybackPipeline::start(config, transmitter, tx), receiver, rx)
    }

    fn quiet_config() -> PlaybackConfig {
        PlaybackConfig {
            send_silence_when_idle: false,
            ..Default::default()
        }
    }

    fn ramp_pcm(samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| (((i % 200) as i16 - 100) * 50).to_le_bytes())
            .collect()
    }

    async fn next_event(rx: &mut UnboundedReceiver<PlaybackEvent>) -> PlaybackEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no playback event")
            .expect("event channel closed")
    }

    async fn drain_payloads(receiver: &UdpSocket) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1500];
        while let Ok(Ok(len)) = tokio::time::timeout(Duration::from_millis(100), receiver.recv(&mut buf)).await {
            out.push(RtpPacket::parse(&buf[..len]).unwrap().payload.to_vec());
        }
        out
    }

    #[test]
    fn test_marked_ring_offsets() {
        let mut ring = MarkedRing::new(AudioRingBuffer::with_capacity(8000, 64, OverflowPolicy::AutoExpand));
        ring.write(&[1, 2, 3, 4]);
        ring.mark(StreamMarker::EndOfSpeech);
        ring.write(&[5, 6]);

        assert_eq!(ring.readable(), 4);
        assert_eq!(ring.take_marker(), None);
        assert_eq!(ring.read(10), vec![1, 2, 3, 4]);
        assert_eq!(ring.take_marker(), Some(StreamMarker::EndOfSpeech));
        assert_eq!(ring.readable(), 2);

        ring.clear();
        assert!(ring.is_idle());
        ring.mark(StreamMarker::Interrupted);
        assert_eq!(ring.take_marker(), Some(StreamMarker::Interrupted));
    }

    #[test]
    fn test_marker_survives_audio_that_looks_like_old_sentinels() {
        let mut ring = MarkedRing::new(AudioRingBuffer::with_capacity(8000, 64, OverflowPolicy::AutoExpand));
        ring.write(&[111, 111, 112, 112]);
        assert_eq!(ring.take_marker(), None);
        assert_eq!(ring.read(4), vec![111, 111, 112, 112]);
        assert_eq!(ring.take_marker(), None);
    }

    #[tokio::test]
    async fn test_request_plays_and_completes() {
        let (playback, receiver, mut events) = pipeline(quiet_config()).await;
        let pcm = ramp_pcm(800);

        let feed = playback.begin();
        assert!(feed.push(pcm.clone()));
        assert!(feed.finish());

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Completed);
        let payloads = drain_payloads(&receiver).await;
        assert_eq!(payloads.len(), 5);
        assert_eq!(payloads.concat(), Codec::Pcma.encode(&pcm));
    }

    #[tokio::test]
    async fn test_final_partial_frame_is_sent() {
        let (playback, receiver, mut events) = pipeline(quiet_config()).await;
        let feed = playback.begin();
        feed.push(ramp_pcm(200));
        feed.finish();

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Completed);
        let payloads = drain_payloads(&receiver).await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads[1][40..].iter().all(|&b| b == Codec::Pcma.silence_byte()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_staggered_interrupts_report_once() {
        let (playback, _receiver, mut events) = pipeline(quiet_config()).await;
        let feed = playback.begin();
        feed.push(ramp_pcm(48000));
        feed.finish();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let barrier = Arc::new(std::sync::Barrier::new(4));
        let threads: Vec<_> = (0..4u64)
            .map(|i| {
                let interrupter = playback.interrupter();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    std::thread::sleep(Duration::from_millis(i * 30));
                    interrupter.interrupt();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Interrupted);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err(), "extra playback event");

        // A later request is reported again
        let feed = playback.begin();
        feed.push(ramp_pcm(48000));
        feed.finish();
        tokio::time::sleep(Duration::from_millis(100)).await;
        playback.interrupt();
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Interrupted);
    }

    #[tokio::test]
    async fn test_no_request_audio_after_interrupt() {
        let (playback, receiver, mut events) = pipeline(PlaybackConfig::default()).await;
        let silence = vec![Codec::Pcma.silence_byte(); 160];
        let feed = playback.begin();
        feed.push(ramp_pcm(16000));
        feed.finish();

        // Wait until request audio is flowing
        let mut buf = [0u8; 1500];
        loop {
            let len = tokio::time::timeout(Duration::from_secs(1), receiver.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if RtpPacket::parse(&buf[..len]).unwrap().payload != silence.as_slice() {
                break;
            }
        }

        playback.interrupt();
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Interrupted);
        playback.stop();

        // Frames already queued in the socket plus the one in flight may still be request audio;
        // once silence appears no request audio follows
        let payloads = drain_payloads(&receiver).await;
        let first_silence = payloads.iter().position(|p| *p == silence).unwrap_or(payloads.len());
        assert!(
            payloads[first_silence..].iter().all(|p| *p == silence),
            "request audio sent after silence resumed"
        );
        assert!(first_silence <= 2, "{} request frames after interrupt", first_silence);
    }

    #[tokio::test]
    async fn test_interrupt_when_idle_still_reports() {
        let (playback, _receiver, mut events) = pipeline(quiet_config()).await;
        playback.interrupt();
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Interrupted);
    }

    #[tokio::test]
    async fn test_stale_feed_is_rejected() {
        let (playback, _receiver, _events) = pipeline(quiet_config()).await;
        let first = playback.begin();
        let second = playback.begin();

        assert!(!first.is_current());
        assert!(!first.push(vec![0; 320]));
        assert!(second.push(vec![0; 320]));

        playback.interrupt();
        assert!(!second.push(vec![0; 320]));
    }

    #[tokio::test]
    async fn test_new_request_supersedes_playing_one() {
        let (playback, _receiver, mut events) = pipeline(quiet_config()).await;
        let first = playback.begin();
        first.push(ramp_pcm(16000));
        first.finish();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = playback.begin();
        second.push(ramp_pcm(320));
        second.finish();

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Interrupted);
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Completed);
    }

    #[tokio::test]
    async fn test_play_silence_completes_after_pause() {
        let (playback, receiver, mut events) = pipeline(quiet_config()).await;
        let started = StdInstant::now();
        playback.play_silence(100);

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Completed);
        assert!(started.elapsed() >= Duration::from_millis(75));

        let payloads = drain_payloads(&receiver).await;
        assert_eq!(payloads.len(), 5);
        assert!(payloads.concat().iter().all(|&b| b == 0xD5));
    }

    #[tokio::test]
    async fn test_downsampled_request() {
        let config = PlaybackConfig {
            resample: ResampleMode::Downsample24kTo8k,
            ..quiet_config()
        };
        let (playback, receiver, mut events) = pipeline(config).await;
        assert_eq!(playback.input_rate(), 24000);

        // 100ms at 24kHz
        let feed = playback.begin();
        feed.push(ramp_pcm(2400));
        feed.finish();

        assert_eq!(next_event(&mut events).await, PlaybackEvent::Completed);
        assert_eq!(drain_payloads(&receiver).await.len(), 5);
    }

    #[tokio::test]
    async fn test_idle_silence_keeps_stream_alive() {
        let (playback, receiver, _events) = pipeline(PlaybackConfig::default()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        playback.stop();

        let payloads = drain_payloads(&receiver).await;
        assert!(payloads.len() >= 5, "only {} silence frames", payloads.len());
        assert!(payloads.iter().all(|p| p.iter().all(|&b| b == 0xD5)));
    }

    #[tokio::test]
    async fn test_stop_ends_workers() {
        let (playback, _receiver, _events) = pipeline(PlaybackConfig::default()).await;
        playback.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(playback.is_finished());
    }
}
