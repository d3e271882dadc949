//! Media session wiring and the session lookup table
//!
//! A session owns one symmetric RTP socket. Inbound packets are decoded by
//! payload type and fed to the capture pipeline; the playback pipeline
//! transmits on the same socket. A router task turns pipeline, recogniser and
//! timer notifications into `SessionEvent`s.

use crate::backend::{BackendFactory, RecognitionEvent, TtsEngine};
use crate::capture::{CaptureEvent, CaptureHandle};
use crate::codec::Codec;
use crate::config::{ConfigError, SessionConfig};
use crate::events::SessionEvent;
use crate::playback::{PlaybackEvent, PlaybackInterrupter, PlaybackPipeline};
use crate::rtp::{FrameTiming, RtpError, RtpPacket, RtpTransmitter};
use crate::timeout::{TimeoutEvent, TimeoutHandle};
use crate::vad::{ModelFactory, VadError, WebRtcModel};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("RTP setup failed: {0}")]
    Rtp(#[from] RtpError),

    #[error("VAD setup failed: {0}")]
    Vad(#[from] VadError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Async runtime unavailable: {0}")]
    Runtime(String),

    #[error("Session {0} already exists")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub struct MediaSession {
    id: String,
    local_addr: SocketAddr,
    capture: Arc<CaptureHandle>,
    playback: PlaybackPipeline,
    timeouts: TimeoutHandle,
    tts: Arc<dyn TtsEngine>,
    playing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl MediaSession {
    /// Start a session using the WebRTC speech model
    pub async fn start(
        id: &str,
        config: SessionConfig,
        remote: SocketAddr,
        backends: &BackendFactory,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        let model = WebRtcModel::factory(&config.effective_vad());
        Self::start_with_model(id, config, remote, backends, model, events).await
    }

    /// Start a session with a caller-supplied speech model.
    ///
    /// Failing to open the RTP socket fails the whole setup; nothing is left running.
    pub async fn start_with_model(
        id: &str,
        config: SessionConfig,
        remote: SocketAddr,
        backends: &BackendFactory,
        model: ModelFactory,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local: SocketAddr = config
            .rtp_bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("rtp_bind {:?}: {}", config.rtp_bind, e)))?;

        let transmitter = RtpTransmitter::connect(local, remote, config.codec, FrameTiming::default()).await?;
        let socket = transmitter.socket();
        let local_addr = transmitter.local_addr()?;

        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();

        let vad = config.effective_vad();
        let asr_rate = config.capture.resample.output_rate(vad.sample_rate);
        let asr = backends.asr(asr_rate, recognition_tx);
        let tts = backends.tts();

        let capture = Arc::new(
            CaptureHandle::spawn(id, config.capture.clone(), vad, model, asr, capture_tx).await?,
        );
        let playback = PlaybackPipeline::start(config.playback.clone(), transmitter, playback_tx);
        let timeouts = TimeoutHandle::spawn(config.timeouts.clone(), timeout_tx);
        let playing = Arc::new(AtomicBool::new(false));

        let receiver = tokio::spawn(receive_loop(id.to_string(), socket, capture.clone()));
        let router = EventRouter {
            capture_rx,
            recognition_rx,
            playback_rx,
            timeout_rx,
            events,
            timeouts: timeouts.clone(),
            interrupter: playback.interrupter(),
            playing: playing.clone(),
            automatic_interruption: config.automatic_interruption,
        };
        let router = tokio::spawn(router.run());

        info!("📞 Session {} started on {} <-> {}", id, local_addr, remote);

        Ok(Arc::new(Self {
            id: id.to_string(),
            local_addr,
            capture,
            playback,
            timeouts,
            tts,
            playing,
            tasks: vec![receiver, router],
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begin listening for input; arms the no-input timer
    pub fn start_recognition(&self) {
        debug!("Session {} recognising", self.id);
        self.timeouts.start_timers();
    }

    pub fn speak(&self, text: &str) {
        self.playing.store(true, Ordering::Release);
        self.playback.speak(self.tts.clone(), text.to_string());
    }

    pub fn play_silence(&self, duration_ms: u32) {
        self.playing.store(true, Ordering::Release);
        self.playback.play_silence(duration_ms);
    }

    pub fn interrupt_playback(&self) {
        self.playback.interrupt();
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Stop every worker of the session. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.capture.close();
        self.playback.stop();
        self.timeouts.cancel_all();
        for task in &self.tasks {
            task.abort();
        }
        info!("📴 Session {} closed", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(id: String, socket: Arc<UdpSocket>, capture: Arc<CaptureHandle>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                // ICMP errors from the far end surface here on connected sockets
                debug!("RTP receive error on {}: {}", id, e);
                continue;
            }
        };

        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet on {}: {}", id, e);
                continue;
            }
        };
        let Some(codec) = Codec::from_payload_type(packet.payload_type) else {
            trace!("Ignoring payload type {} on {}", packet.payload_type, id);
            continue;
        };

        if !capture.push_audio(codec.decode(packet.payload)) {
            break;
        }
    }
    debug!("RTP receive loop for {} stopped", id);
}

struct EventRouter {
    capture_rx: UnboundedReceiver<CaptureEvent>,
    recognition_rx: UnboundedReceiver<RecognitionEvent>,
    playback_rx: UnboundedReceiver<PlaybackEvent>,
    timeout_rx: UnboundedReceiver<TimeoutEvent>,
    events: UnboundedSender<SessionEvent>,
    timeouts: TimeoutHandle,
    interrupter: PlaybackInterrupter,
    playing: Arc<AtomicBool>,
    automatic_interruption: bool,
}

impl EventRouter {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                Some(event) = self.capture_rx.recv() => self.on_capture(event),
                Some(event) = self.recognition_rx.recv() => self.on_recognition(event),
                Some(event) = self.playback_rx.recv() => {
                    self.playing.store(false, Ordering::Release);
                    Some(event.into())
                }
                Some(event) = self.timeout_rx.recv() => Some(event.into()),
                else => break,
            };

            if let Some(event) = event {
                if self.events.send(event).is_err() {
                    break;
                }
            }
        }
        debug!("Session event router stopped");
    }

    fn on_capture(&mut self, event: CaptureEvent) -> Option<SessionEvent> {
        match &event {
            CaptureEvent::SpeechStarted { .. } => {
                self.timeouts.speech_started();
                if self.automatic_interruption && self.playing.load(Ordering::Acquire) {
                    info!("🗣️ Caller barged in, interrupting playback");
                    self.timeouts.cancel_all();
                    self.interrupter.interrupt();
                }
            }
            CaptureEvent::SpeechEnded { .. } => self.timeouts.speech_ended(),
            CaptureEvent::UtteranceDropped { .. } => {}
        }
        SessionEvent::from_capture(&event)
    }

    fn on_recognition(&mut self, event: RecognitionEvent) -> Option<SessionEvent> {
        if matches!(event, RecognitionEvent::Final(_)) {
            // The next utterance gets a fresh no-input window
            self.timeouts.start_timers();
        }
        Some(event.into())
    }
}

/// Session id to session lookup shared across call-control tasks
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<MediaSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<MediaSession>) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(session.id()) {
            return Err(SessionError::Duplicate(session.id().to_string()));
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<MediaSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(id).cloned()
    }

    /// Remove and close a session
    pub fn remove(&self, id: &str) -> Option<Arc<MediaSession>> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(session) = &session {
            session.close();
        }
        session
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in drained {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::vad::{rms_energy, SpeechModel, VadConfig};
    use crate::timeout::TimeoutConfig;
    use std::time::Duration;

    struct EnergyModel;

    impl SpeechModel for EnergyModel {
        fn speech_probability(&mut self, frame: &[f32]) -> crate::vad::Result<f32> {
            Ok(if rms_energy(frame) > 0.01 { 1.0 } else { 0.0 })
        }

        fn reset(&mut self) {}
    }

    fn energy_model() -> ModelFactory {
        Arc::new(|| -> crate::vad::Result<Box<dyn SpeechModel>> { Ok(Box::new(EnergyModel)) })
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            rtp_bind: "127.0.0.1:0".into(),
            vad: VadConfig {
                frame_samples: 160,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn start(config: SessionConfig) -> (Arc<MediaSession>, UdpSocket, UnboundedReceiver<SessionEvent>) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = BackendFactory::new(BackendConfig::default());
        let session = MediaSession::start_with_model(
            "call-1",
            config,
            peer.local_addr().unwrap(),
            &factory,
            energy_model(),
            tx,
        )
        .await
        .unwrap();
        peer.connect(session.local_addr()).await.unwrap();
        (session, peer, rx)
    }

    /// Send `pcm` to the session as 20ms A-law packets
    async fn send_rtp(peer: &UdpSocket, pcm: &[u8], seq: &mut u16) {
        for frame in pcm.chunks(320) {
            let mut packet = vec![0x80, 8];
            packet.extend_from_slice(&seq.to_be_bytes());
            packet.extend_from_slice(&(*seq as u32 * 160).to_be_bytes());
            packet.extend_from_slice(&[0, 0, 0, 1]);
            packet.extend(Codec::Pcma.encode(frame));
            peer.send(&packet).await.unwrap();
            *seq = seq.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn tone(samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let t = i as f32 / 8000.0;
                ((8000.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16).to_le_bytes()
            })
            .collect()
    }

    async fn wait_for(rx: &mut UnboundedReceiver<SessionEvent>, wanted: SessionEvent) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            let done = event == wanted;
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("never saw {:?}, got {:?}", wanted, seen);
    }

    #[tokio::test]
    async fn test_inbound_speech_produces_events() {
        let (session, peer, mut rx) = start(test_config()).await;
        let mut seq = 0;

        send_rtp(&peer, &vec![0; 8000], &mut seq).await;
        send_rtp(&peer, &tone(8000), &mut seq).await;
        send_rtp(&peer, &vec![0; 8000], &mut seq).await;

        let seen = wait_for(&mut rx, SessionEvent::SpeechComplete).await;
        assert!(seen.contains(&SessionEvent::SpeechStarted));
        session.close();
    }

    #[tokio::test]
    async fn test_malformed_packets_are_ignored() {
        let (session, peer, mut rx) = start(test_config()).await;
        peer.send(&[0x12, 0x34]).await.unwrap();
        peer.send(&[0x80, 99, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2]).await.unwrap();

        let mut seq = 0;
        send_rtp(&peer, &vec![0; 4000], &mut seq).await;
        send_rtp(&peer, &tone(4000), &mut seq).await;
        wait_for(&mut rx, SessionEvent::SpeechStarted).await;
        session.close();
    }

    #[tokio::test]
    async fn test_speak_reaches_peer_and_completes() {
        let (session, peer, mut rx) = start(test_config()).await;
        session.speak("hi");
        assert!(session.is_playing());

        wait_for(&mut rx, SessionEvent::PlaybackCompleted).await;
        assert!(!session.is_playing());

        let mut buf = [0u8; 1500];
        let len = tokio::time::timeout(Duration::from_secs(1), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(packet.payload_type, 8);
        session.close();
    }

    #[tokio::test]
    async fn test_caller_speech_interrupts_playback() {
        let (session, peer, mut rx) = start(test_config()).await;
        session.speak("a fairly long prompt that keeps playing for a while");

        let mut seq = 0;
        send_rtp(&peer, &vec![0; 4000], &mut seq).await;
        send_rtp(&peer, &tone(4000), &mut seq).await;

        let seen = wait_for(&mut rx, SessionEvent::PlaybackInterrupted).await;
        assert!(seen.contains(&SessionEvent::SpeechStarted));
        assert!(!seen.contains(&SessionEvent::PlaybackCompleted));
        session.close();
    }

    #[tokio::test]
    async fn test_no_input_timeout() {
        let config = SessionConfig {
            timeouts: TimeoutConfig {
                no_input_timeout_ms: 100,
                ..Default::default()
            },
            ..test_config()
        };
        let (session, _peer, mut rx) = start(config).await;
        session.start_recognition();
        wait_for(&mut rx, SessionEvent::NoInputTimeout).await;
        session.close();
    }

    #[tokio::test]
    async fn test_bind_failure_fails_setup() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = SessionConfig {
            rtp_bind: taken.local_addr().unwrap().to_string(),
            ..test_config()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = MediaSession::start_with_model(
            "busy",
            config,
            "127.0.0.1:9".parse().unwrap(),
            &BackendFactory::new(BackendConfig::default()),
            energy_model(),
            tx,
        )
        .await;
        assert!(matches!(result, Err(SessionError::Rtp(_))));
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = SessionRegistry::new();
        let (session, _peer, _rx) = start(test_config()).await;

        registry.insert(session.clone()).unwrap();
        assert!(matches!(registry.insert(session.clone()), Err(SessionError::Duplicate(_))));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("call-1").is_some());
        assert!(registry.get("call-2").is_none());

        let removed = registry.remove("call-1").unwrap();
        assert!(removed.is_closed());
        assert!(registry.is_empty());

        registry.insert(session).unwrap();
        registry.close_all();
        assert!(registry.is_empty());
    }
}
