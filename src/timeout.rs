//! No-input timeout coordination
//!
//! Speech-complete is decided by the VAD's silence tracking, so the only timer
//! here is the no-input timer. A speech end is reported immediately.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 0 disables the no-input timer
    pub no_input_timeout_ms: u64,

    /// Arm the no-input timer as soon as recognition starts
    pub start_input_timers: bool,

    /// Overrides the VAD minimum silence when set
    pub speech_complete_timeout_ms: Option<u32>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            no_input_timeout_ms: 500_000,
            start_input_timers: true,
            speech_complete_timeout_ms: None,
        }
    }
}

impl TimeoutConfig {
    /// Silence that ends an utterance, given the VAD's own setting
    pub fn effective_min_silence_ms(&self, vad_min_silence_ms: u32) -> u32 {
        self.speech_complete_timeout_ms.unwrap_or(vad_min_silence_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Idle,
    Armed,
    SpeechDetected,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    NoInputTimeout,
    SpeechComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCommand {
    StartTimers,
    SpeechStarted,
    SpeechEnded,
    CancelAll,
}

/// Single-threaded timer state machine; time is passed in by the caller
#[derive(Debug)]
pub struct TimeoutCoordinator {
    config: TimeoutConfig,
    state: TimeoutState,
    deadline: Option<Instant>,
}

impl TimeoutCoordinator {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            state: TimeoutState::Idle,
            deadline: None,
        }
    }

    /// Arm the no-input timer if configured to start immediately
    pub fn start_timers(&mut self, now: Instant) -> bool {
        if !self.config.start_input_timers || self.config.no_input_timeout_ms == 0 {
            self.state = TimeoutState::Idle;
            self.deadline = None;
            return false;
        }
        let timeout = Duration::from_millis(self.config.no_input_timeout_ms);
        self.deadline = Some(now + timeout);
        self.state = TimeoutState::Armed;
        debug!("⏱️ No-input timer armed for {:?}", timeout);
        true
    }

    pub fn speech_started(&mut self) {
        if self.deadline.take().is_some() {
            debug!("No-input timer cancelled by speech");
        }
        self.state = TimeoutState::SpeechDetected;
    }

    pub fn speech_ended(&mut self) -> Option<TimeoutEvent> {
        self.deadline = None;
        self.state = TimeoutState::Idle;
        Some(TimeoutEvent::SpeechComplete)
    }

    pub fn cancel_all(&mut self) {
        self.deadline = None;
        self.state = TimeoutState::Idle;
    }

    /// Fire the no-input timeout if its deadline has passed
    pub fn poll_expired(&mut self, now: Instant) -> Option<TimeoutEvent> {
        match self.deadline {
            Some(deadline) if self.state == TimeoutState::Armed && now >= deadline => {
                self.deadline = None;
                self.state = TimeoutState::TimedOut;
                info!("⏰ No input before timeout");
                Some(TimeoutEvent::NoInputTimeout)
            }
            _ => None,
        }
    }

    pub fn apply(&mut self, command: TimeoutCommand, now: Instant) -> Option<TimeoutEvent> {
        match command {
            TimeoutCommand::StartTimers => {
                self.start_timers(now);
                None
            }
            TimeoutCommand::SpeechStarted => {
                self.speech_started();
                None
            }
            TimeoutCommand::SpeechEnded => self.speech_ended(),
            TimeoutCommand::CancelAll => {
                self.cancel_all();
                None
            }
        }
    }

    pub fn state(&self) -> TimeoutState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sends commands to a coordinator running on its own task
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    tx: UnboundedSender<TimeoutCommand>,
}

impl TimeoutHandle {
    /// Run a coordinator on the current runtime, reporting on `events`
    pub fn spawn(config: TimeoutConfig, events: UnboundedSender<TimeoutEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(TimeoutCoordinator::new(config), rx, events));
        Self { tx }
    }

    pub fn send(&self, command: TimeoutCommand) {
        let _ = self.tx.send(command);
    }

    pub fn start_timers(&self) {
        self.send(TimeoutCommand::StartTimers);
    }

    pub fn speech_started(&self) {
        self.send(TimeoutCommand::SpeechStarted);
    }

    pub fn speech_ended(&self) {
        self.send(TimeoutCommand::SpeechEnded);
    }

    pub fn cancel_all(&self) {
        self.send(TimeoutCommand::CancelAll);
    }
}

async fn run(
    mut coordinator: TimeoutCoordinator,
    mut rx: UnboundedReceiver<TimeoutCommand>,
    events: UnboundedSender<TimeoutEvent>,
) {
    loop {
        let deadline = coordinator.deadline();
        let event = tokio::select! {
            command = rx.recv() => match command {
                Some(command) => coordinator.apply(command, Instant::now()),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                coordinator.poll_expired(Instant::now())
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                break;
            }
        }
    }
    debug!("Timeout coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ms: u64) -> TimeoutConfig {
        TimeoutConfig {
            no_input_timeout_ms: ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_arm_and_expire_once() {
        let mut c = TimeoutCoordinator::new(config(1000));
        let now = Instant::now();
        assert!(c.start_timers(now));
        assert_eq!(c.state(), TimeoutState::Armed);

        assert_eq!(c.poll_expired(now + Duration::from_millis(999)), None);
        assert_eq!(
            c.poll_expired(now + Duration::from_millis(1000)),
            Some(TimeoutEvent::NoInputTimeout)
        );
        assert_eq!(c.state(), TimeoutState::TimedOut);
        assert_eq!(c.poll_expired(now + Duration::from_secs(5)), None);

        // Re-arming is the caller's call
        assert!(c.start_timers(now + Duration::from_secs(5)));
        assert_eq!(c.state(), TimeoutState::Armed);
    }

    #[test]
    fn test_disabled_timers_stay_idle() {
        let now = Instant::now();
        let mut c = TimeoutCoordinator::new(config(0));
        assert!(!c.start_timers(now));
        assert_eq!(c.state(), TimeoutState::Idle);

        let mut c = TimeoutCoordinator::new(TimeoutConfig {
            start_input_timers: false,
            ..Default::default()
        });
        assert!(!c.start_timers(now));
        assert_eq!(c.deadline(), None);
    }

    #[test]
    fn test_speech_cancels_no_input() {
        let mut c = TimeoutCoordinator::new(config(100));
        let now = Instant::now();
        c.start_timers(now);
        c.speech_started();

        assert_eq!(c.state(), TimeoutState::SpeechDetected);
        assert_eq!(c.poll_expired(now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_speech_end_completes_immediately() {
        let mut c = TimeoutCoordinator::new(config(100));
        c.start_timers(Instant::now());
        c.speech_started();
        assert_eq!(c.speech_ended(), Some(TimeoutEvent::SpeechComplete));
        assert_eq!(c.state(), TimeoutState::Idle);
    }

    #[test]
    fn test_cancel_all() {
        let mut c = TimeoutCoordinator::new(config(100));
        let now = Instant::now();
        c.start_timers(now);
        c.cancel_all();
        assert_eq!(c.state(), TimeoutState::Idle);
        assert_eq!(c.poll_expired(now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_speech_complete_override() {
        let base = TimeoutConfig::default();
        assert_eq!(base.effective_min_silence_ms(300), 300);
        let custom = TimeoutConfig {
            speech_complete_timeout_ms: Some(800),
            ..Default::default()
        };
        assert_eq!(custom.effective_min_silence_ms(300), 800);
    }

    #[tokio::test]
    async fn test_driver_fires_no_input() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TimeoutHandle::spawn(config(50), tx);
        handle.start_timers();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(event, Some(TimeoutEvent::NoInputTimeout));
    }

    #[tokio::test]
    async fn test_driver_speech_prevents_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TimeoutHandle::spawn(config(80), tx);
        handle.start_timers();
        handle.speech_started();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        handle.speech_ended();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(event, Some(TimeoutEvent::SpeechComplete));
    }
}
