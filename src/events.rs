use crate::backend::RecognitionEvent;
use crate::capture::CaptureEvent;
use crate::playback::PlaybackEvent;
use crate::timeout::TimeoutEvent;

/// Notifications a media session forwards to call control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SpeechStarted,
    /// Speech ended; silence was judged by the VAD
    SpeechComplete,
    RecognitionPartial(String),
    RecognitionComplete(String),
    RecognitionFailed(String),
    NoInputTimeout,
    UtteranceDropped(String),
    PlaybackCompleted,
    PlaybackInterrupted,
}

impl From<RecognitionEvent> for SessionEvent {
    fn from(event: RecognitionEvent) -> Self {
        match event {
            RecognitionEvent::Partial(text) => SessionEvent::RecognitionPartial(text),
            RecognitionEvent::Final(text) => SessionEvent::RecognitionComplete(text),
            RecognitionEvent::Error(message) => SessionEvent::RecognitionFailed(message),
        }
    }
}

impl From<PlaybackEvent> for SessionEvent {
    fn from(event: PlaybackEvent) -> Self {
        match event {
            PlaybackEvent::Completed => SessionEvent::PlaybackCompleted,
            PlaybackEvent::Interrupted => SessionEvent::PlaybackInterrupted,
        }
    }
}

impl From<TimeoutEvent> for SessionEvent {
    fn from(event: TimeoutEvent) -> Self {
        match event {
            TimeoutEvent::NoInputTimeout => SessionEvent::NoInputTimeout,
            TimeoutEvent::SpeechComplete => SessionEvent::SpeechComplete,
        }
    }
}

impl SessionEvent {
    /// Capture events that are reported directly; speech ends go through the timeout coordinator
    pub fn from_capture(event: &CaptureEvent) -> Option<Self> {
        match event {
            CaptureEvent::SpeechStarted { .. } => Some(SessionEvent::SpeechStarted),
            CaptureEvent::SpeechEnded { .. } => None,
            CaptureEvent::UtteranceDropped { reason } => Some(SessionEvent::UtteranceDropped(reason.clone())),
        }
    }
}
