//! Real-time media engine for a telephony speech gateway
//!
//! Bridges RTP voice calls to speech recognition and synthesis backends:
//! VAD-gated capture with pre-roll, paced G.711 transmission, interruptible
//! playback and no-input timeouts.

#![forbid(unsafe_code)]

pub mod backend;
pub mod capture;
pub mod codec;
pub mod config;
pub mod events;
pub mod playback;
pub mod resample;
pub mod ring_buffer;
pub mod rtp;
pub mod session;
pub mod timeout;
pub mod vad;

pub use backend::{BackendConfig, BackendFactory, RecognitionEvent};
pub use codec::Codec;
pub use config::SessionConfig;
pub use events::SessionEvent;
pub use ring_buffer::{AudioRingBuffer, OverflowPolicy};
pub use session::{MediaSession, SessionError, SessionRegistry};
