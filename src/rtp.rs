//! RTP packetisation and paced frame transmission
//!
//! The transmitter slices an encoded G.711 stream into fixed frames and sends
//! one packet per frame duration. The send deadline is a fixed grid anchored
//! at the first packet, so pacing does not drift with scheduling jitter.

use crate::codec::Codec;
use smallvec::SmallVec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

pub const RTP_HEADER_SIZE: usize = 12;
const RTP_VERSION: u8 = 2;

/// Packet buffer large enough for a header plus one narrowband frame
type PacketBuf = SmallVec<[u8; 256]>;

/// Error type for RTP operations
#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed RTP packet: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, RtpError>;

/// Frame cadence of the RTP leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub sample_rate: u32,
    pub frame_ms: u32,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            frame_ms: 20,
        }
    }
}

impl FrameTiming {
    pub const fn samples_per_frame(&self) -> usize {
        (self.sample_rate * self.frame_ms / 1000) as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

/// A parsed RTP packet borrowing its payload from the datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse a version-2 RTP datagram, skipping CSRCs, extensions and padding
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RtpError::Malformed(format!("{} bytes is shorter than a header", data.len())));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::Malformed(format!("unsupported version {}", version)));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let mut offset = RTP_HEADER_SIZE + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::Malformed("truncated header extension".into()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if offset > data.len() {
            return Err(RtpError::Malformed("header runs past end of packet".into()));
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(RtpError::Malformed(format!("invalid padding length {}", pad)));
            }
            end -= pad;
        }

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: &data[offset..end],
        })
    }
}

/// Cloneable handle that can stop an in-progress `send` from another task
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Paced RTP sender for one outbound stream
pub struct RtpTransmitter {
    socket: Arc<UdpSocket>,
    codec: Codec,
    timing: FrameTiming,

    sequence: u16,
    timestamp: u32,
    ssrc: u32,

    /// Send time of the next frame on the fixed grid
    next_deadline: Option<Instant>,

    interrupt: Arc<AtomicBool>,
    frames_sent: u64,
}

impl RtpTransmitter {
    /// Bind `local` and connect to `remote`. Failure here is a session setup failure.
    pub async fn connect(
        local: SocketAddr,
        remote: SocketAddr,
        codec: Codec,
        timing: FrameTiming,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        info!(
            "RTP transmitter {} -> {} ({}, {}ms frames)",
            socket.local_addr()?,
            remote,
            codec.name(),
            timing.frame_ms
        );
        Ok(Self::from_socket(Arc::new(socket), codec, timing))
    }

    /// Wrap an already connected socket, which may also be used for receiving
    pub fn from_socket(socket: Arc<UdpSocket>, codec: Codec, timing: FrameTiming) -> Self {
        Self {
            socket,
            codec,
            timing,
            sequence: 0,
            timestamp: 0,
            ssrc: rand::random::<u32>(),
            next_deadline: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            frames_sent: 0,
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.interrupt.clone())
    }

    /// Stop the current `send` before its next frame
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    /// Bytes of encoded payload carried per packet
    pub fn frame_bytes(&self) -> usize {
        self.timing.samples_per_frame()
    }

    /// Send `payload` as consecutive paced frames; returns the number of frames sent.
    ///
    /// A trailing partial frame is padded with codec silence. The interrupt flag
    /// is checked before every frame and cleared when this call returns.
    pub async fn send(&mut self, payload: &[u8]) -> usize {
        let frame_bytes = self.frame_bytes();
        let samples = self.timing.samples_per_frame() as u32;
        let mut sent = 0;

        for frame in payload.chunks(frame_bytes) {
            if self.interrupt.load(Ordering::Acquire) {
                debug!("RTP send interrupted after {} of {} frames", sent, payload.len().div_ceil(frame_bytes));
                break;
            }

            self.wait_for_slot().await;

            let packet = self.build_packet(frame);
            if let Err(e) = self.socket.send(&packet).await {
                warn!("RTP send failed (seq {}): {}", self.sequence, e);
            }

            self.sequence = self.sequence.wrapping_add(1);
            self.timestamp = self.timestamp.wrapping_add(samples);
            self.frames_sent += 1;
            sent += 1;
        }

        self.interrupt.store(false, Ordering::Release);
        sent
    }

    /// Sleep until this frame's slot on the deadline grid.
    ///
    /// A slot more than one frame in the past (idle gap or scheduler stall)
    /// re-anchors the grid at now instead of bursting to catch up, and a slot
    /// more than one frame ahead is clamped to one frame.
    async fn wait_for_slot(&mut self) {
        let frame = self.timing.duration();
        let now = Instant::now();

        let deadline = match self.next_deadline {
            None => now,
            Some(deadline) if now > deadline + frame => {
                trace!("RTP pacing fell {:?} behind, re-anchoring", now - deadline);
                now
            }
            Some(deadline) if deadline > now + frame => now + frame,
            Some(deadline) => deadline,
        };

        sleep_until(deadline).await;
        self.next_deadline = Some(deadline + frame);
    }

    fn build_packet(&self, frame: &[u8]) -> PacketBuf {
        let frame_bytes = self.frame_bytes();
        let mut packet = PacketBuf::new();
        packet.push(RTP_VERSION << 6);
        packet.push(self.codec.payload_type() & 0x7F);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(frame);
        if frame.len() < frame_bytes {
            packet.resize(RTP_HEADER_SIZE + frame_bytes, self.codec.silence_byte());
        }
        packet
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    #[cfg(test)]
    fn set_counters(&mut self, sequence: u16, timestamp: u32) {
        self.sequence = sequence;
        self.timestamp = timestamp;
    }
}
