//! Circular audio byte buffer
//!
//! Backs both the capture pre-roll and the playback queues. The buffer is not
//! internally locked: a single worker owns it and performs all reads and writes.

use std::fmt;
use tracing::{debug, warn};

/// Behaviour when a write does not fit in the remaining space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest bytes to make room
    FixedOverwrite,

    /// Grow the buffer; overwrite only if the allocation fails
    AutoExpand,
}

/// Bytes of 16-bit mono PCM covering `duration_ms` at `sample_rate`
pub fn pcm_bytes_for(sample_rate: u32, duration_ms: u64) -> usize {
    (sample_rate as u64 * duration_ms / 1000) as usize * 2
}

/// Fixed-capacity or auto-expanding circular byte buffer
pub struct AudioRingBuffer {
    data: Vec<u8>,
    capacity: usize,
    read_pos: usize,
    write_pos: usize,
    len: usize,
    sample_rate: u32,
    policy: OverflowPolicy,
    closed: bool,
}

impl AudioRingBuffer {
    /// Create a buffer holding `seconds` of 16-bit mono audio at `sample_rate`
    pub fn new(sample_rate: u32, seconds: u32, policy: OverflowPolicy) -> Self {
        let capacity = pcm_bytes_for(sample_rate, seconds as u64 * 1000);
        Self::with_capacity(sample_rate, capacity, policy)
    }

    /// Create a buffer with an explicit byte capacity
    pub fn with_capacity(sample_rate: u32, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(2);
        Self {
            data: vec![0; capacity],
            capacity,
            read_pos: 0,
            write_pos: 0,
            len: 0,
            sample_rate,
            policy,
            closed: false,
        }
    }

    /// Append bytes, making room according to the overflow policy.
    ///
    /// Returns the number of bytes retained. Only a single write larger than the
    /// whole fixed capacity loses incoming data, and then only its oldest part.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if self.closed || bytes.is_empty() {
            return 0;
        }

        let required = self.len + bytes.len();
        if required > self.capacity && self.policy == OverflowPolicy::AutoExpand {
            self.try_expand(required);
        }

        let mut incoming = bytes;
        if incoming.len() > self.capacity {
            let skip = incoming.len() - self.capacity;
            warn!(
                "Write of {} bytes exceeds ring capacity {}, keeping newest {} bytes",
                bytes.len(),
                self.capacity,
                self.capacity
            );
            incoming = &incoming[skip..];
        }

        let overflow = (self.len + incoming.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.discard(overflow);
        }

        self.copy_in(incoming);
        incoming.len()
    }

    /// Remove and return up to `n` bytes in FIFO order
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        if self.closed {
            return Vec::new();
        }
        let n = n.min(self.len);
        let out = self.copy_out(n);
        self.discard(n);
        out
    }

    /// Remove and return everything buffered
    pub fn read_all(&mut self) -> Vec<u8> {
        self.read(self.len)
    }

    /// Same as `read` but leaves the buffer untouched
    pub fn peek(&self, n: usize) -> Vec<u8> {
        if self.closed {
            return Vec::new();
        }
        self.copy_out(n.min(self.len))
    }

    /// Keep only the most recent `duration_ms` of buffered audio.
    ///
    /// The next read replays that tail. Returns the number of bytes kept.
    pub fn move_read_pointer_back(&mut self, duration_ms: u32) -> usize {
        if self.closed {
            return 0;
        }
        let keep = pcm_bytes_for(self.sample_rate, duration_ms as u64).min(self.len);
        self.read_pos = (self.write_pos + self.capacity - keep) % self.capacity;
        self.len = keep;
        keep
    }

    /// Reset to empty without changing capacity
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }

    /// Release the storage. Every later operation is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.clear();
        self.data = Vec::new();
        self.closed = true;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fraction of capacity currently in use
    pub fn usage_ratio(&self) -> f64 {
        self.len as f64 / self.capacity as f64
    }

    fn copy_in(&mut self, src: &[u8]) {
        let first = (self.capacity - self.write_pos).min(src.len());
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }
        self.write_pos = (self.write_pos + src.len()) % self.capacity;
        self.len += src.len();
    }

    fn copy_out(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let first = (self.capacity - self.read_pos).min(n);
        out.extend_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        if n > first {
            out.extend_from_slice(&self.data[..n - first]);
        }
        out
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.len);
        self.read_pos = (self.read_pos + n) % self.capacity;
        self.len -= n;
    }

    /// Grow to double the duration, or to the whole seconds needed plus one.
    /// Leaves the buffer unchanged if the allocation is refused.
    fn try_expand(&mut self, required: usize) {
        let mut new_capacity = self.capacity.saturating_mul(2);
        if new_capacity < required {
            let per_second = pcm_bytes_for(self.sample_rate, 1000).max(2);
            new_capacity = (required.div_ceil(per_second) + 1) * per_second;
        }

        let mut data: Vec<u8> = Vec::new();
        if let Err(e) = data.try_reserve_exact(new_capacity) {
            warn!(
                "Ring buffer expansion to {} bytes failed ({}), overwriting oldest audio",
                new_capacity, e
            );
            return;
        }

        let first = (self.capacity - self.read_pos).min(self.len);
        data.extend_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        data.extend_from_slice(&self.data[..self.len - first]);
        data.resize(new_capacity, 0);

        debug!(
            "Ring buffer expanded {} -> {} bytes ({} buffered)",
            self.capacity, new_capacity, self.len
        );

        self.data = data;
        self.capacity = new_capacity;
        self.read_pos = 0;
        self.write_pos = self.len;
    }
}

impl fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("sample_rate", &self.sample_rate)
            .field("policy", &self.policy)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, start: u8) -> Vec<u8> {
        (0..n).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let mut buf = AudioRingBuffer::with_capacity(8000, 10, OverflowPolicy::FixedOverwrite);

        buf.write(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.read(4), vec![1, 2, 3, 4]);

        // Crosses the physical end of the storage
        buf.write(&[7, 8, 9, 10, 11, 12]);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.read(3), vec![5, 6, 7]);
        assert_eq!(buf.read_all(), vec![8, 9, 10, 11, 12]);
        assert!(buf.read(4).is_empty());
    }

    #[test]
    fn test_fixed_overwrite_keeps_newest_bytes() {
        let capacity = 16;
        let mut buf = AudioRingBuffer::with_capacity(8000, capacity, OverflowPolicy::FixedOverwrite);
        let data = ramp(capacity + 5, 0);

        for chunk in data.chunks(3) {
            buf.write(chunk);
        }

        assert_eq!(buf.len(), capacity);
        assert_eq!(buf.read_all(), data[5..].to_vec());
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let mut buf = AudioRingBuffer::with_capacity(8000, 8, OverflowPolicy::FixedOverwrite);
        buf.write(&[0xAA, 0xBB]);
        let retained = buf.write(&ramp(12, 0));
        assert_eq!(retained, 8);
        assert_eq!(buf.read_all(), ramp(12, 0)[4..].to_vec());
    }

    #[test]
    fn test_auto_expand_never_drops() {
        // 1 second at 8kHz = 16000 bytes
        let mut buf = AudioRingBuffer::new(8000, 1, OverflowPolicy::AutoExpand);
        assert_eq!(buf.capacity(), 16000);

        let first = ramp(12000, 0);
        let second = ramp(9000, 100);
        buf.write(&first);
        buf.read(1000);
        buf.write(&second);

        assert_eq!(buf.capacity(), 32000);
        assert_eq!(buf.len(), 11000 + 9000);

        let all = buf.read_all();
        assert_eq!(&all[..11000], &first[1000..]);
        assert_eq!(&all[11000..], &second[..]);
    }

    #[test]
    fn test_auto_expand_to_required_seconds() {
        let mut buf = AudioRingBuffer::new(8000, 1, OverflowPolicy::AutoExpand);
        // Needs 5 seconds; doubling to 2 is not enough, so 5 + 1 seconds
        buf.write(&vec![1u8; 80000]);
        assert_eq!(buf.capacity(), 96000);
        assert_eq!(buf.len(), 80000);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = AudioRingBuffer::with_capacity(8000, 32, OverflowPolicy::FixedOverwrite);
        buf.write(&[9, 8, 7, 6]);
        assert_eq!(buf.peek(2), vec![9, 8]);
        assert_eq!(buf.peek(100), vec![9, 8, 7, 6]);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.read(1), vec![9]);
    }

    #[test]
    fn test_move_read_pointer_back_replays_tail() {
        // 3 seconds at 8kHz
        let mut buf = AudioRingBuffer::new(8000, 3, OverflowPolicy::FixedOverwrite);
        let audio = ramp(20000, 0);
        buf.write(&audio);

        // 500ms at 8kHz = 8000 bytes
        let kept = buf.move_read_pointer_back(500);
        assert_eq!(kept, 8000);
        assert_eq!(buf.read_all(), audio[12000..].to_vec());
    }

    #[test]
    fn test_move_read_pointer_back_clamps_to_available() {
        let mut buf = AudioRingBuffer::new(8000, 3, OverflowPolicy::FixedOverwrite);
        buf.write(&ramp(3000, 0));
        buf.read(1000);
        assert_eq!(buf.move_read_pointer_back(500), 2000);
        assert_eq!(buf.read_all(), ramp(3000, 0)[1000..].to_vec());
    }

    #[test]
    fn test_move_read_pointer_back_after_wrap() {
        let mut buf = AudioRingBuffer::with_capacity(1000, 20, OverflowPolicy::FixedOverwrite);
        let audio = ramp(30, 0);
        buf.write(&audio[..15]);
        buf.write(&audio[15..]);
        // 5ms at 1kHz = 5 samples = 10 bytes
        assert_eq!(buf.move_read_pointer_back(5), 10);
        assert_eq!(buf.read_all(), audio[20..].to_vec());
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = AudioRingBuffer::with_capacity(8000, 64, OverflowPolicy::FixedOverwrite);
        buf.write(&ramp(40, 0));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 64);
        buf.write(&[1, 2]);
        assert_eq!(buf.read_all(), vec![1, 2]);
    }

    #[test]
    fn test_closed_buffer_is_inert() {
        let mut buf = AudioRingBuffer::with_capacity(8000, 64, OverflowPolicy::AutoExpand);
        buf.write(&[1, 2, 3]);
        buf.close();

        assert!(buf.is_closed());
        assert_eq!(buf.write(&[4, 5]), 0);
        assert!(buf.read(10).is_empty());
        assert!(buf.peek(10).is_empty());
        assert_eq!(buf.move_read_pointer_back(100), 0);
        assert_eq!(buf.len(), 0);
    }
}
