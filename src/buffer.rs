//! Bounded, timestamped FIFO per mount.
//!
//! One [`RingBuffer`] backs one mount's uploaded byte stream. `append` is
//! O(1) amortized; `since` is a snapshot read returning every entry whose
//! timestamp is strictly greater than the watermark given, honoring I3/I4:
//! the oldest timestamp still held is the buffer's admission floor for every
//! subscriber's watermark.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Clone)]
pub struct Entry {
    pub timestamp: Instant,
    pub bytes: Bytes,
}

pub struct RingBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<Entry>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a chunk, evicting the oldest entry if at capacity.
    pub fn append(&self, data: Bytes) -> Instant {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Entry {
            timestamp: now,
            bytes: data,
        });
        now
    }

    /// The oldest timestamp still held, or `None` if the buffer is empty.
    pub fn oldest(&self) -> Option<Instant> {
        self.entries.lock().front().map(|e| e.timestamp)
    }

    /// Snapshot of every entry with `timestamp > watermark`, oldest first.
    ///
    /// Returns `None` if `watermark` predates the buffer's oldest retained
    /// entry — the caller has fallen behind the ring (backpressure overrun)
    /// and must be evicted rather than silently skip data (I4). This can
    /// only distinguish "fell behind after being served" from "asked for
    /// more tail than the ring retains" if the caller never hands in a
    /// watermark older than the buffer's contents at join time — see
    /// `FanoutEngine::clamp_initial_watermark`, which enforces that.
    pub fn since(&self, watermark: Instant) -> Option<Vec<Entry>> {
        let entries = self.entries.lock();
        // A watermark older than the oldest retained entry while the buffer
        // is at capacity means the reader has fallen off the back of the
        // ring: evict rather than silently skip the gap.
        if let Some(oldest) = entries.front() {
            if watermark < oldest.timestamp && entries.len() == self.capacity {
                return None;
            }
        }
        Some(
            entries
                .iter()
                .filter(|e| e.timestamp > watermark)
                .cloned()
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn append_then_since_returns_new_entries_only() {
        let buf = RingBuffer::new(10);
        let t0 = buf.append(Bytes::from_static(b"a"));
        sleep(Duration::from_millis(2));
        buf.append(Bytes::from_static(b"b"));
        let since = buf.since(t0).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(&since[0].bytes[..], b"b");
    }

    #[test]
    fn overflow_evicts_oldest() {
        let buf = RingBuffer::new(2);
        buf.append(Bytes::from_static(b"a"));
        buf.append(Bytes::from_static(b"b"));
        buf.append(Bytes::from_static(b"c"));
        assert_eq!(buf.len(), 2);
        let since = buf.since(Instant::now() - Duration::from_secs(10)).unwrap();
        let payload: Vec<u8> = since.iter().flat_map(|e| e.bytes.to_vec()).collect();
        assert_eq!(payload, b"bc");
    }

    #[test]
    fn watermark_older_than_full_buffer_signals_overrun() {
        let buf = RingBuffer::new(2);
        let stale = Instant::now();
        sleep(Duration::from_millis(2));
        buf.append(Bytes::from_static(b"a"));
        buf.append(Bytes::from_static(b"b"));
        buf.append(Bytes::from_static(b"c"));
        assert!(buf.since(stale).is_none());
    }
}
