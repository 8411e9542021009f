//! Fan-out engine (C5): subscriber registration, the single global
//! broadcast loop, protocol-aware framing, and slow-consumer eviction.
//!
//! Writes happen exclusively from [`FanoutEngine::broadcast_tick`] (§4.6
//! step 5): a connection task that subscribed never touches its own write
//! half again after handing it to this engine. This is the inversion the
//! design notes call out — one writer task instead of N per-connection
//! write loops — so a subscriber's socket is only ever written to from one
//! place, and the per-connection task just waits on read/cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::RingBuffer;
use crate::registry::Registry;
use crate::types::{ConnectionId, ProtocolVersion};

enum Sink {
    Data {
        write: OwnedWriteHalf,
        protocol_version: ProtocolVersion,
        cancel: CancellationToken,
    },
    /// The bounded RTCM metadata parser, fed through an in-process pipe
    /// rather than a socket. Sentinel id 0 (never issued to a real
    /// connection, §C3 ids start at 1) marks these in the subscriber list.
    Meta { tx: mpsc::UnboundedSender<Bytes> },
}

struct Subscriber {
    id: ConnectionId,
    sink: Sink,
    watermark: Instant,
}

pub struct FanoutEngine {
    registry: Arc<Registry>,
    buffers: RwLock<HashMap<String, Arc<RingBuffer>>>,
    subscribers: RwLock<HashMap<String, Arc<Mutex<Vec<Subscriber>>>>>,
    send_timeout: Duration,
}

impl FanoutEngine {
    pub fn new(registry: Arc<Registry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            buffers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Creates the mount's ring buffer. Called after `Registry::add_mount`
    /// succeeds (§4.6 step 4).
    pub fn register_mount(&self, name: &str, ring_capacity: usize) -> Arc<RingBuffer> {
        let buf = Arc::new(RingBuffer::new(ring_capacity));
        self.buffers.write().insert(name.to_string(), buf.clone());
        self.subscribers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        buf
    }

    /// Tears down the ring buffer only. Live subscriber sockets stay
    /// attached to the now-dead mount name (§3 Lifecycles: "do not drop
    /// subscribers") until their own read/write returns or the reaper
    /// times them out.
    pub fn unregister_mount(&self, name: &str) {
        self.buffers.write().remove(name);
    }

    pub fn append(&self, name: &str, data: Bytes) -> Option<Instant> {
        let buf = self.buffers.read().get(name).cloned()?;
        Some(buf.append(data))
    }

    pub fn is_mount_registered(&self, name: &str) -> bool {
        self.buffers.read().contains_key(name)
    }

    pub fn subscribe_data(
        &self,
        mount: &str,
        id: ConnectionId,
        write: OwnedWriteHalf,
        protocol_version: ProtocolVersion,
        requested_watermark: Instant,
        cancel: CancellationToken,
    ) {
        let watermark = self.clamp_initial_watermark(mount, requested_watermark);
        let list = self
            .subscribers
            .write()
            .entry(mount.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        list.lock().push(Subscriber {
            id,
            sink: Sink::Data {
                write,
                protocol_version,
                cancel,
            },
            watermark,
        });
    }

    /// A freshly joined subscriber asks for the last `INITIAL_TAIL` of
    /// history (§4.6 step 5), but `RingBuffer::since`'s overrun check (I4)
    /// can't tell "asked for more tail than the ring retains" apart from
    /// "fell behind after being served" — both look like a watermark older
    /// than the buffer's oldest entry. A buffer that is already full when a
    /// fast uploader has packed less than `INITIAL_TAIL` worth of history
    /// into it would otherwise evict the subscriber before its first
    /// delivery. Clamp the join watermark to the buffer's oldest retained
    /// entry so the subscriber gets whatever tail actually exists instead
    /// of being evicted for lacking history nobody could have sent it.
    fn clamp_initial_watermark(&self, mount: &str, requested: Instant) -> Instant {
        match self.buffers.read().get(mount).and_then(|b| b.oldest()) {
            Some(oldest) if requested < oldest => oldest,
            _ => requested,
        }
    }

    /// Registers the bounded RTCM metadata parser as a subscriber (§4.4,
    /// §4.5): it is served identically to a rover, just through a channel.
    pub fn subscribe_meta(&self, mount: &str, watermark: Instant) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let list = self
            .subscribers
            .write()
            .entry(mount.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        list.lock().push(Subscriber {
            id: 0,
            sink: Sink::Meta { tx },
            watermark,
        });
        rx
    }

    /// Removes and tears down one subscriber by id, independent of the
    /// broadcast loop. Used by a connection task that notices its own
    /// socket has gone away (read EOF/error, or admin/reaper cancellation)
    /// so the write half doesn't linger forgotten in the subscriber list.
    pub async fn unsubscribe_data(&self, mount: &str, id: ConnectionId) {
        let Some(list) = self.subscribers.read().get(mount).cloned() else {
            return;
        };
        let removed = {
            let mut guard = list.lock();
            guard.iter().position(|s| s.id == id).map(|pos| guard.remove(pos))
        };
        if let Some(Subscriber { sink: Sink::Data { mut write, cancel, .. }, .. }) = removed {
            cancel.cancel();
            let _ = write.shutdown().await;
        }
    }

    /// One pass of the global broadcast loop: for every mount with
    /// subscribers, swap the subscriber list out from under its lock,
    /// deliver with no lock held across I/O, then put back whichever
    /// subscribers are still healthy (§5: "No task may hold a registry
    /// lock across a socket I/O call").
    pub async fn broadcast_tick(&self) {
        let mounts: Vec<(String, Arc<Mutex<Vec<Subscriber>>>)> =
            self.subscribers.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        for (mount, list) in mounts {
            let batch: Vec<Subscriber> = std::mem::take(&mut *list.lock());
            if batch.is_empty() {
                // Nothing subscribed right now; prune the empty entry so
                // the subscriber map doesn't grow unbounded over uptime.
                self.subscribers.write().remove(&mount);
                continue;
            }
            let buffer = self.buffers.read().get(&mount).cloned();
            let mut survivors = Vec::with_capacity(batch.len());
            for mut sub in batch {
                if self.deliver(&mount, buffer.as_deref(), &mut sub).await {
                    survivors.push(sub);
                } else {
                    self.evict(&mount, sub).await;
                }
            }
            if !survivors.is_empty() {
                list.lock().extend(survivors);
            }
        }
    }

    /// Delivers new data to one subscriber. Returns `false` if the
    /// subscriber must be evicted: send error, deadline exceeded, or
    /// buffer-overrun backpressure (I4).
    async fn deliver(&self, mount: &str, buffer: Option<&RingBuffer>, sub: &mut Subscriber) -> bool {
        let Some(buffer) = buffer else {
            // Mount isn't (or no longer) live: nothing new, subscriber stays.
            return true;
        };
        let Some(entries) = buffer.since(sub.watermark) else {
            warn!(target: "caster::fanout", mount, id = sub.id, "buffer overrun, evicting subscriber");
            return false;
        };
        if entries.is_empty() {
            return true;
        }

        let mut sent_bytes = 0u64;
        for entry in &entries {
            let outcome = match &mut sub.sink {
                Sink::Data { write, protocol_version, .. } => {
                    let framed = frame(*protocol_version, &entry.bytes);
                    match timeout(self.send_timeout, write.write_all(&framed)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(Some(e.to_string())),
                        Err(_) => Err(None),
                    }
                }
                Sink::Meta { tx } => {
                    if tx.send(entry.bytes.clone()).is_ok() {
                        Ok(())
                    } else {
                        Err(Some("metadata parser pipe closed".to_string()))
                    }
                }
            };
            match outcome {
                Ok(()) => sent_bytes += entry.bytes.len() as u64,
                Err(Some(reason)) => {
                    debug!(target: "caster::fanout", mount, id = sub.id, reason, "subscriber write failed");
                    return false;
                }
                Err(None) => {
                    warn!(target: "caster::fanout", mount, id = sub.id, "subscriber send deadline exceeded");
                    return false;
                }
            }
        }
        sub.watermark = entries.last().map(|e| e.timestamp).unwrap_or(sub.watermark);
        if sub.id != 0 {
            self.registry.update_user_activity(sub.id, sub.watermark, sent_bytes);
        }
        true
    }

    async fn evict(&self, mount: &str, sub: Subscriber) {
        if sub.id != 0 {
            self.registry.remove_user(sub.id);
        }
        if let Sink::Data { mut write, cancel, .. } = sub.sink {
            cancel.cancel();
            let _ = write.shutdown().await;
            debug!(target: "caster::fanout", mount, id = sub.id, "evicted subscriber");
        }
    }
}

/// NTRIP 1.0 writes each chunk as-is; NTRIP 2.0 prefixes it with
/// `len(chunk)` as hex, CRLF, the chunk, CRLF (§4.4).
fn frame(version: ProtocolVersion, chunk: &Bytes) -> Bytes {
    match version {
        ProtocolVersion::Ntrip1_0 => chunk.clone(),
        ProtocolVersion::Ntrip2_0 => {
            let mut out = Vec::with_capacity(chunk.len() + 16);
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
            Bytes::from(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn ntrip1_frames_are_raw() {
        let chunk = Bytes::from_static(b"AABB");
        assert_eq!(frame(ProtocolVersion::Ntrip1_0, &chunk), chunk);
    }

    #[test]
    fn ntrip2_frames_wrap_in_hex_length_prefix() {
        let chunk = Bytes::from_static(b"F1F2");
        let framed = frame(ProtocolVersion::Ntrip2_0, &chunk);
        assert_eq!(&framed[..], b"4\r\nF1F2\r\n");
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, _) = tokio::join!(async { listener.accept().await.unwrap() }, connect);
        (accepted.0, connect.await.unwrap())
    }

    #[tokio::test]
    async fn subscriber_receives_chunked_frames() {
        let registry = Arc::new(Registry::new(3));
        let engine = FanoutEngine::new(registry, Duration::from_secs(5));
        engine.register_mount("MT01", 10);

        let (server_side, mut client_side) = loopback_pair().await;
        let (_read, write) = server_side.into_split();
        let watermark = Instant::now() - Duration::from_secs(10);
        engine.subscribe_data(
            "MT01",
            1,
            write,
            ProtocolVersion::Ntrip2_0,
            watermark,
            CancellationToken::new(),
        );

        engine.append("MT01", Bytes::from_static(b"F1F2"));
        engine.broadcast_tick().await;

        let mut buf = [0u8; 64];
        let n = client_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4\r\nF1F2\r\n");
    }

    #[tokio::test]
    async fn overrun_evicts_without_panicking() {
        let registry = Arc::new(Registry::new(3));
        let engine = FanoutEngine::new(registry, Duration::from_secs(5));
        engine.register_mount("MT01", 2);

        let (server_side, _client_side) = loopback_pair().await;
        let (_read, write) = server_side.into_split();
        let stale = Instant::now();
        engine.subscribe_data(
            "MT01",
            1,
            write,
            ProtocolVersion::Ntrip2_0,
            stale,
            CancellationToken::new(),
        );

        engine.append("MT01", Bytes::from_static(b"a"));
        engine.append("MT01", Bytes::from_static(b"b"));
        engine.append("MT01", Bytes::from_static(b"c"));
        engine.broadcast_tick().await;
        // Subscriber was evicted; a second tick must not find it again.
        engine.broadcast_tick().await;
    }
}
