//! Packet Buffers and Queues
//!
//! Every buffer on the packet plane is leased from a per-tunnel pool of
//! fixed-capacity buffers (MTU + headroom) and returned on drop, exactly
//! once, on every exit path. Queues are bounded channels of [`PacketBuf`]
//! with move semantics: pushing a buffer transfers ownership to the
//! receiver.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use crate::shutdown::Shutdown;
use crate::QUEUE_SEND_TIMEOUT;

/// Spare bytes in front of the payload so a frame type byte can be
/// prepended without reallocating
pub const HEADROOM: usize = 16;

/// Extra payload slack beyond the MTU
pub const PAYLOAD_SLACK: usize = 128;

struct PoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
}

/// Fixed-capacity buffer pool
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create a pool whose buffers hold `mtu + PAYLOAD_SLACK` payload bytes
    /// plus [`HEADROOM`].
    pub fn new(mtu: usize) -> Self {
        let buf_capacity = HEADROOM + mtu + PAYLOAD_SLACK;
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::new()),
                buf_capacity,
            }),
        }
    }

    /// Largest payload a pooled buffer can carry.
    pub fn payload_capacity(&self) -> usize {
        self.inner.buf_capacity - HEADROOM
    }

    /// Lease a buffer. Reuses a pooled allocation when one is available.
    pub fn acquire(&self) -> PacketBuf {
        let storage = self
            .inner
            .buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_capacity]);

        PacketBuf {
            storage,
            start: HEADROOM,
            end: HEADROOM,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Lease a buffer and copy `payload` into it. Oversized payloads are
    /// rejected so pooled buffers stay uniform.
    pub fn acquire_from(&self, payload: &[u8]) -> Option<PacketBuf> {
        if payload.len() > self.payload_capacity() {
            trace!("payload of {} bytes exceeds pool capacity", payload.len());
            return None;
        }
        let mut buf = self.acquire();
        buf.set_payload(payload);
        Some(buf)
    }

    #[cfg(test)]
    fn idle_buffers(&self) -> usize {
        self.inner.buffers.lock().unwrap().len()
    }
}

/// A leased packet buffer. Dropping it returns the backing storage to the
/// pool.
pub struct PacketBuf {
    storage: Vec<u8>,
    start: usize,
    end: usize,
    pool: Weak<PoolInner>,
}

impl PacketBuf {
    /// Replace the payload, resetting any consumed headroom.
    pub fn set_payload(&mut self, payload: &[u8]) {
        assert!(
            HEADROOM + payload.len() <= self.storage.len(),
            "payload exceeds pooled buffer capacity"
        );
        self.start = HEADROOM;
        self.end = HEADROOM + payload.len();
        self.storage[self.start..self.end].copy_from_slice(payload);
    }

    /// Prepend one byte using the leading headroom. Never reallocates;
    /// returns false only when the headroom is exhausted.
    pub fn prepend(&mut self, byte: u8) -> bool {
        if self.start == 0 {
            return false;
        }
        self.start -= 1;
        self.storage[self.start] = byte;
        true
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }
}

impl std::ops::Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let storage = std::mem::take(&mut self.storage);
            if storage.len() == pool.buf_capacity {
                pool.buffers.lock().unwrap().push(storage);
            }
        }
    }
}

/// Try to enqueue a buffer, waiting up to [`QUEUE_SEND_TIMEOUT`] for
/// capacity.
///
/// Returns `true` when the packet was queued, `false` once the timeout
/// elapses or the shutdown signal fires (the buffer is dropped back to the
/// pool either way).
pub async fn enqueue_with_timeout(
    queue: &mpsc::Sender<PacketBuf>,
    packet: PacketBuf,
    shutdown: &Shutdown,
) -> bool {
    let packet = match queue.try_send(packet) {
        Ok(()) => return true,
        Err(mpsc::error::TrySendError::Closed(_)) => return false,
        Err(mpsc::error::TrySendError::Full(packet)) => packet,
    };

    tokio::select! {
        result = queue.send_timeout(packet, QUEUE_SEND_TIMEOUT) => result.is_ok(),
        _ = shutdown.wait() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_buffer_returns_to_pool_once() {
        let pool = PacketPool::new(1400);
        assert_eq!(pool.idle_buffers(), 0);

        let buf = pool.acquire_from(b"payload").unwrap();
        drop(buf);
        assert_eq!(pool.idle_buffers(), 1);

        // The same storage is recycled.
        let buf = pool.acquire();
        assert_eq!(pool.idle_buffers(), 0);
        drop(buf);
        assert_eq!(pool.idle_buffers(), 1);
    }

    #[test]
    fn test_prepend_uses_headroom() {
        let pool = PacketPool::new(1400);
        let mut buf = pool.acquire_from(&[0x45, 0x00]).unwrap();

        assert!(buf.prepend(0x01));
        assert_eq!(buf.as_slice(), &[0x01, 0x45, 0x00]);

        // Headroom is finite but never reallocated away.
        for _ in 0..HEADROOM - 1 {
            assert!(buf.prepend(0xAA));
        }
        assert!(!buf.prepend(0xBB));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let pool = PacketPool::new(100);
        let too_big = vec![0u8; pool.payload_capacity() + 1];
        assert!(pool.acquire_from(&too_big).is_none());
    }

    #[tokio::test]
    async fn test_enqueue_succeeds_with_capacity() {
        let pool = PacketPool::new(100);
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = Shutdown::new();

        let buf = pool.acquire_from(b"pkt").unwrap();
        assert!(enqueue_with_timeout(&tx, buf, &shutdown).await);
        assert_eq!(rx.recv().await.unwrap().as_slice(), b"pkt");
    }

    #[tokio::test]
    async fn test_enqueue_times_out_when_full() {
        let pool = PacketPool::new(100);
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();

        assert!(enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await);

        let started = Instant::now();
        let queued = enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await;
        assert!(!queued);
        assert!(started.elapsed() >= QUEUE_SEND_TIMEOUT);

        // The rejected buffer went back to the pool.
        assert!(pool.idle_buffers() >= 1);
    }

    #[tokio::test]
    async fn test_enqueue_succeeds_when_capacity_frees_up() {
        let pool = PacketPool::new(100);
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();

        assert!(enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await);

        let drainer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            rx.recv().await;
            rx
        });

        // Capacity appears inside the timeout window.
        let queued = enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await;
        assert!(queued);
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_aborts_on_shutdown() {
        let pool = PacketPool::new(100);
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();

        assert!(enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await);

        shutdown.trigger();
        let started = Instant::now();
        let queued = enqueue_with_timeout(&tx, pool.acquire(), &shutdown).await;
        assert!(!queued);
        assert!(started.elapsed() < QUEUE_SEND_TIMEOUT);
    }
}
