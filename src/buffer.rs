//! Pooled fixed-size buffers and a chunk-linked FIFO of bytes.
//!
//! Every cross-layer transfer in this crate is a borrowed slice (see
//! [`RecvBuf`]); the pool below is what backs the slice the network layer
//! reads into, and the queue is what filters use to hold application bytes
//! they cannot yet forward (spec section 3, "Byte buffer" / "Byte-buffer
//! queue" / "Buffer pool").

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// A bounded free-list of fixed-size buffers.
///
/// `acquire` hands out a cleared buffer, allocating fresh if the pool is
/// empty; `release` returns it, dropped on the floor if the pool is
/// already full. A buffer acquired and released exactly once is eligible
/// for reuse; releasing twice silently double-frees a distinct logical
/// owner's buffer and is an implementation error in the caller (spec
/// section 8).
#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Creates a pool of buffers of `chunk_size` bytes, holding at most
    /// `capacity` idle buffers.
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            chunk_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// The fixed size of buffers this pool hands out.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Acquire a cleared buffer, possibly freshly allocated.
    pub fn acquire(&self) -> BytesMut {
        let mut free = self.free.lock();
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(self.chunk_size),
        }
    }

    /// Return a buffer to the pool. Dropped if the pool is already full.
    pub fn release(&self, buf: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in the pool (test/diagnostic use).
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A FIFO of bytes stored as a chain of `Bytes` segments.
///
/// Mirrors the "byte-buffer queue" of spec section 3: `put`/`get` move
/// whole segments, `put_byte`/`get_byte` operate a byte at a time,
/// `unget` pushes bytes back onto the front. Not internally synchronized —
/// concurrent callers (filters with a `sendLock`/`recvLock`) hold an
/// external mutex, per spec's stated invariant.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ChunkQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
        }
    }

    /// Total bytes currently queued.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if there is nothing queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether there are pending bytes (spec's `hasRemaining`).
    pub fn has_remaining(&self) -> bool {
        !self.is_empty()
    }

    /// Append a whole segment.
    pub fn put(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push_back(bytes);
    }

    /// Append a single byte. Rare relative to `put`; used by parsers that
    /// build a response one byte at a time.
    pub fn put_byte(&mut self, byte: u8) {
        self.put(Bytes::copy_from_slice(&[byte]));
    }

    /// Push bytes back onto the front of the queue, to be read again
    /// before anything already queued.
    pub fn unget(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push_front(bytes);
    }

    /// Remove and return up to `max` bytes from the front, `None` if
    /// nothing is queued.
    pub fn get(&mut self, max: usize) -> Option<Bytes> {
        if max == 0 || self.is_empty() {
            return None;
        }
        let take = max.min(self.len);
        self.take_bytes(take)
    }

    /// Remove and return a single byte from the front.
    pub fn get_byte(&mut self) -> Option<u8> {
        let front = self.segments.front_mut()?;
        let byte = front[0];
        front.advance_slice(1);
        self.len -= 1;
        if front.is_empty() {
            self.segments.pop_front();
        }
        Some(byte)
    }

    /// Drain the whole queue into one contiguous buffer. Used when a
    /// filter flushes its buffered bytes downward/upward in one call.
    pub fn drain_all(&mut self) -> Bytes {
        self.take_bytes(self.len).unwrap_or_default()
    }

    /// Allocate a new buffer sized to the queue's preferred chunk size.
    /// Spec's `newByteBuffer`; here simply a convenience over `BytesMut`.
    pub fn new_byte_buffer(capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }

    fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let front = self.segments.front_mut()?;
        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segments.pop_front();
            }
            return Some(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self.segments.pop_front()?;
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
            self.len -= take;
            if take < seg.len() {
                self.segments.push_front(seg.slice(take..));
            }
        }
        Some(out.freeze())
    }
}

/// Small helper trait so `ChunkQueue::get_byte` can advance a `Bytes`
/// segment in place without pulling in `bytes::Buf` for one call site.
trait AdvanceSlice {
    fn advance_slice(&mut self, n: usize);
}

impl AdvanceSlice for Bytes {
    fn advance_slice(&mut self, n: usize) {
        *self = self.slice(n..);
    }
}

/// A borrowed view over bytes handed to a layer's receive side.
///
/// This is the Rust rendering of spec's "byte buffer" contract: the
/// callee sees a mutable cursor over the caller's slice and consumes a
/// prefix of it; whatever it does not consume remains visible to the
/// caller, who resubmits it later. No copy is forced on either side.
#[derive(Debug)]
pub struct RecvBuf<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecvBuf<'a> {
    /// Wrap a slice for one receive call.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Whether any bytes remain.
    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Number of bytes not yet consumed.
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Mark `n` bytes as consumed. Panics if `n` exceeds what remains.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining_len(), "advance past end of RecvBuf");
        self.pos += n;
    }

    /// Take up to `n` unconsumed bytes without advancing.
    pub fn peek(&self, n: usize) -> &[u8] {
        let n = n.min(self.remaining_len());
        &self.data[self.pos..self.pos + n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_released_buffers() {
        let pool = BufferPool::new(64, 2);
        let a = pool.acquire();
        assert_eq!(pool.idle_count(), 0);
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);
        let b = pool.acquire();
        assert_eq!(b.len(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn pool_drops_buffers_past_capacity() {
        let pool = BufferPool::new(16, 1);
        pool.release(BytesMut::new());
        pool.release(BytesMut::new());
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn chunk_queue_put_get_roundtrip() {
        let mut q = ChunkQueue::new();
        q.put(Bytes::from_static(b"hello"));
        q.put(Bytes::from_static(b" world"));
        assert_eq!(q.len(), 11);
        let all = q.get(11).unwrap();
        assert_eq!(&all[..], b"hello world");
        assert!(q.is_empty());
    }

    #[test]
    fn chunk_queue_get_spans_segments() {
        let mut q = ChunkQueue::new();
        q.put(Bytes::from_static(b"ab"));
        q.put(Bytes::from_static(b"cd"));
        q.put(Bytes::from_static(b"ef"));
        let taken = q.get(4).unwrap();
        assert_eq!(&taken[..], b"abcd");
        assert_eq!(q.len(), 2);
        let rest = q.get(2).unwrap();
        assert_eq!(&rest[..], b"ef");
    }

    #[test]
    fn chunk_queue_unget_reprioritizes() {
        let mut q = ChunkQueue::new();
        q.put(Bytes::from_static(b"later"));
        q.unget(Bytes::from_static(b"first"));
        assert_eq!(&q.get(10).unwrap()[..], b"firstlater");
    }

    #[test]
    fn recv_buf_advance_leaves_remainder() {
        let data = [1u8, 2, 3, 4];
        let mut buf = RecvBuf::new(&data);
        buf.advance(2);
        assert_eq!(buf.remaining(), &[3, 4]);
    }
}
