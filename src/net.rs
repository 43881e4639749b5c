//! The two network-layer variants (spec 4.3): a non-blocking layer driven
//! by the hub's selector, and a blocking layer with a dedicated reader
//! thread and an on-demand writer thread. Both expose the same upward
//! interface to the rest of the stack.
//!
//! Grounded in the teacher's `net::tcp_stream`/`net::tcp_listener` trait
//! pair (one abstraction over `mio::net` and `std::net` sockets) and its
//! `Listener`'s accept/read/write loop.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use mio::Interest;
use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::{ChunkQueue, RecvBuf};
use crate::error::{Error, Result};
use crate::hub::{IoHub, ReadyListener, RegistrationToken, SourceKind};
use crate::stack::{Layer, Position, RecvLayer, SendLayer, Stack};

/// The non-blocking network layer: owns an `mio::net::TcpStream`,
/// registered with the hub, interest starting at readable.
pub struct NonBlockingNetworkLayer {
    stream: Mutex<mio::net::TcpStream>,
    hub: Arc<IoHub>,
    token: RegistrationToken,
    stack: OnceLock<Arc<Stack>>,
    position: OnceLock<Arc<Position>>,
    outbound: Mutex<ChunkQueue>,
    write_interested: AtomicBool,
    recv_open: AtomicBool,
    send_open: AtomicBool,
}

impl NonBlockingNetworkLayer {
    /// Wrap an already-connected `mio` stream and register it with `hub`
    /// for read readiness.
    pub fn new(stream: mio::net::TcpStream, hub: Arc<IoHub>) -> io::Result<Arc<Self>> {
        let mut token_slot: Option<RegistrationToken> = None;
        let layer = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let listener: Arc<dyn ReadyListener> = Arc::new(WeakForward(weak.clone()));
            let token = hub.register(&stream, listener, Interest::READABLE, SourceKind::Stream);
            token_slot = token.as_ref().ok().copied();
            Self {
                stream: Mutex::new(stream),
                hub: hub.clone(),
                token: token_slot.unwrap_or(RegistrationToken(mio::Token(usize::MAX))),
                stack: OnceLock::new(),
                position: OnceLock::new(),
                outbound: Mutex::new(ChunkQueue::new()),
                write_interested: AtomicBool::new(false),
                recv_open: AtomicBool::new(true),
                send_open: AtomicBool::new(true),
            }
        });
        match token_slot {
            Some(_) => Ok(layer),
            None => Err(io::Error::new(io::ErrorKind::Other, "failed to register socket with hub")),
        }
    }

    /// Bind this layer to the stack it belongs to. Must be called before
    /// `Stack::init()`/`start()` so close propagation can reach the
    /// application position.
    pub fn attach_stack(&self, stack: Arc<Stack>) {
        let _ = self.stack.set(stack);
    }

    fn drain_writes(&self) {
        let mut guard = self.stream.lock();
        let mut queue = self.outbound.lock();
        loop {
            let Some(chunk) = queue.get(usize::MAX) else { break };
            match guard.write(&chunk) {
                Ok(0) => {
                    queue.unget(chunk);
                    break;
                }
                Ok(n) if n < chunk.len() => {
                    queue.unget(chunk.slice(n..));
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    queue.unget(chunk);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    queue.unget(chunk);
                    continue;
                }
                Err(_) => {
                    queue.unget(chunk);
                    break;
                }
            }
        }

        if queue.is_empty() {
            if self.write_interested.swap(false, Ordering::AcqRel) {
                self.hub.remove_interest(self.token, Interest::WRITABLE);
            }
        } else {
            // The hub strips WRITABLE from interest before dispatching this
            // handler (spec 5: "only the handler re-arms them"); a partial
            // write or WouldBlock leaves bytes queued, so re-add it or the
            // socket never gets another write-ready event.
            self.hub.add_interest(self.token, Interest::WRITABLE);
        }
    }

    fn do_read(&self) {
        let pool = self.hub.buffer_pool().clone();
        loop {
            if !self.recv_open.load(Ordering::Acquire) {
                return;
            }
            let mut buf = pool.acquire();
            buf.resize(pool.chunk_size(), 0);

            let read_result = {
                let mut guard = self.stream.lock();
                guard.read(&mut buf)
            };

            match read_result {
                Ok(0) => {
                    pool.release(buf);
                    self.observed_eof(None);
                    return;
                }
                Ok(n) => {
                    if let Some(position) = self.position.get() {
                        let mut recv = RecvBuf::new(&buf[..n]);
                        if let Err(e) = position.on_recv(&mut recv) {
                            warn!(error = %e, "non-blocking network layer: upward delivery failed");
                            pool.release(buf);
                            self.observed_eof(Some(e));
                            return;
                        }
                    }
                    pool.release(buf);
                    // mio is edge-triggered: keep reading until the socket
                    // tells us there's nothing left, per spec 4.3 ("read as
                    // much as possible"), rather than waiting for the next
                    // readiness event.
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    pool.release(buf);
                    // The hub strips READABLE from interest before
                    // dispatching this handler; re-add it now that we've
                    // drained the socket (spec 5: "only the handler
                    // re-arms them").
                    self.hub.add_interest(self.token, Interest::READABLE);
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    pool.release(buf);
                }
                Err(e) => {
                    pool.release(buf);
                    self.observed_eof(Some(e.into()));
                    return;
                }
            }
        }
    }

    fn observed_eof(&self, cause: Option<Error>) {
        self.recv_open.store(false, Ordering::Release);
        if let (Some(position), Some(stack)) = (self.position.get(), self.stack.get()) {
            position.on_recv_closed(cause.clone());
            stack.application_position().do_close_send();
            stack.notify_closed(cause);
        }
    }
}

impl ReadyListener for NonBlockingNetworkLayer {
    fn ready(&self, _accept: bool, _connect: bool, read: bool, write: bool) {
        if read {
            self.do_read();
        }
        if write {
            self.drain_writes();
        }
    }
}

/// Forwards hub readiness callbacks to a `NonBlockingNetworkLayer` that
/// may not have finished constructing yet. Needed because the hub wants
/// an `Arc<dyn ReadyListener>` at registration time, before the layer
/// itself has a stable `Arc`.
struct WeakForward(std::sync::Weak<NonBlockingNetworkLayer>);

impl ReadyListener for WeakForward {
    fn ready(&self, accept: bool, connect: bool, read: bool, write: bool) {
        if let Some(layer) = self.0.upgrade() {
            layer.ready(accept, connect, read, write);
        }
    }
}

impl std::fmt::Debug for NonBlockingNetworkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingNetworkLayer").finish()
    }
}

impl RecvLayer for NonBlockingNetworkLayer {
    fn on_recv(&self, _data: &mut RecvBuf<'_>) -> Result<()> {
        // The network layer is the bottom of the stack; nothing below it
        // sends data "up" into it. Present for trait completeness only.
        Ok(())
    }

    fn on_recv_closed(&self, _cause: Option<Error>) {
        self.recv_open.store(false, Ordering::Release);
    }

    fn is_recv_open(&self) -> bool {
        self.recv_open.load(Ordering::Acquire)
    }
}

impl SendLayer for NonBlockingNetworkLayer {
    fn do_send(&self, data: &[u8]) -> Result<()> {
        if !self.is_send_open() {
            return Err(Error::TransportClosed);
        }
        self.outbound.lock().put(bytes::Bytes::copy_from_slice(data));
        if !self.write_interested.swap(true, Ordering::AcqRel) {
            self.hub.add_interest(self.token, Interest::WRITABLE);
        }
        Ok(())
    }

    fn do_close_send(&self) {
        if self.send_open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.lock().shutdown(Shutdown::Write);
        }
    }

    fn is_send_open(&self) -> bool {
        self.send_open.load(Ordering::Acquire)
    }
}

impl Layer for NonBlockingNetworkLayer {
    fn name(&self) -> &'static str {
        "network/non-blocking"
    }

    fn init(&self, position: &Arc<Position>) -> Result<()> {
        let _ = self.position.set(position.clone());
        Ok(())
    }
}

/// The blocking network layer: a dedicated reader thread plus an
/// on-demand writer thread, sharing the hub's buffer pool and the
/// per-hub stack-start barrier.
pub struct BlockingNetworkLayer {
    stream: std::net::TcpStream,
    hub: Arc<IoHub>,
    self_weak: std::sync::Weak<Self>,
    stack: OnceLock<Arc<Stack>>,
    position: OnceLock<Arc<Position>>,
    outbound: Mutex<ChunkQueue>,
    writer_running: AtomicBool,
    recv_open: AtomicBool,
    send_open: AtomicBool,
}

impl BlockingNetworkLayer {
    /// Wrap an already-connected `std::net::TcpStream`.
    pub fn new(stream: std::net::TcpStream, hub: Arc<IoHub>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            stream,
            hub,
            self_weak: weak.clone(),
            stack: OnceLock::new(),
            position: OnceLock::new(),
            outbound: Mutex::new(ChunkQueue::new()),
            writer_running: AtomicBool::new(false),
            recv_open: AtomicBool::new(true),
            send_open: AtomicBool::new(true),
        })
    }

    /// See [`NonBlockingNetworkLayer::attach_stack`].
    pub fn attach_stack(&self, stack: Arc<Stack>) {
        let _ = self.stack.set(stack);
    }

    fn reader_loop(self: Arc<Self>) {
        self.hub.start_barrier().wait();
        let pool = self.hub.buffer_pool().clone();
        loop {
            if !self.recv_open.load(Ordering::Acquire) {
                return;
            }
            let mut buf = pool.acquire();
            buf.resize(pool.chunk_size(), 0);
            let mut stream = match self.stream.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    pool.release(buf);
                    self.observed_eof(Some(e.into()));
                    return;
                }
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    pool.release(buf);
                    self.observed_eof(None);
                    return;
                }
                Ok(n) => {
                    if let Some(position) = self.position.get() {
                        let mut recv = RecvBuf::new(&buf[..n]);
                        if let Err(e) = position.on_recv(&mut recv) {
                            pool.release(buf);
                            self.observed_eof(Some(e));
                            return;
                        }
                    }
                    pool.release(buf);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    pool.release(buf);
                    continue;
                }
                Err(e) => {
                    pool.release(buf);
                    self.observed_eof(Some(e.into()));
                    return;
                }
            }
        }
    }

    fn observed_eof(&self, cause: Option<Error>) {
        self.recv_open.store(false, Ordering::Release);
        if let (Some(position), Some(stack)) = (self.position.get(), self.stack.get()) {
            position.on_recv_closed(cause.clone());
            stack.application_position().do_close_send();
            stack.notify_closed(cause);
        }
    }

    fn spawn_writer_if_needed(self: &Arc<Self>) {
        if self.writer_running.swap(true, Ordering::AcqRel) {
            return; // already running; it will pick up the new data
        }
        let this = self.clone();
        let _ = this.hub.clone().execute(move || loop {
            let chunk = {
                let mut queue = this.outbound.lock();
                queue.get(usize::MAX)
            };
            let Some(chunk) = chunk else {
                this.writer_running.store(false, Ordering::Release);
                if !this.outbound.lock().is_empty() && !this.writer_running.swap(true, Ordering::AcqRel) {
                    continue;
                }
                return;
            };
            let mut stream = &this.stream;
            if let Err(e) = stream.write_all(&chunk) {
                warn!(error = %e, "blocking network layer: write failed");
                this.writer_running.store(false, Ordering::Release);
                return;
            }
        });
    }
}

impl std::fmt::Debug for BlockingNetworkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingNetworkLayer").finish()
    }
}

impl RecvLayer for BlockingNetworkLayer {
    fn on_recv(&self, _data: &mut RecvBuf<'_>) -> Result<()> {
        Ok(())
    }
    fn on_recv_closed(&self, _cause: Option<Error>) {
        self.recv_open.store(false, Ordering::Release);
    }
    fn is_recv_open(&self) -> bool {
        self.recv_open.load(Ordering::Acquire)
    }
}

impl SendLayer for BlockingNetworkLayer {
    fn do_send(&self, data: &[u8]) -> Result<()> {
        if !self.is_send_open() {
            return Err(Error::TransportClosed);
        }
        self.outbound.lock().put(bytes::Bytes::copy_from_slice(data));
        if let Some(this) = self.self_weak.upgrade() {
            this.spawn_writer_if_needed();
        }
        Ok(())
    }

    fn do_close_send(&self) {
        if self.send_open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Write);
        }
    }

    fn is_send_open(&self) -> bool {
        self.send_open.load(Ordering::Acquire)
    }
}

impl Layer for BlockingNetworkLayer {
    fn name(&self) -> &'static str {
        "network/blocking"
    }

    fn init(&self, position: &Arc<Position>) -> Result<()> {
        let _ = self.position.set(position.clone());
        Ok(())
    }
}

/// Spawn the blocking layer's reader task and, if there's already queued
/// outbound data (writes submitted before `init()`), its writer task.
/// Call once, right after `Stack::start()` returns.
pub fn spawn_blocking_tasks(layer: &Arc<BlockingNetworkLayer>) {
    let reader = layer.clone();
    let hub = layer.hub.clone();
    let _ = hub.execute(move || reader.reader_loop());
    if !layer.outbound.lock().is_empty() {
        layer.spawn_writer_if_needed();
    }
}
