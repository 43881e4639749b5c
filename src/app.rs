//! Application layer (spec 4.7): the topmost stack position, terminating
//! the chain and exposing a plain send/receive surface to the host.
//!
//! A trait-only contract in spec.md — the concrete application is
//! explicitly out of scope. [`ApplicationLayer`] is the one concrete,
//! minimal implementation the stack needs to terminate at, parameterized
//! by an [`ApplicationListener`] the host supplies.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::buffer::RecvBuf;
use crate::error::{Error, Result};
use crate::stack::{Layer, Position, RecvLayer, SendLayer};

/// Host-supplied callbacks for bytes arriving at the top of the stack.
pub trait ApplicationListener: Send + Sync {
    /// Bytes delivered in order, never after [`on_read_closed`].
    ///
    /// [`on_read_closed`]: ApplicationListener::on_read_closed
    fn on_read(&self, data: &[u8]);

    /// The receive direction has closed; `cause` is `None` for a clean
    /// shutdown. Called at most once.
    fn on_read_closed(&self, cause: Option<Error>);
}

/// The application layer: forwards inbound bytes to an
/// [`ApplicationListener`] and exposes [`send`](Self::send) /
/// [`close_write`](Self::close_write) / [`close_read`](Self::close_read)
/// for the host to drive outbound traffic.
pub struct ApplicationLayer {
    listener: Arc<dyn ApplicationListener>,
    position: OnceLock<Arc<Position>>,
    /// Monotonic: once cleared, never set again (spec 4.7's "read open"
    /// invariant).
    read_open: AtomicBool,
    write_open: AtomicBool,
}

impl ApplicationLayer {
    /// Build the application position with the given listener.
    pub fn new(listener: Arc<dyn ApplicationListener>) -> Arc<Self> {
        Arc::new(Self {
            listener,
            position: OnceLock::new(),
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        })
    }

    /// Send `data` down through the stack toward the network. Fails with
    /// [`Error::TransportClosed`] if the next position down is no longer
    /// accepting sends.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self.position.get() {
            Some(position) => position.do_send(data),
            None => Err(Error::TransportClosed),
        }
    }

    /// Close the send direction at the stack boundary: cascades
    /// `doCloseSend` down through every filter to the network layer.
    pub fn close_write(&self) {
        if let Some(position) = self.position.get() {
            position.do_close_send();
        }
    }

    /// Close the receive direction via the network layer: the network
    /// layer's own receive side is closed directly, and `onRecvClosed`
    /// cascades upward through the filters to this layer.
    pub fn close_read(&self) {
        if let Some(position) = self.position.get() {
            position.on_recv_closed(None);
        }
    }

    /// Whether this layer is still willing to accept `onRead` (spec
    /// 4.7's monotonic flag, exposed so a host can poll it without
    /// routing a send through a closed stack).
    pub fn is_read_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    /// Whether `send` is still meaningful.
    pub fn is_write_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ApplicationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationLayer")
            .field("read_open", &self.read_open.load(Ordering::Relaxed))
            .field("write_open", &self.write_open.load(Ordering::Relaxed))
            .finish()
    }
}

impl RecvLayer for ApplicationLayer {
    fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()> {
        if !self.read_open.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }
        self.listener.on_read(data.remaining());
        data.advance(data.remaining_len());
        Ok(())
    }

    fn on_recv_closed(&self, cause: Option<Error>) {
        // Monotonic: only the first transition fires the callback.
        if self.read_open.swap(false, Ordering::AcqRel) {
            self.listener.on_read_closed(cause);
        }
    }

    fn is_recv_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }
}

impl SendLayer for ApplicationLayer {
    fn do_send(&self, _data: &[u8]) -> Result<()> {
        // The application is the top of the stack; nothing above it ever
        // forwards a send into it. Present for trait completeness only,
        // mirroring the network layer's unreachable `on_recv`.
        Ok(())
    }

    fn do_close_send(&self) {
        self.write_open.store(false, Ordering::Release);
    }

    fn is_send_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }
}

impl Layer for ApplicationLayer {
    fn name(&self) -> &'static str {
        "application"
    }

    fn init(&self, position: &Arc<Position>) -> Result<()> {
        let _ = self.position.set(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{Stack, StartBarrier};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct PassThrough {
        sent: Mutex<Vec<u8>>,
        recv_open: AtomicBool,
        send_open: AtomicBool,
    }

    impl RecvLayer for PassThrough {
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
    impl SendLayer for PassThrough {
        fn do_send(&self, data: &[u8]) -> Result<()> {
            self.sent.lock().extend_from_slice(data);
            Ok(())
        }
        fn do_close_send(&self) {
            self.send_open.store(false, Ordering::Release);
        }
        fn is_send_open(&self) -> bool {
            self.send_open.load(Ordering::Acquire)
        }
    }
    impl Layer for PassThrough {
        fn name(&self) -> &'static str {
            "network-stub"
        }
    }

    fn network_stub() -> Arc<PassThrough> {
        Arc::new(PassThrough {
            sent: Mutex::new(Vec::new()),
            recv_open: AtomicBool::new(true),
            send_open: AtomicBool::new(true),
        })
    }

    #[derive(Default)]
    struct Recording {
        reads: Mutex<Vec<u8>>,
        closed: AtomicUsize,
    }
    impl ApplicationListener for Recording {
        fn on_read(&self, data: &[u8]) {
            self.reads.lock().extend_from_slice(data);
        }
        fn on_read_closed(&self, _cause: Option<Error>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_reaches_network_stub() {
        let network = network_stub();
        let recording = Arc::new(Recording::default());
        let app = ApplicationLayer::new(recording.clone());
        let stack = Stack::build("test", network.clone(), vec![], app.clone(), StartBarrier::new());
        stack.init().unwrap();
        stack.start().unwrap();

        app.send(b"outbound").unwrap();
        assert_eq!(&network.sent.lock()[..], b"outbound");
    }

    #[test]
    fn read_closed_is_monotonic_and_notifies_once() {
        let network = network_stub();
        let recording = Arc::new(Recording::default());
        let app = ApplicationLayer::new(recording.clone());
        let stack = Stack::build("test", network.clone(), vec![], app.clone(), StartBarrier::new());
        stack.init().unwrap();
        stack.start().unwrap();

        let net_pos = stack.network_position().clone();
        net_pos.on_recv_closed(None);
        net_pos.on_recv_closed(None);

        assert_eq!(recording.closed.load(Ordering::SeqCst), 1);
        assert!(!app.is_read_open());
    }

    #[test]
    fn close_write_cascades_to_network_stub() {
        let network = network_stub();
        let recording = Arc::new(Recording::default());
        let app = ApplicationLayer::new(recording.clone());
        let stack = Stack::build("test", network.clone(), vec![], app.clone(), StartBarrier::new());
        stack.init().unwrap();
        stack.start().unwrap();

        app.close_write();
        assert!(!app.is_write_open());
        assert!(!network.send_open.load(Ordering::Acquire));
    }
}
