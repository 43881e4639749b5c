//! The protocol stack: a doubly-linked chain of layers plus its lifecycle.
//!
//! Mirrors spec section 4.2. A [`Stack`] owns an ordered sequence of
//! [`Position`]s — one for the network layer, one per filter, one for the
//! application layer — and drives `init()`/`start()` across them in order.
//! Traversal (`on_recv`/`do_send`) is the hot path and only ever takes a
//! read lock; splicing a removed position out of the chain is the one
//! operation that needs the write lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::buffer::RecvBuf;
use crate::error::{Error, Result};

/// The receive-side half of a layer.
pub trait RecvLayer: fmt::Debug + Send + Sync {
    /// Deliver bytes flowing up toward the application.
    fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()>;

    /// Notify the layer that its receive side has closed, for the given
    /// (optional) cause. Idempotent by contract of the caller (`Position`).
    fn on_recv_closed(&self, cause: Option<Error>);

    /// Whether this layer currently accepts `on_recv`.
    fn is_recv_open(&self) -> bool;

    /// Called exactly once, when the stack physically splices this
    /// position out of the receive chain.
    fn on_recv_removed(&self) {}
}

/// The send-side half of a layer.
pub trait SendLayer: fmt::Debug + Send + Sync {
    /// Deliver bytes flowing down toward the network.
    fn do_send(&self, data: &[u8]) -> Result<()>;

    /// Close the send side. Idempotent by contract of the caller.
    fn do_close_send(&self);

    /// Whether this layer currently accepts `do_send`.
    fn is_send_open(&self) -> bool;

    /// Called exactly once, when the stack physically splices this
    /// position out of the send chain.
    fn on_send_removed(&self) {}
}

/// A full stack participant: network layer, filter, or application layer.
pub trait Layer: RecvLayer + SendLayer {
    /// Stable name for logging (`"ack"`, `"header"`, `"tls"`, ...).
    fn name(&self) -> &'static str;

    /// Called once, low position to high, before `start()`. Receives its
    /// own position so it can reach neighbors and schedule work against
    /// the stack's hub.
    fn init(&self, _position: &Arc<Position>) -> Result<()> {
        Ok(())
    }

    /// Called once, low position to high, after every `init()` has run.
    /// Layers that need to push their own handshake bytes downward (ACK,
    /// header length) do so here.
    fn start(&self) -> Result<()> {
        Ok(())
    }
}

/// A node in the stack: the layer plus mutable links to its neighbors.
///
/// Invariant (spec 3): `next_send` and `next_recv` of adjacent *active*
/// positions are mutual inverses. A position marked `removed` is skipped
/// by traversal; the first caller to notice it while holding the write
/// lock splices it out and fires `on_send_removed`/`on_recv_removed`
/// exactly once per direction.
pub struct Position {
    layer: Arc<dyn Layer>,
    /// Index into the owning stack's position list, stable for the
    /// lifetime of the stack (used only for diagnostics).
    index: usize,
    next_send: RwLock<Option<Arc<Position>>>,
    next_recv: RwLock<Option<Arc<Position>>>,
    recv_on_closed: AtomicBool,
    send_do_closed: AtomicBool,
    removed: AtomicBool,
    recv_removed_fired: AtomicBool,
    send_removed_fired: AtomicBool,
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Position")
            .field("index", &self.index)
            .field("layer", &self.layer.name())
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Position {
    fn new(layer: Arc<dyn Layer>, index: usize) -> Arc<Self> {
        Arc::new(Self {
            layer,
            index,
            next_send: RwLock::new(None),
            next_recv: RwLock::new(None),
            recv_on_closed: AtomicBool::new(false),
            send_do_closed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            recv_removed_fired: AtomicBool::new(false),
            send_removed_fired: AtomicBool::new(false),
        })
    }

    /// The layer occupying this position.
    pub fn layer(&self) -> &Arc<dyn Layer> {
        &self.layer
    }

    /// Position index within the stack (0 = network layer).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Deliver `data` to the next higher active position. Fails with
    /// `TransportClosed` (without advancing) if that position is not
    /// accepting receives.
    pub fn on_recv(self: &Arc<Self>, data: &mut RecvBuf<'_>) -> Result<()> {
        let next = self.active_next_recv();
        match next {
            Some(pos) => {
                if !pos.layer.is_recv_open() {
                    return Err(Error::TransportClosed);
                }
                pos.layer.on_recv(data)
            }
            None => Ok(()),
        }
    }

    /// Deliver `data` to the next lower active position. Same
    /// closed-channel semantics as `on_recv`.
    pub fn do_send(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let next = self.active_next_send();
        match next {
            Some(pos) => {
                if !pos.layer.is_send_open() {
                    return Err(Error::TransportClosed);
                }
                pos.layer.do_send(data)
            }
            None => Ok(()),
        }
    }

    /// Propagate a receive-side close upward exactly once.
    pub fn on_recv_closed(self: &Arc<Self>, cause: Option<Error>) {
        if self.recv_on_closed.swap(true, Ordering::AcqRel) {
            return; // already closed
        }
        self.layer.on_recv_closed(cause.clone());
        if let Some(next) = self.active_next_recv() {
            if next.layer.is_recv_open() {
                next.on_recv_closed(cause);
            }
        }
    }

    /// Propagate a send-side close downward exactly once.
    pub fn do_close_send(self: &Arc<Self>) {
        if self.send_do_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.layer.do_close_send();
        if let Some(next) = self.active_next_send() {
            if next.layer.is_send_open() {
                next.do_close_send();
            }
        }
    }

    /// Tear down both directions starting from this position: notify the
    /// next higher position that receiving has closed, close this
    /// position's (and everything lower's) send side, then close this
    /// position's own receive side. Mid-stack-initiated close (spec 4.2) —
    /// what a filter calls on itself when it aborts a handshake.
    pub fn abort(self: &Arc<Self>, cause: Option<Error>) {
        if let Some(next) = self.active_next_recv() {
            if next.layer.is_recv_open() {
                next.on_recv_closed(cause.clone());
            }
        }
        self.do_close_send();
        self.on_recv_closed(cause);
    }

    /// Mark this position for removal. The physical splice happens lazily,
    /// the next time a traversal holding the write lock notices it.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Walk `next_recv` links, splicing out any removed positions found
    /// along the way, and return the first active one (if any).
    fn active_next_recv(self: &Arc<Self>) -> Option<Arc<Position>> {
        loop {
            let candidate = self.next_recv.read().clone()?;
            if !candidate.is_removed() {
                return Some(candidate);
            }
            self.splice_recv(&candidate);
        }
    }

    fn active_next_send(self: &Arc<Self>) -> Option<Arc<Position>> {
        loop {
            let candidate = self.next_send.read().clone()?;
            if !candidate.is_removed() {
                return Some(candidate);
            }
            self.splice_send(&candidate);
        }
    }

    fn splice_recv(self: &Arc<Self>, removed: &Arc<Position>) {
        let mut ours = self.next_recv.write();
        // Re-check under the write lock: another thread may have spliced
        // already.
        if !matches!(&*ours, Some(p) if Arc::ptr_eq(p, removed)) {
            return;
        }
        let after = removed.next_recv.read().clone();
        *ours = after.clone();
        drop(ours);
        if let Some(after) = after {
            *after.next_send.write() = Some(self.clone());
        }
        if !removed.recv_removed_fired.swap(true, Ordering::AcqRel) {
            removed.layer.on_recv_removed();
        }
        debug!(position = removed.index, "spliced position out of receive chain");
    }

    fn splice_send(self: &Arc<Self>, removed: &Arc<Position>) {
        let mut ours = self.next_send.write();
        if !matches!(&*ours, Some(p) if Arc::ptr_eq(p, removed)) {
            return;
        }
        let after = removed.next_send.read().clone();
        *ours = after.clone();
        drop(ours);
        if let Some(after) = after {
            *after.next_recv.write() = Some(self.clone());
        }
        if !removed.send_removed_fired.swap(true, Ordering::AcqRel) {
            removed.layer.on_send_removed();
        }
        debug!(position = removed.index, "spliced position out of send chain");
    }
}

/// Called exactly once when the network layer's receive direction has
/// finally closed.
pub trait StackListener: Send + Sync {
    /// `cause` is `None` for a clean shutdown.
    fn on_closed(&self, stack: &Stack, cause: Option<Error>);
}

/// A fixed ordered pipeline: network layer, zero or more filters,
/// application layer.
pub struct Stack {
    name: String,
    positions: Vec<Arc<Position>>,
    listener: RwLock<Option<Arc<dyn StackListener>>>,
    notified: AtomicBool,
    start_barrier: Arc<StartBarrier>,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("positions", &self.positions.len())
            .finish()
    }
}

impl Stack {
    /// Compose a stack from a network layer, an ordered list of filters,
    /// and an application layer, linking their positions.
    pub fn build(
        name: impl Into<String>,
        network: Arc<dyn Layer>,
        filters: Vec<Arc<dyn Layer>>,
        application: Arc<dyn Layer>,
        start_barrier: Arc<StartBarrier>,
    ) -> Arc<Stack> {
        let mut layers = Vec::with_capacity(filters.len() + 2);
        layers.push(network);
        layers.extend(filters);
        layers.push(application);

        let positions: Vec<Arc<Position>> = layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| Position::new(layer, i))
            .collect();

        for w in positions.windows(2) {
            *w[0].next_recv.write() = Some(w[1].clone());
            *w[1].next_send.write() = Some(w[0].clone());
        }

        Arc::new(Stack {
            name: name.into(),
            positions,
            listener: RwLock::new(None),
            notified: AtomicBool::new(false),
            start_barrier,
        })
    }

    /// The stack's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the listener notified exactly once when the network
    /// layer's receive direction closes.
    pub fn set_listener(&self, listener: Arc<dyn StackListener>) {
        *self.listener.write() = Some(listener);
    }

    /// All positions, network layer first.
    pub fn positions(&self) -> &[Arc<Position>] {
        &self.positions
    }

    /// The network-layer position (index 0).
    pub fn network_position(&self) -> &Arc<Position> {
        &self.positions[0]
    }

    /// The application-layer position (last index).
    pub fn application_position(&self) -> &Arc<Position> {
        self.positions.last().expect("stack always has >= 2 positions")
    }

    /// Walk positions low-to-high calling `init(position)`.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        for pos in &self.positions {
            pos.layer().init(pos)?;
        }
        Ok(())
    }

    /// Walk positions low-to-high calling `start()`. If any layer's
    /// `start()` fails, the stack first propagates `on_recv_closed(cause)`
    /// to the next higher position before re-raising (spec 4.2).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        for (i, pos) in self.positions.iter().enumerate() {
            if let Err(e) = pos.layer().start() {
                warn!(stack = %self.name, position = i, error = %e, "layer start failed");
                if let Some(next) = self.positions.get(i + 1) {
                    next.on_recv_closed(Some(e.clone()));
                }
                self.start_barrier.count_down();
                return Err(e);
            }
        }
        self.start_barrier.count_down();
        Ok(())
    }

    /// Barrier blocking-variant readers wait on before their first read,
    /// so they never deliver bytes the stack isn't ready to route yet.
    pub fn start_barrier(&self) -> &Arc<StartBarrier> {
        &self.start_barrier
    }

    /// Notify the stack listener exactly once that the network layer's
    /// receive side has closed. Safe to call from any position in the
    /// chain; only the first call is delivered.
    pub fn notify_closed(&self, cause: Option<Error>) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener.read().clone() {
            listener.on_closed(self, cause);
        }
    }
}

/// A per-hub latch counted down once per stack whose `start()` completes
/// (successfully or not), never reset. Blocking-variant network readers
/// registered against the same hub wait on it before their first read
/// (spec section 9's "global stack-started barrier", scoped per hub per
/// the resolved open question — see DESIGN.md).
#[derive(Debug, Default)]
pub struct StartBarrier {
    inner: parking_lot::Mutex<BarrierState>,
    condvar: parking_lot::Condvar,
}

#[derive(Debug, Default)]
struct BarrierState {
    started: bool,
}

impl StartBarrier {
    /// A fresh, not-yet-counted-down barrier.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count the barrier down. Idempotent; never resets once tripped.
    pub fn count_down(&self) {
        let mut state = self.inner.lock();
        if !state.started {
            state.started = true;
            self.condvar.notify_all();
        }
    }

    /// Block the calling thread until the barrier has tripped.
    pub fn wait(&self) {
        let mut state = self.inner.lock();
        while !state.started {
            self.condvar.wait(&mut state);
        }
    }

    /// Non-blocking check.
    pub fn is_tripped(&self) -> bool {
        self.inner.lock().started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct PassThrough {
        name: &'static str,
        recv_open: AtomicBool,
        send_open: AtomicBool,
        received: parking_lot::Mutex<Vec<u8>>,
    }

    impl PassThrough {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                recv_open: AtomicBool::new(true),
                send_open: AtomicBool::new(true),
                received: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl RecvLayer for PassThrough {
        fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()> {
            self.received.lock().extend_from_slice(data.remaining());
            data.advance(data.remaining_len());
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
        fn do_send(&self, _data: &[u8]) -> Result<()> {
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
            self.name
        }
    }

    #[test]
    fn happy_path_delivers_bytes_to_application() {
        let network = PassThrough::new("network");
        let app = PassThrough::new("application");
        let stack = Stack::build(
            "test",
            network.clone(),
            vec![],
            app.clone(),
            StartBarrier::new(),
        );
        stack.init().unwrap();
        stack.start().unwrap();

        let net_pos = stack.network_position().clone();
        let mut buf = RecvBuf::new(b"hello");
        net_pos.on_recv(&mut buf).unwrap();
        assert_eq!(&app.received.lock()[..], b"hello");
    }

    #[test]
    fn recv_closed_is_idempotent_and_propagates_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Counting;
        impl RecvLayer for Counting {
            fn on_recv(&self, _d: &mut RecvBuf<'_>) -> Result<()> {
                Ok(())
            }
            fn on_recv_closed(&self, _cause: Option<Error>) {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }
            fn is_recv_open(&self) -> bool {
                true
            }
        }
        impl SendLayer for Counting {
            fn do_send(&self, _d: &[u8]) -> Result<()> {
                Ok(())
            }
            fn do_close_send(&self) {}
            fn is_send_open(&self) -> bool {
                true
            }
        }
        impl Layer for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
        }

        let stack = Stack::build(
            "test",
            Arc::new(Counting),
            vec![],
            Arc::new(Counting),
            StartBarrier::new(),
        );
        stack.init().unwrap();
        stack.start().unwrap();

        let net_pos = stack.network_position().clone();
        net_pos.on_recv_closed(None);
        net_pos.on_recv_closed(None);
        // Network's own on_recv_closed plus the application's, exactly once each.
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_position_is_spliced_on_next_traversal() {
        let network = PassThrough::new("network");
        let middle = PassThrough::new("middle");
        let app = PassThrough::new("application");
        let stack = Stack::build(
            "test",
            network.clone(),
            vec![middle.clone()],
            app.clone(),
            StartBarrier::new(),
        );
        stack.init().unwrap();
        stack.start().unwrap();

        stack.positions()[1].remove();
        let net_pos = stack.network_position().clone();
        let mut buf = RecvBuf::new(b"x");
        net_pos.on_recv(&mut buf).unwrap();
        assert_eq!(&app.received.lock()[..], b"x");
        // The network position's next_recv now points straight at the app.
        assert!(Arc::ptr_eq(
            &net_pos.active_next_recv().unwrap(),
            stack.application_position()
        ));
    }
}
