//! ACK filter: a short fixed byte sequence exchanged before any
//! application traffic is allowed through (spec 4.4 / 6).
//!
//! Grounded in the teacher's `Connection`/`ConnectionBuilder` handshake
//! idiom (a fixed state machine pumped by successive `on_recv` calls) and
//! in the stack's own mid-stack abort contract (`Position::abort`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{ChunkQueue, RecvBuf};
use crate::error::{Error, Result};
use crate::hub::{IoHub, TimeoutHandle};
use crate::stack::{Layer, Position, RecvLayer, SendLayer};

/// Default sentinel, the three bytes `ACK` (spec.md 6).
pub const DEFAULT_SENTINEL: &[u8] = b"ACK";

/// A three-byte (configurable) sentinel exchange run once at the bottom
/// of a stack, immediately above the network layer.
pub struct AckFilter {
    sentinel: Bytes,
    handshaking_timeout: Duration,
    hub: Arc<IoHub>,
    weak_self: OnceLock<Weak<AckFilter>>,
    recv_ack: Mutex<BytesMut>,
    send_queue: Mutex<ChunkQueue>,
    recv_queue: Mutex<ChunkQueue>,
    timeout: Mutex<Option<TimeoutHandle>>,
    position: OnceLock<Arc<Position>>,
    completed: AtomicBool,
    aborted: AtomicBool,
    abort_cause: Mutex<Option<Error>>,
    send_open: AtomicBool,
}

impl AckFilter {
    /// Build a filter expecting and sending `sentinel`, aborting if no ACK
    /// arrives within `handshaking_timeout` of `start()`.
    pub fn new(sentinel: Bytes, handshaking_timeout: Duration, hub: Arc<IoHub>) -> Arc<Self> {
        let filter = Arc::new(Self {
            sentinel,
            handshaking_timeout,
            hub,
            weak_self: OnceLock::new(),
            recv_ack: Mutex::new(BytesMut::new()),
            send_queue: Mutex::new(ChunkQueue::new()),
            recv_queue: Mutex::new(ChunkQueue::new()),
            timeout: Mutex::new(None),
            position: OnceLock::new(),
            completed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_cause: Mutex::new(None),
            send_open: AtomicBool::new(true),
        });
        let _ = filter.weak_self.set(Arc::downgrade(&filter));
        filter
    }

    /// The default filter: sentinel `b"ACK"`, caller-supplied timeout.
    pub fn with_default_sentinel(handshaking_timeout: Duration, hub: Arc<IoHub>) -> Arc<Self> {
        Self::new(Bytes::from_static(DEFAULT_SENTINEL), handshaking_timeout, hub)
    }

    fn abort(&self, cause: Error) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(error = %cause, "ack filter: aborting");
        *self.abort_cause.lock() = Some(cause.clone());
        self.send_open.store(false, Ordering::Release);
        if let Some(handle) = self.timeout.lock().take() {
            handle.cancel();
        }
        if let Some(position) = self.position.get() {
            position.abort(Some(cause));
        }
    }

    fn cause_or_closed(&self) -> Error {
        self.abort_cause.lock().clone().unwrap_or(Error::TransportClosed)
    }
}

impl std::fmt::Debug for AckFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckFilter")
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

impl RecvLayer for AckFilter {
    fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(self.cause_or_closed());
        }

        if self.completed.load(Ordering::Acquire) {
            return match self.position.get() {
                Some(position) => position.on_recv(data),
                None => Ok(()),
            };
        }

        {
            let mut recv_ack = self.recv_ack.lock();
            while recv_ack.len() < self.sentinel.len() && data.has_remaining() {
                let want = self.sentinel.len() - recv_ack.len();
                let take = want.min(data.remaining_len());
                let start = recv_ack.len();
                recv_ack.extend_from_slice(data.peek(take));
                data.advance(take);
                if recv_ack[start..] != self.sentinel[start..start + take] {
                    let mismatch = Error::refused(format!(
                        "ack mismatch at byte {start}: expected {:02x?}, got {:02x?}",
                        &self.sentinel[start..start + take],
                        &recv_ack[start..]
                    ));
                    drop(recv_ack);
                    self.abort(mismatch.clone());
                    return Err(mismatch);
                }
            }
            if recv_ack.len() < self.sentinel.len() {
                return Ok(());
            }
        }

        if let Some(handle) = self.timeout.lock().take() {
            handle.cancel();
        }
        self.completed.store(true, Ordering::Release);
        debug!("ack filter: handshake complete");

        let Some(position) = self.position.get() else {
            return Ok(());
        };

        let queued_send = self.send_queue.lock().drain_all();
        if !queued_send.is_empty() {
            position.do_send(&queued_send)?;
        }
        let queued_recv = self.recv_queue.lock().drain_all();
        if !queued_recv.is_empty() {
            let mut buf = RecvBuf::new(&queued_recv);
            position.on_recv(&mut buf)?;
        }
        if data.has_remaining() {
            position.on_recv(data)?;
        }
        Ok(())
    }

    fn on_recv_closed(&self, cause: Option<Error>) {
        self.abort(cause.unwrap_or(Error::TransportClosed));
    }

    fn is_recv_open(&self) -> bool {
        !self.aborted.load(Ordering::Acquire)
    }
}

impl SendLayer for AckFilter {
    fn do_send(&self, data: &[u8]) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(self.cause_or_closed());
        }
        if self.completed.load(Ordering::Acquire) {
            return match self.position.get() {
                Some(position) => position.do_send(data),
                None => Ok(()),
            };
        }
        self.send_queue.lock().put(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn do_close_send(&self) {
        self.send_open.store(false, Ordering::Release);
    }

    fn is_send_open(&self) -> bool {
        !self.aborted.load(Ordering::Acquire) && self.send_open.load(Ordering::Acquire)
    }
}

impl Layer for AckFilter {
    fn name(&self) -> &'static str {
        "ack"
    }

    fn init(&self, position: &Arc<Position>) -> Result<()> {
        let _ = self.position.set(position.clone());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let position = self.position.get().expect("init runs before start").clone();
        let weak = self.weak_self.get().expect("constructed via new").clone();
        let handle = self.hub.execute_later(
            move || {
                if let Some(filter) = weak.upgrade() {
                    filter.abort(Error::Timeout("ack"));
                }
            },
            self.handshaking_timeout,
        );
        *self.timeout.lock() = Some(handle);
        position.do_send(&self.sentinel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::stack::{Stack, StartBarrier};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Capture {
        down: Mutex<Vec<u8>>,
        up: Mutex<Vec<u8>>,
        closed: AtomicUsize,
    }

    impl RecvLayer for Capture {
        fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()> {
            self.up.lock().extend_from_slice(data.remaining());
            data.advance(data.remaining_len());
            Ok(())
        }
        fn on_recv_closed(&self, _cause: Option<Error>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn is_recv_open(&self) -> bool {
            true
        }
    }
    impl SendLayer for Capture {
        fn do_send(&self, data: &[u8]) -> Result<()> {
            self.down.lock().extend_from_slice(data);
            Ok(())
        }
        fn do_close_send(&self) {}
        fn is_send_open(&self) -> bool {
            true
        }
    }
    impl Layer for Capture {
        fn name(&self) -> &'static str {
            "capture"
        }
    }

    fn build(hub: Arc<IoHub>) -> (Arc<Stack>, Arc<Capture>, Arc<Capture>, Arc<AckFilter>) {
        let network = Arc::new(Capture::default());
        let app = Arc::new(Capture::default());
        let ack = AckFilter::with_default_sentinel(Duration::from_secs(5), hub);
        let stack = Stack::build(
            "test",
            network.clone(),
            vec![ack.clone()],
            app.clone(),
            StartBarrier::new(),
        );
        stack.init().unwrap();
        stack.start().unwrap();
        (stack, network, app, ack)
    }

    #[test]
    fn happy_path_forwards_bytes_after_ack() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let (stack, network, app, _ack) = build(hub.clone());

        assert_eq!(&network.down.lock()[..], DEFAULT_SENTINEL);

        let net_pos = stack.network_position().clone();
        let mut incoming = Vec::new();
        incoming.extend_from_slice(DEFAULT_SENTINEL);
        incoming.extend_from_slice(b"hello");
        let mut buf = RecvBuf::new(&incoming);
        net_pos.on_recv(&mut buf).unwrap();

        assert_eq!(&app.up.lock()[..], b"hello");
        hub.close();
    }

    #[test]
    fn mismatched_ack_aborts() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let (stack, _network, app, _ack) = build(hub.clone());

        let net_pos = stack.network_position().clone();
        let mut buf = RecvBuf::new(b"XYZ");
        let err = net_pos.on_recv(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Refused { permanent: false, .. }));
        assert_eq!(app.closed.load(Ordering::SeqCst), 1);
        hub.close();
    }

    #[test]
    fn send_before_ack_completes_is_queued_then_flushed() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let (stack, network, _app, _ack) = build(hub.clone());

        let app_pos = stack.application_position().clone();
        app_pos.do_send(b"queued").unwrap();
        assert_eq!(&network.down.lock()[..], DEFAULT_SENTINEL);

        let net_pos = stack.network_position().clone();
        let mut buf = RecvBuf::new(DEFAULT_SENTINEL);
        net_pos.on_recv(&mut buf).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(DEFAULT_SENTINEL);
        expected.extend_from_slice(b"queued");
        assert_eq!(&network.down.lock()[..], &expected[..]);
        hub.close();
    }
}
