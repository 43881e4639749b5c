//! Connection-header filter: exchanges a pair of length-prefixed property
//! maps and a short accept/refuse response, with a reject/confirm
//! sub-protocol (spec 4.5 / 6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{ChunkQueue, RecvBuf};
use crate::error::{Error, Result};
use crate::hub::{IoHub, TimeoutHandle};
use crate::stack::{Layer, Position, RecvLayer, SendLayer};

const BYE: &[u8] = b"BYE";

/// What the caller-supplied listener decides after seeing the remote's
/// header map.
#[derive(Debug, Clone)]
pub enum HeaderDecision {
    /// Respond `OK` and proceed.
    Accept,
    /// Respond `ERROR: <reason>`; peer may retry on a new connection.
    Refuse(String),
    /// Respond `FATAL: <reason>`; peer should not retry.
    RefusePermanent(String),
}

/// Caller hook invoked once the remote's header map has been fully parsed.
pub trait HeaderListener: Send + Sync {
    /// Inspect `headers` and decide whether to proceed.
    fn on_receive_headers(&self, headers: &HashMap<String, String>) -> HeaderDecision;
}

/// Parse the line-oriented `key: value` / `# comment` text format (spec.md
/// 6) — deliberately not Java `Properties` escaping, just the
/// line/comment/trim shape.
pub fn parse_properties(text: &str) -> std::result::Result<HashMap<String, String>, ()> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(());
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(());
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Serialize a header map to the same line-oriented text format.
pub fn serialize_properties(map: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in map {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
    }
    out
}

enum RecvState {
    AwaitingHeaderLength(BytesMut),
    AwaitingHeaderContent(BytesMut, usize),
    AwaitingResponseLength(BytesMut),
    AwaitingResponseContent(BytesMut, usize),
    AwaitingByeConfirmation(BytesMut),
    Done,
}

fn fill(buf: &mut BytesMut, total: usize, data: &mut RecvBuf<'_>) -> bool {
    let need = total - buf.len();
    let take = need.min(data.remaining_len());
    buf.extend_from_slice(data.peek(take));
    data.advance(take);
    buf.len() == total
}

fn length_prefixed(content: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + content.len());
    out.put_u16(content.len() as u16);
    out.extend_from_slice(content);
    out.freeze()
}

/// Exchanges one pair of header maps and an accept/refuse response.
pub struct HeaderFilter {
    our_headers: HashMap<String, String>,
    listener: Arc<dyn HeaderListener>,
    handshaking_timeout: Duration,
    hub: Arc<IoHub>,
    weak_self: OnceLock<Weak<HeaderFilter>>,
    position: OnceLock<Arc<Position>>,
    recv_state: Mutex<RecvState>,
    send_queue: Mutex<ChunkQueue>,
    recv_queue: Mutex<ChunkQueue>,
    handshake_timeout_handle: Mutex<Option<TimeoutHandle>>,
    bye_timeout_handle: Mutex<Option<TimeoutHandle>>,
    local_refusal_cause: Mutex<Option<Error>>,
    completed: AtomicBool,
    aborted: AtomicBool,
    abort_cause: Mutex<Option<Error>>,
    send_open: AtomicBool,
}

impl HeaderFilter {
    /// Build a filter that will send `our_headers` and hand the remote's
    /// headers to `listener` once fully received.
    pub fn new(
        our_headers: HashMap<String, String>,
        listener: Arc<dyn HeaderListener>,
        handshaking_timeout: Duration,
        hub: Arc<IoHub>,
    ) -> Arc<Self> {
        let filter = Arc::new(Self {
            our_headers,
            listener,
            handshaking_timeout,
            hub,
            weak_self: OnceLock::new(),
            position: OnceLock::new(),
            recv_state: Mutex::new(RecvState::AwaitingHeaderLength(BytesMut::new())),
            send_queue: Mutex::new(ChunkQueue::new()),
            recv_queue: Mutex::new(ChunkQueue::new()),
            handshake_timeout_handle: Mutex::new(None),
            bye_timeout_handle: Mutex::new(None),
            local_refusal_cause: Mutex::new(None),
            completed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_cause: Mutex::new(None),
            send_open: AtomicBool::new(true),
        });
        let _ = filter.weak_self.set(Arc::downgrade(&filter));
        filter
    }

    fn cause_or_closed(&self) -> Error {
        self.abort_cause.lock().clone().unwrap_or(Error::TransportClosed)
    }

    fn abort(&self, cause: Error) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(error = %cause, "connection-header filter: aborting");
        *self.abort_cause.lock() = Some(cause.clone());
        self.send_open.store(false, Ordering::Release);
        if let Some(handle) = self.handshake_timeout_handle.lock().take() {
            handle.cancel();
        }
        if let Some(handle) = self.bye_timeout_handle.lock().take() {
            handle.cancel();
        }
        if let Some(position) = self.position.get() {
            position.abort(Some(cause));
        }
    }

    /// Begin the aborting sub-state after WE decided to refuse the peer:
    /// send the refusal response, then wait for `BYE` or a timeout.
    fn begin_local_refusal(&self, response: &'static str, reason: String, permanent: bool) {
        let cause = if permanent {
            Error::refused_permanent(reason.clone())
        } else {
            Error::refused(reason.clone())
        };
        *self.local_refusal_cause.lock() = Some(cause);

        if let Some(position) = self.position.get() {
            let body = format!("{response}{reason}");
            let _ = position.do_send(&length_prefixed(body.as_bytes()));
        }

        let weak = self.weak_self.get().expect("constructed via new").clone();
        let handle = self.hub.execute_later(
            move || {
                if let Some(filter) = weak.upgrade() {
                    let cause = filter
                        .local_refusal_cause
                        .lock()
                        .clone()
                        .unwrap_or(Error::Timeout("connection header bye"));
                    filter.abort(cause);
                }
            },
            self.handshaking_timeout,
        );
        *self.bye_timeout_handle.lock() = Some(handle);
    }

    fn finish_success(&self) -> Result<()> {
        self.completed.store(true, Ordering::Release);
        if let Some(handle) = self.handshake_timeout_handle.lock().take() {
            handle.cancel();
        }
        debug!("connection-header filter: handshake complete");

        if let Some(position) = self.position.get() {
            let queued_send = self.send_queue.lock().drain_all();
            if !queued_send.is_empty() {
                position.do_send(&queued_send)?;
            }
            let queued_recv = self.recv_queue.lock().drain_all();
            if !queued_recv.is_empty() {
                let mut buf = RecvBuf::new(&queued_recv);
                position.on_recv(&mut buf)?;
            }
            position.remove();
        }
        Ok(())
    }
}

impl std::fmt::Debug for HeaderFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderFilter")
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

impl RecvLayer for HeaderFilter {
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

        loop {
            let mut state = self.recv_state.lock();
            match &mut *state {
                RecvState::AwaitingHeaderLength(buf) => {
                    if !fill(buf, 2, data) {
                        return Ok(());
                    }
                    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                    *state = RecvState::AwaitingHeaderContent(BytesMut::new(), len);
                }
                RecvState::AwaitingHeaderContent(buf, len) => {
                    let len = *len;
                    if !fill(buf, len, data) {
                        return Ok(());
                    }
                    let text = match std::str::from_utf8(buf) {
                        Ok(t) => t.to_string(),
                        Err(_) => {
                            drop(state);
                            self.begin_local_refusal("ERROR: ", "Malformed connection header".into(), false);
                            *self.recv_state.lock() = RecvState::AwaitingByeConfirmation(BytesMut::new());
                            continue;
                        }
                    };
                    match parse_properties(&text) {
                        Ok(headers) => {
                            drop(state);
                            match self.listener.on_receive_headers(&headers) {
                                HeaderDecision::Accept => {
                                    if let Some(position) = self.position.get() {
                                        let _ = position.do_send(&length_prefixed(b"OK"));
                                    }
                                    *self.recv_state.lock() =
                                        RecvState::AwaitingResponseLength(BytesMut::new());
                                }
                                HeaderDecision::Refuse(reason) => {
                                    self.begin_local_refusal("ERROR: ", reason, false);
                                    *self.recv_state.lock() =
                                        RecvState::AwaitingByeConfirmation(BytesMut::new());
                                }
                                HeaderDecision::RefusePermanent(reason) => {
                                    self.begin_local_refusal("FATAL: ", reason, true);
                                    *self.recv_state.lock() =
                                        RecvState::AwaitingByeConfirmation(BytesMut::new());
                                }
                            }
                        }
                        Err(()) => {
                            drop(state);
                            self.begin_local_refusal("ERROR: ", "Malformed connection header".into(), false);
                            *self.recv_state.lock() = RecvState::AwaitingByeConfirmation(BytesMut::new());
                        }
                    }
                }
                RecvState::AwaitingResponseLength(buf) => {
                    if !fill(buf, 2, data) {
                        return Ok(());
                    }
                    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                    *state = RecvState::AwaitingResponseContent(BytesMut::new(), len);
                }
                RecvState::AwaitingResponseContent(buf, len) => {
                    let len = *len;
                    if !fill(buf, len, data) {
                        return Ok(());
                    }
                    let text = String::from_utf8_lossy(buf).to_string();
                    drop(state);

                    if text == "OK" {
                        *self.recv_state.lock() = RecvState::Done;
                        self.finish_success()?;
                        if data.has_remaining() {
                            if let Some(position) = self.position.get() {
                                position.on_recv(data)?;
                            }
                        }
                        return Ok(());
                    } else if let Some(reason) = text.strip_prefix("ERROR: ") {
                        if let Some(position) = self.position.get() {
                            let _ = position.do_send(BYE);
                        }
                        *self.recv_state.lock() = RecvState::Done;
                        self.abort(Error::refused(reason.to_string()));
                        return Err(self.cause_or_closed());
                    } else if let Some(reason) = text.strip_prefix("FATAL: ") {
                        if let Some(position) = self.position.get() {
                            let _ = position.do_send(BYE);
                        }
                        *self.recv_state.lock() = RecvState::Done;
                        self.abort(Error::refused_permanent(reason.to_string()));
                        return Err(self.cause_or_closed());
                    } else {
                        *self.recv_state.lock() = RecvState::Done;
                        let cause = Error::protocol(format!("unrecognized header response: {text:?}"));
                        self.abort(cause.clone());
                        return Err(cause);
                    }
                }
                RecvState::AwaitingByeConfirmation(buf) => {
                    if !fill(buf, BYE.len(), data) {
                        return Ok(());
                    }
                    drop(state);
                    let cause = self
                        .local_refusal_cause
                        .lock()
                        .clone()
                        .unwrap_or(Error::TransportClosed);
                    self.abort(cause.clone());
                    return Err(cause);
                }
                RecvState::Done => return Ok(()),
            }
        }
    }

    fn on_recv_closed(&self, cause: Option<Error>) {
        self.abort(cause.unwrap_or(Error::TransportClosed));
    }

    fn is_recv_open(&self) -> bool {
        !self.aborted.load(Ordering::Acquire)
    }
}

impl SendLayer for HeaderFilter {
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

impl Layer for HeaderFilter {
    fn name(&self) -> &'static str {
        "header"
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
                    filter.abort(Error::Timeout("connection header"));
                }
            },
            self.handshaking_timeout,
        );
        *self.handshake_timeout_handle.lock() = Some(handle);

        let content = serialize_properties(&self.our_headers);
        position.do_send(&length_prefixed(content.as_bytes()))
    }
}
