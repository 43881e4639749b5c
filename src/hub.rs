//! The I/O hub: a selector thread multiplexing registered channels, a
//! deadline-ordered timer queue, and a worker pool that runs everything
//! that isn't the selector's own poll (spec section 4.1).
//!
//! Grounded in the teacher's `Listener`/`MultiListener` (`mio::{Poll,
//! Events, Token, Interest, Waker}` plus a `slab::Slab` of registered
//! state) and `Worker` (a `crossbeam_channel` receiver driving a pool of
//! OS threads). The watchdog and overheat guard are literal translations
//! of spec 4.1's platform-workaround paragraphs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::env;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, warn};

use crate::buffer::BufferPool;
use crate::error::{Error, Result};

const WATCHDOG_ENV: &str = "PROTOHUB_WATCHDOG_MILLIS";
const DEFAULT_WATCHDOG_MILLIS: u64 = 1000;
const OVERHEAT_WINDOW: Duration = Duration::from_millis(100);

/// A task dispatched to the worker pool.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked with the readiness flags for a registered channel.
/// Ready bits are cleared from the interest set *before* dispatch, so a
/// handler is never invoked twice concurrently for the same token — only
/// the handler itself re-arms interest (spec 5, ordering guarantees).
pub trait ReadyListener: Send + Sync {
    /// `accept`/`connect`/`read`/`write` mirror the four operations a
    /// selector can report.
    fn ready(&self, accept: bool, connect: bool, read: bool, write: bool);
}

/// Opaque handle to a registered channel. Used to request interest
/// changes or to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(pub(crate) Token);

/// A cancellable, future-like handle to a scheduled task.
pub struct TimeoutHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl TimeoutHandle {
    /// Request cancellation. A no-op if the task has already started
    /// running or already fired.
    pub fn cancel(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return false;
        }
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the task has already run.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

struct ScheduledTask {
    deadline: Instant,
    id: u64,
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    task: Task,
}

// `BinaryHeap` is a max-heap; order by *earliest* deadline first via `Reverse`.
struct HeapEntry {
    deadline: Instant,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

enum RegistryOp {
    Register {
        fd: RawFd,
        listener: Arc<dyn ReadyListener>,
        interest: Interest,
        kind: SourceKind,
        reply: Sender<io::Result<RegistrationToken>>,
    },
    AddInterest(Token, Interest),
    RemoveInterest(Token, Interest),
    Unregister(Token),
}

/// What a registered channel's readiness *means*. `mio::Interest` only
/// has readable/writable; a listening socket's readability means
/// "accept ready", a connecting socket's writability means "connect
/// completed", and an established stream's readable/writable mean
/// exactly that. The hub tags each registration with its kind so
/// `ReadyListener::ready` can report the semantically correct flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A listening socket; readability means a connection is acceptable.
    Listener,
    /// A socket mid-`connect()`; writability means the connect completed.
    Connecting,
    /// An established stream; readable/writable mean exactly that.
    Stream,
}

struct SlotState {
    fd: RawFd,
    listener: Arc<dyn ReadyListener>,
    interest: Interest,
    kind: SourceKind,
}

/// The shared reactor: one selector thread, a worker pool, and a buffer
/// pool every network layer acquires/releases through.
pub struct IoHub {
    registry: Registry,
    waker: Arc<Waker>,
    registry_ops_tx: Sender<RegistryOp>,
    selector_tasks_tx: Sender<Task>,
    worker_tx: Sender<Task>,
    timers: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
    timer_tasks: Arc<Mutex<std::collections::HashMap<u64, ScheduledTask>>>,
    timer_seq: AtomicU64,
    closed: Arc<AtomicBool>,
    buffer_pool: Arc<BufferPool>,
    start_barrier: Arc<crate::stack::StartBarrier>,
    _selector_thread: thread::JoinHandle<()>,
    _workers: Vec<thread::JoinHandle<()>>,
}

/// Construction knobs for an [`IoHub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of worker threads draining ready events and scheduled tasks.
    pub worker_threads: usize,
    /// Buffer pool chunk size, in bytes.
    pub buffer_chunk_size: usize,
    /// Buffer pool capacity (idle buffers kept around).
    pub buffer_pool_capacity: usize,
    /// Maximum events drained from the selector per wakeup.
    pub events_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus(),
            buffer_chunk_size: 64 * 1024,
            buffer_pool_capacity: 256,
            events_capacity: 1024,
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn watchdog_interval() -> Duration {
    let millis = env::var(WATCHDOG_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_WATCHDOG_MILLIS);
    Duration::from_millis(millis)
}

impl IoHub {
    /// Spin up the selector thread and worker pool.
    pub fn new(config: HubConfig) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        const WAKE_TOKEN: Token = Token(usize::MAX);
        let waker = Arc::new(Waker::new(&registry, WAKE_TOKEN)?);

        let (registry_ops_tx, registry_ops_rx) = unbounded::<RegistryOp>();
        let (selector_tasks_tx, selector_tasks_rx) = unbounded::<Task>();
        let (worker_tx, worker_rx) = unbounded::<Task>();

        let timers: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>> = Arc::new(Mutex::new(BinaryHeap::new()));
        let timer_tasks = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let selector_closed = closed.clone();
        let selector_timers = timers.clone();
        let selector_timer_tasks = timer_tasks.clone();
        let selector_worker_tx = worker_tx.clone();
        let selector_waker = waker.clone();

        let events_capacity = config.events_capacity;
        let selector_thread = thread::Builder::new()
            .name("protohub-selector".into())
            .spawn(move || {
                run_selector_loop(
                    poll,
                    WAKE_TOKEN,
                    registry_ops_rx,
                    selector_tasks_rx,
                    selector_worker_tx,
                    selector_timers,
                    selector_timer_tasks,
                    selector_closed,
                    selector_waker,
                    events_capacity,
                );
            })
            .expect("failed to spawn selector thread");

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads.max(1) {
            let rx: Receiver<Task> = worker_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("protohub-worker-{i}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        let buffer_pool = Arc::new(BufferPool::new(config.buffer_chunk_size, config.buffer_pool_capacity));

        Ok(Arc::new(Self {
            registry,
            waker,
            registry_ops_tx,
            selector_tasks_tx,
            worker_tx,
            timers,
            timer_tasks,
            timer_seq: AtomicU64::new(0),
            closed,
            buffer_pool,
            start_barrier: crate::stack::StartBarrier::new(),
            _selector_thread: selector_thread,
            _workers: workers,
        }))
    }

    /// The per-hub stack-start barrier (spec 9's resolved open question).
    pub fn start_barrier(&self) -> &Arc<crate::stack::StartBarrier> {
        &self.start_barrier
    }

    /// The shared buffer pool.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Enqueue a task on the worker pool, unordered with respect to other
    /// tasks.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }
        self.worker_tx
            .send(Box::new(task))
            .map_err(|_| Error::TransportClosed)
    }

    /// Enqueue a task to run on the selector thread before the next
    /// blocking poll, waking the selector if it's already parked.
    pub fn execute_on_selector(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }
        self.selector_tasks_tx
            .send(Box::new(task))
            .map_err(|_| Error::TransportClosed)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Schedule `task` to run once, no sooner than `delay` from now.
    pub fn execute_later(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> TimeoutHandle {
        let id = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;

        self.timer_tasks.lock().insert(
            id,
            ScheduledTask {
                deadline,
                id,
                cancelled: cancelled.clone(),
                fired: fired.clone(),
                task: Box::new(task),
            },
        );
        self.timers.lock().push(Reverse(HeapEntry { deadline, seq: id }));
        let _ = self.waker.wake();

        TimeoutHandle { id, cancelled, fired }
    }

    /// Register a channel with the selector, with the given initial
    /// interest. The registration completes asynchronously on the
    /// selector thread; this call blocks only on a channel round-trip,
    /// not on I/O.
    ///
    /// The hub tracks the file descriptor, not the socket itself — the
    /// caller keeps the socket and performs its own reads/writes from
    /// within its `ReadyListener::ready` callback. This lets one object
    /// own the stream for the whole connection's lifetime instead of
    /// handing it to the hub and getting it back piecemeal.
    pub fn register<S: AsRawFd>(
        &self,
        source: &S,
        listener: Arc<dyn ReadyListener>,
        interest: Interest,
        kind: SourceKind,
    ) -> io::Result<RegistrationToken> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.registry_ops_tx
            .send(RegistryOp::Register {
                fd: source.as_raw_fd(),
                listener,
                interest,
                kind,
                reply: reply_tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "hub is shut down"))?;
        let _ = self.waker.wake();
        reply_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "hub is shut down"))?
    }

    /// Request that `interest` be added to a registered channel's
    /// interest set.
    pub fn add_interest(&self, token: RegistrationToken, interest: Interest) {
        let _ = self.registry_ops_tx.send(RegistryOp::AddInterest(token.0, interest));
        let _ = self.waker.wake();
    }

    /// Request that `interest` be removed from a registered channel's
    /// interest set.
    pub fn remove_interest(&self, token: RegistrationToken, interest: Interest) {
        let _ = self.registry_ops_tx.send(RegistryOp::RemoveInterest(token.0, interest));
        let _ = self.waker.wake();
    }

    /// Cancel a registration and detach its listener.
    pub fn unregister(&self, token: RegistrationToken) {
        let _ = self.registry_ops_tx.send(RegistryOp::Unregister(token.0));
        let _ = self.waker.wake();
    }

    /// Shut the selector down. Outstanding `register`/`execute` calls
    /// fail with `TransportClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Raw registry, used by network-layer variants that register
    /// themselves directly rather than boxing a `Source`.
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[allow(clippy::too_many_arguments)]
fn run_selector_loop(
    mut poll: Poll,
    wake_token: Token,
    registry_ops_rx: Receiver<RegistryOp>,
    selector_tasks_rx: Receiver<Task>,
    worker_tx: Sender<Task>,
    timers: Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>,
    timer_tasks: Arc<Mutex<std::collections::HashMap<u64, ScheduledTask>>>,
    closed: Arc<AtomicBool>,
    waker: Arc<Waker>,
    events_capacity: usize,
) {
    let mut slots: Slab<SlotState> = Slab::new();
    let mut events = Events::with_capacity(events_capacity);

    // Watchdog: wake the selector on an interval, in case this platform's
    // blocking poll doesn't reliably return on `Waker::wake`.
    let watchdog_interval = watchdog_interval();
    let watchdog_waker = waker.clone();
    let watchdog_closed = closed.clone();
    thread::spawn(move || loop {
        thread::sleep(watchdog_interval);
        if watchdog_closed.load(Ordering::Acquire) {
            return;
        }
        let _ = watchdog_waker.wake();
    });

    let mut recent_errors: Vec<Instant> = Vec::new();

    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }

        // 1. Drain expired scheduled tasks.
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = timers.lock();
                match heap.peek() {
                    Some(Reverse(entry)) if entry.deadline <= now => heap.pop().map(|Reverse(e)| e.seq),
                    _ => None,
                }
            };
            let Some(seq) = due else { break };
            let scheduled = timer_tasks.lock().remove(&seq);
            if let Some(scheduled) = scheduled {
                if !scheduled.cancelled.load(Ordering::Acquire) {
                    let fired = scheduled.fired.clone();
                    let task = scheduled.task;
                    let _ = worker_tx.send(Box::new(move || {
                        fired.store(true, Ordering::Release);
                        task();
                    }));
                }
            }
        }

        // 2. Drain pending registrations.
        let mut did_work = false;
        while let Ok(op) = registry_ops_rx.try_recv() {
            did_work = true;
            match op {
                RegistryOp::Register {
                    fd,
                    listener,
                    interest,
                    kind,
                    reply,
                } => {
                    let entry = slots.vacant_entry();
                    let token = Token(entry.key());
                    match poll.registry().register(&mut SourceFd(&fd), token, interest) {
                        Ok(()) => {
                            entry.insert(SlotState { fd, listener, interest, kind });
                            let _ = reply.send(Ok(RegistrationToken(token)));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                RegistryOp::AddInterest(token, add) => {
                    if let Some(slot) = slots.get_mut(token.0) {
                        slot.interest = slot.interest.add(add);
                        let _ = poll.registry().reregister(&mut SourceFd(&slot.fd), token, slot.interest);
                    }
                }
                RegistryOp::RemoveInterest(token, remove) => {
                    if let Some(slot) = slots.get_mut(token.0) {
                        if let Some(next) = subtract(slot.interest, remove) {
                            slot.interest = next;
                            let _ = poll.registry().reregister(&mut SourceFd(&slot.fd), token, slot.interest);
                        }
                    }
                }
                RegistryOp::Unregister(token) => {
                    if slots.contains(token.0) {
                        let slot = slots.remove(token.0);
                        let _ = poll.registry().deregister(&mut SourceFd(&slot.fd));
                    }
                }
            }
        }

        // 3. Drain selector-thread tasks.
        while let Ok(task) = selector_tasks_rx.try_recv() {
            did_work = true;
            task();
        }

        // 4. Poll: non-blocking if we just did work (more may have arrived
        // meanwhile), otherwise block until the next timer deadline or a
        // wakeup.
        let timeout = if did_work {
            Some(Duration::from_millis(0))
        } else {
            next_timer_timeout(&timers)
        };

        match poll.poll(&mut events, timeout) {
            Ok(()) => {
                recent_errors.clear();
                for event in events.iter() {
                    if event.token() == wake_token {
                        continue;
                    }
                    let token = event.token();
                    if let Some(slot) = slots.get_mut(token.0) {
                        // Clear ready bits from interest before dispatch,
                        // so only the handler re-arms them (spec 5).
                        let mut cleared = slot.interest;
                        if event.is_readable() {
                            cleared = subtract(cleared, Interest::READABLE).unwrap_or(cleared);
                        }
                        if event.is_writable() {
                            cleared = subtract(cleared, Interest::WRITABLE).unwrap_or(cleared);
                        }
                        if cleared != slot.interest {
                            slot.interest = cleared;
                            let _ = poll.registry().reregister(&mut SourceFd(&slot.fd), token, slot.interest);
                        }

                        let listener = slot.listener.clone();
                        let (accept, connect, read, write) = match slot.kind {
                            SourceKind::Listener => (event.is_readable(), false, false, false),
                            SourceKind::Connecting => (false, event.is_writable(), false, event.is_writable()),
                            SourceKind::Stream => (false, false, event.is_readable(), event.is_writable()),
                        };
                        let _ = worker_tx.send(Box::new(move || {
                            listener.ready(accept, connect, read, write);
                        }));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "selector poll failed");
                recent_errors.push(Instant::now());
                recent_errors.retain(|t| t.elapsed() < OVERHEAT_WINDOW);
                if recent_errors.len() > 3 {
                    thread::sleep(Duration::from_millis(5));
                } else {
                    thread::yield_now();
                }
            }
        }
    }
}

fn next_timer_timeout(timers: &Arc<Mutex<BinaryHeap<Reverse<HeapEntry>>>>) -> Option<Duration> {
    let heap = timers.lock();
    heap.peek().map(|Reverse(entry)| {
        let now = Instant::now();
        if entry.deadline <= now {
            Duration::from_millis(0)
        } else {
            entry.deadline - now
        }
    })
}

fn subtract(current: Interest, remove: Interest) -> Option<Interest> {
    // `mio::Interest` has no removal API; approximate by reconstructing
    // from the readable/writable flags that remain.
    let keep_read = current.is_readable() && !remove.is_readable();
    let keep_write = current.is_writable() && !remove.is_writable();
    match (keep_read, keep_write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn execute_runs_on_worker_pool() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        hub.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        hub.close();
    }

    #[test]
    fn execute_later_respects_cancellation() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = hub.execute_later(move || fired2.store(true, Ordering::SeqCst), Duration::from_millis(200));
        assert!(handle.cancel());
        thread::sleep(Duration::from_millis(400));
        assert!(!fired.load(Ordering::SeqCst));
        hub.close();
    }

    #[test]
    fn execute_later_fires_when_not_cancelled() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        hub.execute_later(move || tx.send(()).unwrap(), Duration::from_millis(10));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        hub.close();
    }

    #[test]
    fn execute_after_close_fails() {
        let hub = IoHub::new(HubConfig {
            worker_threads: 1,
            ..HubConfig::default()
        })
        .unwrap();
        hub.close();
        thread::sleep(Duration::from_millis(50));
        assert!(hub.execute(|| {}).is_err());
    }
}
