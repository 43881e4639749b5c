use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use protohub::buffer::RecvBuf;
use protohub::error::{Error, Result};
use protohub::filters::ack::AckFilter;
use protohub::hub::{HubConfig, IoHub};
use protohub::stack::{Layer, Position, RecvLayer, SendLayer, Stack, StartBarrier};

#[derive(Debug, Default)]
struct Sink {
    recv_open: AtomicBool,
    send_open: AtomicBool,
}

impl Sink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            recv_open: AtomicBool::new(true),
            send_open: AtomicBool::new(true),
        })
    }
}

impl RecvLayer for Sink {
    fn on_recv(&self, data: &mut RecvBuf<'_>) -> Result<()> {
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

impl SendLayer for Sink {
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

impl Layer for Sink {
    fn name(&self) -> &'static str {
        "sink"
    }
}

fn established_stack() -> (Arc<IoHub>, Arc<Stack>) {
    let hub = IoHub::new(HubConfig {
        worker_threads: 1,
        ..HubConfig::default()
    })
    .unwrap();
    let network = Sink::new();
    let app = Sink::new();
    let ack = AckFilter::with_default_sentinel(Duration::from_secs(5), hub.clone());
    let stack = Stack::build("bench", network, vec![ack], app, StartBarrier::new());
    stack.init().unwrap();
    stack.start().unwrap();

    let net_pos = stack.network_position().clone();
    let mut buf = RecvBuf::new(b"ACK");
    net_pos.on_recv(&mut buf).unwrap();

    (hub, stack)
}

fn post_handshake_throughput(c: &mut Criterion) {
    let (_hub, stack) = established_stack();
    let net_pos = stack.network_position().clone();
    let payload = vec![0u8; 4096];

    c.bench_function("ack_filter_passthrough_4k", |b| {
        b.iter(|| {
            let mut buf = RecvBuf::new(black_box(&payload));
            net_pos.on_recv(&mut buf).unwrap();
        })
    });
}

fn handshake_cost(c: &mut Criterion) {
    c.bench_function("ack_filter_handshake", |b| {
        b.iter(|| {
            let (hub, stack) = established_stack();
            hub.close();
            black_box(stack);
        })
    });
}

criterion_group!(benches, post_handshake_throughput, handshake_cost);
criterion_main!(benches);
