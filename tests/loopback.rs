//! End-to-end loopback: two in-process stacks over a real
//! `TcpListener`/`TcpStream` pair, driving the non-blocking network layer,
//! the ACK filter, the connection-header filter, and the application
//! layer together. Mirrors the pack's own loopback-style integration
//! tests (a real socket pair rather than in-process stubs).

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protohub::error::Error;
use protohub::filters::ack::AckFilter;
use protohub::filters::header::{HeaderDecision, HeaderFilter, HeaderListener};
use protohub::hub::{HubConfig, IoHub};
use protohub::net::NonBlockingNetworkLayer;
use protohub::stack::{Stack, StackListener};

use protohub::app::{ApplicationLayer, ApplicationListener};

struct AcceptAll;
impl HeaderListener for AcceptAll {
    fn on_receive_headers(&self, _headers: &HashMap<String, String>) -> HeaderDecision {
        HeaderDecision::Accept
    }
}

#[derive(Default)]
struct Recorder {
    reads: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl ApplicationListener for Recorder {
    fn on_read(&self, data: &[u8]) {
        self.reads.lock().unwrap().extend_from_slice(data);
    }
    fn on_read_closed(&self, _cause: Option<Error>) {
        self.closed.store(true, Ordering::Release);
    }
}

struct NullStackListener;
impl StackListener for NullStackListener {
    fn on_closed(&self, _stack: &Stack, _cause: Option<Error>) {}
}

struct Side {
    stack: Arc<Stack>,
    app: Arc<ApplicationLayer>,
    recorder: Arc<Recorder>,
}

fn build_side(hub: Arc<IoHub>, stream: mio::net::TcpStream, name: &str) -> Side {
    let network = NonBlockingNetworkLayer::new(stream, hub.clone()).unwrap();
    let ack = AckFilter::with_default_sentinel(Duration::from_secs(5), hub.clone());
    let mut headers = HashMap::new();
    headers.insert("clientName".to_string(), name.to_string());
    let header = HeaderFilter::new(headers, Arc::new(AcceptAll), Duration::from_secs(5), hub.clone());
    let recorder = Arc::new(Recorder::default());
    let app = ApplicationLayer::new(recorder.clone());

    let stack = Stack::build(
        name,
        network.clone(),
        vec![ack, header],
        app.clone(),
        hub.start_barrier().clone(),
    );
    network.attach_stack(stack.clone());
    stack.set_listener(Arc::new(NullStackListener));
    stack.init().unwrap();
    stack.start().unwrap();

    Side { stack, app, recorder }
}

#[test]
fn bytes_survive_ack_and_header_handshake_round_trip() {
    let hub = IoHub::new(HubConfig {
        worker_threads: 2,
        ..HubConfig::default()
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let connector = std::net::TcpStream::connect(addr).unwrap();
    connector.set_nonblocking(true).unwrap();

    // Both ends are loopback, so the accept resolves essentially
    // immediately; poll briefly rather than assume synchronous readiness.
    let accepted = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("accept failed: {e}"),
        }
    };

    let server_stream = mio::net::TcpStream::from_std(accepted);
    let client_stream = mio::net::TcpStream::from_std(connector);

    let client = build_side(hub.clone(), client_stream, "client");
    let server = build_side(hub.clone(), server_stream, "server");

    client.app.send(b"hello from client").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server.recorder.reads.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(&server.recorder.reads.lock().unwrap()[..], b"hello from client");
    assert!(!client.recorder.closed.load(Ordering::Acquire));

    server.app.send(b"hello from server").unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.recorder.reads.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(&client.recorder.reads.lock().unwrap()[..], b"hello from server");

    hub.close();
}

#[test]
fn mismatched_ack_sentinel_tears_down_the_connection() {
    let hub = IoHub::new(HubConfig {
        worker_threads: 2,
        ..HubConfig::default()
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let connector = std::net::TcpStream::connect(addr).unwrap();
    connector.set_nonblocking(true).unwrap();

    let accepted = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("accept failed: {e}"),
        }
    };

    // Server side runs the real stack; the "client" side is a bare socket
    // that writes a deliberately wrong sentinel and checks the server
    // hangs up rather than forwarding anything upward.
    let server_stream = mio::net::TcpStream::from_std(accepted);
    let server = build_side(hub.clone(), server_stream, "server");

    use std::io::Write;
    let mut raw_client = connector;
    raw_client.write_all(b"XYZ").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !server.recorder.closed.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(server.recorder.closed.load(Ordering::Acquire));
    assert!(server.recorder.reads.lock().unwrap().is_empty());

    hub.close();
}
