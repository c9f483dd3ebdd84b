//! Integration tests: length-prefixed echo over real TCP connections.
//!
//! Each test starts a wireline server, connects with std TCP clients,
//! and verifies framing, ordering, and the single-flight guarantee.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use wireline::{
    ChannelContext, Codec, Decoded, Error, Handler, Result, Server, ServerConfig, TextCodec,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn connect(addr: &str) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Client-side frame reader: buffers across reads so pipelined echoes that
/// coalesce into one TCP segment still come out one frame at a time.
struct FrameReader {
    codec: TextCodec,
    window: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        FrameReader {
            codec: TextCodec::new(),
            window: Vec::new(),
        }
    }

    fn read_frame(&mut self, stream: &mut TcpStream) -> String {
        let mut chunk = [0u8; 4096];
        loop {
            if let Decoded::Frame(text, consumed) = self.codec.decode(&self.window).unwrap() {
                self.window.drain(..consumed);
                return text;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert_ne!(n, 0, "connection closed while waiting for a frame");
            self.window.extend_from_slice(&chunk[..n]);
        }
    }
}

fn encode(text: &str) -> Vec<u8> {
    TextCodec::new().encode(&text.to_string()).unwrap().to_vec()
}

struct Echo;

impl Handler<String> for Echo {
    fn on_message(&self, ctx: &ChannelContext, message: String) -> Result<()> {
        let frame = TextCodec::new().encode(&message)?;
        ctx.write(&frame)?;
        Ok(())
    }
}

fn echo_server(port: u16, workers: usize) -> Server<String> {
    let config = ServerConfig::with_codec(port, TextCodec::new())
        .workers(workers)
        .handler(Echo);
    let server = Server::new(config).expect("server config");
    server.start().expect("server start");
    server
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_small_message() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 1);
    wait_for_server(&addr);

    let mut stream = connect(&addr);
    let mut reader = FrameReader::new();
    stream.write_all(&encode("Hello, wireline!")).unwrap();
    assert_eq!(reader.read_frame(&mut stream), "Hello, wireline!");

    server.shutdown().unwrap();
}

#[test]
fn echo_long_form_message() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 2);
    wait_for_server(&addr);

    // Larger than the read buffer and well into 4-byte-prefix territory.
    let message: String = "abcdefgh".repeat(2048);
    let mut stream = connect(&addr);
    let mut reader = FrameReader::new();
    stream.write_all(&encode(&message)).unwrap();
    assert_eq!(reader.read_frame(&mut stream), message);

    server.shutdown().unwrap();
}

#[test]
fn frames_arrive_in_order() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 1);
    wait_for_server(&addr);

    let mut stream = connect(&addr);
    let mut reader = FrameReader::new();
    for i in 0..50 {
        stream.write_all(&encode(&format!("msg-{i}"))).unwrap();
    }
    for i in 0..50 {
        assert_eq!(reader.read_frame(&mut stream), format!("msg-{i}"));
    }

    server.shutdown().unwrap();
}

#[test]
fn fragmented_frame_reassembles() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 1);
    wait_for_server(&addr);

    let message = "split across many tiny writes".repeat(20);
    let wire = encode(&message);
    let mut stream = connect(&addr);
    // Dribble the frame out a few bytes at a time, including a split
    // inside the 4-byte length prefix itself.
    for piece in wire.chunks(3) {
        stream.write_all(piece).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    let mut reader = FrameReader::new();
    assert_eq!(reader.read_frame(&mut stream), message);

    server.shutdown().unwrap();
}

#[test]
fn pipelined_frames_in_one_write() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 1);
    wait_for_server(&addr);

    let mut wire = encode("first");
    wire.extend_from_slice(&encode("second"));
    wire.extend_from_slice(&encode("third"));
    let mut stream = connect(&addr);
    let mut reader = FrameReader::new();
    stream.write_all(&wire).unwrap();
    assert_eq!(reader.read_frame(&mut stream), "first");
    assert_eq!(reader.read_frame(&mut stream), "second");
    assert_eq!(reader.read_frame(&mut stream), "third");

    server.shutdown().unwrap();
}

#[test]
fn multiple_connections() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 4);
    wait_for_server(&addr);

    let mut handles = Vec::new();
    for i in 0..8 {
        let addr = addr.clone();
        handles.push(thread::spawn(move || {
            let mut stream = connect(&addr);
            let mut reader = FrameReader::new();
            for round in 0..10 {
                let message = format!("conn-{i}-round-{round}");
                stream.write_all(&encode(&message)).unwrap();
                assert_eq!(reader.read_frame(&mut stream), message);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    server.shutdown().unwrap();
}

// Handler that detects overlapping invocations for one connection.
struct SingleFlightProbe {
    busy: AtomicBool,
    overlaps: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
}

impl Handler<String> for SingleFlightProbe {
    fn on_message(&self, _ctx: &ChannelContext, _message: String) -> Result<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Hold the "critical section" long enough for readiness events to
        // pile up while this invocation is in flight.
        thread::sleep(Duration::from_millis(1));
        self.busy.store(false, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn handler_is_single_flight_per_connection() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let overlaps = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    let config = ServerConfig::with_codec(port, TextCodec::new())
        .workers(2)
        .pool_threads(8)
        .handler(SingleFlightProbe {
            busy: AtomicBool::new(false),
            overlaps: overlaps.clone(),
            handled: handled.clone(),
        });
    let server = Server::new(config).unwrap();
    server.start().unwrap();
    wait_for_server(&addr);

    const FRAMES: usize = 200;
    let mut stream = connect(&addr);
    // Many small writes so readiness keeps firing while passes run.
    for i in 0..FRAMES {
        stream.write_all(&encode(&format!("burst-{i}"))).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while handled.load(Ordering::SeqCst) < FRAMES {
        assert!(Instant::now() < deadline, "handler saw {} of {FRAMES} frames",
            handled.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "overlapping invocations");

    server.shutdown().unwrap();
}

// Handler that records the error/close sequence.
struct FailureProbe {
    events: Arc<Mutex<Vec<String>>>,
}

impl Handler<String> for FailureProbe {
    fn on_message(&self, _ctx: &ChannelContext, message: String) -> Result<()> {
        self.events.lock().unwrap().push(format!("message:{message}"));
        Ok(())
    }

    fn on_error(&self, _ctx: &ChannelContext, error: &Error) {
        self.events.lock().unwrap().push(format!("error:{error}"));
    }

    fn on_closed(&self, _ctx: &ChannelContext) {
        self.events.lock().unwrap().push("closed".to_string());
    }
}

#[test]
fn oversized_frame_fires_error_then_close() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = ServerConfig::with_codec(port, TextCodec::new().limit(10)).handler(FailureProbe {
        events: events.clone(),
    });
    let server = Server::new(config).unwrap();
    server.start().unwrap();
    wait_for_server(&addr);

    let mut stream = connect(&addr);
    // Declared length 11 against a limit of 10. The violation is raised
    // from the prefix alone, before any payload is delivered.
    stream.write_all(&[11u8]).unwrap();
    stream.write_all(b"elevenchars").unwrap();

    // The server must close the connection on the framing error.
    let mut buf = [0u8; 64];
    let mut eof = false;
    for _ in 0..100 {
        match stream.read(&mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(eof, "connection should be closed after a framing violation");

    let events = events.lock().unwrap();
    let error_at = events.iter().position(|e| e.starts_with("error:"));
    let closed_at = events.iter().position(|e| e == "closed");
    assert!(error_at.is_some(), "on_error did not fire: {events:?}");
    assert!(closed_at.is_some(), "on_closed did not fire: {events:?}");
    assert!(error_at < closed_at, "error must precede close: {events:?}");
    assert!(
        !events.iter().any(|e| e.starts_with("message:")),
        "no partial message may be delivered: {events:?}"
    );

    server.shutdown().unwrap();
}

#[test]
fn empty_frame_round_trips() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let server = echo_server(port, 1);
    wait_for_server(&addr);

    let mut stream = connect(&addr);
    let mut reader = FrameReader::new();
    stream.write_all(&encode("")).unwrap();
    stream.write_all(&encode("after-empty")).unwrap();
    assert_eq!(reader.read_frame(&mut stream), "");
    assert_eq!(reader.read_frame(&mut stream), "after-empty");

    server.shutdown().unwrap();
}
