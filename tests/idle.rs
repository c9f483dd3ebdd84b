//! Integration tests for idle detection timing and counter semantics.

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wireline::{
    ChannelContext, Codec, Handler, IdleKind, IdlePolicy, IdleWatch, Result, Server, ServerConfig,
    TextCodec,
};

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

struct Discard;

impl Handler<String> for Discard {
    fn on_message(&self, _ctx: &ChannelContext, _message: String) -> Result<()> {
        Ok(())
    }
}

struct Recorder {
    events: Arc<Mutex<Vec<(IdleKind, u64, u64)>>>,
}

impl IdleWatch for Recorder {
    fn on_idle(&self, _ctx: &ChannelContext, kind: IdleKind, total: u64, consecutive: u64) {
        self.events.lock().unwrap().push((kind, total, consecutive));
    }
}

fn idle_server(
    port: u16,
    read_idle: Duration,
    write_idle: Duration,
) -> (Server<String>, Arc<Mutex<Vec<(IdleKind, u64, u64)>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder {
        events: events.clone(),
    };
    let config = ServerConfig::with_codec(port, TextCodec::new())
        .handler(Discard)
        .idle(IdlePolicy::new(read_idle, write_idle, recorder));
    let server = Server::new(config).unwrap();
    server.start().unwrap();
    (server, events)
}

#[test]
fn read_idle_fires_once_per_second() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (server, events) = idle_server(port, Duration::from_secs(1), Duration::ZERO);
    wait_for_server(&addr);

    let stream = TcpStream::connect(&addr).unwrap();
    // Silence: expect roughly one firing per second.
    thread::sleep(Duration::from_millis(3500));

    let snapshot = events.lock().unwrap().clone();
    assert!(
        (2..=4).contains(&snapshot.len()),
        "expected ~3 firings in 3.5s, got {snapshot:?}"
    );
    for (i, (kind, total, consecutive)) in snapshot.iter().enumerate() {
        assert_eq!(*kind, IdleKind::Read);
        assert_eq!(*total, (i + 1) as u64, "total increments monotonically");
        assert_eq!(*consecutive, (i + 1) as u64, "no activity, so consecutive tracks total");
    }

    drop(stream);
    server.shutdown().unwrap();
}

#[test]
fn read_activity_resets_consecutive_count() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (server, events) = idle_server(port, Duration::from_secs(1), Duration::ZERO);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    thread::sleep(Duration::from_millis(2500));
    let before = events.lock().unwrap().len();
    assert!(before >= 1, "expected at least one firing before activity");

    // A read between two firings zeroes the consecutive counter; the total
    // keeps climbing.
    let frame = TextCodec::new().encode(&"ping".to_string()).unwrap();
    stream.write_all(&frame).unwrap();
    thread::sleep(Duration::from_millis(2000));

    let snapshot = events.lock().unwrap().clone();
    assert!(snapshot.len() > before, "firings must continue after activity");
    let (_, total, consecutive) = snapshot[before];
    assert_eq!(consecutive, 1, "consecutive restarts at 1 after a read: {snapshot:?}");
    assert_eq!(total, (before + 1) as u64, "total is never reset: {snapshot:?}");

    server.shutdown().unwrap();
}

#[test]
fn write_idle_chain_is_independent() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (server, events) = idle_server(port, Duration::ZERO, Duration::from_secs(1));
    wait_for_server(&addr);

    let stream = TcpStream::connect(&addr).unwrap();
    // The handler never writes, so only the write chain fires.
    thread::sleep(Duration::from_millis(2500));

    let snapshot = events.lock().unwrap().clone();
    assert!(
        !snapshot.is_empty(),
        "write idle chain should have fired at least once"
    );
    assert!(snapshot.iter().all(|(kind, _, _)| *kind == IdleKind::Write));
    let (_, total, consecutive) = snapshot[snapshot.len() - 1];
    assert_eq!(total, snapshot.len() as u64);
    assert_eq!(consecutive, snapshot.len() as u64);

    drop(stream);
    server.shutdown().unwrap();
}

#[test]
fn sub_second_thresholds_stay_silent() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (server, events) = idle_server(port, Duration::from_millis(300), Duration::from_millis(300));
    wait_for_server(&addr);

    let _stream = TcpStream::connect(&addr).unwrap();
    thread::sleep(Duration::from_millis(1500));

    assert!(
        events.lock().unwrap().is_empty(),
        "thresholds under one second are disabled"
    );
    server.shutdown().unwrap();
}
