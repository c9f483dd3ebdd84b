//! Acceptor: the dispatcher thread owning the listening socket.
//!
//! Accepted sockets are spread across workers with a power-of-two masked
//! round robin — allocation-free and stateless per connection. The chosen
//! worker is handed the connection over its registration channel and woken;
//! the connection stays on that worker for life.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::Connection;
use crate::context::ChannelContext;
use crate::idle::IdleState;
use crate::server::Shared;
use crate::tls::{TlsChannel, Transport};
use crate::worker::WorkerLink;

const LISTENER_TOKEN: Token = Token(0);
const ACCEPTOR_WAKER_TOKEN: Token = Token(1);

pub(crate) struct AcceptorState<M> {
    pub poll: Poll,
    pub listener: TcpListener,
    pub workers: Vec<WorkerLink<M>>,
    pub run_flag: Arc<AtomicBool>,
    pub shared: Arc<Shared<M>>,
}

pub(crate) fn spawn_acceptor<M: Send + 'static>(
    state: AcceptorState<M>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("wireline-acceptor".to_string())
        .spawn(move || run_acceptor(state))
}

fn run_acceptor<M: Send + 'static>(mut state: AcceptorState<M>) {
    let mut events = Events::with_capacity(64);
    let mask = state.workers.len() - 1;
    let mut counter = 0usize;

    loop {
        if let Err(err) = state.poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("acceptor poll failed: {err}");
            break;
        }
        if !state.run_flag.load(Ordering::Acquire) {
            break;
        }
        loop {
            match state.listener.accept() {
                Ok((stream, peer)) => {
                    counter = counter.wrapping_add(1);
                    accept_one(&state, stream, peer, &state.workers[counter & mask]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Transient accept failures (e.g. fd exhaustion) must
                    // not take the dispatcher down.
                    log::error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    // Wake every worker so each observes the cleared run flag and drains.
    for worker in &state.workers {
        let _ = worker.waker.wake();
    }
}

fn accept_one<M: Send + 'static>(
    state: &AcceptorState<M>,
    stream: TcpStream,
    peer: SocketAddr,
    worker: &WorkerLink<M>,
) {
    let shared = &state.shared;
    let _ = stream.set_nodelay(true);

    let transport = match &shared.tls {
        Some(tls_config) => {
            match TlsChannel::new(
                stream,
                tls_config.clone(),
                shared.read_buffer_size,
                shared.write_buffer_size,
                shared.log_tls_errors,
            ) {
                Ok(channel) => Transport::Tls(channel),
                Err(err) => {
                    if shared.log_tls_errors {
                        log::warn!("tls engine setup failed for {peer}: {err}");
                    }
                    return;
                }
            }
        }
        None => Transport::Plain(stream),
    };

    let ctx = ChannelContext::new(transport, peer);
    if let Some(policy) = &shared.idle_policy {
        ctx.set_idle(Arc::new(IdleState::new(policy)));
    }

    let handler = shared.handler.get();
    let codec = shared.codec.get();
    let conn = Connection::new(
        ctx.clone(),
        codec,
        handler.clone(),
        shared.read_buffer_size,
        shared.log_read_errors,
        shared.log_application_bytes,
    );

    // Synchronous, before any read; a failure releases the connection
    // without it ever reaching a worker.
    if let Err(err) = handler.on_connected(&ctx) {
        log::warn!("on_connected failed for channel {}: {err}", ctx.id());
        conn.release();
        return;
    }

    if let Some(scheduler) = &shared.idle_scheduler {
        scheduler.track(&ctx);
    }

    log::debug!("channel {} accepted from {peer}", ctx.id());
    if worker.registrations.send(conn).is_ok() {
        let _ = worker.waker.wake();
    } else {
        log::warn!("worker gone, dropping channel {}", ctx.id());
    }
}

/// Bind the listening socket and set up the acceptor's poll.
pub(crate) fn bind(port: u16) -> io::Result<(Poll, TcpListener, Arc<Waker>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), ACCEPTOR_WAKER_TOKEN)?);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let mut listener = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    Ok((poll, listener, waker))
}
