//! Worker event loops.
//!
//! Each worker thread exclusively owns one `mio::Poll` and the set of
//! connections registered with it; connections are never migrated between
//! workers. The only cross-thread path into a worker is its registration
//! channel: the acceptor enqueues an accepted connection and wakes the
//! poll, and the worker applies the registration at the top of its own
//! loop — serialized against selection by construction.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::Connection;
use crate::context::Retirement;
use crate::pool::ExecutionPool;

/// Reserved token for the worker's waker; slab keys stay well below it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Handle kept by the acceptor for each worker.
pub(crate) struct WorkerLink<M> {
    pub registrations: Sender<Arc<Connection<M>>>,
    pub waker: Arc<Waker>,
}

pub(crate) struct WorkerState<M> {
    pub id: usize,
    pub poll: Poll,
    pub waker: Arc<Waker>,
    pub registrations: Receiver<Arc<Connection<M>>>,
    pub retirements_tx: Sender<usize>,
    pub retirements: Receiver<usize>,
    pub run_flag: Arc<AtomicBool>,
    pub pool: Arc<ExecutionPool>,
    pub log_read_errors: bool,
}

pub(crate) fn spawn_worker<M: Send + 'static>(
    state: WorkerState<M>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("wireline-worker-{}", state.id))
        .spawn(move || run_worker(state))
}

fn run_worker<M: Send + 'static>(mut state: WorkerState<M>) {
    let mut events = Events::with_capacity(256);
    let mut conns: Slab<Arc<Connection<M>>> = Slab::new();

    loop {
        if let Err(err) = state.poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("worker {} poll failed: {err}", state.id);
            break;
        }
        if !state.run_flag.load(Ordering::Acquire) {
            break;
        }

        // Apply registrations before looking at readiness.
        while let Ok(conn) = state.registrations.try_recv() {
            register(&state, &mut conns, conn);
        }

        // Drop retired connections so their slots can be reused.
        while let Ok(token) = state.retirements.try_recv() {
            retire(&state, &mut conns, token);
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(conn) = conns.get(token.0) else {
                continue;
            };
            if conn.ctx.is_closed() {
                continue;
            }
            if conn.schedule() {
                let runner = conn.clone();
                if state.pool.execute(Box::new(move || runner.run())).is_err() {
                    // Pool already released (server shutting down): this
                    // connection is done, the loop keeps serving the rest.
                    conn.release();
                }
            }
        }
    }

    // Release whatever is still registered so close callbacks fire, then
    // the poll closes with this thread.
    for conn in conns.drain() {
        conn.release();
    }
}

fn register<M: Send + 'static>(
    state: &WorkerState<M>,
    conns: &mut Slab<Arc<Connection<M>>>,
    conn: Arc<Connection<M>>,
) {
    let entry = conns.vacant_entry();
    let token = Token(entry.key());
    let registered = conn
        .ctx
        .with_stream(|stream| state.poll.registry().register(stream, token, Interest::READABLE));
    match registered {
        Ok(()) => {
            conn.ctx.set_retirement(Retirement {
                tx: state.retirements_tx.clone(),
                waker: state.waker.clone(),
                token: token.0,
            });
            log::debug!("worker {} registered channel {}", state.id, conn.ctx.id());
            entry.insert(conn);
        }
        Err(err) => {
            if state.log_read_errors {
                log::warn!("worker {} register failed: {err}", state.id);
            }
            conn.release();
        }
    }
}

fn retire<M: Send + 'static>(
    state: &WorkerState<M>,
    conns: &mut Slab<Arc<Connection<M>>>,
    token: usize,
) {
    if let Some(conn) = conns.try_remove(token) {
        let _ = conn
            .ctx
            .with_stream(|stream| state.poll.registry().deregister(stream));
        log::debug!("worker {} retired channel {}", state.id, conn.ctx.id());
    }
}

/// Build the poll/waker/channel plumbing for one worker.
pub(crate) fn worker_parts<M: Send + 'static>(
    id: usize,
    run_flag: Arc<AtomicBool>,
    pool: Arc<ExecutionPool>,
    log_read_errors: bool,
) -> io::Result<(WorkerState<M>, WorkerLink<M>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (reg_tx, reg_rx) = crossbeam_channel::unbounded();
    let (ret_tx, ret_rx) = crossbeam_channel::unbounded();
    let state = WorkerState {
        id,
        poll,
        waker: waker.clone(),
        registrations: reg_rx,
        retirements_tx: ret_tx,
        retirements: ret_rx,
        run_flag,
        pool,
        log_read_errors,
    };
    let link = WorkerLink {
        registrations: reg_tx,
        waker,
    };
    Ok((state, link))
}
