//! Connection runner: the unit of execution bound to one connection.
//!
//! A runner pass reads whatever the socket has, feeds the accumulator, and
//! drives the decode loop, emitting each complete frame to the handler in
//! arrival order. A partial trailing frame stays in the accumulator and the
//! pass yields; the next readiness event resumes it. The scheduling state
//! machine below guarantees at most one pass executes per connection at any
//! instant, with no lost wakeups.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::accumulator::RecvAccumulator;
use crate::codec::{Codec, Decoded};
use crate::context::ChannelContext;
use crate::error::Result;
use crate::handler::Handler;
use crate::tls::ReadStep;
use crate::util;

/// No pass running and none queued.
const IDLE: u8 = 0;
/// Submitted to the execution pool, not yet started.
const SCHEDULED: u8 = 1;
/// A pass is executing.
const RUNNING: u8 = 2;
/// A readiness event arrived while a pass was executing.
const NOTIFIED: u8 = 3;

pub(crate) struct Connection<M> {
    pub ctx: Arc<ChannelContext>,
    codec: Arc<dyn Codec<Item = M>>,
    handler: Arc<dyn Handler<M>>,
    acc: std::sync::Mutex<RecvAccumulator>,
    scratch: std::sync::Mutex<Vec<u8>>,
    exec: AtomicU8,
    read_buffer_size: usize,
    log_read_errors: bool,
    log_application_bytes: bool,
}

impl<M: Send + 'static> Connection<M> {
    pub fn new(
        ctx: Arc<ChannelContext>,
        codec: Arc<dyn Codec<Item = M>>,
        handler: Arc<dyn Handler<M>>,
        read_buffer_size: usize,
        log_read_errors: bool,
        log_application_bytes: bool,
    ) -> Arc<Self> {
        let close_handler = handler.clone();
        ctx.set_close_hook(Box::new(move |c| close_handler.on_closed(c)));
        Arc::new(Connection {
            acc: std::sync::Mutex::new(RecvAccumulator::new(read_buffer_size)),
            scratch: std::sync::Mutex::new(vec![0u8; read_buffer_size]),
            ctx,
            codec,
            handler,
            exec: AtomicU8::new(IDLE),
            read_buffer_size,
            log_read_errors,
            log_application_bytes,
        })
    }

    /// Worker-side scheduling on a readiness event. Returns true when the
    /// caller must submit [`run`](Connection::run) to the execution pool;
    /// false when an execution is already in flight (it will observe the
    /// notification) or already queued.
    pub fn schedule(&self) -> bool {
        loop {
            match self.exec.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .exec
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                RUNNING => {
                    if self
                        .exec
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return false;
                    }
                }
                // SCHEDULED or NOTIFIED: the pending execution will see the
                // new data; coalesce.
                _ => return false,
            }
        }
    }

    /// Pool-side entry point: run passes until no notification remains,
    /// then return the connection to the idle state.
    pub fn run(&self) {
        self.exec.store(RUNNING, Ordering::Release);
        loop {
            self.pass();
            if self
                .exec
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // A readiness event landed mid-pass: consume it and go again.
            self.exec.store(RUNNING, Ordering::Release);
        }
    }

    fn pass(&self) {
        if self.ctx.is_closed() {
            return;
        }
        match self.read_loop() {
            Ok(false) => {}
            Ok(true) => {
                if !self.ctx.is_closed() {
                    log::info!("channel closed by peer {}", self.ctx.id());
                }
                self.release();
            }
            Err(err) => {
                if self.log_read_errors {
                    log::warn!("channel {} read failed: {err}", self.ctx.id());
                }
                self.release();
            }
        }
    }

    /// Read until the socket has no more to give. A read that fills the
    /// buffer exactly is followed by another immediately (the kernel may
    /// have more queued); a short read yields back to the worker. Returns
    /// Ok(true) on a zero-length terminal read.
    fn read_loop(&self) -> Result<bool> {
        let mut scratch = self.scratch.lock().unwrap();
        let mut acc = self.acc.lock().unwrap();
        loop {
            let before = acc.len();
            match self.ctx.read_step(&mut scratch, &mut acc)? {
                ReadStep::PeerClosed => {
                    // A final flight can carry data and the close together
                    // (TLS close_notify after application records): deliver
                    // what decoded before releasing.
                    self.decode_loop(&mut acc)?;
                    return Ok(true);
                }
                ReadStep::WouldBlock => return Ok(false),
                ReadStep::Data { raw } => {
                    if self.log_application_bytes && acc.len() > before {
                        log::debug!(
                            "channel {} recv\n{}",
                            self.ctx.id(),
                            util::hex_dump(&acc.data()[before..])
                        );
                    }
                    self.decode_loop(&mut acc)?;
                    if raw < self.read_buffer_size {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Emit every complete frame currently in the window, in order. The
    /// handler's error callback fires before any failure propagates to the
    /// release path.
    fn decode_loop(&self, acc: &mut RecvAccumulator) -> Result<()> {
        while acc.len() > 0 {
            match self.codec.decode(acc.data()) {
                Ok(Decoded::Frame(message, consumed)) => {
                    acc.consume(consumed);
                    if let Err(err) = self.handler.on_message(&self.ctx, message) {
                        self.handler.on_error(&self.ctx, &err);
                        return Err(err);
                    }
                }
                Ok(Decoded::Incomplete) => break,
                Err(err) => {
                    self.handler.on_error(&self.ctx, &err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn release(&self) {
        self.ctx.close();
    }
}
