//! Per-connection state shared between the runner, the handler callbacks,
//! and the idle scheduler.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use mio::Waker;
use mio::net::TcpStream;

use crate::accumulator::RecvAccumulator;
use crate::error::{Error, Result};
use crate::idle::IdleState;
use crate::tls::{ReadStep, Transport};
use crate::util;

/// Link back to the owning worker, installed at registration time. Closing
/// the channel pushes its token onto the worker's retirement queue and wakes
/// the worker's poll so the slot is deregistered.
pub(crate) struct Retirement {
    pub tx: crossbeam_channel::Sender<usize>,
    pub waker: Arc<Waker>,
    pub token: usize,
}

type CloseHook = Box<dyn Fn(&ChannelContext) + Send + Sync>;
type Attachment = Arc<dyn Any + Send + Sync>;

/// One accepted connection: socket, identity, extensibility points, and the
/// idle binding.
///
/// A context is created at accept time, bound permanently to one worker, and
/// released exactly once — on explicit [`close`](ChannelContext::close),
/// peer disconnect, or unrecoverable I/O error. All of its accessors are
/// safe to call from handler callbacks and from other threads.
pub struct ChannelContext {
    id: String,
    peer: SocketAddr,
    transport: Mutex<Transport>,
    closed: AtomicBool,
    idle: OnceLock<Arc<IdleState>>,
    attachment: Mutex<Option<Attachment>>,
    attributes: Mutex<Option<HashMap<String, Attachment>>>,
    close_hook: OnceLock<CloseHook>,
    retirement: OnceLock<Retirement>,
}

impl ChannelContext {
    pub(crate) fn new(transport: Transport, peer: SocketAddr) -> Arc<Self> {
        Arc::new(ChannelContext {
            id: util::next_channel_id(),
            peer,
            transport: Mutex::new(transport),
            closed: AtomicBool::new(false),
            idle: OnceLock::new(),
            attachment: Mutex::new(None),
            attributes: Mutex::new(None),
            close_hook: OnceLock::new(),
            retirement: OnceLock::new(),
        })
    }

    /// Opaque identity, unique within the process.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether this connection is speaking TLS. False on plain servers and
    /// on plaintext clients that connected to a TLS-capable listener.
    pub fn is_tls(&self) -> bool {
        self.transport.lock().unwrap().is_tls()
    }

    /// ALPN protocol negotiated during the TLS handshake, if any.
    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.transport.lock().unwrap().negotiated_protocol()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write raw bytes to the peer, wrapping through the TLS engine when
    /// active. Returns the number of payload bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let result = self.transport.lock().unwrap().write(data);
        // Stamped on every attempt, success or not.
        if let Some(idle) = self.idle.get() {
            idle.on_write();
        }
        result.map(|()| data.len())
    }

    /// Release the connection. Idempotent: the first call shuts the socket
    /// down, fires `on_closed`, and retires the registration; later calls
    /// are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.lock().unwrap().shutdown();
        if let Some(hook) = self.close_hook.get() {
            hook(self);
        }
        *self.attachment.lock().unwrap() = None;
        if let Some(retirement) = self.retirement.get() {
            let _ = retirement.tx.send(retirement.token);
            let _ = retirement.waker.wake();
        }
    }

    /// Single opaque attachment slot.
    pub fn set_attachment(&self, value: Attachment) {
        *self.attachment.lock().unwrap() = Some(value);
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().unwrap().clone()
    }

    /// String-keyed attribute bag; the map is created on first use.
    pub fn set_attribute(&self, key: impl Into<String>, value: Attachment) {
        self.attributes
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Attachment> {
        self.attributes
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    }

    // ── crate-internal wiring ───────────────────────────────────────────

    pub(crate) fn read_step(
        &self,
        scratch: &mut [u8],
        acc: &mut RecvAccumulator,
    ) -> Result<ReadStep> {
        if self.is_closed() {
            return Ok(ReadStep::PeerClosed);
        }
        let result = self.transport.lock().unwrap().read_step(scratch, acc);
        if let Some(idle) = self.idle.get() {
            idle.on_read();
        }
        result
    }

    pub(crate) fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> R {
        f(self.transport.lock().unwrap().stream_mut())
    }

    pub(crate) fn set_idle(&self, state: Arc<IdleState>) {
        let _ = self.idle.set(state);
    }

    pub(crate) fn idle_state(&self) -> Option<&Arc<IdleState>> {
        self.idle.get()
    }

    pub(crate) fn set_close_hook(&self, hook: CloseHook) {
        let _ = self.close_hook.set(hook);
    }

    pub(crate) fn set_retirement(&self, retirement: Retirement) {
        let _ = self.retirement.set(retirement);
    }
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
