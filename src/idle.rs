//! Idle-state detection.
//!
//! Each connection carries read/write activity timestamps and trigger
//! counters; a single scheduler thread per server services every
//! connection's idle checks from one deadline heap, keyed by the channel.
//! Thresholds under one second are treated as disabled to avoid
//! pathological rescheduling.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::ChannelContext;

/// Minimum usable idle threshold; anything shorter disables the chain.
const MIN_IDLE: Duration = Duration::from_secs(1);

/// Firing this close to the deadline counts as on time; an earlier wakeup
/// reschedules for the remainder instead of invoking the callback.
const EARLY_FIRE_GUARD: Duration = Duration::from_secs(1);

/// Which activity direction went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    Read,
    Write,
}

/// Callback invoked when a connection shows no read/write activity within
/// its configured window.
///
/// `total` counts every firing over the connection's lifetime; it is never
/// reset. `consecutive` counts firings since the last real I/O in that
/// direction and drops back to zero whenever activity occurs. Both wrap
/// back to 1 rather than reaching zero on overflow.
pub trait IdleWatch: Send + Sync + 'static {
    fn on_idle(&self, ctx: &ChannelContext, kind: IdleKind, total: u64, consecutive: u64);
}

/// Idle detection policy for a server: the two thresholds and the callback.
#[derive(Clone)]
pub struct IdlePolicy {
    read_idle: Duration,
    write_idle: Duration,
    watch: Arc<dyn IdleWatch>,
}

impl IdlePolicy {
    /// Thresholds below one second disable the corresponding chain.
    pub fn new<W: IdleWatch>(read_idle: Duration, write_idle: Duration, watch: W) -> Self {
        IdlePolicy {
            read_idle,
            write_idle,
            watch: Arc::new(watch),
        }
    }
}

/// Per-connection idle state: timestamps and saturating trigger counters.
pub(crate) struct IdleState {
    watch: Arc<dyn IdleWatch>,
    read_idle: Option<Duration>,
    write_idle: Option<Duration>,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    read_total: AtomicU64,
    read_consecutive: AtomicU64,
    write_total: AtomicU64,
    write_consecutive: AtomicU64,
}

impl IdleState {
    pub fn new(policy: &IdlePolicy) -> Self {
        let now = Instant::now();
        IdleState {
            watch: policy.watch.clone(),
            read_idle: (policy.read_idle >= MIN_IDLE).then_some(policy.read_idle),
            write_idle: (policy.write_idle >= MIN_IDLE).then_some(policy.write_idle),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            read_total: AtomicU64::new(0),
            read_consecutive: AtomicU64::new(0),
            write_total: AtomicU64::new(0),
            write_consecutive: AtomicU64::new(0),
        }
    }

    /// Stamp read activity. Called on every read attempt, whether or not
    /// bytes arrived.
    pub fn on_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
        self.read_consecutive.store(0, Ordering::Relaxed);
    }

    /// Stamp write activity.
    pub fn on_write(&self) {
        *self.last_write.lock().unwrap() = Instant::now();
        self.write_consecutive.store(0, Ordering::Relaxed);
    }

    fn threshold(&self, kind: IdleKind) -> Option<Duration> {
        match kind {
            IdleKind::Read => self.read_idle,
            IdleKind::Write => self.write_idle,
        }
    }

    fn last_activity(&self, kind: IdleKind) -> Instant {
        match kind {
            IdleKind::Read => *self.last_read.lock().unwrap(),
            IdleKind::Write => *self.last_write.lock().unwrap(),
        }
    }

    fn bump(&self, kind: IdleKind) -> (u64, u64) {
        match kind {
            IdleKind::Read => (
                clamp_increment(&self.read_total),
                clamp_increment(&self.read_consecutive),
            ),
            IdleKind::Write => (
                clamp_increment(&self.write_total),
                clamp_increment(&self.write_consecutive),
            ),
        }
    }
}

/// Increment a trigger counter, wrapping back to 1 instead of 0 so the
/// published counts stay positive forever.
fn clamp_increment(counter: &AtomicU64) -> u64 {
    let value = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if value == 0 {
        counter.store(1, Ordering::Relaxed);
        1
    } else {
        value
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    kind: IdleKind,
    ctx: Weak<ChannelContext>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

struct Queue {
    heap: BinaryHeap<Entry>,
    stopped: bool,
}

/// One shared deadline scheduler servicing all connections of a server.
pub(crate) struct IdleScheduler {
    queue: Mutex<Queue>,
    cv: Condvar,
    seq: AtomicU64,
}

impl IdleScheduler {
    pub fn start() -> std::io::Result<(Arc<Self>, thread::JoinHandle<()>)> {
        let scheduler = Arc::new(IdleScheduler {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                stopped: false,
            }),
            cv: Condvar::new(),
            seq: AtomicU64::new(0),
        });
        let runner = scheduler.clone();
        let handle = thread::Builder::new()
            .name("wireline-idle".to_string())
            .spawn(move || runner.run())?;
        Ok((scheduler, handle))
    }

    /// Begin idle tracking for a newly accepted connection: one initial
    /// full-length check per enabled chain.
    pub fn track(&self, ctx: &Arc<ChannelContext>) {
        let Some(state) = ctx.idle_state() else {
            return;
        };
        if let Some(threshold) = state.read_idle {
            self.schedule(Arc::downgrade(ctx), IdleKind::Read, threshold);
        }
        if let Some(threshold) = state.write_idle {
            self.schedule(Arc::downgrade(ctx), IdleKind::Write, threshold);
        }
    }

    fn schedule(&self, ctx: Weak<ChannelContext>, kind: IdleKind, delay: Duration) {
        let entry = Entry {
            at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            ctx,
        };
        let mut queue = self.queue.lock().unwrap();
        if queue.stopped {
            return;
        }
        queue.heap.push(entry);
        self.cv.notify_one();
    }

    pub fn stop(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.stopped = true;
        queue.heap.clear();
        self.cv.notify_all();
    }

    fn run(&self) {
        loop {
            let entry = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if queue.stopped {
                        return;
                    }
                    let now = Instant::now();
                    match queue.heap.peek() {
                        None => {
                            queue = self.cv.wait(queue).unwrap();
                        }
                        Some(next) if next.at > now => {
                            let wait = next.at - now;
                            queue = self.cv.wait_timeout(queue, wait).unwrap().0;
                        }
                        Some(_) => break queue.heap.pop().unwrap(),
                    }
                }
            };
            self.fire(entry);
        }
    }

    fn fire(&self, entry: Entry) {
        // A released connection simply lets its pending checks fall away.
        let Some(ctx) = entry.ctx.upgrade() else {
            return;
        };
        if ctx.is_closed() {
            return;
        }
        let Some(state) = ctx.idle_state() else {
            return;
        };
        let Some(threshold) = state.threshold(entry.kind) else {
            return;
        };
        let elapsed = state.last_activity(entry.kind).elapsed();
        let remaining = threshold.saturating_sub(elapsed);
        if remaining > EARLY_FIRE_GUARD {
            // Woke early (activity happened, or clock coarseness): push the
            // check out for the remainder without invoking the callback.
            self.schedule(Arc::downgrade(&ctx), entry.kind, remaining);
            return;
        }
        let (total, consecutive) = state.bump(entry.kind);
        state.watch.on_idle(&ctx, entry.kind, total, consecutive);
        self.schedule(Arc::downgrade(&ctx), entry.kind, threshold);
    }
}
