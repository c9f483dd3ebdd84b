//! Shared execution pool running connection runner passes.
//!
//! Passes never park waiting for bytes (a partial frame yields instead), so
//! a fixed-size pool cannot be exhausted by stalled connections. The pool
//! outlives stop/start cycles and is released permanently by
//! [`Server::shutdown`](crate::Server::shutdown).

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ExecutionPool {
    tx: Mutex<Option<Sender<Job>>>,
    live: Arc<(Mutex<usize>, Condvar)>,
}

impl ExecutionPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let live = Arc::new((Mutex::new(threads), Condvar::new()));
        for i in 0..threads {
            let rx = rx.clone();
            let live = live.clone();
            thread::Builder::new()
                .name(format!("wireline-exec-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    let (count, cv) = &*live;
                    *count.lock().unwrap() -= 1;
                    cv.notify_all();
                })?;
        }
        Ok(ExecutionPool {
            tx: Mutex::new(Some(tx)),
            live,
        })
    }

    pub fn execute(&self, job: Job) -> Result<()> {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(job).map_err(|_| Error::PoolStopped),
            None => Err(Error::PoolStopped),
        }
    }

    /// Stop accepting work and wait up to `grace` for in-flight jobs to
    /// drain. Stragglers are abandoned, not interrupted.
    pub fn shutdown(&self, grace: Duration) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let (count, cv) = &*self.live;
        let guard = count.lock().unwrap();
        let (guard, timeout) = cv
            .wait_timeout_while(guard, grace, |remaining| *remaining > 0)
            .unwrap();
        if timeout.timed_out() {
            log::warn!("execution pool did not drain within {grace:?} ({} left)", *guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_submitted_jobs() {
        let pool = ExecutionPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let pool = ExecutionPool::new(1).unwrap();
        pool.shutdown(Duration::from_secs(1));
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(Error::PoolStopped)
        ));
    }
}
