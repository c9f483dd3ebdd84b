//! Composition root: owns configuration, wires the acceptor, workers,
//! execution pool, TLS and idle machinery, and drives the lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mio::Waker;

use crate::acceptor::{self, AcceptorState};
use crate::config::{Caps, CodecSource, HandlerSource, ServerConfig};
use crate::error::{Error, Result};
use crate::idle::{IdlePolicy, IdleScheduler};
use crate::pool::ExecutionPool;
use crate::worker::{self, WorkerLink};

/// Grace given to the execution pool on shutdown before in-flight work is
/// abandoned.
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-start runtime configuration shared by the acceptor and its
/// connections.
pub(crate) struct Shared<M> {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub idle_policy: Option<IdlePolicy>,
    pub idle_scheduler: Option<Arc<IdleScheduler>>,
    pub handler: HandlerSource<M>,
    pub codec: CodecSource<M>,
    pub log_tls_errors: bool,
    pub log_read_errors: bool,
    pub log_application_bytes: bool,
}

/// Everything owned by one start/stop cycle.
struct Runtime {
    run_flag: Arc<AtomicBool>,
    acceptor_waker: Arc<Waker>,
    worker_wakers: Vec<Arc<Waker>>,
    acceptor: thread::JoinHandle<()>,
    workers: Vec<thread::JoinHandle<()>>,
    idle: Option<(Arc<IdleScheduler>, thread::JoinHandle<()>)>,
}

struct Lifecycle {
    runtime: Option<Runtime>,
    shut_down: bool,
}

/// A TCP server instance bound to one listening port and one message type.
///
/// `start` / `stop` may cycle any number of times; `shutdown` additionally
/// releases the shared execution pool, after which the instance can never
/// be started again.
pub struct Server<M> {
    config: ServerConfig<M>,
    caps: Caps,
    pool: Arc<ExecutionPool>,
    lifecycle: Mutex<Lifecycle>,
}

impl<M: Send + 'static> Server<M> {
    /// Validate the configuration and build the server. The execution pool
    /// is created here and lives until [`shutdown`](Server::shutdown).
    pub fn new(config: ServerConfig<M>) -> Result<Self> {
        config.validate()?;
        let caps = Caps::detect();
        let pool = Arc::new(ExecutionPool::new(config.resolved_pool_threads(&caps))?);
        Ok(Server {
            config,
            caps,
            pool,
            lifecycle: Mutex::new(Lifecycle {
                runtime: None,
                shut_down: false,
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Bind the listener and begin accepting. Fails if the server is
    /// already running or was permanently shut down.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.shut_down {
            return Err(Error::ServerShutdown);
        }
        if lifecycle.runtime.is_some() {
            return Err(Error::InvalidConfig("server already started".into()));
        }

        let (poll, listener, acceptor_waker) = acceptor::bind(self.config.port)?;
        let run_flag = Arc::new(AtomicBool::new(true));

        let idle = self
            .config
            .idle
            .as_ref()
            .map(|_| IdleScheduler::start())
            .transpose()?;

        let handler = self
            .config
            .handler
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("channel handler not set".into()))?;
        let shared = Arc::new(Shared {
            read_buffer_size: self.config.read_buffer_size,
            write_buffer_size: self.config.write_buffer_size,
            tls: self.config.tls.clone(),
            idle_policy: self.config.idle.clone(),
            idle_scheduler: idle.as_ref().map(|(scheduler, _)| scheduler.clone()),
            handler,
            codec: self.config.codec.clone(),
            log_tls_errors: self.config.log_tls_errors,
            log_read_errors: self.config.log_read_errors,
            log_application_bytes: self.config.log_application_bytes,
        });

        let worker_count = self.config.resolved_workers(&self.caps);
        let mut links: Vec<WorkerLink<M>> = Vec::with_capacity(worker_count);
        let mut worker_wakers = Vec::with_capacity(worker_count);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (state, link) = worker::worker_parts(
                id,
                run_flag.clone(),
                self.pool.clone(),
                self.config.log_read_errors,
            )?;
            worker_wakers.push(link.waker.clone());
            worker_handles.push(worker::spawn_worker(state)?);
            links.push(link);
        }

        let acceptor_handle = acceptor::spawn_acceptor(AcceptorState {
            poll,
            listener,
            workers: links,
            run_flag: run_flag.clone(),
            shared,
        })?;

        lifecycle.runtime = Some(Runtime {
            run_flag,
            acceptor_waker,
            worker_wakers,
            acceptor: acceptor_handle,
            workers: worker_handles,
            idle,
        });
        log::info!("server startup on {}", self.config.port);
        Ok(())
    }

    /// Stop accepting and release every connection. The server can be
    /// started again afterwards.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        let Some(runtime) = lifecycle.runtime.take() else {
            log::info!("server is not started");
            return Ok(());
        };
        drop(lifecycle);

        runtime.run_flag.store(false, Ordering::Release);
        let _ = runtime.acceptor_waker.wake();
        let _ = runtime.acceptor.join();
        // The acceptor wakes the workers on exit, but wake them here too in
        // case it died before reaching that point.
        for waker in &runtime.worker_wakers {
            let _ = waker.wake();
        }
        for handle in runtime.workers {
            let _ = handle.join();
        }
        if let Some((scheduler, handle)) = runtime.idle {
            scheduler.stop();
            let _ = handle.join();
        }
        log::info!("server stopped");
        Ok(())
    }

    /// Stop, then start again on the same configuration.
    pub fn restart(&self) -> Result<()> {
        log::info!("restart ...");
        self.stop()?;
        self.start()
    }

    /// Stop if running, then permanently release the execution pool. The
    /// instance cannot be started again.
    pub fn shutdown(&self) -> Result<()> {
        self.stop()?;
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if !lifecycle.shut_down {
            lifecycle.shut_down = true;
            drop(lifecycle);
            self.pool.shutdown(POOL_SHUTDOWN_GRACE);
        }
        Ok(())
    }
}

impl<M> Drop for Server<M> {
    fn drop(&mut self) {
        // Best-effort: make sure threads are not left accepting.
        if let Ok(mut lifecycle) = self.lifecycle.lock()
            && let Some(runtime) = lifecycle.runtime.take()
        {
            runtime.run_flag.store(false, Ordering::Release);
            let _ = runtime.acceptor_waker.wake();
            for waker in &runtime.worker_wakers {
                let _ = waker.wake();
            }
            if let Some((scheduler, _)) = &runtime.idle {
                scheduler.stop();
            }
        }
    }
}
