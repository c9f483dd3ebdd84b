//! Server configuration.
//!
//! [`ServerConfig`] is a consuming builder: construct with a port (and a
//! codec for non-default message types), chain setters, hand it to
//! [`Server::new`](crate::Server::new). Validation happens once at server
//! construction against the capabilities resolved at that moment.

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Codec, RawCodec};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::idle::IdlePolicy;

/// Buffer sizes below this are raised to it.
const MIN_BUFFER_SIZE: usize = 512;
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Runtime capabilities resolved once at server construction — no hidden
/// process-wide detection singletons.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caps {
    pub parallelism: usize,
}

impl Caps {
    pub fn detect() -> Self {
        Caps {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// TLS termination settings: a pre-built rustls server config plus the
/// ordered ALPN protocol list. Certificates, keys, and cipher-suite
/// selection are configured on the rustls `ServerConfig` (via its crypto
/// provider) before it is handed over.
pub struct TlsConfig {
    config: rustls::ServerConfig,
}

impl TlsConfig {
    pub fn new(config: rustls::ServerConfig) -> Self {
        TlsConfig { config }
    }

    /// Ordered application protocol preference list offered during the
    /// handshake (ALPN).
    pub fn alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.config.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn into_shared(self) -> Arc<rustls::ServerConfig> {
        Arc::new(self.config)
    }
}

pub(crate) enum HandlerSource<M> {
    Instance(Arc<dyn Handler<M>>),
    Factory(Arc<dyn Fn() -> Arc<dyn Handler<M>> + Send + Sync>),
}

impl<M> HandlerSource<M> {
    pub fn get(&self) -> Arc<dyn Handler<M>> {
        match self {
            HandlerSource::Instance(handler) => handler.clone(),
            HandlerSource::Factory(factory) => factory(),
        }
    }
}

impl<M> Clone for HandlerSource<M> {
    fn clone(&self) -> Self {
        match self {
            HandlerSource::Instance(handler) => HandlerSource::Instance(handler.clone()),
            HandlerSource::Factory(factory) => HandlerSource::Factory(factory.clone()),
        }
    }
}

pub(crate) enum CodecSource<M> {
    Instance(Arc<dyn Codec<Item = M>>),
    Factory(Arc<dyn Fn() -> Arc<dyn Codec<Item = M>> + Send + Sync>),
}

impl<M> CodecSource<M> {
    pub fn get(&self) -> Arc<dyn Codec<Item = M>> {
        match self {
            CodecSource::Instance(codec) => codec.clone(),
            CodecSource::Factory(factory) => factory(),
        }
    }
}

impl<M> Clone for CodecSource<M> {
    fn clone(&self) -> Self {
        match self {
            CodecSource::Instance(codec) => CodecSource::Instance(codec.clone()),
            CodecSource::Factory(factory) => CodecSource::Factory(factory.clone()),
        }
    }
}

/// Configuration for one server instance handling messages of type `M`.
pub struct ServerConfig<M> {
    pub(crate) port: u16,
    pub(crate) workers: usize,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) pool_threads: usize,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) idle: Option<IdlePolicy>,
    pub(crate) handler: Option<HandlerSource<M>>,
    pub(crate) codec: CodecSource<M>,
    pub(crate) log_tls_errors: bool,
    pub(crate) log_read_errors: bool,
    pub(crate) log_application_bytes: bool,
}

impl ServerConfig<Bytes> {
    /// Configuration with the pass-through codec: the handler receives each
    /// receive window as raw [`Bytes`].
    pub fn new(port: u16) -> Self {
        Self::with_codec(port, RawCodec)
    }
}

impl<M: Send + 'static> ServerConfig<M> {
    pub fn with_codec<C: Codec<Item = M>>(port: u16, codec: C) -> Self {
        ServerConfig {
            port,
            workers: 1,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            pool_threads: 0,
            tls: None,
            idle: None,
            handler: None,
            codec: CodecSource::Instance(Arc::new(codec)),
            log_tls_errors: false,
            log_read_errors: false,
            log_application_bytes: false,
        }
    }

    // ── Threading ────────────────────────────────────────────────────

    /// Requested worker count. Clamped to `[1, available parallelism]` and
    /// rounded up to the next power of two at server construction.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Execution pool size. 0 (the default) derives it from available
    /// parallelism.
    pub fn pool_threads(mut self, n: usize) -> Self {
        self.pool_threads = n;
        self
    }

    // ── Buffers ──────────────────────────────────────────────────────

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn write_buffer_size(mut self, n: usize) -> Self {
        self.write_buffer_size = n.max(MIN_BUFFER_SIZE);
        self
    }

    // ── TLS ──────────────────────────────────────────────────────────

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls.into_shared());
        self
    }

    // ── Idle detection ───────────────────────────────────────────────

    pub fn idle(mut self, policy: IdlePolicy) -> Self {
        self.idle = Some(policy);
        self
    }

    // ── Handler and codec ────────────────────────────────────────────

    /// One handler instance shared by every connection.
    pub fn handler<H: Handler<M>>(mut self, handler: H) -> Self {
        self.handler = Some(HandlerSource::Instance(Arc::new(handler)));
        self
    }

    /// A handler factory invoked once per accepted connection.
    pub fn handler_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Handler<M>> + Send + Sync + 'static,
    {
        self.handler = Some(HandlerSource::Factory(Arc::new(factory)));
        self
    }

    /// Replace the codec instance.
    pub fn codec<C: Codec<Item = M>>(mut self, codec: C) -> Self {
        self.codec = CodecSource::Instance(Arc::new(codec));
        self
    }

    /// A codec factory invoked once per accepted connection.
    pub fn codec_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Codec<Item = M>> + Send + Sync + 'static,
    {
        self.codec = CodecSource::Factory(Arc::new(factory));
        self
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    pub fn log_tls_errors(mut self, enable: bool) -> Self {
        self.log_tls_errors = enable;
        self
    }

    pub fn log_read_errors(mut self, enable: bool) -> Self {
        self.log_read_errors = enable;
        self
    }

    /// Hex-dump every received application byte window at debug level.
    pub fn log_application_bytes(mut self, enable: bool) -> Self {
        self.log_application_bytes = enable;
        self
    }

    // ── Resolution ───────────────────────────────────────────────────

    pub(crate) fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be non-zero".into()));
        }
        if self.handler.is_none() {
            return Err(Error::InvalidConfig("channel handler not set".into()));
        }
        Ok(())
    }

    /// Worker count actually used: requested, clamped, then rounded up to a
    /// power of two so the acceptor can mask instead of dividing.
    pub(crate) fn resolved_workers(&self, caps: &Caps) -> usize {
        self.workers.clamp(1, caps.parallelism).next_power_of_two()
    }

    pub(crate) fn resolved_pool_threads(&self, caps: &Caps) -> usize {
        if self.pool_threads > 0 {
            self.pool_threads
        } else {
            caps.parallelism.max(2)
        }
    }
}
