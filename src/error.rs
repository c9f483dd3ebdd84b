use std::io;

use thiserror::Error;

/// Errors returned by the wireline server core.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or poll operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration rejected by `validate()`.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// A frame declared a payload longer than the configured cap.
    #[error("frame length {length} exceeds limit {limit}")]
    FrameTooLarge { length: usize, limit: usize },
    /// Frame payload could not be converted under the configured charset.
    #[error("frame decode: {0}")]
    FrameDecode(String),
    /// TLS engine failure outside the handshake (wrap/unwrap in steady state).
    #[error("encryption: {0}")]
    Encryption(String),
    /// Operation on a channel that has already been released.
    #[error("channel is closed")]
    ChannelClosed,
    /// `start()` called on a server that was permanently shut down.
    #[error("server is shut down")]
    ServerShutdown,
    /// The shared execution pool is no longer accepting work.
    #[error("execution pool stopped")]
    PoolStopped,
    /// Failure raised by user handler code.
    #[error("handler: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary application error for propagation out of a
    /// [`Handler`](crate::Handler) callback.
    pub fn handler<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Handler(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
