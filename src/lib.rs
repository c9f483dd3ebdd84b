//! wireline — embeddable non-blocking TCP server core.
//!
//! wireline is a multiplexed I/O engine for applications that want a
//! server socket without a full network-framework dependency: an acceptor
//! thread distributes connections across worker-owned `mio` event loops, a
//! pluggable codec delimits the byte stream into messages, TLS can be
//! terminated per connection (with plaintext clients coexisting on the
//! same port), and idle connections are detected by a shared scheduler.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wireline::{ChannelContext, Codec, Handler, Result, Server, ServerConfig, TextCodec};
//!
//! struct Echo;
//!
//! impl Handler<String> for Echo {
//!     fn on_message(&self, ctx: &ChannelContext, message: String) -> Result<()> {
//!         let frame = TextCodec::new().encode(&message)?;
//!         ctx.write(&frame)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = ServerConfig::with_codec(7878, TextCodec::new())
//!         .workers(4)
//!         .handler(Echo);
//!     let server = Server::new(config)?;
//!     server.start()?;
//!     // ... embed in your application; later:
//!     server.shutdown()
//! }
//! ```
//!
//! # Execution model
//!
//! Every accepted connection is bound to exactly one worker for its entire
//! life. Readiness events submit the connection's runner to a shared
//! execution pool; a worker-side state machine guarantees at most one
//! runner execution per connection at any instant, so handler callbacks
//! for one connection never overlap and arrive in byte-stream order.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod accumulator;
pub(crate) mod connection;
pub(crate) mod pool;
pub(crate) mod tls;
pub(crate) mod util;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod idle;
pub mod server;
pub mod text;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Framing contract implemented by every codec.
pub use codec::Codec;
/// Outcome of a decode attempt: a complete frame or not enough bytes yet.
pub use codec::Decoded;
/// Hard cap on default-codec payload length (the 4-byte prefix reserves
/// its top bits).
pub use codec::MAX_FRAME_LENGTH;
/// Pass-through codec delivering raw byte windows.
pub use codec::RawCodec;
/// Per-server configuration builder.
pub use config::ServerConfig;
/// TLS termination settings (rustls server config + ALPN list).
pub use config::TlsConfig;
/// Per-connection state handed to every handler callback.
pub use context::ChannelContext;
/// Errors produced by the server core.
pub use error::Error;
/// Crate-wide result alias.
pub use error::Result;
/// Application callbacks for one server instance.
pub use handler::Handler;
/// Which activity direction went idle.
pub use idle::IdleKind;
/// Idle thresholds plus the triggered callback.
pub use idle::IdlePolicy;
/// Callback invoked when a connection goes idle.
pub use idle::IdleWatch;
/// The server instance: lifecycle and composition root.
pub use server::Server;
/// Character set for the default text codec.
pub use text::Charset;
/// Default length-prefixed text codec.
pub use text::TextCodec;
