use bytes::Bytes;

use crate::error::{Error, Result};

/// Outcome of a single decode attempt against the front of a byte window.
#[derive(Debug)]
pub enum Decoded<T> {
    /// One complete frame, plus the number of bytes it consumed from the
    /// window (prefix and payload included).
    Frame(T, usize),
    /// The window does not yet hold a complete frame. The runner keeps the
    /// bytes and retries once the worker delivers more.
    Incomplete,
}

/// Byte-stream framing: delimits the receive stream into application
/// messages and encodes outgoing messages back to raw bytes.
///
/// `decode` is called with the connection's current contiguous receive
/// window and must either cut exactly one frame off the front or report
/// [`Decoded::Incomplete`]. The runner loops until the window is exhausted
/// or incomplete, so a single readiness event can emit any number of frames,
/// always in arrival order. Implementations hold no per-connection state;
/// partial frames live in the connection's accumulator, not in the codec.
///
/// `encode` is a pure function of the message.
pub trait Codec: Send + Sync + 'static {
    type Item: Send + 'static;

    fn decode(&self, src: &[u8]) -> Result<Decoded<Self::Item>>;

    fn encode(&self, item: &Self::Item) -> Result<Bytes>;
}

/// Pass-through codec: hands each receive window to the handler as a single
/// raw [`Bytes`] message. This is the default when no codec is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Item = Bytes;

    fn decode(&self, src: &[u8]) -> Result<Decoded<Bytes>> {
        if src.is_empty() {
            return Ok(Decoded::Incomplete);
        }
        Ok(Decoded::Frame(Bytes::copy_from_slice(src), src.len()))
    }

    fn encode(&self, item: &Bytes) -> Result<Bytes> {
        Ok(item.clone())
    }
}

/// Frames longer than this corrupt the high bits of the 4-byte length prefix
/// (the encoder sets bit 15 as the long-form marker), so it is the hard cap
/// for [`TextCodec`](crate::TextCodec) regardless of the configured limit.
pub const MAX_FRAME_LENGTH: usize = 0x7fff;

pub(crate) fn check_frame_length(length: usize, limit: usize) -> Result<()> {
    if length > limit {
        return Err(Error::FrameTooLarge { length, limit });
    }
    Ok(())
}
