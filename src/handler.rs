use crate::context::ChannelContext;
use crate::error::{Error, Result};

/// Application callbacks for one server instance.
///
/// All callbacks for a given connection are serialized: the worker's
/// scheduling state machine guarantees at most one runner execution per
/// connection at any instant, so `on_message` never races with itself and
/// handler code needs no connection-level locking of its own. Messages are
/// delivered strictly in arrival order.
pub trait Handler<M>: Send + Sync + 'static {
    /// Called once, synchronously, when the connection is accepted — before
    /// any read occurs. A failure releases the connection without it ever
    /// being registered for reads.
    fn on_connected(&self, ctx: &ChannelContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once per decoded message, in arrival order. A failure is
    /// forwarded to [`on_error`](Handler::on_error) and releases the
    /// connection.
    fn on_message(&self, ctx: &ChannelContext, message: M) -> Result<()>;

    /// Called exactly once when the connection is released.
    fn on_closed(&self, ctx: &ChannelContext) {
        let _ = ctx;
    }

    /// Called when decoding or message handling fails, before the
    /// connection closes.
    fn on_error(&self, ctx: &ChannelContext, error: &Error) {
        let _ = (ctx, error);
    }
}
