use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter used to mint channel identities.
static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint the next channel identity: a 16-digit lowercase hex string of a
/// process-wide monotonic counter.
pub(crate) fn next_channel_id() -> String {
    let seq = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    format!("{seq:016x}")
}

/// Format bytes as a space-separated uppercase hex dump for diagnostics.
pub(crate) fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for b in data {
        out.push_str(&format!("{b:02X} "));
    }
    out
}
