//! Process-wide unique connection identifiers.
//!
//! File descriptors get reused the moment a connection closes, so the
//! worker's connection table and the idle-expiry sweep key on this instead
//! of the raw socket handle.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A 64-bit identifier, unique for the lifetime of the process, assigned
/// at [`ConnectionRecord`](crate::record::ConnectionRecord) creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocates the next identifier. Strict-monotonic and safe to call
    /// concurrently from any thread (e.g. the accept path and a child
    /// connection setup racing on different workers).
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
