//! User-authentication lookup, standing in for the prepared
//! `SELECT user, ether, atime FROM users WHERE ip = ?1` statement each
//! worker owns when `user_auth` is enabled.
//!
//! The actual backend (sqlite, a remote service, whatever) is external;
//! this crate only defines the seam and a per-worker handle to it.

use std::net::IpAddr;

/// A resolved user record for a source IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Username as resolved by the backend.
    pub user: String,
    /// MAC address of the source host, if known.
    pub ether: Option<String>,
}

/// Backend capable of resolving a source IP to a user. Implementations
/// must be safe to share across workers; each worker is expected to hold
/// its own prepared-statement-equivalent state internally if the backend
/// needs one, via [`UserLookup::prepare`].
pub trait UserLookup: Send + Sync {
    /// Resolves `ip` to a user record, if one exists.
    fn lookup(&self, ip: IpAddr) -> Option<UserRecord>;

    /// Gives each worker a chance to prepare per-thread backend state
    /// (e.g. a prepared statement) before the event loop starts. The
    /// default implementation does nothing, for backends with no such
    /// concept.
    fn prepare(&self) -> Box<dyn UserLookupHandle> {
        Box::new(NoopHandle)
    }
}

/// Per-worker handle produced by [`UserLookup::prepare`]. Exists so a
/// backend that needs a prepared statement per connection-handling thread
/// (to avoid contending at the statement level) has somewhere to put it.
pub trait UserLookupHandle: Send {
    /// Resolves `ip` using this worker's prepared state.
    fn lookup(&self, ip: IpAddr) -> Option<UserRecord>;
}

struct NoopHandle;

impl UserLookupHandle for NoopHandle {
    fn lookup(&self, _ip: IpAddr) -> Option<UserRecord> {
        None
    }
}
