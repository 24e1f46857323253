//! Error kinds surfaced by the pool, worker, and protocol layers.
//!
//! Most failures inside a running worker are handled locally (converted
//! to a counter plus a log line); this enum only covers what is actually
//! propagated to a caller.

use std::io;

/// Errors the pool or a connection's protocol handler can report.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A worker thread, event loop, or resolver could not be constructed
    /// during [`Pool::run`](crate::pool::Pool::run). Startup is aborted and
    /// any already-constructed workers are torn down in reverse order.
    #[error("failed to start worker {index}: {source}")]
    Startup {
        /// Index of the worker slot that failed to start.
        index: usize,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The auto-SSL detector identified a ClientHello but the
    /// TLS-terminating handler could not be set up for it (e.g. a bad
    /// `ServerConfig`).
    #[error("TLS handler setup failed: {0}")]
    TlsSetup(#[from] rustls::Error),

    /// A protocol handler's `setup` hook failed for a reason other than
    /// TLS configuration.
    #[error("protocol setup failed: {0}")]
    ProtocolSetup(String),

    /// Formatting a log line failed; the specific emission is skipped and
    /// the connection is otherwise unaffected.
    #[error("failed to format log line: {0}")]
    LogFormat(#[from] std::fmt::Error),
}

/// Result alias used across the public API.
pub type ProxyResult<T> = Result<T, ProxyError>;
