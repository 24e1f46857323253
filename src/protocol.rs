//! The protocol vtable: the capability set every protocol handler
//! satisfies, and the tagged state that lets the auto-SSL detector swap a
//! connection's handler in place.
//!
//! Each concrete handler (`passthrough`, `autossl`, `tls`) implements
//! [`ProtocolHandler`]. [`ProtocolState`] wraps exactly one of them at a
//! time and forwards to it; swapping is a single field assignment between
//! event-loop callbacks, so no in-flight callback ever observes a torn
//! state.

use std::io::{self, Read, Write};

use mio::Interest;

use crate::autossl::AutoSslHandler;
use crate::passthrough::PassthroughHandler;
use crate::tls::TlsHandler;

/// Blanket trait over anything both readable and writable, so handlers
/// don't need to be generic over the concrete socket type. Implemented
/// for every `T: Read + Write`, including `&[u8]` in tests.
pub trait Stream: Read + Write {}
impl<T: Read + Write + ?Sized> Stream for T {}

/// What happened on one `on_readable` call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// No verdict yet; kept buffering, forwarded nothing.
    Pending,
    /// Handled in place; no state change.
    Continue,
    /// Commit to a new protocol state (auto-SSL's only use of this).
    Swap(ProtocolState),
    /// The peer closed the connection (a `read` of zero bytes).
    Closed,
}

/// Operations every protocol handler satisfies, through which the
/// auto-SSL handler can be swapped in-place.
pub trait ProtocolHandler: std::fmt::Debug {
    /// Produces the protocol state a child connection spawned from this
    /// one should start in. Children inherit the parent's *post-detection*
    /// protocol, never the auto-SSL detector itself.
    fn setup_child(&self) -> ProtocolState;

    /// Handles readable readiness. May return [`ReadOutcome::Swap`] to
    /// request the connection's protocol state be replaced.
    fn on_readable(&mut self, stream: &mut dyn Stream) -> io::Result<ReadOutcome>;

    /// Handles writable readiness, returning the number of bytes flushed.
    fn on_writable(&mut self, stream: &mut dyn Stream) -> io::Result<usize>;

    /// Which readiness this handler currently wants to be polled for.
    fn interest(&self) -> Interest;

    /// Whether this handler considers the connection finished.
    fn is_closed(&self) -> bool;

    /// Releases any handler-owned resources ahead of the connection
    /// record being dropped. Most handlers have nothing to do here.
    fn teardown(&mut self) {}
}

/// The swappable protocol state attached to a
/// [`ConnectionRecord`](crate::record::ConnectionRecord).
#[derive(Debug)]
pub enum ProtocolState {
    /// Plain byte-copying, either from the start or after auto-SSL
    /// committed to cleartext.
    Passthrough(PassthroughHandler),
    /// Scanning inbound bytes for a TLS ClientHello.
    AutoSsl(AutoSslHandler),
    /// Terminating TLS, either from the start or after auto-SSL detected
    /// an inline upgrade.
    Tls(TlsHandler),
}

impl ProtocolHandler for ProtocolState {
    fn setup_child(&self) -> ProtocolState {
        match self {
            ProtocolState::Passthrough(h) => h.setup_child(),
            ProtocolState::AutoSsl(h) => h.setup_child(),
            ProtocolState::Tls(h) => h.setup_child(),
        }
    }

    fn on_readable(&mut self, stream: &mut dyn Stream) -> io::Result<ReadOutcome> {
        match self {
            ProtocolState::Passthrough(h) => h.on_readable(stream),
            ProtocolState::AutoSsl(h) => h.on_readable(stream),
            ProtocolState::Tls(h) => h.on_readable(stream),
        }
    }

    fn on_writable(&mut self, stream: &mut dyn Stream) -> io::Result<usize> {
        match self {
            ProtocolState::Passthrough(h) => h.on_writable(stream),
            ProtocolState::AutoSsl(h) => h.on_writable(stream),
            ProtocolState::Tls(h) => h.on_writable(stream),
        }
    }

    fn interest(&self) -> Interest {
        match self {
            ProtocolState::Passthrough(h) => h.interest(),
            ProtocolState::AutoSsl(h) => h.interest(),
            ProtocolState::Tls(h) => h.interest(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            ProtocolState::Passthrough(h) => h.is_closed(),
            ProtocolState::AutoSsl(h) => h.is_closed(),
            ProtocolState::Tls(h) => h.is_closed(),
        }
    }

    fn teardown(&mut self) {
        match self {
            ProtocolState::Passthrough(h) => h.teardown(),
            ProtocolState::AutoSsl(h) => h.teardown(),
            ProtocolState::Tls(h) => h.teardown(),
        }
    }
}
