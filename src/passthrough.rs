//! The plain byte-copying protocol handler.
//!
//! Full bidirectional relaying (wiring a connection's buffered bytes to
//! its sibling child connection's socket) is the job of the surrounding
//! proxy application and out of scope here; this handler only satisfies
//! the vtable contract by moving bytes between the socket and an internal
//! buffer the caller can drain or prime.

use std::io::{self, Read, Write};

use mio::Interest;

use crate::protocol::{ProtocolHandler, ProtocolState, ReadOutcome, Stream};

/// Copies bytes between peers without interpreting them.
#[derive(Debug, Default)]
pub struct PassthroughHandler {
    /// Bytes read from the socket, awaiting relay by the caller.
    inbound: Vec<u8>,
    /// Bytes queued to be written to the socket.
    outbound: Vec<u8>,
    closed: bool,
}

impl PassthroughHandler {
    /// Creates a handler with no buffered state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the inbound buffer with bytes the caller already consumed
    /// from the socket before handing off to this handler (e.g. bytes
    /// the auto-SSL detector buffered before committing to passthrough).
    pub fn prime(&mut self, bytes: Vec<u8>) {
        self.inbound.extend(bytes);
    }

    /// Drains and returns whatever has been read so far.
    pub fn take_inbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.inbound)
    }

    /// Queues bytes to be flushed to the socket on the next writable
    /// event.
    pub fn queue_outbound(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }
}

impl ProtocolHandler for PassthroughHandler {
    fn setup_child(&self) -> ProtocolState {
        ProtocolState::Passthrough(PassthroughHandler::new())
    }

    fn on_readable(&mut self, stream: &mut dyn Stream) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.closed = true;
                Ok(ReadOutcome::Closed)
            }
            Ok(n) => {
                self.inbound.extend_from_slice(&chunk[..n]);
                Ok(ReadOutcome::Continue)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Pending),
            Err(e) => Err(e),
        }
    }

    fn on_writable(&mut self, stream: &mut dyn Stream) -> io::Result<usize> {
        if self.outbound.is_empty() {
            return Ok(0);
        }
        let written = stream.write(&self.outbound)?;
        self.outbound.drain(..written);
        Ok(written)
    }

    fn interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primed_bytes_are_available_before_any_read() {
        let mut h = PassthroughHandler::new();
        h.prime(vec![1, 2, 3]);
        assert_eq!(h.take_inbound(), vec![1, 2, 3]);
    }

    #[test]
    fn on_readable_buffers_bytes_and_reports_continue() {
        let mut h = PassthroughHandler::new();
        let mut source: &[u8] = b"hello";
        let outcome = h.on_readable(&mut source).unwrap();
        assert!(matches!(outcome, ReadOutcome::Continue));
        assert_eq!(h.take_inbound(), b"hello");
    }

    #[test]
    fn on_readable_reports_closed_on_eof() {
        let mut h = PassthroughHandler::new();
        let mut source: &[u8] = b"";
        let outcome = h.on_readable(&mut source).unwrap();
        assert!(matches!(outcome, ReadOutcome::Closed));
        assert!(h.is_closed());
    }

    #[test]
    fn queued_outbound_bytes_flush_on_writable() {
        let mut h = PassthroughHandler::new();
        h.queue_outbound(b"reply");
        let mut sink = Vec::new();
        let n = h.on_writable(&mut sink).unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"reply");
    }

    #[test]
    fn interest_drops_writable_once_outbound_drained() {
        let mut h = PassthroughHandler::new();
        assert_eq!(h.interest(), Interest::READABLE);
        h.queue_outbound(b"x");
        assert_eq!(h.interest(), Interest::READABLE | Interest::WRITABLE);
        let mut sink = Vec::new();
        h.on_writable(&mut sink).unwrap();
        assert_eq!(h.interest(), Interest::READABLE);
    }
}
