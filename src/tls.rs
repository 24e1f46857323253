//! The TLS-terminating protocol handler.
//!
//! Certificate forging for the intercepting handshake is out of scope;
//! this handler terminates TLS against whatever `rustls::ServerConfig`
//! it is handed, operating through the [`ProtocolHandler`] vtable
//! instead of owning its socket directly.

use std::io::{self, Read, Write};
use std::sync::Arc;

use mio::Interest;
use rustls::{ServerConfig, ServerConnection};

use crate::protocol::{ProtocolHandler, ProtocolState, ReadOutcome, Stream};

/// Terminates TLS for one connection.
pub struct TlsHandler {
    conn: Box<ServerConnection>,
    config: Arc<ServerConfig>,
    closed: bool,
}

impl std::fmt::Debug for TlsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandler")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TlsHandler {
    /// Builds a fresh TLS server session against `config`.
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        let conn = ServerConnection::new(config.clone())?;
        Ok(Self {
            conn: Box::new(conn),
            config,
            closed: false,
        })
    }

    /// Feeds bytes the caller already pulled off the socket (e.g. the
    /// ClientHello the auto-SSL detector buffered before the swap) into
    /// the TLS engine, as if they had arrived as this handler's first
    /// read. Must be called at most once, immediately after construction.
    pub fn replay(&mut self, buffered: &[u8]) -> io::Result<()> {
        if buffered.is_empty() {
            return Ok(());
        }
        let mut cursor = buffered;
        self.read_tls_from(&mut cursor)?;
        self.process_new_packets()
    }

    fn read_tls_from(&mut self, reader: &mut dyn Read) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.conn.read_tls(reader) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => {
                        return if total == 0 { Err(e) } else { Ok(total) }
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(e),
                },
            }
        }
    }

    fn process_new_packets(&mut self) -> io::Result<()> {
        match self.conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(e) => {
                self.closed = true;
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }
}

impl ProtocolHandler for TlsHandler {
    fn setup_child(&self) -> ProtocolState {
        // A child built while the parent is already in a TLS session
        // starts its own independent TLS server session.
        match TlsHandler::new(self.config.clone()) {
            Ok(h) => ProtocolState::Tls(h),
            Err(_) => ProtocolState::Passthrough(crate::passthrough::PassthroughHandler::new()),
        }
    }

    fn on_readable(&mut self, stream: &mut dyn Stream) -> io::Result<ReadOutcome> {
        let read = match self.read_tls_from(stream) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Pending),
            Err(e) => return Err(e),
        };

        if read == 0 {
            self.closed = true;
            return Ok(ReadOutcome::Closed);
        }

        self.process_new_packets()?;
        Ok(ReadOutcome::Continue)
    }

    fn on_writable(&mut self, stream: &mut dyn Stream) -> io::Result<usize> {
        self.conn.write_tls(stream)
    }

    fn interest(&self) -> Interest {
        let read = self.conn.wants_read();
        let write = self.conn.wants_write();
        match (read, write) {
            (_, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, false) => Interest::READABLE,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rustls::pki_types::PrivateKeyDer;

    fn self_signed_config() -> Arc<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.cert.der().clone();
        let key_der =
            PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        Arc::new(config)
    }

    #[test]
    fn new_handler_wants_to_read_before_any_bytes_arrive() {
        let handler = TlsHandler::new(self_signed_config()).unwrap();
        assert_eq!(handler.interest(), Interest::READABLE);
        assert!(!handler.is_closed());
    }

    #[test]
    fn replay_of_empty_buffer_is_a_no_op() {
        let mut handler = TlsHandler::new(self_signed_config()).unwrap();
        handler.replay(&[]).unwrap();
        assert!(!handler.is_closed());
    }
}
