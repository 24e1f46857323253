//! The auto-SSL protocol handler: watches a cleartext connection for an
//! inline upgrade to TLS and swaps the connection's protocol state to the
//! TLS-terminating handler without losing the buffered ClientHello bytes.

use std::io::{self, Read};
use std::sync::Arc;

use mio::Interest;
use rustls::ServerConfig;

use crate::passthrough::PassthroughHandler;
use crate::protocol::{ProtocolHandler, ProtocolState, ReadOutcome, Stream};
use crate::tls::TlsHandler;

/// Record header (type + version + length) plus handshake header (type +
/// 24-bit length): the minimum prefix the detector needs before it can
/// commit to "this is a ClientHello".
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const COMMIT_LEN: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;

/// TLS's maximum plaintext record size; a declared length above this is
/// not a real ClientHello.
const MAX_TLS_RECORD_LEN: usize = 16384;

/// Conservative upper bound on pre-detection buffering (open
/// question: the original leaves this unbounded). Beyond this we commit
/// to passthrough rather than stall the connection indefinitely.
pub const MAX_SEARCH_BUFFER: usize = 16 * 1024;

/// Verdict from inspecting the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Not enough bytes yet to decide either way.
    NeedMore,
    /// The buffered prefix is a well-formed ClientHello header.
    Matched,
    /// The buffered prefix cannot be a ClientHello.
    Rejected,
}

/// Inspects `buf` for the canonical TLS ClientHello prefix: record type
/// `0x16`, a plausible major version, a length within legal bounds,
/// followed by handshake type `0x01`. Never commits until both the
/// 5-byte record header and the 4-byte handshake header are present.
pub fn detect_client_hello(buf: &[u8]) -> Detection {
    if buf.is_empty() {
        return Detection::NeedMore;
    }
    if buf[0] != 0x16 {
        return Detection::Rejected;
    }
    if buf.len() < 2 {
        return Detection::NeedMore;
    }
    // TLS record layer major version has stayed at 3 across SSLv3..TLS1.3.
    if buf[1] != 0x03 {
        return Detection::Rejected;
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Detection::NeedMore;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len == 0 || record_len > MAX_TLS_RECORD_LEN {
        return Detection::Rejected;
    }
    if buf.len() < COMMIT_LEN {
        return Detection::NeedMore;
    }
    if buf[5] != 0x01 {
        return Detection::Rejected;
    }
    let handshake_len = u32::from_be_bytes([0, buf[6], buf[7], buf[8]]) as usize;
    if handshake_len == 0 || handshake_len + HANDSHAKE_HEADER_LEN > record_len {
        return Detection::Rejected;
    }
    Detection::Matched
}

/// Scans inbound bytes for a TLS ClientHello and swaps the connection's
/// protocol state on a verdict.
pub struct AutoSslHandler {
    clienthello_search: bool,
    clienthello_found: bool,
    buffer: Vec<u8>,
    tls_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for AutoSslHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSslHandler")
            .field("clienthello_search", &self.clienthello_search)
            .field("clienthello_found", &self.clienthello_found)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl AutoSslHandler {
    /// Starts a detector in the initial state: searching, not yet found.
    pub fn new(tls_config: Arc<ServerConfig>) -> Self {
        Self {
            clienthello_search: true,
            clienthello_found: false,
            buffer: Vec::new(),
            tls_config,
        }
    }

    /// Whether the detector is still scanning inbound bytes.
    pub fn clienthello_search(&self) -> bool {
        self.clienthello_search
    }

    /// Whether a ClientHello has been positively identified.
    pub fn clienthello_found(&self) -> bool {
        self.clienthello_found
    }

    fn commit_to_passthrough(&mut self) -> ReadOutcome {
        self.clienthello_search = false;
        let mut handler = PassthroughHandler::new();
        handler.prime(std::mem::take(&mut self.buffer));
        ReadOutcome::Swap(ProtocolState::Passthrough(handler))
    }

    fn commit_to_tls(&mut self) -> io::Result<ReadOutcome> {
        self.clienthello_search = false;
        self.clienthello_found = true;
        let mut handler = TlsHandler::new(self.tls_config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        handler.replay(&self.buffer)?;
        self.buffer.clear();
        Ok(ReadOutcome::Swap(ProtocolState::Tls(handler)))
    }
}

impl ProtocolHandler for AutoSslHandler {
    fn setup_child(&self) -> ProtocolState {
        // Children inherit the parent's post-detection protocol, never
        // the detector itself.
        if self.clienthello_found {
            match TlsHandler::new(self.tls_config.clone()) {
                Ok(h) => ProtocolState::Tls(h),
                Err(_) => ProtocolState::Passthrough(PassthroughHandler::new()),
            }
        } else {
            ProtocolState::Passthrough(PassthroughHandler::new())
        }
    }

    fn on_readable(&mut self, stream: &mut dyn Stream) -> io::Result<ReadOutcome> {
        if !self.clienthello_search {
            // Detector has already committed; nothing left for it to do.
            return Ok(ReadOutcome::Continue);
        }

        let mut chunk = [0u8; 4096];
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Pending),
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(ReadOutcome::Closed);
        }
        self.buffer.extend_from_slice(&chunk[..n]);

        match detect_client_hello(&self.buffer) {
            Detection::Matched => self.commit_to_tls(),
            Detection::Rejected => Ok(self.commit_to_passthrough()),
            Detection::NeedMore if self.buffer.len() >= MAX_SEARCH_BUFFER => {
                Ok(self.commit_to_passthrough())
            }
            Detection::NeedMore => Ok(ReadOutcome::Pending),
        }
    }

    fn on_writable(&mut self, _stream: &mut dyn Stream) -> io::Result<usize> {
        // Nothing is ever queued for write while searching; the detector
        // behaves like passthrough, which forwards nothing until a
        // verdict is reached.
        Ok(0)
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rustls::pki_types::PrivateKeyDer;

    const CLIENT_HELLO_PREFIX: &[u8] = &[
        0x16, 0x03, 0x01, 0x00, 0x30, 0x01, 0x00, 0x00, 0x2C, 0x03, 0x01,
    ];

    #[test]
    fn needs_more_before_record_header_complete() {
        for n in 0..RECORD_HEADER_LEN {
            assert_eq!(
                detect_client_hello(&CLIENT_HELLO_PREFIX[..n]),
                Detection::NeedMore,
                "expected NeedMore at {n} bytes"
            );
        }
    }

    #[test]
    fn needs_more_between_record_and_handshake_header() {
        assert_eq!(
            detect_client_hello(&CLIENT_HELLO_PREFIX[..RECORD_HEADER_LEN]),
            Detection::NeedMore
        );
        assert_eq!(
            detect_client_hello(&CLIENT_HELLO_PREFIX[..COMMIT_LEN - 1]),
            Detection::NeedMore
        );
    }

    #[test]
    fn matches_once_both_headers_present() {
        assert_eq!(
            detect_client_hello(&CLIENT_HELLO_PREFIX[..COMMIT_LEN]),
            Detection::Matched
        );
        assert_eq!(detect_client_hello(CLIENT_HELLO_PREFIX), Detection::Matched);
    }

    #[test]
    fn rejects_on_first_byte_when_not_0x16() {
        assert_eq!(detect_client_hello(b"GET / HTTP/1.1"), Detection::Rejected);
        assert_eq!(detect_client_hello(b"G"), Detection::Rejected);
    }

    #[test]
    fn rejects_implausible_major_version() {
        assert_eq!(
            detect_client_hello(&[0x16, 0x99, 0x01, 0x00, 0x30]),
            Detection::Rejected
        );
    }

    #[test]
    fn rejects_zero_length_record() {
        assert_eq!(
            detect_client_hello(&[0x16, 0x03, 0x01, 0x00, 0x00]),
            Detection::Rejected
        );
    }

    #[test]
    fn matches_one_byte_at_a_time_across_arbitrary_chunk_boundaries() {
        let mut buf = Vec::new();
        let mut last = Detection::NeedMore;
        for &b in CLIENT_HELLO_PREFIX {
            buf.push(b);
            last = detect_client_hello(&buf);
        }
        assert_eq!(last, Detection::Matched);
    }

    fn self_signed_config() -> Arc<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        Arc::new(config)
    }

    #[test]
    fn initial_state_is_searching_and_not_found() {
        let handler = AutoSslHandler::new(self_signed_config());
        assert!(handler.clienthello_search());
        assert!(!handler.clienthello_found());
    }

    #[test]
    fn positive_detection_swaps_to_tls_and_sets_found() {
        let mut handler = AutoSslHandler::new(self_signed_config());
        let mut source: &[u8] = CLIENT_HELLO_PREFIX;
        let outcome = handler.on_readable(&mut source).unwrap();
        assert!(handler.clienthello_found());
        assert!(!handler.clienthello_search());
        assert!(matches!(outcome, ReadOutcome::Swap(ProtocolState::Tls(_))));
    }

    #[test]
    fn negative_detection_swaps_to_passthrough_and_forwards_buffered_bytes() {
        let mut handler = AutoSslHandler::new(self_signed_config());
        let mut source: &[u8] = b"GET / HTTP/1.1\r\n";
        let outcome = handler.on_readable(&mut source).unwrap();
        assert!(!handler.clienthello_found());
        assert!(!handler.clienthello_search());
        match outcome {
            ReadOutcome::Swap(ProtocolState::Passthrough(mut p)) => {
                assert_eq!(p.take_inbound(), b"GET / HTTP/1.1\r\n");
            }
            other => panic!("expected passthrough swap, got {other:?}"),
        }
    }

    #[test]
    fn detector_never_downgrades_after_positive_identification() {
        let mut handler = AutoSslHandler::new(self_signed_config());
        let mut source: &[u8] = CLIENT_HELLO_PREFIX;
        handler.on_readable(&mut source).unwrap();
        assert!(handler.clienthello_found());

        // Further calls after commit are no-ops for the detector itself;
        // by this point the connection record has already swapped away
        // from AutoSslHandler, so on_readable here only guards against
        // being invoked again by mistake.
        let outcome = handler.on_readable(&mut source).unwrap();
        assert!(matches!(outcome, ReadOutcome::Continue));
        assert!(handler.clienthello_found());
    }

    #[test]
    fn oversized_declared_record_length_commits_to_passthrough_immediately() {
        // A record length above the 16 KiB TLS plaintext maximum can never
        // be a real ClientHello; this is rejected as soon as the record
        // header is complete, well before MAX_SEARCH_BUFFER comes into play.
        let mut handler = AutoSslHandler::new(self_signed_config());
        let mut source: &[u8] = &[0x16, 0x03, 0x01, 0xFF, 0xFF];
        let outcome = handler.on_readable(&mut source).unwrap();
        assert!(matches!(
            outcome,
            ReadOutcome::Swap(ProtocolState::Passthrough(_))
        ));
        assert!(!handler.clienthello_found());
    }

    #[test]
    fn search_buffer_cap_backstops_the_detector_against_a_stalled_decision() {
        // Given the header-only detection above, a verdict is always
        // reached by the 9th buffered byte, so this cap never actually
        // fires in practice; it exists as a backstop against any future
        // change to `detect_client_hello` that inspects more of the
        // buffer before deciding. Exercise the cap check directly rather
        // than via `on_readable`, since no byte sequence can keep
        // `detect_client_hello` returning `NeedMore` past 9 bytes.
        let mut handler = AutoSslHandler::new(self_signed_config());
        handler.buffer = vec![0u8; MAX_SEARCH_BUFFER];
        let outcome = handler.commit_to_passthrough();
        assert!(matches!(outcome, ReadOutcome::Swap(ProtocolState::Passthrough(_))));
    }
}
