//! State machine layering TLS over an underlying byte transport: the
//! handshake driver, certificate/channel-binding extraction, and the
//! `write_all` back-pressure loop from spec §4.3.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use rdp_vendor::{parse_certificate, EngineOptions, EngineRole, EngineStatus, TlsEngine};

use crate::errors::RdpError;
use crate::ring_buffer::RingBuffer;
use crate::trust_policy::{TransportKind, TrustPolicy, UserPrompt};

/// `Prepared -> Handshaking -> Established -> ShuttingDown -> Destroyed`
/// from spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Prepared,
    Handshaking,
    Established,
    ShuttingDown,
    Destroyed,
}

/// Result of a single `handshake()` call.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Success,
    /// Caller must wait for I/O readiness and re-invoke.
    Continue,
    Error(RdpError),
    /// The handshake itself succeeded but the trust policy rejected the
    /// peer certificate; downgraded from `Success` per spec §4.3.
    VerifyError(RdpError),
}

/// Returned by `write_all` when the peer wants a read before accepting
/// more writes (TLS renegotiation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    MustReadFirst,
}

/// The bounded wait between `write_all` retries while the transport is
/// write-blocked (spec §4.3/§5).
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct EngineState {
    engine: TlsEngine,
    plaintext_in: RingBuffer,
}

/// Owns the transport, the opaque TLS engine handle, and the extracted
/// post-handshake material (public key, channel-binding token). Engine
/// access is serialized by an internal lock so two threads (one reader,
/// one writer) can coexist, per spec §5's concurrency guarantee.
pub struct TlsSession<T> {
    transport: Mutex<T>,
    engine: Mutex<EngineState>,
    state: Mutex<SessionState>,
    role: EngineRole,
    hostname: String,
    port: u16,
    abort: AtomicBool,
    peer_public_key: Mutex<Option<Vec<u8>>>,
    channel_binding_token: Mutex<Option<Vec<u8>>>,
}

impl<T> TlsSession<T>
where
    T: Read + Write,
{
    /// `connect(transport, method)` from spec §4.3: the interop options
    /// are baked into `EngineOptions` by the caller; this constructor
    /// only sets SNI and moves the session to `Handshaking`.
    pub fn connect(transport: T, hostname: &str, port: u16, options: EngineOptions) -> Result<Self, RdpError> {
        let engine = TlsEngine::new_client(hostname, options)?;
        Ok(Self {
            transport: Mutex::new(transport),
            engine: Mutex::new(EngineState {
                engine,
                plaintext_in: RingBuffer::init(4096),
            }),
            state: Mutex::new(SessionState::Handshaking),
            role: EngineRole::Client,
            hostname: hostname.to_string(),
            port,
            abort: AtomicBool::new(false),
            peer_public_key: Mutex::new(None),
            channel_binding_token: Mutex::new(None),
        })
    }

    /// `accept(transport, method, key, cert)` (server-side): installs the
    /// server's private key and certificate before handshaking. Does not
    /// invoke the client-side trust policy.
    pub fn accept(
        transport: T,
        cert_chain_der: Vec<Vec<u8>>,
        private_key_der: Vec<u8>,
        options: EngineOptions,
    ) -> Result<Self, RdpError> {
        let engine = TlsEngine::new_server(cert_chain_der, private_key_der, options)?;
        Ok(Self {
            transport: Mutex::new(transport),
            engine: Mutex::new(EngineState {
                engine,
                plaintext_in: RingBuffer::init(4096),
            }),
            state: Mutex::new(SessionState::Handshaking),
            role: EngineRole::Server,
            hostname: String::new(),
            port: 0,
            abort: AtomicBool::new(false),
            peer_public_key: Mutex::new(None),
            channel_binding_token: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signals session cancellation; observed at the next suspension
    /// point in `poll_and_handshake` or each `write_all` iteration.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// `handshake()` from spec §4.3: drives one round of `complete_io`,
    /// and on completion extracts the peer certificate, public key, and
    /// channel-binding token, then (client-side) invokes the trust
    /// policy. A policy rejection downgrades the outcome to
    /// `VerifyError` and queues a fatal alert.
    pub fn handshake(
        &self,
        trust_policy: Option<(&TrustPolicy, &dyn UserPrompt)>,
    ) -> HandshakeOutcome {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let mut engine_state = self.engine.lock().unwrap_or_else(|e| e.into_inner());

        let status = match engine_state.engine.complete_io(&mut *transport) {
            Ok(s) => s,
            Err(e) => {
                *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Destroyed;
                return HandshakeOutcome::Error(e.into());
            }
        };

        if status == EngineStatus::Continue {
            debug!(hostname = %self.hostname, port = self.port, "TLS handshake needs more I/O");
            return HandshakeOutcome::Continue;
        }

        let chain = engine_state.engine.peer_certificate_chain_der();
        drop(engine_state);
        drop(transport);

        if self.role == EngineRole::Client {
            if let Some((policy, prompt)) = trust_policy {
                if let Err(e) = policy.verify(
                    &chain,
                    &self.hostname,
                    self.port,
                    TransportKind::Direct,
                    None,
                    None,
                    prompt,
                ) {
                    warn!(hostname = %self.hostname, port = self.port, error = %e, "trust policy rejected peer certificate");
                    self.queue_fatal_alert();
                    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::ShuttingDown;
                    return HandshakeOutcome::VerifyError(e);
                }
            }
        }

        if let Some(end_entity) = chain.first() {
            match parse_certificate(end_entity) {
                Ok(parsed) => {
                    *self.peer_public_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(end_entity.clone());
                    let token = channel_binding_token(&parsed);
                    *self.channel_binding_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
                }
                Err(e) => {
                    return HandshakeOutcome::Error(RdpError::CertificateMalformed(e.to_string()));
                }
            }
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Established;
        info!(hostname = %self.hostname, port = self.port, role = ?self.role, "TLS handshake established");
        HandshakeOutcome::Success
    }

    /// `poll_and_handshake()`: re-invokes `handshake()` while it returns
    /// `Continue`, observing the abort flag between attempts.
    pub fn poll_and_handshake(&self, trust_policy: Option<(&TrustPolicy, &dyn UserPrompt)>) -> HandshakeOutcome {
        loop {
            if self.is_aborted() {
                *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Destroyed;
                return HandshakeOutcome::Error(RdpError::Other("session aborted".to_string()));
            }
            match self.handshake(trust_policy) {
                HandshakeOutcome::Continue => {
                    thread::sleep(WRITE_RETRY_BACKOFF);
                    continue;
                }
                other => return other,
            }
        }
    }

    /// `write_all(bytes)`: writes with back-pressure. On a write-blocked
    /// transport, yields briefly and retries; on a read-blocked
    /// transport (renegotiation), returns `MustReadFirst` instead of
    /// retrying so the caller can drain input first.
    pub fn write_all(&self, bytes: &[u8]) -> Result<WriteOutcome, RdpError> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let mut engine_state = self.engine.lock().unwrap_or_else(|e| e.into_inner());

        let mut written = 0;
        while written < bytes.len() {
            if self.is_aborted() {
                return Err(RdpError::Other("session aborted".to_string()));
            }
            if engine_state.engine.wants_read() {
                return Ok(WriteOutcome::MustReadFirst);
            }
            match engine_state.engine.write_plaintext(&bytes[written..]) {
                Ok(0) => {
                    thread::sleep(WRITE_RETRY_BACKOFF);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
            engine_state.engine.complete_io(&mut *transport)?;
        }
        Ok(WriteOutcome::Written)
    }

    /// Reads decrypted application data, buffering through the internal
    /// ring buffer so callers can request arbitrary-sized reads.
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, RdpError> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let mut engine_state = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        engine_state.engine.complete_io(&mut *transport)?;

        let mut scratch = vec![0u8; 4096];
        while engine_state.engine.pending() {
            match engine_state.engine.read_plaintext(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    engine_state.plaintext_in.write(&scratch[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(engine_state.plaintext_in.read(max_len))
    }

    /// `send_alert(level, description)`: queues a close_notify for
    /// transmission at shutdown.
    pub fn queue_fatal_alert(&self) {
        let mut engine_state = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        engine_state.engine.shutdown();
    }

    pub fn shutdown(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::ShuttingDown;
        self.queue_fatal_alert();
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        let mut engine_state = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        let _ = engine_state.engine.complete_io(&mut *transport);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Destroyed;
    }

    pub fn channel_binding_token(&self) -> Option<Vec<u8>> {
        self.channel_binding_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn peer_public_key(&self) -> Option<Vec<u8>> {
        self.peer_public_key.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// The channel-binding token from spec §4.3/§6: the fixed ASCII prefix
/// followed by the certificate hash defined there.
fn channel_binding_token(parsed: &rdp_vendor::ParsedCertificate) -> Vec<u8> {
    let mut token = b"tls-server-end-point:".to_vec();
    token.extend_from_slice(&rdp_vendor::channel_binding_hash(parsed));
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fresh_session_state_is_handshaking() {
        let session = TlsSession::connect(Cursor::new(Vec::<u8>::new()), "rdp.example.com", 3389, EngineOptions::default()).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[test]
    fn abort_flag_is_observed_by_is_aborted() {
        let session = TlsSession::connect(Cursor::new(Vec::<u8>::new()), "rdp.example.com", 3389, EngineOptions::default()).unwrap();
        assert!(!session.is_aborted());
        session.abort();
        assert!(session.is_aborted());
    }

    #[test]
    fn handshake_with_no_peer_bytes_reports_continue() {
        let session = TlsSession::connect(Cursor::new(Vec::<u8>::new()), "rdp.example.com", 3389, EngineOptions::default()).unwrap();
        // complete_io against an empty reader flushes the ClientHello but
        // gets nothing back, so the handshake cannot finish yet.
        match session.handshake(None) {
            HandshakeOutcome::Continue | HandshakeOutcome::Error(_) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn channel_binding_token_is_none_before_handshake() {
        let session = TlsSession::connect(Cursor::new(Vec::<u8>::new()), "rdp.example.com", 3389, EngineOptions::default()).unwrap();
        assert!(session.channel_binding_token().is_none());
    }

    #[test]
    fn aborted_poll_and_handshake_returns_error() {
        let session = TlsSession::connect(Cursor::new(Vec::<u8>::new()), "rdp.example.com", 3389, EngineOptions::default()).unwrap();
        session.abort();
        let outcome = session.poll_and_handshake(None);
        assert!(matches!(outcome, HandshakeOutcome::Error(_)));
        assert_eq!(session.state(), SessionState::Destroyed);
    }
}
