//! Opaque TLS engine handle, implemented on top of `rustls`.
//!
//! The operation set is deliberately narrow (handshake, read, write,
//! pending, shutdown, set_options, set_min/max_version, set_cipher_list,
//! set_key_log_callback) so a different TLS library could be swapped in
//! without touching `rdp-core`.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig, ServerConnection, SignatureScheme};

use crate::keylog::NssKeyLogWriter;

/// Which side of the handshake this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Client,
    Server,
}

/// TLS protocol version bound, independent of the underlying library's enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVersion {
    Tls12,
    Tls13,
}

/// Result of driving the handshake one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The handshake finished; the connection is ready for application data.
    Complete,
    /// More I/O is needed; the caller should wait for readiness and retry.
    Continue,
}

#[derive(Debug)]
pub enum EngineError {
    /// The underlying transport failed.
    Io(io::Error),
    /// The TLS library reported a protocol-level failure.
    Protocol(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "engine I/O error: {e}"),
            EngineError::Protocol(msg) => write!(f, "engine protocol error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            EngineError::Protocol(_) => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<rustls::Error> for EngineError {
    fn from(e: rustls::Error) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

/// A `ServerCertVerifier` that accepts every chain but still checks the
/// handshake signature with the real algorithms, so a tampered signature
/// still fails the handshake. The actual accept/deny/prompt decision is
/// made one layer up, in `rdp_core::trust_policy`, once the certificate has
/// been fully extracted — see spec §4.3.
#[derive(Debug)]
struct DeferToPolicyVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for DeferToPolicyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Options applied before the handshake starts. Maps to the narrow
/// `set_options` / `set_min/max_version` / `set_cipher_list` /
/// `set_key_log_callback` operations from design note 9.
#[derive(Default)]
pub struct EngineOptions {
    pub min_version: Option<EngineVersion>,
    pub max_version: Option<EngineVersion>,
    /// Restrict to this cipher-suite name list (rustls suite names, e.g.
    /// `"TLS13_AES_256_GCM_SHA384"`). `None` keeps the library default.
    pub cipher_suites: Option<Vec<String>>,
    /// NSS-format key-log file path, appended to once per key derivation.
    pub key_log_path: Option<std::path::PathBuf>,
}

fn version_bound(opts: &EngineOptions) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let min = opts.min_version.unwrap_or(EngineVersion::Tls12);
    let max = opts.max_version.unwrap_or(EngineVersion::Tls13);
    let mut versions = Vec::new();
    if min == EngineVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if max == EngineVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

fn select_cipher_suites(
    provider: &rustls::crypto::CryptoProvider,
    wanted: &Option<Vec<String>>,
) -> Vec<rustls::SupportedCipherSuite> {
    match wanted {
        None => provider.cipher_suites.clone(),
        Some(names) => provider
            .cipher_suites
            .iter()
            .filter(|suite| {
                names.iter().any(|n| {
                    suite
                        .suite()
                        .as_str()
                        .is_some_and(|s| n.eq_ignore_ascii_case(s))
                })
            })
            .cloned()
            .collect(),
    }
}

enum EngineInner {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

/// Opaque handle over a `rustls` client or server connection.
pub struct TlsEngine {
    inner: EngineInner,
    role: EngineRole,
}

impl TlsEngine {
    /// `connect()` from spec §4.3: configures interop-mandated TLS options
    /// and sets SNI to `server_hostname`.
    pub fn new_client(
        server_hostname: &str,
        opts: EngineOptions,
    ) -> Result<Self, EngineError> {
        let mut provider = rustls::crypto::ring::default_provider();
        provider.cipher_suites = select_cipher_suites(&provider, &opts.cipher_suites);
        let provider = Arc::new(provider);

        let key_log_path = opts.key_log_path.clone();
        let builder = ClientConfig::builder_with_protocol_versions(&version_bound(&opts))
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferToPolicyVerifier {
                provider: provider.clone(),
            }));
        let mut config = builder.with_no_client_auth();
        config.enable_sni = true;
        if let Some(path) = key_log_path {
            config.key_log = Arc::new(NssKeyLogWriter::new(path));
        }

        let server_name = ServerName::try_from(server_hostname.to_string())
            .map_err(|e| EngineError::Protocol(format!("invalid SNI hostname: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(Self {
            inner: EngineInner::Client(Box::new(conn)),
            role: EngineRole::Client,
        })
    }

    /// `accept()` from spec §4.3: server-side, installs a private key and
    /// certificate chain before handshaking.
    pub fn new_server(
        cert_chain_der: Vec<Vec<u8>>,
        private_key_der: Vec<u8>,
        opts: EngineOptions,
    ) -> Result<Self, EngineError> {
        let chain: Vec<CertificateDer<'static>> =
            cert_chain_der.into_iter().map(CertificateDer::from).collect();
        let key = PrivateKeyDer::try_from(private_key_der)
            .map_err(|e| EngineError::Protocol(format!("invalid private key: {e}")))?;

        let key_log_path = opts.key_log_path.clone();
        let mut config = ServerConfig::builder_with_protocol_versions(&version_bound(&opts))
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(EngineError::from)?;
        if let Some(path) = key_log_path {
            config.key_log = Arc::new(NssKeyLogWriter::new(path));
        }

        let conn = ServerConnection::new(Arc::new(config))?;
        Ok(Self {
            inner: EngineInner::Server(Box::new(conn)),
            role: EngineRole::Server,
        })
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    /// Drive handshake/application I/O against `transport`, which may be a
    /// non-blocking stream (`io::ErrorKind::WouldBlock` on either side of
    /// the I/O is treated as "no progress right now", matching spec §4.3
    /// `Continue`).
    pub fn complete_io<T: Read + Write>(&mut self, transport: &mut T) -> Result<EngineStatus, EngineError> {
        let result = match &mut self.inner {
            EngineInner::Client(c) => c.complete_io(transport),
            EngineInner::Server(c) => c.complete_io(transport),
        };
        match result {
            Ok(_) => Ok(if self.is_handshaking() {
                EngineStatus::Continue
            } else {
                EngineStatus::Complete
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(EngineStatus::Continue),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.inner {
            EngineInner::Client(c) => c.is_handshaking(),
            EngineInner::Server(c) => c.is_handshaking(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match &self.inner {
            EngineInner::Client(c) => c.wants_read(),
            EngineInner::Server(c) => c.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match &self.inner {
            EngineInner::Client(c) => c.wants_write(),
            EngineInner::Server(c) => c.wants_write(),
        }
    }

    /// `pending()` from design note 9: whether decrypted application data is
    /// buffered and ready to be read without further transport I/O.
    pub fn pending(&mut self) -> bool {
        match &mut self.inner {
            EngineInner::Client(c) => c.reader().into_first_chunk().map(|c| !c.is_empty()).unwrap_or(false),
            EngineInner::Server(c) => c.reader().into_first_chunk().map(|c| !c.is_empty()).unwrap_or(false),
        }
    }

    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            EngineInner::Client(c) => c.reader().read(buf),
            EngineInner::Server(c) => c.reader().read(buf),
        }
    }

    pub fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            EngineInner::Client(c) => c.writer().write(buf),
            EngineInner::Server(c) => c.writer().write(buf),
        }
    }

    /// Queue a close_notify alert for delivery on the next `complete_io`.
    /// `send_alert` in spec §4.3 generalizes to arbitrary alert levels on
    /// older TLS stacks; `rustls` only exposes the close_notify path, which
    /// covers the shutdown case this crate actually needs.
    pub fn shutdown(&mut self) {
        match &mut self.inner {
            EngineInner::Client(c) => c.send_close_notify(),
            EngineInner::Server(c) => c.send_close_notify(),
        }
    }

    /// End-entity certificate presented by the peer, DER-encoded, if the
    /// handshake has progressed far enough to have received it.
    pub fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        let certs = match &self.inner {
            EngineInner::Client(c) => c.peer_certificates(),
            EngineInner::Server(c) => c.peer_certificates(),
        }?;
        certs.first().map(|c| c.as_ref().to_vec())
    }

    /// Full certificate chain as presented, end-entity first.
    pub fn peer_certificate_chain_der(&self) -> Vec<Vec<u8>> {
        let certs = match &self.inner {
            EngineInner::Client(c) => c.peer_certificates(),
            EngineInner::Server(c) => c.peer_certificates(),
        };
        certs
            .map(|c| c.iter().map(|der| der.as_ref().to_vec()).collect())
            .unwrap_or_default()
    }
}
