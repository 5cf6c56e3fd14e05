//! Typed error hierarchy for the trust transport and bitmap cache core.
//!
//! Every propagating operation returns a specific variant instead of an
//! opaque string, so callers can match on the category (fatal vs.
//! tolerated, alertable vs. not) rather than parse a message.

use std::fmt;
use std::io;

/// Structured error type for the session lifecycle, per the taxonomy in
/// SPEC_FULL.md §7.
#[derive(Debug)]
pub enum RdpError {
    /// The underlying byte transport failed or was aborted. Not retried.
    Transport(io::Error),

    /// The TLS handshake could not complete. Fatal for the session.
    TlsHandshake(String),

    /// A presented server certificate was refused by policy or the user.
    /// A TLS alert is queued before the session moves to `Destroyed`.
    CertificateRejected(String),

    /// No usable public key, PEM, or fingerprint could be extracted from
    /// a certificate.
    CertificateMalformed(String),

    /// A drawing order referenced a bitmap cache slot with nothing
    /// installed. Never propagated past the dispatcher; kept here so
    /// internal helpers have a uniform return type.
    CachedResourceMissing { cell: usize, index: u16 },

    /// A configuration value (cell/capacity counts, file paths, policy
    /// flags) was out of range. Fatal at session start.
    BadConfiguration(String),

    /// Catch-all for failures that don't fit another category.
    Other(String),
}

impl fmt::Display for RdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdpError::Transport(e) => write!(f, "transport error: {e}"),
            RdpError::TlsHandshake(msg) => write!(f, "TLS handshake: {msg}"),
            RdpError::CertificateRejected(msg) => write!(f, "certificate rejected: {msg}"),
            RdpError::CertificateMalformed(msg) => write!(f, "certificate malformed: {msg}"),
            RdpError::CachedResourceMissing { cell, index } => {
                write!(f, "cache miss at cell {cell}, index {index}")
            }
            RdpError::BadConfiguration(msg) => write!(f, "bad configuration: {msg}"),
            RdpError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RdpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RdpError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl RdpError {
    /// Returns `true` if the handshake/policy failure is fatal to the
    /// session (cannot be retried on the same `TlsSession`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RdpError::TlsHandshake(_)
                | RdpError::CertificateRejected(_)
                | RdpError::CertificateMalformed(_)
                | RdpError::BadConfiguration(_)
        )
    }

    /// Returns `true` for the one category the taxonomy says must never
    /// be surfaced as an error to the caller — a cache miss is absorbed
    /// at the dispatcher boundary, per SPEC_FULL.md §7.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, RdpError::CachedResourceMissing { .. })
    }

    pub fn from_io(e: io::Error) -> Self {
        RdpError::Transport(e)
    }
}

impl From<io::Error> for RdpError {
    fn from(e: io::Error) -> Self {
        RdpError::from_io(e)
    }
}

impl From<rdp_vendor::EngineError> for RdpError {
    fn from(e: rdp_vendor::EngineError) -> Self {
        match e {
            rdp_vendor::EngineError::Io(io_err) => RdpError::Transport(io_err),
            rdp_vendor::EngineError::Protocol(msg) => RdpError::TlsHandshake(msg),
        }
    }
}

impl From<rdp_vendor::ChainVerifyError> for RdpError {
    fn from(e: rdp_vendor::ChainVerifyError) -> Self {
        RdpError::CertificateMalformed(e.to_string())
    }
}
