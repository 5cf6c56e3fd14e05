//! Certificate chain verification and parsing, isolated behind
//! `ParsedCertificate` so `rdp-core::trust_policy` never touches
//! `x509-parser` or `rustls` directly.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::prelude::*;

#[derive(Debug)]
pub enum ChainVerifyError {
    Malformed(String),
    NotTrusted(String),
    HostnameMismatch { expected: String, got: Vec<String> },
}

impl fmt::Display for ChainVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainVerifyError::Malformed(m) => write!(f, "certificate malformed: {m}"),
            ChainVerifyError::NotTrusted(m) => write!(f, "certificate chain not trusted: {m}"),
            ChainVerifyError::HostnameMismatch { expected, got } => write!(
                f,
                "hostname {expected} does not match certificate names {got:?}"
            ),
        }
    }
}

impl std::error::Error for ChainVerifyError {}

/// The subset of an X.509 end-entity certificate that the trust policy
/// needs, extracted once so the rest of `rdp-core` deals in plain strings
/// and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub subject: String,
    pub issuer: String,
    pub dns_names: Vec<String>,
    /// True if the certificate was signed with MD5 or SHA-1; per RFC 5929
    /// the channel-binding hash must be upgraded to SHA-256 in that case.
    pub weak_signature: bool,
    pub der: Vec<u8>,
    pub pem: String,
}

fn signature_is_weak(oid: &x509_parser::oid_registry::Oid<'_>) -> bool {
    use x509_parser::oid_registry::*;
    use x509_parser::oid_registry::asn1_rs::oid;
    const OID_SIG_ECDSA_WITH_SHA1: x509_parser::oid_registry::Oid<'static> =
        oid!(1.2.840.10045.4.1);
    oid == &OID_PKCS1_MD5WITHRSAENC
        || oid == &OID_PKCS1_SHA1WITHRSA
        || oid == &OID_SIG_DSA_WITH_SHA1
        || oid == &OID_SIG_ECDSA_WITH_SHA1
}

/// Parse a DER-encoded end-entity certificate into the fields the trust
/// policy needs.
pub fn parse_certificate(der: &[u8]) -> Result<ParsedCertificate, ChainVerifyError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ChainVerifyError::Malformed(e.to_string()))?;

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }

    let weak_signature = signature_is_weak(&cert.signature_algorithm.algorithm);

    let pem = pem_encode(der);

    Ok(ParsedCertificate {
        subject,
        issuer,
        dns_names,
        weak_signature,
        der: der.to_vec(),
        pem,
    })
}

fn pem_encode(der: &[u8]) -> String {
    use std::fmt::Write as _;
    let b64 = base64_encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        let _ = writeln!(out, "{}", std::str::from_utf8(chunk).unwrap());
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// The channel-binding hash algorithm for `"tls-server-end-point:"`,
/// selected per spec §4.3: upgraded to SHA-256 for weak signatures,
/// otherwise following the certificate's own signature hash family.
pub fn channel_binding_hash(cert: &ParsedCertificate) -> Vec<u8> {
    if cert.weak_signature {
        Sha256::digest(&cert.der).to_vec()
    } else {
        // Re-derive the signature hash family from the stored algorithm;
        // fall back to SHA-256 for anything we can't classify, since that
        // is always a safe, RFC 5929-compliant choice.
        match classify_signature_family(&cert.der) {
            SignatureFamily::Sha384 => Sha384::digest(&cert.der).to_vec(),
            SignatureFamily::Sha512 => Sha512::digest(&cert.der).to_vec(),
            SignatureFamily::Sha256 | SignatureFamily::Unknown => Sha256::digest(&cert.der).to_vec(),
        }
    }
}

enum SignatureFamily {
    Sha256,
    Sha384,
    Sha512,
    Unknown,
}

fn classify_signature_family(der: &[u8]) -> SignatureFamily {
    use x509_parser::oid_registry::*;
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return SignatureFamily::Unknown;
    };
    let oid = &cert.signature_algorithm.algorithm;
    if oid == &OID_PKCS1_SHA384WITHRSA || oid == &OID_SIG_ECDSA_WITH_SHA384 {
        SignatureFamily::Sha384
    } else if oid == &OID_PKCS1_SHA512WITHRSA || oid == &OID_SIG_ECDSA_WITH_SHA512 {
        SignatureFamily::Sha512
    } else if oid == &OID_PKCS1_SHA256WITHRSA || oid == &OID_SIG_ECDSA_WITH_SHA256 {
        SignatureFamily::Sha256
    } else {
        SignatureFamily::Unknown
    }
}

/// Verify `chain` (end-entity first) against the platform's native root
/// store and check `hostname` against the leaf's CN/SAN, per spec §4.2
/// step 5. Wildcard matching (`*.` prefix, single label, case-insensitive)
/// is applied the same way the trust policy applies it to stored
/// identities.
pub fn verify_chain(chain: &[Vec<u8>], hostname: &str) -> Result<(), ChainVerifyError> {
    let end_entity = chain
        .first()
        .ok_or_else(|| ChainVerifyError::Malformed("empty certificate chain".into()))?;

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }

    let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ChainVerifyError::NotTrusted(e.to_string()))?;

    let end_entity_der = CertificateDer::from(end_entity.clone());
    let intermediates: Vec<CertificateDer<'static>> = chain[1..]
        .iter()
        .map(|c| CertificateDer::from(c.clone()))
        .collect();
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|e| ChainVerifyError::Malformed(format!("invalid hostname: {e}")))?;
    let now = UnixTime::since_unix_epoch(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    );

    verifier
        .verify_server_cert(&end_entity_der, &intermediates, &server_name, &[], now)
        .map_err(|e| ChainVerifyError::NotTrusted(e.to_string()))?;

    let parsed = parse_certificate(end_entity)?;
    if !hostname_matches(hostname, &parsed) {
        return Err(ChainVerifyError::HostnameMismatch {
            expected: hostname.to_string(),
            got: parsed.dns_names,
        });
    }
    Ok(())
}

fn hostname_matches(hostname: &str, cert: &ParsedCertificate) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    let candidates: Vec<String> = if cert.dns_names.is_empty() {
        extract_cn(&cert.subject).into_iter().collect()
    } else {
        cert.dns_names.clone()
    };
    candidates
        .iter()
        .any(|pattern| wildcard_match(pattern, &hostname))
}

fn extract_cn(subject: &str) -> Option<String> {
    subject.split(',').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("CN=").map(|s| s.to_string())
    })
}

/// `*.` prefix matches exactly one label; case-insensitive.
fn wildcard_match(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if let Some(rest) = pattern.strip_prefix("*.") {
        match hostname.split_once('.') {
            Some((_, host_rest)) => host_rest == rest,
            None => false,
        }
    } else {
        pattern == hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_single_label() {
        assert!(wildcard_match("*.example.com", "rdp.example.com"));
    }

    #[test]
    fn wildcard_rejects_multi_label() {
        assert!(!wildcard_match("*.example.com", "a.b.example.com"));
    }

    #[test]
    fn wildcard_is_case_insensitive() {
        assert!(wildcard_match("*.EXAMPLE.com", "rdp.example.COM"));
    }

    #[test]
    fn exact_match_without_wildcard() {
        assert!(wildcard_match("rdp.example.com", "rdp.example.com"));
    }

    #[test]
    fn extract_cn_finds_common_name() {
        assert_eq!(
            extract_cn("CN=rdp.example.com, O=Example Inc"),
            Some("rdp.example.com".to_string())
        );
    }

    #[test]
    fn extract_cn_absent_returns_none() {
        assert_eq!(extract_cn("O=Example Inc"), None);
    }

    #[test]
    fn base64_round_trip_matches_known_vector() {
        assert_eq!(base64_encode(b"Man"), "TWFu");
        assert_eq!(base64_encode(b"Ma"), "TWE=");
        assert_eq!(base64_encode(b"M"), "TQ==");
    }

    #[test]
    fn pem_encode_wraps_with_markers() {
        let pem = pem_encode(b"hello world");
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
    }

    #[test]
    fn verify_chain_rejects_empty_chain() {
        let err = verify_chain(&[], "rdp.example.com").unwrap_err();
        assert!(matches!(err, ChainVerifyError::Malformed(_)));
    }
}
