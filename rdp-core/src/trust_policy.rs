//! Pure decision function: given a presented certificate, stored data,
//! hostname, and configuration, decide accept / deny / prompt.
//!
//! This module never touches a transport or a TLS engine; `TlsSession`
//! calls `TrustPolicy::verify` once the handshake has produced a peer
//! certificate chain.

use std::sync::Arc;

use log::warn;
use sha2::{Digest, Sha256};

use rdp_vendor::{parse_certificate, verify_chain};

use crate::cert_store::{CertificateIdentity, DigestAlgorithm, Fingerprint, KnownHostsStore, StoreLookup};
use crate::config::TrustPolicyConfig;
use crate::errors::RdpError;

/// Which transport kind an "already-accepted PEM" applies to (spec §4.2
/// step 2): the gateway, a redirected target, or a direct connection each
/// track their own prior acceptance independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Gateway,
    Redirected,
}

/// Outcome of an external management callback or a user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    AcceptPermanently,
    AcceptTemporarily,
    Reject,
}

/// Flags passed to an external certificate manager / user prompt so it
/// can render the right warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReason {
    NewIdentity,
    ChangedIdentity,
}

/// Delegates the accept/deny decision to a host application (spec §4.2
/// step 3, "external management").
pub trait ExternalCertificateManager: Send + Sync {
    /// Returns `Some(decision)` if this manager handles the decision, or
    /// `None` to fall through to the rest of the policy algorithm.
    fn verify(&self, pem: &str, reason: PromptReason) -> Option<UserDecision>;
}

/// Prompts a human for the final step-7 decision.
pub trait UserPrompt: Send + Sync {
    fn prompt_new(&self, identity: &CertificateIdentity) -> UserDecision;
    fn prompt_changed(&self, identity: &CertificateIdentity, previous: &CertificateIdentity) -> UserDecision;
}

/// A `UserPrompt` that always returns a fixed decision; used when the
/// caller configured auto-accept/auto-deny instead of an interactive
/// prompt.
pub struct FixedDecision(pub UserDecision);

impl UserPrompt for FixedDecision {
    fn prompt_new(&self, _identity: &CertificateIdentity) -> UserDecision {
        self.0
    }

    fn prompt_changed(&self, _identity: &CertificateIdentity, _previous: &CertificateIdentity) -> UserDecision {
        self.0
    }
}

pub struct TrustPolicy {
    config: TrustPolicyConfig,
    store: Arc<KnownHostsStore>,
}

impl TrustPolicy {
    pub fn new(config: TrustPolicyConfig, store: Arc<KnownHostsStore>) -> Self {
        Self { config, store }
    }

    /// `verify(presented_cert, host, port)` from spec §4.2, extended with
    /// the transport-kind and callback parameters the algorithm's steps
    /// 2-3 and 7 require.
    pub fn verify(
        &self,
        chain_der: &[Vec<u8>],
        hostname: &str,
        port: u16,
        transport: TransportKind,
        already_accepted_pem: Option<&str>,
        external: Option<&dyn ExternalCertificateManager>,
        user: &dyn UserPrompt,
    ) -> Result<(), RdpError> {
        let end_entity = chain_der
            .first()
            .ok_or_else(|| RdpError::CertificateMalformed("empty certificate chain".to_string()))?;
        let _ = transport;

        // Steps 1-3 all need a parsed certificate to compare against, so
        // parsing happens unconditionally here. If the peer's certificate
        // can't even be parsed, none of those steps apply and the only
        // remaining question is whether step 4 (ignore-certificate) is
        // set; a policy that isn't ignoring certificates has nothing left
        // to try and must reject.
        let parsed = match parse_certificate(end_entity) {
            Ok(parsed) => parsed,
            Err(e) => {
                if self.config.ignore && !self.config.deny {
                    warn!("certificate verification disabled by policy for {hostname}:{port}; presented certificate could not be parsed");
                    return Ok(());
                }
                return Err(RdpError::CertificateMalformed(e.to_string()));
            }
        };
        // Identity fingerprints are always SHA-256 of the DER, independent
        // of the channel-binding hash selection in spec §4.3 (which tracks
        // the certificate's own signature algorithm instead).
        let fingerprint = Fingerprint::from_bytes(DigestAlgorithm::Sha256, &Sha256::digest(&parsed.der));

        // Step 1: accepted-fingerprint list.
        if self
            .config
            .accepted_fingerprints
            .iter()
            .any(|candidate| fingerprint.matches_hex(candidate))
        {
            return Ok(());
        }

        // Step 2: already-accepted PEM for this transport kind.
        if let Some(pem) = already_accepted_pem {
            if pem == parsed.pem {
                return Ok(());
            }
        }

        // Step 3: external management callback.
        if let Some(manager) = external {
            if let Some(decision) = manager.verify(&parsed.pem, PromptReason::NewIdentity) {
                return self.apply_decision(decision, hostname, port, &parsed, &fingerprint, None);
            }
        }

        // Step 4: ignore-certificate short-circuits the chain verification
        // that follows, once steps 1-3 have had their chance to produce a
        // more specific decision.
        if self.config.ignore && !self.config.deny {
            warn!("certificate verification disabled by policy for {hostname}:{port}");
            return Ok(());
        }

        // Step 5: chain verification + hostname match.
        if verify_chain(chain_der, hostname).is_ok() {
            return Ok(());
        }

        // Step 6: certificates.json. `deny` is checked before `ignore`
        // (see TrustPolicyConfig's doc comment and spec §9 Open
        // Question (a)) so a simultaneous deny+ignore always rejects.
        if self.config.deny {
            return Err(RdpError::CertificateRejected(format!(
                "certificate for {hostname}:{port} denied by configuration"
            )));
        }
        if self.config.ignore {
            return Ok(());
        }
        if self
            .config
            .certificate_db
            .iter()
            .any(|entry| fingerprint.matches_hex(&entry.hash))
        {
            return Ok(());
        }

        // Step 7: consult the known-hosts store.
        let lookup = self.store.contains(hostname, port, &fingerprint);
        let identity = CertificateIdentity::from_parsed(hostname, port, &parsed, fingerprint.clone());

        match lookup {
            StoreLookup::Match => Ok(()),
            StoreLookup::Missing => {
                if self.config.deny_userconfig {
                    return Err(RdpError::CertificateRejected(format!(
                        "unknown certificate for {hostname}:{port} and user prompts are disabled"
                    )));
                }
                warn!("unknown certificate presented for {hostname}:{port}; prompting");
                let decision = if self.config.auto_accept_new {
                    UserDecision::AcceptPermanently
                } else {
                    user.prompt_new(&identity)
                };
                self.apply_new_decision(decision, identity)
            }
            StoreLookup::Changed => {
                let previous = self.store.load_identity(hostname, port);
                if self.config.deny_userconfig {
                    return Err(RdpError::CertificateRejected(format!(
                        "certificate for {hostname}:{port} changed and user prompts are disabled"
                    )));
                }
                warn!("certificate for {hostname}:{port} changed since last connection");
                let decision = if self.config.auto_deny_on_change {
                    UserDecision::Reject
                } else if let Some(previous) = &previous {
                    user.prompt_changed(&identity, previous)
                } else {
                    user.prompt_new(&identity)
                };
                self.apply_changed_decision(decision, identity, hostname, port)
            }
        }
    }

    fn apply_new_decision(&self, decision: UserDecision, identity: CertificateIdentity) -> Result<(), RdpError> {
        match decision {
            UserDecision::AcceptPermanently => {
                self.store.save(identity);
                Ok(())
            }
            UserDecision::AcceptTemporarily => Ok(()),
            UserDecision::Reject => Err(RdpError::CertificateRejected(format!(
                "user rejected new certificate for {}:{}",
                identity.hostname, identity.port
            ))),
        }
    }

    fn apply_changed_decision(
        &self,
        decision: UserDecision,
        identity: CertificateIdentity,
        hostname: &str,
        port: u16,
    ) -> Result<(), RdpError> {
        match decision {
            UserDecision::AcceptPermanently => {
                self.store.save(identity);
                Ok(())
            }
            UserDecision::AcceptTemporarily => Ok(()),
            UserDecision::Reject => Err(RdpError::CertificateRejected(format!(
                "user rejected changed certificate for {hostname}:{port}"
            ))),
        }
    }

    fn apply_decision(
        &self,
        decision: UserDecision,
        hostname: &str,
        port: u16,
        parsed: &rdp_vendor::ParsedCertificate,
        fingerprint: &Fingerprint,
        _previous: Option<&CertificateIdentity>,
    ) -> Result<(), RdpError> {
        let identity = CertificateIdentity::from_parsed(hostname, port, parsed, fingerprint.clone());
        match decision {
            UserDecision::AcceptPermanently => {
                self.store.save(identity);
                Ok(())
            }
            UserDecision::AcceptTemporarily => Ok(()),
            UserDecision::Reject => Err(RdpError::CertificateRejected(format!(
                "certificate for {hostname}:{port} rejected by external manager"
            ))),
        }
    }
}
