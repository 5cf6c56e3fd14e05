//! Configuration for the trust policy, following the teacher's two-struct
//! pattern: a `serde`-deserialized wire/file payload resolved into a
//! validated runtime config the policy engine actually consumes.

use serde::{Deserialize, Serialize};

use crate::errors::RdpError;

/// One entry of `certificates.json`'s `certificate-db` array: a trusted
/// fingerprint under a named hash algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDbEntry {
    #[serde(rename = "type")]
    pub hash_type: String,
    pub hash: String,
}

/// On-wire shape of `certificates.json` (spec §6). Every key is optional;
/// absent keys fall back to the permissive defaults applied by
/// `resolve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificatePolicyFile {
    #[serde(default)]
    pub deny: bool,
    #[serde(default)]
    pub ignore: bool,
    #[serde(rename = "deny-userconfig", default)]
    pub deny_userconfig: bool,
    #[serde(rename = "certificate-db", default)]
    pub certificate_db: Vec<CertificateDbEntry>,
}

impl CertificatePolicyFile {
    pub fn from_json(text: &str) -> Result<Self, RdpError> {
        serde_json::from_str(text)
            .map_err(|e| RdpError::BadConfiguration(format!("invalid certificates.json: {e}")))
    }
}

/// Validated runtime configuration consumed by `trust_policy::verify`.
///
/// Open Question (a) from spec §9: when both `ignore` and `deny` are
/// present, `deny` wins because step 6 of the policy algorithm checks it
/// first (spec §4.2). This struct codifies that ordering explicitly via
/// field order and the `resolve` comment below, rather than leaving it an
/// accident of evaluation order.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicyConfig {
    /// Checked before `ignore`: a flat reject wins over a flat accept.
    pub deny: bool,
    pub ignore: bool,
    pub deny_userconfig: bool,
    pub certificate_db: Vec<CertificateDbEntry>,
    /// Accepted-fingerprint list from session configuration (spec §4.2
    /// step 1), independent of `certificates.json`.
    pub accepted_fingerprints: Vec<String>,
    /// Auto-deny on a changed fingerprint without prompting (used by
    /// the Trust Policy property in spec §8).
    pub auto_deny_on_change: bool,
    /// Auto-accept a first-use (`Missing`) identity without prompting.
    pub auto_accept_new: bool,
}

impl TrustPolicyConfig {
    pub fn from_payload(payload: CertificatePolicyFile) -> Result<Self, RdpError> {
        for entry in &payload.certificate_db {
            if entry.hash.is_empty() {
                return Err(RdpError::BadConfiguration(
                    "certificate-db entry has an empty hash".to_string(),
                ));
            }
        }
        Ok(Self {
            deny: payload.deny,
            ignore: payload.ignore,
            deny_userconfig: payload.deny_userconfig,
            certificate_db: payload.certificate_db,
            accepted_fingerprints: Vec::new(),
            auto_deny_on_change: false,
            auto_accept_new: false,
        })
    }

    pub fn with_accepted_fingerprints(mut self, fingerprints: Vec<String>) -> Self {
        self.accepted_fingerprints = fingerprints;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_resolves_to_permissive_defaults() {
        let payload = CertificatePolicyFile::from_json("{}").unwrap();
        let config = TrustPolicyConfig::from_payload(payload).unwrap();
        assert!(!config.deny);
        assert!(!config.ignore);
    }

    #[test]
    fn parses_deny_and_ignore_flags() {
        let payload = CertificatePolicyFile::from_json(r#"{"deny": true, "ignore": true}"#).unwrap();
        let config = TrustPolicyConfig::from_payload(payload).unwrap();
        assert!(config.deny);
        assert!(config.ignore);
    }

    #[test]
    fn parses_certificate_db() {
        let payload = CertificatePolicyFile::from_json(
            r#"{"certificate-db": [{"type": "sha256", "hash": "aabbcc"}]}"#,
        )
        .unwrap();
        let config = TrustPolicyConfig::from_payload(payload).unwrap();
        assert_eq!(config.certificate_db.len(), 1);
        assert_eq!(config.certificate_db[0].hash_type, "sha256");
    }

    #[test]
    fn rejects_empty_hash_in_certificate_db() {
        let payload = CertificatePolicyFile::from_json(
            r#"{"certificate-db": [{"type": "sha256", "hash": ""}]}"#,
        )
        .unwrap();
        let result = TrustPolicyConfig::from_payload(payload);
        assert!(matches!(result, Err(RdpError::BadConfiguration(_))));
    }

    #[test]
    fn invalid_json_reports_bad_configuration() {
        let result = CertificatePolicyFile::from_json("not json");
        assert!(matches!(result, Err(RdpError::BadConfiguration(_))));
    }

    #[test]
    fn deny_userconfig_parses_hyphenated_key() {
        let payload = CertificatePolicyFile::from_json(r#"{"deny-userconfig": true}"#).unwrap();
        assert!(payload.deny_userconfig);
    }
}
