//! Certificate identity records and the known-hosts store.
//!
//! `CertificateIdentity` mirrors the `(host, port) -> fingerprint` record
//! the RDP client persists once a server certificate has been accepted.
//! `KnownHostsStore` is the process-wide, read-mostly store from spec §5;
//! saves are atomic at the file-entry level by rewriting the whole file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use rdp_vendor::ParsedCertificate;

/// Which hash family a fingerprint was computed with. Kept alongside the
/// hex digest so a SHA-256 identity fingerprint is never confused with a
/// SHA-384/512 channel-binding fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl Fingerprint {
    pub fn from_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(bytes),
        }
    }

    /// Compares against either `aa:bb:cc`-separated or unseparated hex, as
    /// required by spec §4.2 step 1 (accepted-fingerprint list matching).
    pub fn matches_hex(&self, candidate: &str) -> bool {
        let normalized: String = candidate
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_ascii_lowercase();
        self.hex.to_ascii_lowercase() == normalized
    }
}

/// `{hostname, port, subject, issuer, fingerprint-by-hash, pem}` from
/// spec §3. Two identities are *equivalent* if their PEM matches
/// byte-for-byte; two are *same-host* if `(hostname, port)` match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateIdentity {
    pub hostname: String,
    pub port: u16,
    pub subject: String,
    pub issuer: String,
    pub fingerprint: Fingerprint,
    pub pem: String,
}

impl CertificateIdentity {
    pub fn from_parsed(hostname: &str, port: u16, parsed: &ParsedCertificate, fingerprint: Fingerprint) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            subject: parsed.subject.clone(),
            issuer: parsed.issuer.clone(),
            fingerprint,
            pem: parsed.pem.clone(),
        }
    }

    pub fn is_equivalent(&self, other: &CertificateIdentity) -> bool {
        self.pem == other.pem
    }

    pub fn is_same_host(&self, hostname: &str, port: u16) -> bool {
        self.hostname == hostname && self.port == port
    }
}

/// Result of `KnownHostsStore::contains`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLookup {
    /// A record exists for `(host, port)` and the fingerprint matches.
    Match,
    /// No record exists for `(host, port)`.
    Missing,
    /// A record exists but the fingerprint differs.
    Changed,
}

fn key(hostname: &str, port: u16) -> String {
    format!("{hostname}:{port}")
}

/// Process-wide record of accepted `(host, port) -> CertificateIdentity`
/// bindings, backed by a JSON file under the user's config directory
/// (spec §6.1's known-hosts format). Reads are lock-free after load;
/// writes replace the whole file, making each save atomic at the
/// file-entry level.
pub struct KnownHostsStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, CertificateIdentity>>,
}

impl KnownHostsStore {
    /// Loads an existing store from `path`, or starts empty if the file
    /// does not exist yet.
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str::<Vec<CertificateIdentity>>(&contents).ok())
            .map(|list| {
                list.into_iter()
                    .map(|entry| (key(&entry.hostname, entry.port), entry))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Resolves the default known-hosts path under the user's config
    /// directory, via the `dirs` crate.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rdp-core").join("known_hosts.json"))
    }

    pub fn contains(&self, hostname: &str, port: u16, fingerprint: &Fingerprint) -> StoreLookup {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key(hostname, port)) {
            None => StoreLookup::Missing,
            Some(existing) if &existing.fingerprint == fingerprint => StoreLookup::Match,
            Some(_) => StoreLookup::Changed,
        }
    }

    pub fn load_identity(&self, hostname: &str, port: u16) -> Option<CertificateIdentity> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&key(hostname, port)).cloned()
    }

    /// Inserts or overwrites the record for `identity.hostname:port` and
    /// rewrites the backing file. Returns `false` (without poisoning the
    /// in-memory state) if the file write fails.
    pub fn save(&self, identity: CertificateIdentity) -> bool {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(key(&identity.hostname, identity.port), identity);
        }
        self.flush()
    }

    fn flush(&self) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let list: Vec<&CertificateIdentity> = entries.values().collect();
        let Ok(json) = serde_json::to_string_pretty(&list) else {
            return false;
        };
        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        fs::write(&self.path, json).is_ok()
    }
}

fn identity(hostname: &str, port: u16, hex: &str) -> CertificateIdentity {
    CertificateIdentity {
        hostname: hostname.to_string(),
        port,
        subject: format!("CN={hostname}"),
        issuer: "CN=Test CA".to_string(),
        fingerprint: Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex.to_string(),
        },
        pem: format!("-----BEGIN CERTIFICATE-----\n{hex}\n-----END CERTIFICATE-----\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_colon_separated_hex() {
        let fp = Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: "aabbcc".to_string(),
        };
        assert!(fp.matches_hex("AA:BB:CC"));
    }

    #[test]
    fn fingerprint_matches_unseparated_hex() {
        let fp = Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: "aabbcc".to_string(),
        };
        assert!(fp.matches_hex("aabbcc"));
    }

    #[test]
    fn fingerprint_rejects_mismatch() {
        let fp = Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: "aabbcc".to_string(),
        };
        assert!(!fp.matches_hex("112233"));
    }

    #[test]
    fn identity_equivalence_is_pem_byte_comparison() {
        let a = identity("rdp.example.com", 3389, "aabbcc");
        let mut b = a.clone();
        b.subject = "different subject".to_string();
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn identity_same_host_ignores_fingerprint() {
        let a = identity("rdp.example.com", 3389, "aabbcc");
        let b = identity("rdp.example.com", 3389, "112233");
        assert!(a.is_same_host("rdp.example.com", 3389));
        assert!(!a.is_equivalent(&b));
    }

    #[test]
    fn empty_store_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::load(dir.path().join("known_hosts.json"));
        let fp = Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: "aabbcc".to_string(),
        };
        assert_eq!(store.contains("rdp.example.com", 3389, &fp), StoreLookup::Missing);
    }

    #[test]
    fn save_then_contains_reports_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::load(dir.path().join("known_hosts.json"));
        let id = identity("rdp.example.com", 3389, "aabbcc");
        assert!(store.save(id.clone()));
        assert_eq!(
            store.contains("rdp.example.com", 3389, &id.fingerprint),
            StoreLookup::Match
        );
    }

    #[test]
    fn changed_fingerprint_reports_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::load(dir.path().join("known_hosts.json"));
        store.save(identity("rdp.example.com", 3389, "aabbcc"));
        let new_fp = Fingerprint {
            algorithm: DigestAlgorithm::Sha256,
            hex: "112233".to_string(),
        };
        assert_eq!(
            store.contains("rdp.example.com", 3389, &new_fp),
            StoreLookup::Changed
        );
    }

    #[test]
    fn store_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        {
            let store = KnownHostsStore::load(path.clone());
            store.save(identity("rdp.example.com", 3389, "aabbcc"));
        }
        let reloaded = KnownHostsStore::load(path);
        let loaded = reloaded.load_identity("rdp.example.com", 3389).unwrap();
        assert_eq!(loaded.fingerprint.hex, "aabbcc");
    }

    #[test]
    fn load_identity_returns_none_for_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::load(dir.path().join("known_hosts.json"));
        assert!(store.load_identity("nope.example.com", 3389).is_none());
    }
}
