//! Module artifact verification
//!
//! The lifecycle engine treats verification as an opaque collaborator: it
//! asks a [`ModuleVerifier`] for a [`VerificationResult`] and applies the
//! framework's signature policy to the answer.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::signers::TrustedSignerRegistry;
use crate::error::Result;
use crate::utils::current_timestamp;

/// Outcome of verifying one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Verified,
    NotSigned,
    Untrusted,
    Invalid,
    Expired,
    Revoked,
    Error,
}

impl VerificationResult {
    /// Whether the artifact may be loaded under the given policy
    ///
    /// With signatures required only `Verified` passes; otherwise anything
    /// but `Error` does.
    pub fn permits_load(&self, require_signature: bool) -> bool {
        if require_signature {
            *self == VerificationResult::Verified
        } else {
            *self != VerificationResult::Error
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationResult::Verified => "VERIFIED",
            VerificationResult::NotSigned => "NOT_SIGNED",
            VerificationResult::Untrusted => "UNTRUSTED",
            VerificationResult::Invalid => "INVALID",
            VerificationResult::Expired => "EXPIRED",
            VerificationResult::Revoked => "REVOKED",
            VerificationResult::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Verifier collaborator consulted before an artifact is loaded
pub trait ModuleVerifier: Send + Sync {
    fn verify_module(&self, path: &Path) -> VerificationResult;
}

/// Reports every artifact as unsigned
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedVerifier;

impl ModuleVerifier for UnsignedVerifier {
    fn verify_module(&self, _path: &Path) -> VerificationResult {
        VerificationResult::NotSigned
    }
}

/// Digest check against a sidecar signature file
///
/// `{artifact}.sig` holds `key=value` lines:
/// - `signer=<fingerprint>` of a trusted signer
/// - `sha256=<hex digest>` of the artifact bytes
/// - `expires=<unix seconds>` (optional)
pub struct DigestVerifier {
    signers: Arc<TrustedSignerRegistry>,
}

#[derive(Default)]
struct Sidecar {
    signer: Option<String>,
    sha256: Option<String>,
    expires: Option<u64>,
}

impl DigestVerifier {
    pub fn new(signers: Arc<TrustedSignerRegistry>) -> Self {
        Self { signers }
    }

    /// Path of the sidecar file for an artifact
    pub fn signature_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_os_string();
        name.push(".sig");
        PathBuf::from(name)
    }

    /// Write a sidecar for `artifact` signed by `fingerprint`
    pub fn write_signature(artifact: &Path, fingerprint: &str, expires: Option<u64>) -> Result<PathBuf> {
        let digest = hex::encode(Sha256::digest(fs::read(artifact)?));
        let mut contents = format!("signer={}\nsha256={}\n", fingerprint, digest);
        if let Some(expires) = expires {
            contents.push_str(&format!("expires={}\n", expires));
        }
        let path = Self::signature_path(artifact);
        fs::write(&path, contents)?;
        Ok(path)
    }

    fn parse_sidecar(contents: &str) -> Option<Sidecar> {
        let mut sidecar = Sidecar::default();
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            match key.trim() {
                "signer" => sidecar.signer = Some(value.to_ascii_lowercase()),
                "sha256" => sidecar.sha256 = Some(value.to_ascii_lowercase()),
                "expires" => sidecar.expires = Some(value.parse().ok()?),
                other => debug!("Ignoring unknown signature key {}", other),
            }
        }
        Some(sidecar)
    }
}

impl ModuleVerifier for DigestVerifier {
    fn verify_module(&self, path: &Path) -> VerificationResult {
        let artifact = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot read artifact {:?}: {}", path, e);
                return VerificationResult::Error;
            }
        };

        let sig_path = Self::signature_path(path);
        let contents = match fs::read_to_string(&sig_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return VerificationResult::NotSigned
            }
            Err(e) => {
                warn!("Cannot read signature {:?}: {}", sig_path, e);
                return VerificationResult::Error;
            }
        };

        let Some(sidecar) = Self::parse_sidecar(&contents) else {
            return VerificationResult::Invalid;
        };
        let (Some(fingerprint), Some(expected)) = (sidecar.signer, sidecar.sha256) else {
            return VerificationResult::Invalid;
        };

        let Some(signer) = self.signers.get(&fingerprint) else {
            return VerificationResult::Untrusted;
        };
        if !signer.enabled {
            return VerificationResult::Revoked;
        }
        if let Some(expires) = sidecar.expires {
            if current_timestamp() > expires {
                return VerificationResult::Expired;
            }
        }

        let actual = hex::encode(Sha256::digest(&artifact));
        if actual != expected {
            warn!("Digest mismatch for {:?}", path);
            return VerificationResult::Invalid;
        }
        debug!("Verified {:?} signed by {}", path, signer.name);
        VerificationResult::Verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::signers::TrustedSigner;

    fn registry() -> Arc<TrustedSignerRegistry> {
        let registry = TrustedSignerRegistry::new();
        registry.add(TrustedSigner {
            name: "release".into(),
            email: "release@example.org".into(),
            key_path: "keys/release.pub".into(),
            fingerprint: "aa11".into(),
            enabled: true,
        });
        Arc::new(registry)
    }

    fn artifact(dir: &Path) -> PathBuf {
        let path = dir.join("libmodule.so");
        fs::write(&path, b"module bytes").unwrap();
        path
    }

    #[test]
    fn test_policy() {
        assert!(VerificationResult::NotSigned.permits_load(false));
        assert!(!VerificationResult::NotSigned.permits_load(true));
        assert!(VerificationResult::Verified.permits_load(true));
        assert!(!VerificationResult::Error.permits_load(false));
    }

    #[test]
    fn test_verified_and_tampered() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let verifier = DigestVerifier::new(registry());

        assert_eq!(verifier.verify_module(&path), VerificationResult::NotSigned);

        DigestVerifier::write_signature(&path, "AA11", None).unwrap();
        assert_eq!(verifier.verify_module(&path), VerificationResult::Verified);

        fs::write(&path, b"tampered").unwrap();
        assert_eq!(verifier.verify_module(&path), VerificationResult::Invalid);
    }

    #[test]
    fn test_untrusted_revoked_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let signers = registry();
        let verifier = DigestVerifier::new(signers.clone());

        DigestVerifier::write_signature(&path, "ffff", None).unwrap();
        assert_eq!(verifier.verify_module(&path), VerificationResult::Untrusted);

        DigestVerifier::write_signature(&path, "aa11", Some(1)).unwrap();
        assert_eq!(verifier.verify_module(&path), VerificationResult::Expired);

        DigestVerifier::write_signature(&path, "aa11", None).unwrap();
        signers.set_enabled("aa11", false);
        assert_eq!(verifier.verify_module(&path), VerificationResult::Revoked);
    }

    #[test]
    fn test_missing_artifact_is_error() {
        let verifier = DigestVerifier::new(registry());
        assert_eq!(
            verifier.verify_module(Path::new("/nonexistent/libmissing.so")),
            VerificationResult::Error
        );
    }
}
