//! Trusted signer registry
//!
//! File format, one signer per line:
//! ```text
//! # name|email|keypath|fingerprint|enabled
//! Release Team|release@example.org|keys/release.pub|9f86d081884c7d65|true
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{CdmfError, Result};

/// A signer whose artifacts may be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedSigner {
    pub name: String,
    pub email: String,
    pub key_path: PathBuf,
    pub fingerprint: String,
    pub enabled: bool,
}

impl fmt::Display for TrustedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.name,
            self.email,
            self.key_path.display(),
            self.fingerprint,
            self.enabled
        )
    }
}

impl FromStr for TrustedSigner {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split('|').map(str::trim).collect();
        if fields.len() != 5 {
            return Err(CdmfError::invalid(format!(
                "expected 5 pipe-separated fields, got {}",
                fields.len()
            )));
        }
        if fields[3].is_empty() {
            return Err(CdmfError::invalid("signer fingerprint must not be empty"));
        }
        let enabled = match fields[4].to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => return Err(CdmfError::invalid(format!("invalid enabled flag: {}", other))),
        };
        Ok(TrustedSigner {
            name: fields[0].to_string(),
            email: fields[1].to_string(),
            key_path: PathBuf::from(fields[2]),
            fingerprint: fields[3].to_ascii_lowercase(),
            enabled,
        })
    }
}

/// Signers keyed by fingerprint
#[derive(Default)]
pub struct TrustedSignerRegistry {
    signers: RwLock<BTreeMap<String, TrustedSigner>>,
}

impl TrustedSignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a signer
    pub fn add(&self, mut signer: TrustedSigner) {
        signer.fingerprint = signer.fingerprint.to_ascii_lowercase();
        self.signers.write().insert(signer.fingerprint.clone(), signer);
    }

    pub fn remove(&self, fingerprint: &str) -> Option<TrustedSigner> {
        self.signers.write().remove(&fingerprint.to_ascii_lowercase())
    }

    pub fn get(&self, fingerprint: &str) -> Option<TrustedSigner> {
        self.signers
            .read()
            .get(&fingerprint.to_ascii_lowercase())
            .cloned()
    }

    /// Enable or disable a signer; returns false if unknown
    pub fn set_enabled(&self, fingerprint: &str, enabled: bool) -> bool {
        match self.signers.write().get_mut(&fingerprint.to_ascii_lowercase()) {
            Some(signer) => {
                signer.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<TrustedSigner> {
        self.signers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.signers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.read().is_empty()
    }

    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let contents = fs::read_to_string(path.as_ref())?;
        let loaded = self.load_from_str(&contents);
        info!("Loaded {} trusted signers from {:?}", loaded, path.as_ref());
        Ok(loaded)
    }

    pub fn load_from_str(&self, contents: &str) -> usize {
        let mut loaded = 0;
        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<TrustedSigner>() {
                Ok(signer) => {
                    self.add(signer);
                    loaded += 1;
                }
                Err(e) => warn!("Line {}: skipping malformed signer: {}", index + 1, e),
            }
        }
        loaded
    }

    pub fn to_config_string(&self) -> String {
        let mut out = String::from("# name|email|keypath|fingerprint|enabled\n");
        for signer in self.signers.read().values() {
            out.push_str(&signer.to_string());
            out.push('\n');
        }
        out
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.to_config_string())?;
        Ok(())
    }
}
