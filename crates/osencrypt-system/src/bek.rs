//! Finds the BEK passphrase file on the mounted key volume.

use log::{debug, info};
use osencrypt_core::config::BekCfg;
use osencrypt_core::error::{OsEncryptError, OsEncryptResult};
use osencrypt_core::provider::BekLocator;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Picks the first candidate path that exists. When
/// `bek.expected_sha256` is set the file contents must hash to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBekLocator;

impl FileBekLocator {
    pub fn new() -> Self {
        Self
    }

    fn verify(path: &Path, expected: &str) -> OsEncryptResult<()> {
        let contents = Zeroizing::new(fs::read(path)?);
        let digest = hex::encode(Sha256::digest(&contents[..]));
        if !expected.trim().eq_ignore_ascii_case(&digest) {
            return Err(OsEncryptError::MissingKeySource(format!(
                "{} does not match bek.expected_sha256 (actual {digest})",
                path.display()
            )));
        }
        debug!("{} matches bek.expected_sha256", path.display());
        Ok(())
    }
}

impl BekLocator for FileBekLocator {
    fn passphrase_file(&self, config: &BekCfg) -> OsEncryptResult<PathBuf> {
        let found = config
            .candidates
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                OsEncryptError::MissingKeySource(format!(
                    "none of {} exist",
                    config.candidates.join(", ")
                ))
            })?;

        if let Some(expected) = &config.expected_sha256 {
            Self::verify(&found, expected)?;
        }
        info!("using BEK passphrase file {}", found.display());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(candidates: Vec<PathBuf>, expected_sha256: Option<String>) -> BekCfg {
        BekCfg {
            candidates: candidates
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            expected_sha256,
        }
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("LinuxPassPhraseFileName");
        let present = dir.path().join("LinuxPassPhraseFileName_1_0");
        fs::write(&present, b"passphrase").unwrap();

        let path = FileBekLocator::new()
            .passphrase_file(&cfg(vec![missing, present.clone()], None))
            .unwrap();
        assert_eq!(path, present);
    }

    #[test]
    fn no_candidate_is_missing_key_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBekLocator::new()
            .passphrase_file(&cfg(vec![dir.path().join("absent")], None))
            .unwrap_err();
        assert!(matches!(err, OsEncryptError::MissingKeySource(_)));
    }

    #[test]
    fn checksum_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("LinuxPassPhraseFileName");
        fs::write(&key, b"passphrase").unwrap();
        let digest = hex::encode(Sha256::digest(b"passphrase"));

        let ok = FileBekLocator::new()
            .passphrase_file(&cfg(vec![key.clone()], Some(digest.to_uppercase())))
            .unwrap();
        assert_eq!(ok, key);

        let err = FileBekLocator::new()
            .passphrase_file(&cfg(vec![key], Some("00".repeat(32))))
            .unwrap_err();
        assert!(matches!(err, OsEncryptError::MissingKeySource(_)));
    }
}
