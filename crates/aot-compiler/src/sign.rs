//! Local code signing of compiled artifacts.

use log::debug;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("code signing is disabled")]
    Disabled,

    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {0} is empty")]
    EmptyArtifact(String),

    #[error("signer rejected artifact: {0}")]
    Rejected(String),
}

/// Signs a freshly produced artifact for the app that owns it.
pub trait CodeSigner: Send + Sync {
    /// Returns the signature bytes for `artifact` bound to `app_identifier`.
    fn sign_local_code(&self, app_identifier: &str, artifact: &Path) -> Result<Vec<u8>, SignError>;
}

/// Signs by hashing the app identifier together with the artifact contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSigner;

impl CodeSigner for DigestSigner {
    fn sign_local_code(&self, app_identifier: &str, artifact: &Path) -> Result<Vec<u8>, SignError> {
        let contents = fs::read(artifact).map_err(|source| SignError::Read {
            path: artifact.display().to_string(),
            source,
        })?;
        if contents.is_empty() {
            return Err(SignError::EmptyArtifact(artifact.display().to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(app_identifier.as_bytes());
        hasher.update([0u8]);
        hasher.update(&contents);
        let digest = hasher.finalize().to_vec();
        debug!(
            "signed {} for {}: {}",
            artifact.display(),
            app_identifier,
            hex::encode(&digest)
        );
        Ok(digest)
    }
}

/// Stand-in for builds without code signing; every request fails with
/// [`SignError::Disabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSigner;

impl CodeSigner for DisabledSigner {
    fn sign_local_code(&self, _app_identifier: &str, _artifact: &Path) -> Result<Vec<u8>, SignError> {
        Err(SignError::Disabled)
    }
}

/// The signer this build should use.
pub fn default_signer(enabled: bool) -> Box<dyn CodeSigner> {
    if enabled && cfg!(feature = "code-signing") {
        Box::new(DigestSigner)
    } else {
        Box::new(DisabledSigner)
    }
}

/// Signature bytes as carried over IPC.
pub fn to_sig_data(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| i16::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_depends_on_identity_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("entry.an");
        fs::write(&artifact, b"native code").unwrap();

        let a = DigestSigner.sign_local_code("id1", &artifact).unwrap();
        let b = DigestSigner.sign_local_code("id2", &artifact).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);

        fs::write(&artifact, b"other code").unwrap();
        let c = DigestSigner.sign_local_code("id1", &artifact).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_or_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("entry.an");
        assert!(matches!(
            DigestSigner.sign_local_code("id1", &artifact),
            Err(SignError::Read { .. })
        ));

        fs::write(&artifact, b"").unwrap();
        assert!(matches!(
            DigestSigner.sign_local_code("id1", &artifact),
            Err(SignError::EmptyArtifact(_))
        ));
    }

    #[test]
    fn test_disabled_signer() {
        assert!(matches!(
            DisabledSigner.sign_local_code("id1", Path::new("/x")),
            Err(SignError::Disabled)
        ));
        assert!(matches!(
            default_signer(false).sign_local_code("id1", Path::new("/x")),
            Err(SignError::Disabled)
        ));
    }

    #[test]
    fn test_sig_data_is_unsigned_bytes() {
        assert_eq!(to_sig_data(&[0, 127, 255]), vec![0, 127, 255]);
    }
}
