// ABOUTME: Error types for local SSH key operations using thiserror.
// ABOUTME: Covers key files, key generation, signing, and OS Login certificates.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Filesystem step that failed while handling a persistent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileAction {
    Read,
    Write,
    CreateDirectory,
    RestrictPermissions,
}

impl fmt::Display for KeyFileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyFileAction::Read => "read key file",
            KeyFileAction::Write => "write key file",
            KeyFileAction::CreateDirectory => "create key directory",
            KeyFileAction::RestrictPermissions => "restrict permissions of",
        })
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("failed to {action} {}: {source}", path.display())]
    KeyFile {
        action: KeyFileAction,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not hold an OpenSSH private key.
    #[error("{} is not an OpenSSH private key: {source}", path.display())]
    InvalidKeyFile {
        path: PathBuf,
        #[source]
        source: ssh_key::Error,
    },

    #[error("failed to generate {key_type} key: {source}")]
    Generate {
        key_type: &'static str,
        #[source]
        source: ssh_key::Error,
    },

    #[error("failed to encode key in OpenSSH format: {0}")]
    Encode(#[source] ssh_key::Error),

    #[error("unsupported key type: {0} (only ed25519 and ecdsa-sha2-nistp256 are supported)")]
    UnsupportedKeyType(String),

    #[error("failed to sign data: {0}")]
    Sign(String),

    /// A signed key returned by OS Login could not be used as a certificate.
    #[error("invalid certificate '{excerpt}': {reason}")]
    InvalidCertificate { excerpt: String, reason: String },
}

impl SshError {
    pub(crate) fn key_file(
        action: KeyFileAction,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> SshError {
        let path = path.into();
        move |source| SshError::KeyFile {
            action,
            path,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SshError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_key_file_error_names_action_and_path() {
        let err = SshError::key_file(KeyFileAction::Read, "/keys/id_keywarden")(io::Error::new(
            io::ErrorKind::NotFound,
            "no such file",
        ));

        assert_eq!(
            err.to_string(),
            "failed to read key file /keys/id_keywarden: no such file"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_invalid_key_file_display() {
        let err = SshError::InvalidKeyFile {
            path: PathBuf::from("/keys/garbage"),
            source: ssh_key::Error::AlgorithmUnknown,
        };
        assert!(err
            .to_string()
            .starts_with("/keys/garbage is not an OpenSSH private key"));
    }

    #[test]
    fn test_invalid_certificate_display() {
        let err = SshError::InvalidCertificate {
            excerpt: "ssh-ed25519 AAAA".to_string(),
            reason: "not a certificate type".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid certificate 'ssh-ed25519 AAAA': not a certificate type"
        );
        assert!(err.source().is_none());
    }
}
