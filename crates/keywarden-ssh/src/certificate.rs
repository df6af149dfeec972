// ABOUTME: Signer that presents an OS Login certificate in place of a plain key.
// ABOUTME: Signing is delegated to the local key the certificate was issued for.

use crate::error::{Result, SshError};
use crate::signer::KeySigner;
use base64::Engine;
use std::fmt;
use std::sync::Arc;

/// Suffix shared by all OpenSSH certificate algorithm names.
pub const CERTIFICATE_TYPE_SUFFIX: &str = "-cert-v01@openssh.com";

const EXCERPT_LEN: usize = 48;

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn invalid(text: &str, reason: impl Into<String>) -> SshError {
    SshError::InvalidCertificate {
        excerpt: excerpt(text),
        reason: reason.into(),
    }
}

/// A certified public identity backed by an existing signer.
///
/// The certificate replaces the public key presented to the server while
/// every signature still comes from `inner`.
pub struct CertificateSigner {
    inner: Arc<dyn KeySigner>,
    certificate_type: String,
    certificate: Vec<u8>,
    username: String,
}

impl CertificateSigner {
    /// Wrap `inner` with a signed key of the form
    /// `<cert-type> <base64-cert> [username]`.
    ///
    /// The POSIX username is the third field when present. Otherwise it is
    /// taken from the first valid principal of the decoded certificate.
    ///
    /// # Errors
    /// Returns `SshError::InvalidCertificate` if the type is not a certificate
    /// type, does not match the inner key, the blob is not base64, or no
    /// username can be determined.
    pub fn new(inner: Arc<dyn KeySigner>, signed_key: &str) -> Result<Self> {
        let mut parts = signed_key.split_whitespace();

        let certificate_type = parts
            .next()
            .ok_or_else(|| invalid(signed_key, "empty signed key"))?;
        let base_algorithm = certificate_type
            .strip_suffix(CERTIFICATE_TYPE_SUFFIX)
            .ok_or_else(|| invalid(signed_key, "not a certificate type"))?;
        if base_algorithm != inner.algorithm() {
            return Err(invalid(
                signed_key,
                format!(
                    "certificate type does not match key type {}",
                    inner.algorithm()
                ),
            ));
        }

        let encoded = parts
            .next()
            .ok_or_else(|| invalid(signed_key, "missing certificate blob"))?;
        let certificate = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| invalid(signed_key, format!("certificate blob is not base64: {e}")))?;

        let username = match parts.next() {
            Some(username) => username.to_string(),
            None => principal_from_certificate(signed_key)?,
        };

        Ok(Self {
            inner,
            certificate_type: certificate_type.to_string(),
            certificate,
            username,
        })
    }

    /// POSIX username the certificate was issued for.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The signer that produces signatures for this certificate.
    pub fn inner(&self) -> &Arc<dyn KeySigner> {
        &self.inner
    }
}

fn principal_from_certificate(signed_key: &str) -> Result<String> {
    let certificate = ssh_key::Certificate::from_openssh(signed_key.trim())
        .map_err(|e| invalid(signed_key, format!("certificate cannot be decoded: {e}")))?;

    certificate
        .valid_principals()
        .first()
        .cloned()
        .ok_or_else(|| invalid(signed_key, "certificate has no principals"))
}

impl fmt::Debug for CertificateSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSigner")
            .field("certificate_type", &self.certificate_type)
            .field("username", &self.username)
            .field("inner", &self.inner)
            .finish()
    }
}

impl KeySigner for CertificateSigner {
    fn algorithm(&self) -> &str {
        &self.certificate_type
    }

    fn public_key_blob(&self) -> &[u8] {
        &self.certificate
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign(data)
    }
}
