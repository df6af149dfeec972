// ABOUTME: Signing capability shared by local keys and OS Login certificates.
// ABOUTME: Produces SSH wire-format signatures from in-memory private keys.

use crate::error::{Result, SshError};
use crate::fingerprint::compute_fingerprint;
use crate::key::{generate_private_key, load_or_generate_key, SshKeyType};
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey};
use ssh_key::private::KeypairData;
use ssh_key::{PrivateKey, PublicKey};
use std::fmt;
use std::path::Path;

/// Something that can authenticate an SSH session.
///
/// The public identity is presented to the server as `algorithm` plus
/// `public_key_blob`; `sign` produces a signature in SSH wire format
/// (algorithm name as SSH string followed by the signature blob as SSH string).
pub trait KeySigner: Send + Sync + fmt::Debug {
    /// Algorithm name presented to the server.
    fn algorithm(&self) -> &str;

    /// Public key (or certificate) in SSH wire format.
    fn public_key_blob(&self) -> &[u8];

    /// Sign `data` with the underlying private key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// The public identity in `<algorithm> <base64>` form.
    fn to_openssh(&self) -> String {
        format!(
            "{} {}",
            self.algorithm(),
            base64::engine::general_purpose::STANDARD.encode(self.public_key_blob())
        )
    }
}

/// Append `bytes` as an SSH string (4-byte big-endian length prefix + data).
pub(crate) fn put_ssh_string(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buffer.extend_from_slice(bytes);
}

/// A signer backed by a private key held in this process.
///
/// The private key is zeroized by ssh-key when the signer is dropped.
pub struct LocalSigner {
    key_type: SshKeyType,
    private_key: PrivateKey,
    algorithm: String,
    blob: Vec<u8>,
}

impl LocalSigner {
    /// Create a signer around a freshly generated key.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate(key_type: SshKeyType) -> Result<Self> {
        Self::from_private_key(generate_private_key(key_type)?)
    }

    /// Create a signer from a persistent OpenSSH key file, generating the
    /// file first if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be loaded or created, or if the
    /// key type is unsupported.
    pub fn load_or_generate(key_path: &Path, key_type: SshKeyType) -> Result<Self> {
        Self::from_private_key(load_or_generate_key(key_path, key_type)?)
    }

    /// Wrap an existing private key.
    ///
    /// # Errors
    /// Returns `SshError::UnsupportedKeyType` for keys other than ed25519 and
    /// ecdsa-sha2-nistp256.
    pub fn from_private_key(private_key: PrivateKey) -> Result<Self> {
        let key_type = SshKeyType::from_algorithm(&private_key.algorithm())?;
        let (algorithm, blob) = split_openssh_public_key(private_key.public_key())?;

        Ok(Self {
            key_type,
            private_key,
            algorithm,
            blob,
        })
    }

    /// The type of the underlying key.
    pub fn key_type(&self) -> SshKeyType {
        self.key_type
    }

    /// The ssh-key public key.
    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("key_type", &self.key_type)
            .field("fingerprint", &compute_fingerprint(&self.blob))
            .finish()
    }
}

impl KeySigner for LocalSigner {
    fn algorithm(&self) -> &str {
        &self.algorithm
    }

    fn public_key_blob(&self) -> &[u8] {
        &self.blob
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut wire_data = Vec::new();

        match self.private_key.key_data() {
            KeypairData::Ed25519(keypair) => {
                let signing_key = SigningKey::from_bytes(&keypair.private.to_bytes());
                let signature = signing_key.sign(data);

                put_ssh_string(&mut wire_data, b"ssh-ed25519");
                put_ssh_string(&mut wire_data, &signature.to_bytes());
            }
            KeypairData::Ecdsa(_) => {
                let signature: ssh_key::Signature =
                    signature::Signer::try_sign(&self.private_key, data)
                        .map_err(|e| SshError::Sign(e.to_string()))?;

                put_ssh_string(&mut wire_data, signature.algorithm().as_str().as_bytes());
                put_ssh_string(&mut wire_data, signature.as_bytes());
            }
            other => {
                return Err(SshError::UnsupportedKeyType(
                    other
                        .algorithm()
                        .map(|a| a.as_str().to_string())
                        .unwrap_or_else(|_| "unknown".to_string()),
                ));
            }
        }

        Ok(wire_data)
    }
}

/// Split an OpenSSH public key line into its algorithm name and decoded blob.
fn split_openssh_public_key(public_key: &PublicKey) -> Result<(String, Vec<u8>)> {
    let openssh = public_key.to_openssh().map_err(SshError::Encode)?;
    let mut parts = openssh.split_whitespace();

    let algorithm = parts.next().unwrap_or_default().to_string();
    let blob = parts
        .next()
        .and_then(|b| base64::engine::general_purpose::STANDARD.decode(b).ok())
        .ok_or_else(|| SshError::UnsupportedKeyType(algorithm.clone()))?;

    Ok((algorithm, blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn read_ssh_string(data: &[u8], offset: usize) -> (&[u8], usize) {
        let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        (&data[offset + 4..offset + 4 + len], offset + 4 + len)
    }

    #[test]
    fn test_local_signer_openssh_matches_public_key() {
        for key_type in SshKeyType::ALL {
            let signer = LocalSigner::generate(key_type).expect("should generate signer");
            let expected = signer.public_key().to_openssh().unwrap();

            assert_eq!(signer.algorithm(), key_type.ssh_name());
            assert!(expected.starts_with(&signer.to_openssh()));
        }
    }

    #[test]
    fn test_ed25519_signature_wire_format() {
        let signer = LocalSigner::generate(SshKeyType::Ed25519).unwrap();
        let wire = signer.sign(b"test").expect("should sign");

        // 4 + 11 ("ssh-ed25519") + 4 + 64
        assert_eq!(wire.len(), 83);
        let (algo, next) = read_ssh_string(&wire, 0);
        assert_eq!(algo, b"ssh-ed25519");
        let (sig, _) = read_ssh_string(&wire, next);
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn test_ed25519_signature_verifies_with_dalek() {
        let signer = LocalSigner::generate(SshKeyType::Ed25519).unwrap();
        let message = b"verify this message";
        let wire = signer.sign(message).expect("should sign");

        let sig_bytes: [u8; 64] = wire[19..83].try_into().expect("should be 64 bytes");
        let signature = Signature::from_bytes(&sig_bytes);

        let pub_key_bytes: [u8; 32] = match signer.public_key().key_data() {
            ssh_key::public::KeyData::Ed25519(ed) => *ed.as_ref(),
            _ => panic!("expected ed25519 key"),
        };
        let verifying_key =
            VerifyingKey::from_bytes(&pub_key_bytes).expect("should create verifying key");

        verifying_key
            .verify(message, &signature)
            .expect("signature should verify");
    }

    #[test]
    fn test_ecdsa_signature_carries_algorithm_name() {
        let signer = LocalSigner::generate(SshKeyType::EcdsaNistp256).unwrap();
        let wire = signer.sign(b"test").expect("should sign");

        let (algo, next) = read_ssh_string(&wire, 0);
        assert_eq!(algo, b"ecdsa-sha2-nistp256");
        let (sig, end) = read_ssh_string(&wire, next);
        assert!(!sig.is_empty());
        assert_eq!(end, wire.len());
    }

    #[test]
    fn test_debug_does_not_leak_private_key() {
        let signer = LocalSigner::generate(SshKeyType::Ed25519).unwrap();
        let debug = format!("{:?}", signer);
        assert!(debug.contains("LocalSigner"));
        assert!(debug.contains("fingerprint"));
        assert!(!debug.contains("private"));
    }

    #[test]
    fn test_load_or_generate_signer() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let key_path = temp_dir.path().join("persistent_key");

        let first = LocalSigner::load_or_generate(&key_path, SshKeyType::Ed25519).unwrap();
        let second = LocalSigner::load_or_generate(&key_path, SshKeyType::Ed25519).unwrap();

        assert_eq!(first.public_key_blob(), second.public_key_blob());
    }
}
