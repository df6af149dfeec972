// ABOUTME: SSH key types, generation, and persistence utilities.
// ABOUTME: Creates in-memory key pairs and loads or writes OpenSSH key files.

use crate::error::{KeyFileAction, Result, SshError};
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, EcdsaCurve, LineEnding, PrivateKey};
use std::fmt;
use std::path::{Path, PathBuf};

/// Key types that can back a local signer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SshKeyType {
    #[default]
    Ed25519,
    EcdsaNistp256,
}

impl SshKeyType {
    /// All supported key types.
    pub const ALL: [SshKeyType; 2] = [SshKeyType::Ed25519, SshKeyType::EcdsaNistp256];

    /// The ssh-key algorithm used to generate keys of this type.
    pub fn algorithm(self) -> Algorithm {
        match self {
            SshKeyType::Ed25519 => Algorithm::Ed25519,
            SshKeyType::EcdsaNistp256 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        }
    }

    /// SSH algorithm name as it appears in authorized-keys lines.
    pub fn ssh_name(self) -> &'static str {
        match self {
            SshKeyType::Ed25519 => "ssh-ed25519",
            SshKeyType::EcdsaNistp256 => "ecdsa-sha2-nistp256",
        }
    }

    /// Map an ssh-key algorithm back onto a supported key type.
    ///
    /// # Errors
    /// Returns `SshError::UnsupportedKeyType` for any other algorithm.
    pub fn from_algorithm(algorithm: &Algorithm) -> Result<Self> {
        match algorithm {
            Algorithm::Ed25519 => Ok(SshKeyType::Ed25519),
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            } => Ok(SshKeyType::EcdsaNistp256),
            other => Err(SshError::UnsupportedKeyType(other.as_str().to_string())),
        }
    }
}

impl fmt::Display for SshKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ssh_name())
    }
}

/// Get XDG-style config directory (~/.config/keywarden).
///
/// Uses `XDG_CONFIG_HOME` if set, otherwise falls back to `~/.config`.
pub fn xdg_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("keywarden"))
}

/// Get the default persistent key path (~/.config/keywarden/id_keywarden).
pub fn default_key_path() -> Option<PathBuf> {
    xdg_config_dir().map(|p| p.join("id_keywarden"))
}

/// Generate a new in-memory private key of the given type.
///
/// # Errors
/// Returns an error if the underlying key generation fails.
pub fn generate_private_key(key_type: SshKeyType) -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::thread_rng(), key_type.algorithm()).map_err(|source| {
        SshError::Generate {
            key_type: key_type.ssh_name(),
            source,
        }
    })
}

/// Load an OpenSSH private key file.
///
/// # Errors
/// Returns an error if the file cannot be read or holds no private key.
pub fn load_key(key_path: &Path) -> Result<PrivateKey> {
    let key_data = std::fs::read_to_string(key_path)
        .map_err(SshError::key_file(KeyFileAction::Read, key_path))?;

    PrivateKey::from_openssh(&key_data).map_err(|source| SshError::InvalidKeyFile {
        path: key_path.to_path_buf(),
        source,
    })
}

fn write_key_file(path: &Path, contents: &str, owner_only: bool) -> Result<()> {
    std::fs::write(path, contents.as_bytes())
        .map_err(SshError::key_file(KeyFileAction::Write, path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if owner_only {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(SshError::key_file(KeyFileAction::RestrictPermissions, path))?;
        }
    }
    #[cfg(not(unix))]
    let _ = owner_only;

    Ok(())
}

/// Generate a key pair of `key_type` and store it at `key_path`.
///
/// The private key is written with mode 0600 and the public key next to it
/// with a `.pub` extension. Missing parent directories are created.
///
/// # Errors
/// Returns an error if generation, encoding, or any file operation fails.
pub fn generate_key(key_path: &Path, key_type: SshKeyType) -> Result<PrivateKey> {
    tracing::info!(path = %key_path.display(), %key_type, "generating persistent SSH key");

    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(SshError::key_file(KeyFileAction::CreateDirectory, parent))?;
    }

    let private_key = generate_private_key(key_type)?;
    let encoded_private = private_key
        .to_openssh(LineEnding::LF)
        .map_err(SshError::Encode)?;
    write_key_file(key_path, &encoded_private, true)?;

    let encoded_public = private_key
        .public_key()
        .to_openssh()
        .map_err(SshError::Encode)?;
    write_key_file(&key_path.with_extension("pub"), &encoded_public, false)?;

    Ok(private_key)
}

/// Load the key at `key_path`, generating one of `key_type` if the file
/// does not exist. An existing key keeps the type it was created with.
///
/// # Errors
/// Returns an error if loading or generating the key fails.
pub fn load_or_generate_key(key_path: &Path, key_type: SshKeyType) -> Result<PrivateKey> {
    if key_path.exists() {
        load_key(key_path)
    } else {
        generate_key(key_path, key_type)
    }
}
