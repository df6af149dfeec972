// ABOUTME: Local SSH key material for keywarden credential authorization.
// ABOUTME: Provides key types, signers, the ephemeral cache, and certificate wrapping.

//! # keywarden-ssh
//!
//! Local key material used when authorizing SSH access to VM instances.
//!
//! ## Features
//!
//! - **Signers**: ed25519 and ecdsa-sha2-nistp256 keys that sign in SSH wire format
//! - **Ephemeral cache**: one lazily generated in-memory key per key type
//! - **Persistent keys**: load or generate an OpenSSH private key file
//! - **Certificates**: present an OS Login certificate while signing with the local key
//! - **Fingerprinting**: SHA256 fingerprints of public key blobs
//!
//! ## Example
//!
//! ```no_run
//! use keywarden_ssh::{compute_fingerprint, EphemeralSignerCache, KeySigner, SshKeyType};
//!
//! let cache = EphemeralSignerCache::new();
//! let signer = cache.get(SshKeyType::Ed25519).expect("key should generate");
//!
//! println!("{}", signer.to_openssh());
//! println!("fingerprint: {}", compute_fingerprint(signer.public_key_blob()));
//! ```

mod cache;
mod certificate;
mod error;
mod fingerprint;
mod key;
mod signer;

pub use cache::EphemeralSignerCache;
pub use certificate::{CertificateSigner, CERTIFICATE_TYPE_SUFFIX};
pub use error::{KeyFileAction, Result, SshError};
pub use fingerprint::compute_fingerprint;
pub use key::{
    default_key_path, generate_key, generate_private_key, load_key, load_or_generate_key,
    xdg_config_dir, SshKeyType,
};
pub use signer::{KeySigner, LocalSigner};

// Re-export ssh_key types for convenience
pub use ssh_key::{PrivateKey, PublicKey};
