// ABOUTME: SSH public key fingerprint computation.
// ABOUTME: Computes lowercase hex SHA256 fingerprints over the public key wire blob.

use sha2::{Digest, Sha256};

/// Compute the SHA256 fingerprint of a public key blob (hex encoded, lowercase).
///
/// `blob` is the SSH wire encoding of the key: algorithm name as SSH string
/// followed by the key data. This is the decoded second field of an OpenSSH
/// public key line, and the same fingerprint OS Login uses to name keys.
///
/// # Returns
/// A 64-character lowercase hex string representing the SHA256 hash.
pub fn compute_fingerprint(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hex::encode(hasher.finalize())
}
