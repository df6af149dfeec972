// ABOUTME: Process-lifetime cache of ephemeral signers, one per key type.
// ABOUTME: Creation is serialized by a single lock; later lookups are lock-free.

use crate::error::Result;
use crate::key::SshKeyType;
use crate::signer::LocalSigner;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Lazily creates and keeps one ephemeral signer per key type.
///
/// Signers are never evicted: every connection attempt made through the same
/// cache reuses the same in-memory key for a given type. Own one instance and
/// hand it to whatever needs ephemeral keys rather than sharing a global.
#[derive(Debug, Default)]
pub struct EphemeralSignerCache {
    ed25519: OnceLock<Arc<LocalSigner>>,
    ecdsa_nistp256: OnceLock<Arc<LocalSigner>>,
    create_lock: Mutex<()>,
}

impl EphemeralSignerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key_type: SshKeyType) -> &OnceLock<Arc<LocalSigner>> {
        match key_type {
            SshKeyType::Ed25519 => &self.ed25519,
            SshKeyType::EcdsaNistp256 => &self.ecdsa_nistp256,
        }
    }

    /// Get the signer for `key_type`, generating it on first use.
    ///
    /// # Errors
    /// Returns an error if generating the key fails. A failed generation
    /// leaves the slot empty so a later call can try again.
    pub fn get(&self, key_type: SshKeyType) -> Result<Arc<LocalSigner>> {
        let slot = self.slot(key_type);
        if let Some(signer) = slot.get() {
            return Ok(Arc::clone(signer));
        }

        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another caller may have won the race while we waited.
        if let Some(signer) = slot.get() {
            return Ok(Arc::clone(signer));
        }

        let signer = Arc::new(LocalSigner::generate(key_type)?);
        tracing::debug!(%key_type, "created ephemeral signer");

        let _ = slot.set(Arc::clone(&signer));
        Ok(signer)
    }

    /// Whether a signer of `key_type` has been created yet.
    pub fn contains(&self, key_type: SshKeyType) -> bool {
        self.slot(key_type).get().is_some()
    }
}
