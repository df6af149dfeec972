// ABOUTME: The credential handed to the SSH connection layer.
// ABOUTME: Bundles the signer, the POSIX username, and how the key was authorized.

use crate::policy::AuthorizationMethod;
use keywarden_ssh::KeySigner;
use std::sync::Arc;

/// Result of a successful authorization attempt.
///
/// Dropping the credential releases its reference to the key material.
#[derive(Debug, Clone)]
pub struct PlatformCredential {
    signer: Arc<dyn KeySigner>,
    username: String,
    method: AuthorizationMethod,
}

impl PlatformCredential {
    pub fn new(
        signer: Arc<dyn KeySigner>,
        username: impl Into<String>,
        method: AuthorizationMethod,
    ) -> Self {
        Self {
            signer,
            username: username.into(),
            method,
        }
    }

    pub fn signer(&self) -> &Arc<dyn KeySigner> {
        &self.signer
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn method(&self) -> AuthorizationMethod {
        self.method
    }
}
