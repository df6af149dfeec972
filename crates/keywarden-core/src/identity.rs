// ABOUTME: The signed-in caller on whose behalf credentials are authorized.
// ABOUTME: Identity kind decides between OS Login key import and certificate signing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    /// A regular account signed in interactively.
    Interactive,
    /// A workforce identity federated from an external provider.
    Federated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    login_name: String,
    kind: IdentityKind,
}

impl CallerIdentity {
    pub fn interactive(login_name: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            kind: IdentityKind::Interactive,
        }
    }

    pub fn federated(login_name: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            kind: IdentityKind::Federated,
        }
    }

    /// Login name, usually an email address. Used to derive default
    /// usernames and stamped as owner into managed keys.
    pub fn login_name(&self) -> &str {
        &self.login_name
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn is_federated(&self) -> bool {
        self.kind == IdentityKind::Federated
    }
}
