// ABOUTME: Policy snapshot derived from instance and project metadata flags.
// ABOUTME: Backend and metadata-scope selection as pure functions of that snapshot.

use crate::authorized_keys::LEGACY_METADATA_KEY;
use crate::compute::{Instance, Project};
use crate::error::{AuthorizationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

pub const ENABLE_OS_LOGIN_FLAG: &str = "enable-oslogin";
pub const ENABLE_OS_LOGIN_SECURITY_KEY_FLAG: &str = "enable-oslogin-sk";
pub const BLOCK_PROJECT_SSH_KEYS_FLAG: &str = "block-project-ssh-keys";

/// How a single credential was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizationMethod {
    InstanceMetadata,
    ProjectMetadata,
    #[serde(rename = "oslogin")]
    OsLogin,
}

impl AuthorizationMethod {
    pub const ALL: [AuthorizationMethod; 3] = [
        AuthorizationMethod::InstanceMetadata,
        AuthorizationMethod::ProjectMetadata,
        AuthorizationMethod::OsLogin,
    ];

    fn bit(self) -> u8 {
        match self {
            AuthorizationMethod::InstanceMetadata => 1,
            AuthorizationMethod::ProjectMetadata => 2,
            AuthorizationMethod::OsLogin => 4,
        }
    }
}

impl fmt::Display for AuthorizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthorizationMethod::InstanceMetadata => "instance metadata",
            AuthorizationMethod::ProjectMetadata => "project metadata",
            AuthorizationMethod::OsLogin => "OS Login",
        })
    }
}

/// The set of methods a caller is willing to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthorizationMethods(u8);

impl AuthorizationMethods {
    pub const NONE: AuthorizationMethods = AuthorizationMethods(0);
    pub const ALL: AuthorizationMethods = AuthorizationMethods(7);

    pub fn contains(self, method: AuthorizationMethod) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn with(self, method: AuthorizationMethod) -> Self {
        AuthorizationMethods(self.0 | method.bit())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = AuthorizationMethod> {
        AuthorizationMethod::ALL
            .into_iter()
            .filter(move |method| self.contains(*method))
    }
}

impl From<AuthorizationMethod> for AuthorizationMethods {
    fn from(method: AuthorizationMethod) -> Self {
        AuthorizationMethods::NONE.with(method)
    }
}

impl BitOr<AuthorizationMethod> for AuthorizationMethods {
    type Output = AuthorizationMethods;

    fn bitor(self, method: AuthorizationMethod) -> Self::Output {
        self.with(method)
    }
}

impl BitOr for AuthorizationMethod {
    type Output = AuthorizationMethods;

    fn bitor(self, other: AuthorizationMethod) -> Self::Output {
        AuthorizationMethods::from(self).with(other)
    }
}

impl FromIterator<AuthorizationMethod> for AuthorizationMethods {
    fn from_iter<I: IntoIterator<Item = AuthorizationMethod>>(iter: I) -> Self {
        iter.into_iter()
            .fold(AuthorizationMethods::NONE, AuthorizationMethods::with)
    }
}

/// Effective access policy of one instance, read fresh for every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstancePolicySnapshot {
    pub os_login_enabled: bool,
    pub os_login_requires_security_key: bool,
    pub project_keys_blocked: bool,
    /// Only the instance is inspected for legacy keys.
    pub legacy_key_present: bool,
}

impl InstancePolicySnapshot {
    /// Combine instance and project flags. A flag set on the instance, even
    /// to `false`, overrides the project value.
    pub fn resolve(instance: &Instance, project: &Project) -> Self {
        let flag = |key: &str| {
            instance
                .metadata
                .flag(key)
                .or_else(|| project.common_instance_metadata.flag(key))
                .unwrap_or(false)
        };

        Self {
            os_login_enabled: flag(ENABLE_OS_LOGIN_FLAG),
            os_login_requires_security_key: flag(ENABLE_OS_LOGIN_SECURITY_KEY_FLAG),
            project_keys_blocked: flag(BLOCK_PROJECT_SSH_KEYS_FLAG),
            legacy_key_present: instance
                .metadata
                .get(LEGACY_METADATA_KEY)
                .is_some_and(|value| !value.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OsLogin,
    Metadata,
}

/// Pick the backend for an attempt.
///
/// # Errors
/// Returns `AuthorizationError::Policy` when OS Login is enabled but either
/// requires security keys or is not among `allowed`.
pub fn select_backend(
    policy: &InstancePolicySnapshot,
    allowed: AuthorizationMethods,
) -> Result<Backend> {
    if !policy.os_login_enabled {
        return Ok(Backend::Metadata);
    }
    if policy.os_login_requires_security_key {
        return Err(AuthorizationError::Policy(
            "The VM instance requires OS Login with security keys, which is not supported"
                .to_string(),
        ));
    }
    if !allowed.contains(AuthorizationMethod::OsLogin) {
        return Err(AuthorizationError::Policy(
            "The VM instance requires OS Login, but OS Login is not among the allowed authorization methods"
                .to_string(),
        ));
    }
    Ok(Backend::OsLogin)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataScopeKind {
    Instance,
    Project,
}

impl MetadataScopeKind {
    pub fn method(self) -> AuthorizationMethod {
        match self {
            MetadataScopeKind::Instance => AuthorizationMethod::InstanceMetadata,
            MetadataScopeKind::Project => AuthorizationMethod::ProjectMetadata,
        }
    }
}

/// Choose where a new metadata key goes.
///
/// `can_write_project` is the result of the permission check and is only
/// consulted when both scopes are allowed and project keys are not blocked.
///
/// # Errors
/// Returns `AuthorizationError::Validation` if neither scope is allowed and
/// `AuthorizationError::Policy` if only project scope is allowed but the
/// instance blocks project keys.
pub fn select_metadata_scope(
    policy: &InstancePolicySnapshot,
    allowed: AuthorizationMethods,
    can_write_project: bool,
) -> Result<MetadataScopeKind> {
    let instance_allowed = allowed.contains(AuthorizationMethod::InstanceMetadata);
    let project_allowed = allowed.contains(AuthorizationMethod::ProjectMetadata);

    match (project_allowed, instance_allowed) {
        (true, true) if policy.project_keys_blocked || !can_write_project => {
            Ok(MetadataScopeKind::Instance)
        }
        (true, true) => Ok(MetadataScopeKind::Project),
        (true, false) if policy.project_keys_blocked => Err(AuthorizationError::Policy(
            "The VM instance does not allow project-level SSH keys, and instance-level keys are not among the allowed authorization methods"
                .to_string(),
        )),
        (true, false) => Ok(MetadataScopeKind::Project),
        (false, true) => Ok(MetadataScopeKind::Instance),
        (false, false) => Err(AuthorizationError::Validation(
            "neither instance nor project metadata is an allowed authorization method".to_string(),
        )),
    }
}
