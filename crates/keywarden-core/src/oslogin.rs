// ABOUTME: OS Login profile model, backend client trait, and the credential issuer.
// ABOUTME: Imports keys for interactive users and obtains certificates for federated ones.

use crate::credential::PlatformCredential;
use crate::error::{ApiError, AuthorizationError, Result};
use crate::identity::CallerIdentity;
use crate::locator::{ProjectLocator, ZoneLocator};
use crate::metadata::cancellable;
use crate::policy::AuthorizationMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keywarden_ssh::{CertificateSigner, KeySigner, SshError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Project used for profile lookups that are not tied to a real project.
/// Keys are identity-scoped, so any readable project works.
pub const WELL_KNOWN_PROJECT: &str = "windows-cloud";

const LINUX: &str = "LINUX";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PosixAccount {
    pub primary: bool,
    pub username: String,
    pub operating_system_type: String,
    pub account_id: String,
    pub home_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OsLoginSshPublicKey {
    pub key: String,
    pub fingerprint: String,
    /// `users/<email>/sshPublicKeys/<fingerprint>`
    pub name: String,
    #[serde(deserialize_with = "deserialize_int64", skip_serializing_if = "Option::is_none")]
    pub expiration_time_usec: Option<i64>,
}

/// int64 fields arrive as JSON strings; accept numbers too.
fn deserialize_int64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Option::<Int64>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Int64::Number(value)) => Ok(Some(value)),
        Some(Int64::Text(text)) => text.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginProfile {
    pub name: String,
    pub posix_accounts: Vec<PosixAccount>,
    /// Keyed by fingerprint.
    pub ssh_public_keys: BTreeMap<String, OsLoginSshPublicKey>,
}

impl LoginProfile {
    /// Username of the primary Linux account, if the profile has one.
    pub fn primary_linux_username(&self) -> Option<&str> {
        self.posix_accounts
            .iter()
            .find(|account| account.primary && account.operating_system_type == LINUX)
            .map(|account| account.username.as_str())
    }
}

/// A key registered in an OS Login profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsLoginAuthorizedKey {
    pub fingerprint: String,
    pub email: String,
    pub key_type: String,
    pub public_key: String,
    pub expire_on: Option<DateTime<Utc>>,
}

impl OsLoginAuthorizedKey {
    /// Interpret a profile key; `None` if its name or key is not in the
    /// expected shape.
    pub fn from_profile_key(key: &OsLoginSshPublicKey) -> Option<Self> {
        let name_parts: Vec<&str> = key.name.split('/').collect();
        let key_parts: Vec<&str> = key.key.split_whitespace().collect();

        match (name_parts.as_slice(), key_parts.as_slice()) {
            (["users", email, "sshPublicKeys", _], [key_type, public_key]) if !email.is_empty() => {
                Some(Self {
                    fingerprint: key.fingerprint.clone(),
                    email: email.to_string(),
                    key_type: key_type.to_string(),
                    public_key: public_key.to_string(),
                    expire_on: key
                        .expiration_time_usec
                        .and_then(DateTime::from_timestamp_micros),
                })
            }
            _ => None,
        }
    }
}

/// Operations of the OS Login backend used by the issuer.
#[async_trait]
pub trait OsLoginClient: Send + Sync {
    /// Add `key` to the caller's profile, creating the profile if needed.
    async fn import_ssh_public_key(
        &self,
        project: &ProjectLocator,
        key: &str,
        validity: Duration,
    ) -> std::result::Result<LoginProfile, ApiError>;

    async fn get_login_profile(
        &self,
        project: &ProjectLocator,
    ) -> std::result::Result<LoginProfile, ApiError>;

    async fn delete_ssh_public_key(&self, fingerprint: &str) -> std::result::Result<(), ApiError>;

    /// Obtain a short-lived certificate for `key`; HTTP 404 means the
    /// caller has no POSIX profile yet.
    async fn sign_public_key(
        &self,
        zone: &ZoneLocator,
        instance_id: u64,
        attached_service_account: Option<&str>,
        key: &str,
    ) -> std::result::Result<String, ApiError>;

    async fn provision_posix_profile(&self, region: &str) -> std::result::Result<(), ApiError>;
}

/// The VM an OS Login credential is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsLoginTarget {
    pub zone: ZoneLocator,
    pub instance_id: u64,
    pub attached_service_account: Option<String>,
    pub security_key_required: bool,
}

fn map_oslogin_error(context: &str, error: ApiError) -> AuthorizationError {
    if error.is_access_denied() {
        let message = if error.message().contains("roles/serviceusage.serviceUsageConsumer") {
            "You do not have sufficient access to log in. Because you authenticated using \
             workforce identity federation, you additionally need the 'Service Usage Consumer' \
             role (or an equivalent custom role) to log in."
                .to_string()
        } else {
            format!(
                "You do not have sufficient permissions to use OS Login: {}",
                error.message()
            )
        };
        AuthorizationError::Permission {
            message,
            source: error,
        }
    } else if error.is_bad_request() && error.message().contains("google.posix_username") {
        AuthorizationError::Policy(
            "Your workforce identity provider configuration doesn't contain an attribute \
             mapping for 'google.posix_username'. This mapping is required for using OS Login."
                .to_string(),
        )
    } else {
        AuthorizationError::api(context, error)
    }
}

fn map_certificate_error(error: SshError) -> AuthorizationError {
    match error {
        SshError::InvalidCertificate { excerpt, reason } => AuthorizationError::Format {
            what: "certificate",
            excerpt,
            reason,
        },
        other => other.into(),
    }
}

/// Issues OS Login credentials for one caller.
pub struct OsLoginIssuer {
    client: Arc<dyn OsLoginClient>,
    identity: CallerIdentity,
}

impl OsLoginIssuer {
    pub fn new(client: Arc<dyn OsLoginClient>, identity: CallerIdentity) -> Self {
        Self { client, identity }
    }

    fn reject_federated(&self) -> Result<()> {
        if self.identity.is_federated() {
            return Err(AuthorizationError::Policy(
                "This OS Login operation is not supported for workforce identity federation."
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Authorize `signer` for the target VM.
    ///
    /// Interactive identities import the public key into their profile.
    /// Federated identities get a certificate; if they have no POSIX profile
    /// yet, one is provisioned in the zone's region and signing is retried
    /// once.
    ///
    /// # Errors
    /// - `AuthorizationError::Policy` if the target requires security keys
    /// - `AuthorizationError::Validation` for a zero validity
    /// - `AuthorizationError::InvalidProfile` if the profile has no primary
    ///   Linux account
    /// - `AuthorizationError::Format` for a malformed certificate
    #[tracing::instrument(skip_all, fields(zone = %target.zone, instance_id = target.instance_id))]
    pub async fn authorize_key(
        &self,
        target: &OsLoginTarget,
        signer: Arc<dyn KeySigner>,
        validity: Duration,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        if target.security_key_required {
            return Err(AuthorizationError::Policy(
                "The VM instance requires OS Login with security keys, which is not supported"
                    .to_string(),
            ));
        }
        if validity.is_zero() {
            return Err(AuthorizationError::Validation(
                "key validity must be positive".to_string(),
            ));
        }

        let public_key = signer.to_openssh();

        if self.identity.is_federated() {
            let signed_key = self.sign_public_key(target, &public_key, cancel).await?;
            let certificate =
                CertificateSigner::new(signer, &signed_key).map_err(map_certificate_error)?;
            let username = certificate.username().to_string();
            tracing::info!(%username, "obtained OS Login certificate");

            Ok(PlatformCredential::new(
                Arc::new(certificate),
                username,
                AuthorizationMethod::OsLogin,
            ))
        } else {
            let profile = cancellable(
                cancel,
                self.client
                    .import_ssh_public_key(&target.zone.project(), &public_key, validity),
            )
            .await
            .map_err(|e| map_oslogin_error("importing SSH key into OS Login profile", e))?;

            if !profile
                .ssh_public_keys
                .values()
                .any(|key| key.key.contains(&public_key))
            {
                // Happens when the organization disallows managing keys via the API.
                return Err(AuthorizationError::Permission {
                    message: "You do not have sufficient permissions to publish an SSH key to OS Login"
                        .to_string(),
                    source: ApiError::status(403, "key missing from login profile after import"),
                });
            }

            let username = Self::lookup_username(&profile)?;
            tracing::info!(%username, "imported key into OS Login profile");

            Ok(PlatformCredential::new(
                signer,
                username,
                AuthorizationMethod::OsLogin,
            ))
        }
    }

    async fn sign_public_key(
        &self,
        target: &OsLoginTarget,
        public_key: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let sign = || {
            cancellable(
                cancel,
                self.client.sign_public_key(
                    &target.zone,
                    target.instance_id,
                    target.attached_service_account.as_deref(),
                    public_key,
                ),
            )
        };

        match sign().await {
            Ok(signed_key) => Ok(signed_key),
            Err(e) if e.is_not_found() => {
                let region = target.zone.region();
                tracing::info!(region, "no POSIX profile yet, provisioning one");

                cancellable(cancel, self.client.provision_posix_profile(region))
                    .await
                    .map_err(|e| map_oslogin_error("provisioning POSIX profile", e))?;

                sign()
                    .await
                    .map_err(|e| map_oslogin_error("signing SSH key", e))
            }
            Err(e) => Err(map_oslogin_error("signing SSH key", e)),
        }
    }

    /// The primary Linux username of `profile`.
    ///
    /// # Errors
    /// Returns `AuthorizationError::InvalidProfile` if there is none.
    pub fn lookup_username(profile: &LoginProfile) -> Result<String> {
        profile
            .primary_linux_username()
            .map(str::to_string)
            .ok_or_else(|| {
                AuthorizationError::InvalidProfile(
                    "The login profile does not contain a suitable POSIX account".to_string(),
                )
            })
    }

    /// Keys registered in the caller's profile. Entries that cannot be
    /// interpreted are skipped.
    #[tracing::instrument(skip_all)]
    pub async fn list_authorized_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<OsLoginAuthorizedKey>> {
        self.reject_federated()?;

        let profile = cancellable(
            cancel,
            self.client
                .get_login_profile(&ProjectLocator::new(WELL_KNOWN_PROJECT)),
        )
        .await
        .map_err(|e| map_oslogin_error("reading OS Login profile", e))?;

        Ok(profile
            .ssh_public_keys
            .values()
            .filter_map(OsLoginAuthorizedKey::from_profile_key)
            .collect())
    }

    /// Delete a key by fingerprint; deleting an unknown key succeeds.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete_authorized_key(
        &self,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.reject_federated()?;

        match cancellable(cancel, self.client.delete_ssh_public_key(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("key was already deleted");
                Ok(())
            }
            Err(e) => Err(map_oslogin_error("deleting SSH key from OS Login profile", e)),
        }
    }
}
