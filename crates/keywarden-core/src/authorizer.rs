// ABOUTME: Top-level credential authorization for one VM instance.
// ABOUTME: Resolves instance policy, picks OS Login or metadata keys, returns one credential.

use crate::compute::{MetadataStore, PermissionChecker};
use crate::config::AuthorizerConfig;
use crate::credential::PlatformCredential;
use crate::error::{AuthorizationError, Result};
use crate::identity::CallerIdentity;
use crate::locator::InstanceLocator;
use crate::metadata::{InstanceKeyProcessor, DEFAULT_MAX_UPDATE_ATTEMPTS};
use crate::oslogin::{OsLoginClient, OsLoginIssuer, OsLoginTarget};
use crate::policy::{select_backend, AuthorizationMethods, Backend};
use crate::username::PosixUsername;
use keywarden_ssh::{EphemeralSignerCache, KeySigner, LocalSigner, SshKeyType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default validity of a published key.
pub const DEFAULT_KEY_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Parameters of one authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub instance: InstanceLocator,
    pub validity: Duration,
    pub preferred_username: Option<String>,
    pub allowed_methods: AuthorizationMethods,
    pub key_type: SshKeyType,
}

impl AuthorizationRequest {
    pub fn new(instance: InstanceLocator) -> Self {
        Self {
            instance,
            validity: DEFAULT_KEY_VALIDITY,
            preferred_username: None,
            allowed_methods: AuthorizationMethods::ALL,
            key_type: SshKeyType::default(),
        }
    }

    pub fn from_config(instance: InstanceLocator, config: &AuthorizerConfig) -> Self {
        Self {
            instance,
            validity: config.key_validity(),
            preferred_username: config.preferred_username.clone(),
            allowed_methods: config.allowed_methods(),
            key_type: config.key_type,
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_preferred_username(mut self, username: impl Into<String>) -> Self {
        self.preferred_username = Some(username.into());
        self
    }

    pub fn with_allowed_methods(mut self, allowed_methods: impl Into<AuthorizationMethods>) -> Self {
        self.allowed_methods = allowed_methods.into();
        self
    }

    pub fn with_key_type(mut self, key_type: SshKeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Checks that need no network access.
    fn validate(&self) -> Result<()> {
        if self.allowed_methods.is_empty() {
            return Err(AuthorizationError::Validation(
                "no authorization method is allowed".to_string(),
            ));
        }
        if self.validity.is_zero() {
            return Err(AuthorizationError::Validation(
                "key validity must be positive".to_string(),
            ));
        }
        if let Some(username) = &self.preferred_username {
            PosixUsername::new(username.as_str())?;
        }
        Ok(())
    }
}

/// Issues SSH credentials for VM instances on behalf of one caller.
///
/// Each call to [`authorize`](Self::authorize) reads the instance policy
/// afresh, takes exactly one backend, and either returns a credential or
/// fails without leaving a partial one behind.
pub struct CredentialAuthorizer {
    store: Arc<dyn MetadataStore>,
    permissions: Arc<dyn PermissionChecker>,
    oslogin: OsLoginIssuer,
    identity: CallerIdentity,
    signers: Arc<EphemeralSignerCache>,
    max_update_attempts: u32,
}

impl CredentialAuthorizer {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        permissions: Arc<dyn PermissionChecker>,
        oslogin: Arc<dyn OsLoginClient>,
        identity: CallerIdentity,
        signers: Arc<EphemeralSignerCache>,
    ) -> Self {
        Self {
            store,
            permissions,
            oslogin: OsLoginIssuer::new(oslogin, identity.clone()),
            identity,
            signers,
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }

    pub fn with_max_update_attempts(mut self, max_update_attempts: u32) -> Self {
        self.max_update_attempts = max_update_attempts;
        self
    }

    /// Apply the settings of `config` that belong to the authorizer rather
    /// than to a single request.
    pub fn with_config(self, config: &AuthorizerConfig) -> Self {
        self.with_max_update_attempts(config.max_metadata_update_attempts)
    }

    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    pub fn oslogin(&self) -> &OsLoginIssuer {
        &self.oslogin
    }

    /// Signer selected by `config`: the persistent key file if one is
    /// configured, otherwise the cached ephemeral key.
    pub fn signer_for_config(&self, config: &AuthorizerConfig) -> Result<Arc<dyn KeySigner>> {
        let signer: Arc<dyn KeySigner> = match &config.persistent_key_path {
            Some(path) => Arc::new(LocalSigner::load_or_generate(path, config.key_type)?),
            None => self.signers.get(config.key_type)?,
        };
        Ok(signer)
    }

    /// Authorize the cached ephemeral key of the requested type.
    pub async fn authorize(
        &self,
        request: &AuthorizationRequest,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        request.validate()?;
        let signer: Arc<dyn KeySigner> = self.signers.get(request.key_type)?;
        self.issue(request, signer, cancel).await
    }

    /// Authorize `signer` for the requested instance.
    ///
    /// # Errors
    /// - `AuthorizationError::Validation` for an invalid request, before any
    ///   collaborator is called
    /// - `AuthorizationError::Policy` if the instance requires OS Login and
    ///   that is not possible
    /// - `AuthorizationError::Cancelled` if `cancel` fires
    /// - any error of the selected backend
    pub async fn authorize_with_signer(
        &self,
        request: &AuthorizationRequest,
        signer: Arc<dyn KeySigner>,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        request.validate()?;
        self.issue(request, signer, cancel).await
    }

    /// Runs one attempt for an already validated request.
    #[tracing::instrument(skip_all, fields(instance = %request.instance))]
    async fn issue(
        &self,
        request: &AuthorizationRequest,
        signer: Arc<dyn KeySigner>,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        let result = self.issue_with_backend(request, signer, cancel).await;
        match &result {
            Ok(credential) => tracing::info!(
                method = %credential.method(),
                username = credential.username(),
                "credential issued"
            ),
            Err(e) if e.is_cancellation() => tracing::debug!("authorization cancelled"),
            Err(e) => tracing::warn!(error = %e, "authorization failed"),
        }
        result
    }

    async fn issue_with_backend(
        &self,
        request: &AuthorizationRequest,
        signer: Arc<dyn KeySigner>,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        let processor = InstanceKeyProcessor::for_instance(
            self.store.clone(),
            self.permissions.clone(),
            request.instance.clone(),
            cancel,
        )
        .await?
        .with_max_update_attempts(self.max_update_attempts);

        let policy = *processor.policy();
        let backend = select_backend(&policy, request.allowed_methods)?;
        tracing::debug!(?policy, ?backend, "policy resolved");

        match backend {
            Backend::OsLogin => {
                let instance = processor.instance();
                let target = OsLoginTarget {
                    zone: request.instance.zone_locator(),
                    instance_id: instance.id,
                    attached_service_account: instance
                        .attached_service_account()
                        .map(str::to_string),
                    security_key_required: policy.os_login_requires_security_key,
                };
                self.oslogin
                    .authorize_key(&target, signer, request.validity, cancel)
                    .await
            }
            Backend::Metadata => {
                processor
                    .authorize_key(
                        signer,
                        request.validity,
                        request.preferred_username.as_deref(),
                        &self.identity,
                        request.allowed_methods,
                        cancel,
                    )
                    .await
            }
        }
    }
}
