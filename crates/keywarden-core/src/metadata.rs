// ABOUTME: Optimistic-concurrency metadata updates and the metadata key processors.
// ABOUTME: Places, lists and removes authorized keys in instance or project metadata.

use crate::authorized_keys::{
    AuthorizedKeyRecord, AuthorizedKeySet, LEGACY_METADATA_KEY, METADATA_KEY,
};
use crate::compute::{
    Instance, Metadata, MetadataStore, PermissionChecker, Project,
    ACT_AS_SERVICE_ACCOUNT_PERMISSION, SET_COMMON_INSTANCE_METADATA_PERMISSION,
};
use crate::credential::PlatformCredential;
use crate::error::{ApiError, AuthorizationError, Result};
use crate::identity::CallerIdentity;
use crate::locator::{InstanceLocator, ProjectLocator};
use crate::policy::{
    select_metadata_scope, AuthorizationMethod, AuthorizationMethods, InstancePolicySnapshot,
    MetadataScopeKind,
};
use crate::username::PosixUsername;
use base64::Engine;
use chrono::Utc;
use keywarden_ssh::KeySigner;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default bound on read-modify-write attempts.
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 6;

const BACKOFF_STEP: Duration = Duration::from_millis(10);

const ACCESS_DENIED_MESSAGE: &str = "You do not have sufficient permissions to publish an SSH key. \
     You need the 'Service Account User' and 'Compute Instance Admin' roles \
     (or equivalent custom roles) to perform this action.";

const ACT_AS_DENIED_MESSAGE: &str = "You do not have sufficient permissions to publish an SSH key. \
     Because this VM instance uses a service account, you also need the \
     'Service Account User' role.";

/// Run `future` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    future: F,
) -> std::result::Result<T, ApiError>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
        result = future => result,
    }
}

/// Metadata blob targeted by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataScope {
    Instance(InstanceLocator),
    Project(ProjectLocator),
}

impl MetadataScope {
    pub fn kind(&self) -> MetadataScopeKind {
        match self {
            MetadataScope::Instance(_) => MetadataScopeKind::Instance,
            MetadataScope::Project(_) => MetadataScopeKind::Project,
        }
    }

    async fn read(&self, store: &dyn MetadataStore) -> std::result::Result<Metadata, ApiError> {
        match self {
            MetadataScope::Instance(instance) => {
                Ok(store.get_instance(instance).await?.metadata)
            }
            MetadataScope::Project(project) => {
                Ok(store.get_project(project).await?.common_instance_metadata)
            }
        }
    }

    async fn write(
        &self,
        store: &dyn MetadataStore,
        metadata: Metadata,
    ) -> std::result::Result<(), ApiError> {
        match self {
            MetadataScope::Instance(instance) => {
                store.set_instance_metadata(instance, metadata).await
            }
            MetadataScope::Project(project) => {
                store.set_common_instance_metadata(project, metadata).await
            }
        }
    }
}

impl fmt::Display for MetadataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataScope::Instance(instance) => write!(f, "instance {instance}"),
            MetadataScope::Project(project) => write!(f, "project {project}"),
        }
    }
}

fn map_update_error(scope: &MetadataScope, error: ApiError) -> AuthorizationError {
    if error.is_access_denied() {
        AuthorizationError::Permission {
            message: ACCESS_DENIED_MESSAGE.to_string(),
            source: error,
        }
    } else if error.is_bad_request() {
        // Returned when the caller may change the instance but cannot act as
        // its service account.
        AuthorizationError::Permission {
            message: ACT_AS_DENIED_MESSAGE.to_string(),
            source: error,
        }
    } else {
        AuthorizationError::api(format!("updating metadata of {scope}"), error)
    }
}

/// Read, mutate and conditionally write back the metadata of `scope`.
///
/// `mutate` returns whether it changed anything; when it did not, nothing is
/// written. Each write carries the fingerprint observed by its read. A write
/// rejected as a conflict (HTTP 412) or as unavailable (HTTP 503) is retried
/// from a fresh read after `10ms * attempt`, up to `max_attempts` writes.
///
/// # Errors
/// - `AuthorizationError::Conflict` once `max_attempts` writes conflicted
/// - `AuthorizationError::Permission` on HTTP 403 or 400
/// - `AuthorizationError::Cancelled` if `cancel` fires, even mid-write
#[tracing::instrument(skip_all, fields(scope = %scope, max_attempts = max_attempts))]
pub async fn update_metadata<F>(
    store: &dyn MetadataStore,
    scope: &MetadataScope,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<()>
where
    F: FnMut(&mut Metadata) -> bool + Send,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let mut metadata = cancellable(cancel, scope.read(store))
            .await
            .map_err(|e| map_update_error(scope, e))?;

        if !mutate(&mut metadata) {
            tracing::debug!(attempt, "metadata already up to date");
            return Ok(());
        }

        let error = match cancellable(cancel, scope.write(store, metadata)).await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "metadata update succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        if !(error.is_conflict() || error.is_unavailable()) {
            return Err(map_update_error(scope, error));
        }

        if attempt >= max_attempts {
            tracing::warn!(attempt, error = %error, "giving up on metadata update");
            return Err(if error.is_conflict() {
                AuthorizationError::Conflict {
                    resource: scope.to_string(),
                    attempts: attempt,
                }
            } else {
                map_update_error(scope, error)
            });
        }

        let delay = BACKOFF_STEP * attempt;
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "metadata changed concurrently, retrying"
        );
        cancellable(cancel, async {
            tokio::time::sleep(delay).await;
            Ok::<(), ApiError>(())
        })
        .await
        .map_err(|_| AuthorizationError::Cancelled)?;
    }
}

/// Apply `mutation` to the key set in `metadata`, purging expired keys, and
/// report whether the stored value changed.
fn rewrite_key_set(
    metadata: &mut Metadata,
    mutation: impl FnOnce(AuthorizedKeySet) -> AuthorizedKeySet,
) -> bool {
    let before = metadata.get(METADATA_KEY).map(str::to_string);
    let updated = mutation(AuthorizedKeySet::from_metadata(metadata).remove_expired(Utc::now()));
    let after = updated.to_string();

    if before.as_deref().unwrap_or_default() == after {
        return false;
    }
    updated.write_to(metadata);
    true
}

/// Record for `signer` as it is written into metadata.
fn managed_record(
    signer: &dyn KeySigner,
    username: &PosixUsername,
    owner_email: &str,
    validity: Duration,
) -> Result<AuthorizedKeyRecord> {
    let out_of_range = || AuthorizationError::Validation("key validity is out of range".to_string());
    let expire_on = chrono::Duration::from_std(validity)
        .ok()
        .and_then(|validity| Utc::now().checked_add_signed(validity))
        .ok_or_else(out_of_range)?;

    Ok(AuthorizedKeyRecord::managed(
        username.as_str(),
        signer.algorithm(),
        base64::engine::general_purpose::STANDARD.encode(signer.public_key_blob()),
        owner_email,
        expire_on,
    ))
}

/// Manages metadata keys of one instance and its project.
///
/// Bound to the instance and project state read when it was created.
pub struct InstanceKeyProcessor {
    store: Arc<dyn MetadataStore>,
    permissions: Arc<dyn PermissionChecker>,
    locator: InstanceLocator,
    instance: Instance,
    project: Project,
    policy: InstancePolicySnapshot,
    max_update_attempts: u32,
}

impl InstanceKeyProcessor {
    /// Read instance and project concurrently and derive the policy.
    #[tracing::instrument(skip_all, fields(instance = %locator))]
    pub async fn for_instance(
        store: Arc<dyn MetadataStore>,
        permissions: Arc<dyn PermissionChecker>,
        locator: InstanceLocator,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let project_locator = locator.project();
        let (instance, project) = tokio::try_join!(
            cancellable(cancel, store.get_instance(&locator)),
            cancellable(cancel, store.get_project(&project_locator)),
        )
        .map_err(|e| AuthorizationError::api(format!("reading metadata of {locator}"), e))?;

        let policy = InstancePolicySnapshot::resolve(&instance, &project);
        tracing::debug!(?policy, "resolved instance policy");

        Ok(Self {
            store,
            permissions,
            locator,
            instance,
            project,
            policy,
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        })
    }

    pub fn with_max_update_attempts(mut self, max_update_attempts: u32) -> Self {
        self.max_update_attempts = max_update_attempts;
        self
    }

    pub fn policy(&self) -> &InstancePolicySnapshot {
        &self.policy
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn locator(&self) -> &InstanceLocator {
        &self.locator
    }

    fn scope(&self, kind: MetadataScopeKind) -> MetadataScope {
        match kind {
            MetadataScopeKind::Instance => MetadataScope::Instance(self.locator.clone()),
            MetadataScopeKind::Project => MetadataScope::Project(self.locator.project()),
        }
    }

    fn key_set(&self, kind: MetadataScopeKind) -> AuthorizedKeySet {
        match kind {
            MetadataScopeKind::Instance => AuthorizedKeySet::from_metadata(&self.instance.metadata),
            MetadataScopeKind::Project => {
                AuthorizedKeySet::from_metadata(&self.project.common_instance_metadata)
            }
        }
    }

    async fn can_write_project(
        &self,
        allowed: AuthorizationMethods,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let both_allowed = allowed.contains(AuthorizationMethod::InstanceMetadata)
            && allowed.contains(AuthorizationMethod::ProjectMetadata);
        if !both_allowed || self.policy.project_keys_blocked {
            return Ok(false);
        }

        let granted = cancellable(
            cancel,
            self.permissions.is_access_granted(
                &self.locator.project(),
                &[
                    SET_COMMON_INSTANCE_METADATA_PERMISSION,
                    ACT_AS_SERVICE_ACCOUNT_PERMISSION,
                ],
            ),
        )
        .await;

        match granted {
            Ok(granted) => Ok(granted),
            Err(ApiError::Cancelled) => Err(AuthorizationError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "permission check failed, assuming no project access");
                Ok(false)
            }
        }
    }

    /// Authorize `signer` through instance or project metadata.
    ///
    /// # Errors
    /// - `AuthorizationError::LegacyFormat` if the instance uses `sshKeys`
    /// - `AuthorizationError::Validation` for an invalid username or when no
    ///   metadata scope is allowed
    /// - `AuthorizationError::Policy` if only project keys are allowed but
    ///   blocked
    /// - errors from [`update_metadata`]
    #[tracing::instrument(skip_all, fields(instance = %self.locator))]
    pub async fn authorize_key(
        &self,
        signer: Arc<dyn KeySigner>,
        validity: Duration,
        preferred_username: Option<&str>,
        identity: &CallerIdentity,
        allowed: AuthorizationMethods,
        cancel: &CancellationToken,
    ) -> Result<PlatformCredential> {
        if self.policy.legacy_key_present {
            return Err(AuthorizationError::LegacyFormat(format!(
                "Connecting to the VM instance {} is not supported because the instance uses \
                 legacy SSH keys in its metadata ({LEGACY_METADATA_KEY})",
                self.locator.name
            )));
        }

        let username = PosixUsername::resolve(preferred_username, identity.login_name())?;
        let can_write_project = self.can_write_project(allowed, cancel).await?;
        let kind = select_metadata_scope(&self.policy, allowed, can_write_project)?;
        let record = managed_record(signer.as_ref(), &username, identity.login_name(), validity)?;

        if self
            .key_set(kind)
            .remove_expired(Utc::now())
            .contains(&record)
        {
            tracing::debug!(%username, scope = ?kind, "key already authorized");
        } else {
            tracing::debug!(%username, scope = ?kind, "publishing key to metadata");
            update_metadata(
                self.store.as_ref(),
                &self.scope(kind),
                self.max_update_attempts,
                cancel,
                |metadata| rewrite_key_set(metadata, |set| set.add(record.clone())),
            )
            .await?;
            tracing::info!(%username, scope = ?kind, "published key to metadata");
        }

        Ok(PlatformCredential::new(signer, username.as_str(), kind.method()))
    }

    /// Keys in all allowed metadata scopes, project keys first.
    pub fn list_authorized_keys(&self, allowed: AuthorizationMethods) -> Vec<AuthorizedKeyRecord> {
        let mut keys = AuthorizedKeySet::new();
        for (method, kind) in [
            (
                AuthorizationMethod::ProjectMetadata,
                MetadataScopeKind::Project,
            ),
            (
                AuthorizationMethod::InstanceMetadata,
                MetadataScopeKind::Instance,
            ),
        ] {
            if allowed.contains(method) {
                keys = self.key_set(kind).records().cloned().fold(keys, AuthorizedKeySet::add);
            }
        }
        keys.records().cloned().collect()
    }

    /// Remove `record` from every allowed metadata scope. Absent keys are
    /// ignored.
    #[tracing::instrument(skip_all, fields(instance = %self.locator))]
    pub async fn remove_authorized_key(
        &self,
        record: &AuthorizedKeyRecord,
        allowed: AuthorizationMethods,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (method, kind) in [
            (
                AuthorizationMethod::ProjectMetadata,
                MetadataScopeKind::Project,
            ),
            (
                AuthorizationMethod::InstanceMetadata,
                MetadataScopeKind::Instance,
            ),
        ] {
            if !allowed.contains(method) {
                continue;
            }
            update_metadata(
                self.store.as_ref(),
                &self.scope(kind),
                self.max_update_attempts,
                cancel,
                |metadata| rewrite_key_set(metadata, |set| set.remove(record)),
            )
            .await?;
        }
        Ok(())
    }
}

/// Manages project-wide metadata keys without reference to an instance.
pub struct ProjectKeyProcessor {
    store: Arc<dyn MetadataStore>,
    locator: ProjectLocator,
    project: Project,
    max_update_attempts: u32,
}

impl ProjectKeyProcessor {
    #[tracing::instrument(skip_all, fields(project = %locator))]
    pub async fn for_project(
        store: Arc<dyn MetadataStore>,
        locator: ProjectLocator,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let project = cancellable(cancel, store.get_project(&locator))
            .await
            .map_err(|e| AuthorizationError::api(format!("reading metadata of {locator}"), e))?;

        Ok(Self {
            store,
            locator,
            project,
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        })
    }

    pub fn with_max_update_attempts(mut self, max_update_attempts: u32) -> Self {
        self.max_update_attempts = max_update_attempts;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn list_authorized_keys(&self, allowed: AuthorizationMethods) -> Vec<AuthorizedKeyRecord> {
        if !allowed.contains(AuthorizationMethod::ProjectMetadata) {
            return Vec::new();
        }
        AuthorizedKeySet::from_metadata(&self.project.common_instance_metadata)
            .records()
            .cloned()
            .collect()
    }

    pub async fn remove_authorized_key(
        &self,
        record: &AuthorizedKeyRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        update_metadata(
            self.store.as_ref(),
            &MetadataScope::Project(self.locator.clone()),
            self.max_update_attempts,
            cancel,
            |metadata| rewrite_key_set(metadata, |set| set.remove(record)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMetadataStore;
    use async_trait::async_trait;
    use keywarden_ssh::{LocalSigner, SshKeyType};

    struct FixedPermissions(bool);

    #[async_trait]
    impl PermissionChecker for FixedPermissions {
        async fn is_access_granted(
            &self,
            _project: &ProjectLocator,
            permissions: &[&str],
        ) -> std::result::Result<bool, ApiError> {
            assert_eq!(
                permissions,
                &[
                    SET_COMMON_INSTANCE_METADATA_PERMISSION,
                    ACT_AS_SERVICE_ACCOUNT_PERMISSION
                ]
            );
            Ok(self.0)
        }
    }

    fn locator() -> InstanceLocator {
        InstanceLocator::new("project-1", "us-central1-a", "vm-1")
    }

    fn store_with(instance_metadata: Metadata, project_metadata: Metadata) -> Arc<InMemoryMetadataStore> {
        let store = InMemoryMetadataStore::new();
        store.insert_instance(
            &locator(),
            Instance {
                id: 1,
                name: "vm-1".to_string(),
                zone: "us-central1-a".to_string(),
                metadata: instance_metadata,
                service_accounts: vec![],
            },
        );
        store.insert_project(
            &locator().project(),
            Project {
                name: "project-1".to_string(),
                common_instance_metadata: project_metadata,
            },
        );
        Arc::new(store)
    }

    fn signer() -> Arc<dyn KeySigner> {
        Arc::new(LocalSigner::generate(SshKeyType::Ed25519).unwrap())
    }

    fn identity() -> CallerIdentity {
        CallerIdentity::interactive("alice@example.com")
    }

    async fn processor(store: &Arc<InMemoryMetadataStore>, can_write_project: bool) -> InstanceKeyProcessor {
        InstanceKeyProcessor::for_instance(
            store.clone(),
            Arc::new(FixedPermissions(can_write_project)),
            locator(),
            &CancellationToken::new(),
        )
        .await
        .expect("should read instance and project")
    }

    fn both() -> AuthorizationMethods {
        AuthorizationMethod::InstanceMetadata | AuthorizationMethod::ProjectMetadata
    }

    #[tokio::test]
    async fn test_update_retries_once_after_conflict() {
        let store = store_with(Metadata::new(), Metadata::new());
        store.inject_conflicts(1);
        let reads_before = store.read_count();

        update_metadata(
            store.as_ref(),
            &MetadataScope::Project(locator().project()),
            3,
            &CancellationToken::new(),
            |metadata| {
                metadata.set("k", "v");
                true
            },
        )
        .await
        .expect("second attempt should succeed");

        assert_eq!(store.read_count() - reads_before, 2);
        assert_eq!(store.write_attempts(), 2);
        assert_eq!(store.successful_writes(), 1);
        assert_eq!(
            store.project_metadata(&locator().project()).unwrap().get("k"),
            Some("v")
        );
    }

    #[tokio::test]
    async fn test_update_gives_up_after_bound() {
        let store = store_with(Metadata::new(), Metadata::new());
        store.inject_conflicts(u32::MAX);

        let err = update_metadata(
            store.as_ref(),
            &MetadataScope::Instance(locator()),
            4,
            &CancellationToken::new(),
            |metadata| {
                metadata.set("k", "v");
                true
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuthorizationError::Conflict { attempts: 4, .. }));
        assert_eq!(store.write_attempts(), 4);
        assert_eq!(store.successful_writes(), 0);
    }

    #[tokio::test]
    async fn test_update_skips_write_without_change() {
        let store = store_with(Metadata::new(), Metadata::new());

        update_metadata(
            store.as_ref(),
            &MetadataScope::Instance(locator()),
            3,
            &CancellationToken::new(),
            |_| false,
        )
        .await
        .unwrap();

        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_update_maps_access_denied() {
        let store = store_with(Metadata::new(), Metadata::new());
        store.fail_writes_with(ApiError::status(403, "forbidden"));

        let err = update_metadata(
            store.as_ref(),
            &MetadataScope::Instance(locator()),
            3,
            &CancellationToken::new(),
            |_| true,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuthorizationError::Permission { .. }));
        assert!(err.to_string().contains("Compute Instance Admin"));
        assert_eq!(store.write_attempts(), 1, "permission errors are not retried");
    }

    #[tokio::test]
    async fn test_update_maps_bad_request_to_service_account_hint() {
        let store = store_with(Metadata::new(), Metadata::new());
        store.fail_writes_with(ApiError::status(400, "bad request"));

        let err = update_metadata(
            store.as_ref(),
            &MetadataScope::Instance(locator()),
            3,
            &CancellationToken::new(),
            |_| true,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuthorizationError::Permission { .. }));
        assert!(err.to_string().contains("uses a service account"));
    }

    #[tokio::test]
    async fn test_update_stops_when_cancelled() {
        let store = store_with(Metadata::new(), Metadata::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = update_metadata(
            store.as_ref(),
            &MetadataScope::Instance(locator()),
            3,
            &cancel,
            |_| true,
        )
        .await
        .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_authorize_prefers_project_with_permission() {
        let store = store_with(Metadata::new(), Metadata::new());
        let processor = processor(&store, true).await;

        let credential = processor
            .authorize_key(
                signer(),
                Duration::from_secs(60),
                None,
                &identity(),
                both(),
                &CancellationToken::new(),
            )
            .await
            .expect("should authorize");

        assert_eq!(credential.method(), AuthorizationMethod::ProjectMetadata);
        assert_eq!(credential.username(), "alice");

        let keys = AuthorizedKeySet::from_metadata(
            &store.project_metadata(&locator().project()).unwrap(),
        );
        assert_eq!(keys.len(), 1);
        let record = keys.records().next().unwrap();
        assert_eq!(record.posix_username, "alice");
        assert!(record.is_managed());
    }

    #[tokio::test]
    async fn test_authorize_falls_back_to_instance_without_permission() {
        let store = store_with(Metadata::new(), Metadata::new());
        let processor = processor(&store, false).await;

        let credential = processor
            .authorize_key(
                signer(),
                Duration::from_secs(60),
                Some("bob"),
                &identity(),
                both(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(credential.method(), AuthorizationMethod::InstanceMetadata);
        assert_eq!(credential.username(), "bob");
        assert!(store
            .project_metadata(&locator().project())
            .unwrap()
            .get(METADATA_KEY)
            .is_none());
    }

    #[tokio::test]
    async fn test_authorize_rejects_legacy_keys() {
        let store = store_with(
            Metadata::new().with_item(LEGACY_METADATA_KEY, "u:ssh-rsa K u"),
            Metadata::new(),
        );
        let processor = processor(&store, true).await;

        let err = processor
            .authorize_key(
                signer(),
                Duration::from_secs(60),
                None,
                &identity(),
                both(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizationError::LegacyFormat(_)));
        assert!(err.to_string().contains("vm-1"));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_authorize_existing_key_does_not_write() {
        let signer = signer();
        let existing = format!(
            "alice:{} {} alice",
            signer.algorithm(),
            base64::engine::general_purpose::STANDARD.encode(signer.public_key_blob())
        );
        let store = store_with(Metadata::new().with_item(METADATA_KEY, existing), Metadata::new());
        let processor = processor(&store, false).await;

        let credential = processor
            .authorize_key(
                signer,
                Duration::from_secs(60),
                None,
                &identity(),
                AuthorizationMethod::InstanceMetadata.into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(credential.method(), AuthorizationMethod::InstanceMetadata);
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_authorize_purges_expired_keys() {
        let expired = r#"old:ssh-ed25519 AAAAold google-ssh {"userName":"old@example.com","expireOn":"2000-01-01T00:00:00+0000"}"#;
        let store = store_with(
            Metadata::new().with_item(METADATA_KEY, format!("{expired}\nkeep:ssh-ed25519 AAAAkeep keep")),
            Metadata::new(),
        );
        let processor = processor(&store, false).await;

        processor
            .authorize_key(
                signer(),
                Duration::from_secs(60),
                None,
                &identity(),
                AuthorizationMethod::InstanceMetadata.into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let keys = AuthorizedKeySet::from_metadata(&store.instance_metadata(&locator()).unwrap());
        let usernames: Vec<_> = keys.records().map(|r| r.posix_username.as_str()).collect();
        assert_eq!(usernames, vec!["keep", "alice"]);
    }

    #[tokio::test]
    async fn test_authorize_rejects_invalid_username_without_writes() {
        let store = store_with(Metadata::new(), Metadata::new());
        let processor = processor(&store, true).await;

        let err = processor
            .authorize_key(
                signer(),
                Duration::from_secs(60),
                Some("!user"),
                &identity(),
                both(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizationError::Validation(_)));
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_list_authorized_keys_unions_scopes() {
        let store = store_with(
            Metadata::new().with_item(METADATA_KEY, "i:ssh-ed25519 I i\nshared:ssh-ed25519 S s"),
            Metadata::new().with_item(METADATA_KEY, "p:ssh-ed25519 P p\nshared:ssh-ed25519 S s"),
        );
        let processor = processor(&store, true).await;

        let all: Vec<_> = processor
            .list_authorized_keys(both())
            .into_iter()
            .map(|r| r.posix_username)
            .collect();
        assert_eq!(all, vec!["p", "shared", "i"]);

        let instance_only = processor.list_authorized_keys(AuthorizationMethod::InstanceMetadata.into());
        assert_eq!(instance_only.len(), 2);
        assert!(processor
            .list_authorized_keys(AuthorizationMethod::OsLogin.into())
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove_authorized_key_is_idempotent() {
        let store = store_with(
            Metadata::new().with_item(METADATA_KEY, "i:ssh-ed25519 I i"),
            Metadata::new().with_item(METADATA_KEY, "p:ssh-ed25519 P p"),
        );
        let processor = processor(&store, true).await;
        let record = AuthorizedKeyRecord::unmanaged("i", "ssh-ed25519", "I", "i");

        processor
            .remove_authorized_key(&record, both(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.successful_writes(), 1, "only the instance holds the key");
        assert_eq!(
            store.instance_metadata(&locator()).unwrap().get(METADATA_KEY),
            Some("")
        );

        processor
            .remove_authorized_key(&record, both(), &CancellationToken::new())
            .await
            .expect("removing an absent key should succeed");
        assert_eq!(store.successful_writes(), 1);
    }

    #[tokio::test]
    async fn test_project_processor() {
        let store = store_with(
            Metadata::new(),
            Metadata::new().with_item(METADATA_KEY, "p:ssh-ed25519 P p\nq:ssh-ed25519 Q q"),
        );
        let processor =
            ProjectKeyProcessor::for_project(store.clone(), locator().project(), &CancellationToken::new())
                .await
                .unwrap();

        assert_eq!(processor.list_authorized_keys(AuthorizationMethods::ALL).len(), 2);
        assert!(processor
            .list_authorized_keys(AuthorizationMethod::InstanceMetadata.into())
            .is_empty());

        processor
            .remove_authorized_key(
                &AuthorizedKeyRecord::unmanaged("p", "ssh-ed25519", "P", "p"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            store.project_metadata(&locator().project()).unwrap().get(METADATA_KEY),
            Some("q:ssh-ed25519 Q q")
        );
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_is_rejected_without_writing() {
        let store = store_with(Metadata::new(), Metadata::new());
        let processor = processor(&store, true).await;

        for validity in [Duration::from_secs(9_000_000_000_000), Duration::MAX] {
            let err = processor
                .authorize_key(signer(), validity, None, &identity(), both(), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, AuthorizationError::Validation(_)), "got {err:?}");
        }
        assert_eq!(store.write_attempts(), 0);
    }
}
