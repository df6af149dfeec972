// ABOUTME: Compute metadata model and the collaborator traits for metadata and permissions.
// ABOUTME: Stores enforce fingerprint-conditioned writes; callers only see HTTP-style errors.

use crate::error::ApiError;
use crate::locator::{InstanceLocator, ProjectLocator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Permission needed to change project-wide metadata.
pub const SET_COMMON_INSTANCE_METADATA_PERMISSION: &str =
    "compute.projects.setCommonInstanceMetadata";

/// Permission needed to act as an instance's attached service account.
pub const ACT_AS_SERVICE_ACCOUNT_PERMISSION: &str = "iam.serviceAccounts.actAs";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Key/value metadata of an instance or project.
///
/// `fingerprint` identifies the version that was read; stores reject writes
/// whose fingerprint no longer matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly useful for fixtures.
    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn item(&self, key: &str) -> Option<&MetadataItem> {
        self.items.iter().find(|item| item.key == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.item(key).and_then(|item| item.value.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.item(key).is_some()
    }

    /// Replace the value of `key`, appending the item if it is new.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = Some(value.into());
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.value = value,
            None => self.items.push(MetadataItem { key, value }),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.key != key);
        self.items.len() != before
    }

    /// Boolean flag value; `None` when absent or not a boolean.
    pub fn flag(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?.trim();
        if value.eq_ignore_ascii_case("true") {
            Some(true)
        } else if value.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub zone: String,
    pub metadata: Metadata,
    /// Emails of service accounts attached to the instance.
    pub service_accounts: Vec<String>,
}

impl Instance {
    pub fn attached_service_account(&self) -> Option<&str> {
        self.service_accounts.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub name: String,
    pub common_instance_metadata: Metadata,
}

/// Read and conditionally replace instance and project metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_instance(&self, instance: &InstanceLocator) -> Result<Instance, ApiError>;

    async fn get_project(&self, project: &ProjectLocator) -> Result<Project, ApiError>;

    /// Replace instance metadata.
    ///
    /// Fails with HTTP 412 when `metadata.fingerprint` does not match the
    /// stored version.
    async fn set_instance_metadata(
        &self,
        instance: &InstanceLocator,
        metadata: Metadata,
    ) -> Result<(), ApiError>;

    /// Replace project-wide metadata under the same fingerprint contract.
    async fn set_common_instance_metadata(
        &self,
        project: &ProjectLocator,
        metadata: Metadata,
    ) -> Result<(), ApiError>;
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether the caller holds every one of `permissions` on `project`.
    async fn is_access_granted(
        &self,
        project: &ProjectLocator,
        permissions: &[&str],
    ) -> Result<bool, ApiError>;
}
