// ABOUTME: SSH credential authorization for VM instances.
// ABOUTME: Chooses between OS Login and metadata keys and publishes keys safely under contention.

//! # keywarden-core
//!
//! Authorizes an SSH key for a VM instance, either through OS Login or by
//! publishing it into instance or project metadata.
//!
//! The [`CredentialAuthorizer`] reads the instance policy for every attempt,
//! picks exactly one backend and returns a [`PlatformCredential`]. Metadata
//! writes use optimistic concurrency: each write carries the fingerprint read
//! before it and is retried a bounded number of times on conflict.
//!
//! Compute, IAM and OS Login are consumed through the [`MetadataStore`],
//! [`PermissionChecker`] and [`OsLoginClient`] traits.

pub mod authorized_keys;
pub mod authorizer;
pub mod compute;
pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod locator;
pub mod memory;
pub mod metadata;
pub mod oslogin;
pub mod policy;
pub mod username;

pub use authorized_keys::{AuthorizedKeyRecord, AuthorizedKeySet, KeyProvenance, ManagedKeyMetadata};
pub use authorizer::{AuthorizationRequest, CredentialAuthorizer};
pub use compute::{Instance, Metadata, MetadataStore, PermissionChecker, Project};
pub use config::AuthorizerConfig;
pub use credential::PlatformCredential;
pub use error::{ApiError, AuthorizationError, Result};
pub use identity::{CallerIdentity, IdentityKind};
pub use locator::{InstanceLocator, ProjectLocator, ZoneLocator};
pub use memory::InMemoryMetadataStore;
pub use metadata::{update_metadata, InstanceKeyProcessor, MetadataScope, ProjectKeyProcessor};
pub use oslogin::{LoginProfile, OsLoginAuthorizedKey, OsLoginClient, OsLoginIssuer, OsLoginTarget};
pub use policy::{AuthorizationMethod, AuthorizationMethods, InstancePolicySnapshot};
pub use username::PosixUsername;
