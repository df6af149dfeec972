// ABOUTME: In-memory MetadataStore with fingerprint-checked writes.
// ABOUTME: Can inject conflicts, failures and latency to exercise retry and cancellation paths.

use crate::compute::{Instance, Metadata, MetadataStore, Project};
use crate::error::ApiError;
use crate::locator::{InstanceLocator, ProjectLocator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct State {
    instances: HashMap<InstanceLocator, Instance>,
    projects: HashMap<ProjectLocator, Project>,
    next_version: u64,
    pending_conflicts: u32,
    write_failure: Option<ApiError>,
    write_delay: Option<Duration>,
    reads: u32,
    write_attempts: u32,
    successful_writes: u32,
}

impl State {
    fn stamp(&mut self, metadata: &mut Metadata) {
        self.next_version += 1;
        metadata.fingerprint = Some(format!("v{}", self.next_version));
    }

    /// Validate a conditional write against the stored metadata.
    fn check_write(&mut self, current: Option<&Metadata>, incoming: &Metadata) -> Result<(), ApiError> {
        self.write_attempts += 1;

        if let Some(error) = self.write_failure.clone() {
            return Err(error);
        }
        let Some(current) = current else {
            return Err(ApiError::status(404, "resource not found"));
        };
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            return Err(ApiError::status(412, "metadata fingerprint changed concurrently"));
        }
        if current.fingerprint != incoming.fingerprint {
            return Err(ApiError::status(
                412,
                "supplied fingerprint does not match current metadata fingerprint",
            ));
        }
        Ok(())
    }
}

/// Metadata store that keeps instances and projects in memory.
///
/// Every successful write assigns a new fingerprint, and a write carrying a
/// stale fingerprint fails with HTTP 412 as the real service does.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<State>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_instance(&self, locator: &InstanceLocator, mut instance: Instance) {
        let mut state = self.state();
        state.stamp(&mut instance.metadata);
        state.instances.insert(locator.clone(), instance);
    }

    pub fn insert_project(&self, locator: &ProjectLocator, mut project: Project) {
        let mut state = self.state();
        state.stamp(&mut project.common_instance_metadata);
        state.projects.insert(locator.clone(), project);
    }

    pub fn instance_metadata(&self, locator: &InstanceLocator) -> Option<Metadata> {
        self.state()
            .instances
            .get(locator)
            .map(|instance| instance.metadata.clone())
    }

    pub fn project_metadata(&self, locator: &ProjectLocator) -> Option<Metadata> {
        self.state()
            .projects
            .get(locator)
            .map(|project| project.common_instance_metadata.clone())
    }

    /// Reject the next `count` writes as if another writer got there first.
    pub fn inject_conflicts(&self, count: u32) {
        self.state().pending_conflicts = count;
    }

    /// Fail every following write with `error`.
    pub fn fail_writes_with(&self, error: ApiError) {
        self.state().write_failure = Some(error);
    }

    /// Delay every following write by `delay` before it is applied.
    pub fn delay_writes(&self, delay: Duration) {
        self.state().write_delay = Some(delay);
    }

    /// Number of instance and project reads served.
    pub fn read_count(&self) -> u32 {
        self.state().reads
    }

    pub fn write_attempts(&self) -> u32 {
        self.state().write_attempts
    }

    pub fn successful_writes(&self) -> u32 {
        self.state().successful_writes
    }

    async fn wait_before_write(&self) {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_instance(&self, instance: &InstanceLocator) -> Result<Instance, ApiError> {
        let mut state = self.state();
        state.reads += 1;
        state
            .instances
            .get(instance)
            .cloned()
            .ok_or_else(|| ApiError::status(404, format!("{instance} not found")))
    }

    async fn get_project(&self, project: &ProjectLocator) -> Result<Project, ApiError> {
        let mut state = self.state();
        state.reads += 1;
        state
            .projects
            .get(project)
            .cloned()
            .ok_or_else(|| ApiError::status(404, format!("{project} not found")))
    }

    async fn set_instance_metadata(
        &self,
        instance: &InstanceLocator,
        mut metadata: Metadata,
    ) -> Result<(), ApiError> {
        self.wait_before_write().await;

        let mut state = self.state();
        let current = state.instances.get(instance).map(|i| i.metadata.clone());
        state.check_write(current.as_ref(), &metadata)?;

        state.stamp(&mut metadata);
        state.successful_writes += 1;
        if let Some(stored) = state.instances.get_mut(instance) {
            stored.metadata = metadata;
        }
        Ok(())
    }

    async fn set_common_instance_metadata(
        &self,
        project: &ProjectLocator,
        mut metadata: Metadata,
    ) -> Result<(), ApiError> {
        self.wait_before_write().await;

        let mut state = self.state();
        let current = state
            .projects
            .get(project)
            .map(|p| p.common_instance_metadata.clone());
        state.check_write(current.as_ref(), &metadata)?;

        state.stamp(&mut metadata);
        state.successful_writes += 1;
        if let Some(stored) = state.projects.get_mut(project) {
            stored.common_instance_metadata = metadata;
        }
        Ok(())
    }
}
