// ABOUTME: Locators for projects, zones, and VM instances.
// ABOUTME: Rendered in the projects/<p>/zones/<z>/instances/<n> resource form.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectLocator {
    pub project_id: String,
}

impl ProjectLocator {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}

impl fmt::Display for ProjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}", self.project_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneLocator {
    pub project_id: String,
    pub name: String,
}

impl ZoneLocator {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
        }
    }

    /// Region the zone belongs to (`us-central1-a` is in `us-central1`).
    pub fn region(&self) -> &str {
        match self.name.rsplit_once('-') {
            Some((region, _)) => region,
            None => &self.name,
        }
    }

    pub fn project(&self) -> ProjectLocator {
        ProjectLocator::new(&self.project_id)
    }
}

impl fmt::Display for ZoneLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/zones/{}", self.project_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLocator {
    pub project_id: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    pub fn project(&self) -> ProjectLocator {
        ProjectLocator::new(&self.project_id)
    }

    pub fn zone_locator(&self) -> ZoneLocator {
        ZoneLocator::new(&self.project_id, &self.zone)
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project_id, self.zone, self.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_locator_display() {
        let instance = InstanceLocator::new("project-1", "us-central1-a", "vm-1");
        assert_eq!(
            instance.to_string(),
            "projects/project-1/zones/us-central1-a/instances/vm-1"
        );
        assert_eq!(instance.project().to_string(), "projects/project-1");
        assert_eq!(
            instance.zone_locator().to_string(),
            "projects/project-1/zones/us-central1-a"
        );
    }

    #[test]
    fn test_zone_region() {
        assert_eq!(ZoneLocator::new("p", "us-central1-a").region(), "us-central1");
        assert_eq!(
            ZoneLocator::new("p", "europe-west4-b").region(),
            "europe-west4"
        );
        assert_eq!(ZoneLocator::new("p", "nodash").region(), "nodash");
    }
}
