use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::compute::ComputeApi;
use crate::error::Result;
use crate::models::{Flavor, VmShape};

/// Maps VM shapes onto compute flavors, creating `vflavor-<uuid>` flavors
/// when no exact `(ram, vcpus, disk)` match exists.
#[derive(Clone)]
pub struct FlavorMatcher {
    compute: Arc<dyn ComputeApi>,
    tenant: String,
}

impl FlavorMatcher {
    pub fn new(compute: Arc<dyn ComputeApi>, tenant: impl Into<String>) -> Self {
        Self { compute, tenant: tenant.into() }
    }

    /// First flavor in listing order whose shape matches exactly.
    /// `None` means a flavor has to be created.
    pub async fn resolve(&self, shape: &VmShape) -> Result<Option<String>> {
        let flavors = self.compute.list_flavors(&self.tenant).await?;
        Ok(first_match(&flavors, shape).map(|f| f.id.clone()))
    }

    pub async fn ensure(&self, shape: &VmShape) -> Result<String> {
        if let Some(id) = self.resolve(shape).await? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        let flavor = Flavor {
            id: id.clone(),
            name: format!("vflavor-{}", id),
            ram_mb: shape.ram_mb,
            vcpus: shape.vcpus,
            disk_gb: shape.disk_gb,
        };
        let created = self.compute.create_flavor(flavor).await?;
        info!(flavor = %created, ram_mb = shape.ram_mb, vcpus = shape.vcpus, disk_gb = shape.disk_gb, "created flavor");
        Ok(created)
    }
}

pub fn first_match<'a>(flavors: &'a [Flavor], shape: &VmShape) -> Option<&'a Flavor> {
    flavors.iter().find(|f| f.fits(shape))
}
