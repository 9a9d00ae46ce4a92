//! Persistence of platform instances and external <-> internal id mappings.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::{Result, TakeoverError};
use crate::models::{PlatformInstance, PlatformType, UuidMapping};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Rejects an instance whose hostname or endpoint is already registered.
    async fn insert_platform(&self, instance: &PlatformInstance) -> Result<()>;

    async fn get_platform(&self, uuid: &str) -> Result<Option<PlatformInstance>>;

    async fn list_platforms(&self, platform_type: PlatformType) -> Result<Vec<PlatformInstance>>;

    async fn update_platform(&self, instance: &PlatformInstance) -> Result<()>;

    async fn delete_platform(&self, uuid: &str) -> Result<()>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Inserts or replaces the row keyed by `external_id`.
    async fn upsert_mapping(&self, mapping: &UuidMapping) -> Result<()>;

    async fn mapping_by_external(&self, platform_type: PlatformType, external_id: &str)
        -> Result<Option<UuidMapping>>;

    async fn mapping_by_internal(&self, platform_type: PlatformType, internal_id: &str)
        -> Result<Option<UuidMapping>>;

    async fn list_mappings(&self, platform_type: PlatformType) -> Result<Vec<UuidMapping>>;

    /// Removes the row for `internal_id`; a missing row is not an error.
    async fn delete_mapping(&self, platform_type: PlatformType, internal_id: &str) -> Result<()>;
}

/// Uniqueness check shared by store implementations.
pub fn check_unique(existing: &[PlatformInstance], candidate: &PlatformInstance) -> Result<()> {
    for other in existing.iter().filter(|p| p.uuid != candidate.uuid) {
        if other.hostname == candidate.hostname {
            return Err(TakeoverError::DuplicatePlatform { field: "hostname", value: candidate.hostname.clone() });
        }
        if other.api_endpoint == candidate.api_endpoint {
            return Err(TakeoverError::DuplicatePlatform {
                field: "api_endpoint",
                value: candidate.api_endpoint.clone(),
            });
        }
    }
    Ok(())
}
