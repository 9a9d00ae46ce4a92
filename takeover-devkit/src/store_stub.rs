/*!
In-memory platform and mapping store

Same contract as the SQLite store (uniqueness of hostname / endpoint,
replace-on-upsert, one row per internal id) without any I/O, so it is safe
under tokio's paused clock.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use takeover_kernel::models::{PlatformInstance, PlatformType, UuidMapping};
use takeover_kernel::store::{check_unique, MappingStore, PlatformStore};
use takeover_kernel::Result;

#[derive(Default)]
pub struct MemoryStore {
    platforms: Mutex<BTreeMap<String, PlatformInstance>>,
    /// (platform type, external id) -> mapping
    mappings: Mutex<BTreeMap<(PlatformType, String), UuidMapping>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform_count(&self) -> usize {
        self.platforms.lock().len()
    }

    pub fn mappings_of(&self, platform_type: PlatformType) -> Vec<UuidMapping> {
        self.mappings.lock().values().filter(|m| m.platform_type == platform_type).cloned().collect()
    }
}

#[async_trait]
impl PlatformStore for MemoryStore {
    async fn insert_platform(&self, instance: &PlatformInstance) -> Result<()> {
        let mut platforms = self.platforms.lock();
        let existing: Vec<PlatformInstance> = platforms.values().cloned().collect();
        check_unique(&existing, instance)?;
        platforms.insert(instance.uuid.clone(), instance.clone());
        Ok(())
    }

    async fn get_platform(&self, uuid: &str) -> Result<Option<PlatformInstance>> {
        Ok(self.platforms.lock().get(uuid).cloned())
    }

    async fn list_platforms(&self, platform_type: PlatformType) -> Result<Vec<PlatformInstance>> {
        let mut list: Vec<PlatformInstance> =
            self.platforms.lock().values().filter(|p| p.platform_type == platform_type).cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn update_platform(&self, instance: &PlatformInstance) -> Result<()> {
        let mut platforms = self.platforms.lock();
        let existing: Vec<PlatformInstance> = platforms.values().cloned().collect();
        check_unique(&existing, instance)?;
        if let Some(row) = platforms.get_mut(&instance.uuid) {
            *row = instance.clone();
        }
        Ok(())
    }

    async fn delete_platform(&self, uuid: &str) -> Result<()> {
        self.platforms.lock().remove(uuid);
        Ok(())
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn upsert_mapping(&self, mapping: &UuidMapping) -> Result<()> {
        let mut mappings = self.mappings.lock();
        mappings.retain(|(t, ext), m| {
            !(*t == mapping.platform_type && m.internal_id == mapping.internal_id && *ext != mapping.external_id)
        });
        mappings.insert((mapping.platform_type, mapping.external_id.clone()), mapping.clone());
        Ok(())
    }

    async fn mapping_by_external(&self, platform_type: PlatformType, external_id: &str) -> Result<Option<UuidMapping>> {
        Ok(self.mappings.lock().get(&(platform_type, external_id.to_string())).cloned())
    }

    async fn mapping_by_internal(&self, platform_type: PlatformType, internal_id: &str) -> Result<Option<UuidMapping>> {
        Ok(self
            .mappings
            .lock()
            .values()
            .find(|m| m.platform_type == platform_type && m.internal_id == internal_id)
            .cloned())
    }

    async fn list_mappings(&self, platform_type: PlatformType) -> Result<Vec<UuidMapping>> {
        Ok(self.mappings_of(platform_type))
    }

    async fn delete_mapping(&self, platform_type: PlatformType, internal_id: &str) -> Result<()> {
        self.mappings
            .lock()
            .retain(|(t, _), m| !(*t == platform_type && m.internal_id == internal_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(external_id: &str, internal_id: &str) -> UuidMapping {
        UuidMapping {
            platform_type: PlatformType::B,
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            ip: None,
            flavor_id: None,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_internal_id() {
        let store = MemoryStore::new();
        store.upsert_mapping(&mapping("ext-1", "srv-1")).await.unwrap();
        store.upsert_mapping(&mapping("ext-2", "srv-1")).await.unwrap();

        let rows = store.list_mappings(PlatformType::B).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id, "ext-2");
        assert!(store.list_mappings(PlatformType::A).await.unwrap().is_empty());
    }
}
