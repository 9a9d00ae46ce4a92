/**
 * PLATFORM REGISTRY - registered platform instances of one platform type
 *
 * ROLE : CRUD of platform instances (with host configuration push), a lazily
 * built cache of live adapters, topology aggregation across instances, and
 * the per-instance entry points into the reconciliation engine.
 *
 * ARCHITECTURE : persisted rows live in the `PlatformStore`; the cache holds
 * one adapter per row plus the topology fetched on the last refresh. The
 * cache is built from the store on first access and kept in step by
 * register / update / deregister.
 */

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::{fetch_hosts, fetch_topology, AdapterFactory, PlatformAdapter};
use crate::error::{Result, TakeoverError};
use crate::guard::SyncGuard;
use crate::metrics::ResourceCounters;
use crate::models::{
    Cluster, Datacenter, DatacenterTopology, HypervisorHost, InstanceStatus, NewPlatform, PlatformInstance,
    PlatformType, PlatformUpdate, PlatformView, RemoteVm, Template,
};
use crate::pusher::RemoteConfigPusher;
use crate::reconcile::{ReconciliationEngine, SyncReport, TakeoverReport, TakeoverTarget};
use crate::state::{new_state, Shared};
use crate::store::{check_unique, PlatformStore};

/// Compute placement for every VM adopted through this registry.
#[derive(Debug, Clone)]
pub struct Placement {
    pub zone: String,
    pub network_id: String,
}

/// An aggregated item tagged with the platform it came from.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformScoped<T> {
    pub platform_uuid: String,
    pub platform_name: String,
    #[serde(flatten)]
    pub item: T,
}

#[derive(Clone)]
pub(crate) struct CachedPlatform {
    pub instance: PlatformInstance,
    pub adapter: Arc<dyn PlatformAdapter>,
    pub topology: Option<Vec<DatacenterTopology>>,
}

pub struct PlatformRegistry {
    platform_type: PlatformType,
    store: Arc<dyn PlatformStore>,
    factory: Arc<dyn AdapterFactory>,
    pusher: Arc<RemoteConfigPusher>,
    engine: ReconciliationEngine,
    guard: Arc<SyncGuard>,
    placement: Placement,
    cache: Shared<Option<Vec<CachedPlatform>>>,
}

impl PlatformRegistry {
    pub fn new(
        platform_type: PlatformType,
        store: Arc<dyn PlatformStore>,
        factory: Arc<dyn AdapterFactory>,
        pusher: Arc<RemoteConfigPusher>,
        engine: ReconciliationEngine,
        guard: Arc<SyncGuard>,
        placement: Placement,
    ) -> Self {
        Self {
            platform_type,
            store,
            factory,
            pusher,
            engine,
            guard,
            placement,
            cache: new_state(None),
        }
    }

    pub fn platform_type(&self) -> PlatformType {
        self.platform_type
    }

    /// Builds the adapter cache from the store on first use.
    async fn ensure_loaded(&self) -> Result<()> {
        if self.cache.lock().is_some() {
            return Ok(());
        }
        let rows = self.store.list_platforms(self.platform_type).await?;
        let entries: Vec<CachedPlatform> = rows
            .into_iter()
            .map(|instance| CachedPlatform {
                adapter: self.factory.build(&instance),
                instance,
                topology: None,
            })
            .collect();
        let mut cache = self.cache.lock();
        if cache.is_none() {
            info!(platform_type = %self.platform_type, count = entries.len(), "adapter cache loaded");
            *cache = Some(entries);
        }
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> Result<Vec<CachedPlatform>> {
        self.ensure_loaded().await?;
        Ok(self.cache.lock().clone().unwrap_or_default())
    }

    async fn entry(&self, uuid: &str) -> Result<CachedPlatform> {
        self.snapshot()
            .await?
            .into_iter()
            .find(|e| e.instance.uuid == uuid)
            .ok_or_else(|| TakeoverError::PlatformNotFound(uuid.to_string()))
    }

    fn with_cache(&self, apply: impl FnOnce(&mut Vec<CachedPlatform>)) {
        if let Some(entries) = self.cache.lock().as_mut() {
            apply(entries);
        }
    }

    fn target_for(&self, instance: &PlatformInstance) -> TakeoverTarget {
        TakeoverTarget {
            platform_type: self.platform_type,
            platform_name: instance.name.clone(),
            host: instance.hostname.clone(),
            zone: self.placement.zone.clone(),
            network_id: self.placement.network_id.clone(),
        }
    }

    async fn check_unique(&self, candidate: &PlatformInstance) -> Result<()> {
        let mut existing = Vec::new();
        for platform_type in PlatformType::ALL {
            existing.extend(self.store.list_platforms(platform_type).await?);
        }
        check_unique(&existing, candidate)
    }

    /// Validates the login, converts the compute host, then persists the
    /// instance. Nothing is persisted when any step fails.
    pub async fn register(
        &self,
        new: NewPlatform,
        pre_cmds: &[String],
        rollback_cmds: &[String],
    ) -> Result<PlatformInstance> {
        let instance = new.into_instance(self.platform_type);
        self.check_unique(&instance).await?;

        let adapter = self.factory.build(&instance);
        if let Err(e) = adapter.login().await {
            warn!(platform = %instance.name, error = %e, "platform login failed");
            return Err(TakeoverError::LoginFailed(instance.name.clone()));
        }

        self.pusher.apply(&instance.hostname, pre_cmds, Some(rollback_cmds)).await?;

        if let Err(e) = self.store.insert_platform(&instance).await {
            error!(platform = %instance.name, error = %e, "failed to persist platform, rolling host back");
            if let Err(rollback_err) = self.pusher.apply(&instance.hostname, rollback_cmds, None).await {
                error!(host = %instance.hostname, error = %rollback_err, "host rollback failed");
            }
            return Err(e);
        }

        self.ensure_loaded().await?;
        let cached = CachedPlatform { instance: instance.clone(), adapter, topology: None };
        self.with_cache(|entries| {
            if !entries.iter().any(|e| e.instance.uuid == cached.instance.uuid) {
                entries.push(cached);
            }
        });
        info!(platform = %instance.name, uuid = %instance.uuid, host = %instance.hostname, "platform registered");
        Ok(instance)
    }

    /// Fails fast with `SyncInProgress` while a pass runs; otherwise
    /// de-configures the host, purges the instance's mappings and removes it.
    pub async fn deregister(&self, uuid: &str, cmds: &[String]) -> Result<()> {
        let _lease = self.guard.begin_delete()?;

        let instance = self
            .store
            .get_platform(uuid)
            .await?
            .filter(|p| p.platform_type == self.platform_type)
            .ok_or_else(|| TakeoverError::PlatformNotFound(uuid.to_string()))?;

        self.pusher.apply(&instance.hostname, cmds, None).await?;
        self.purge_mappings(&instance).await;

        self.store.delete_platform(uuid).await?;
        self.with_cache(|entries| entries.retain(|e| e.instance.uuid != uuid));
        info!(platform = %instance.name, uuid, "platform deregistered");
        Ok(())
    }

    async fn purge_mappings(&self, instance: &PlatformInstance) {
        let servers = match self.engine.compute().list_servers(&instance.hostname).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(host = %instance.hostname, error = %e, "cannot list host servers, mappings left in place");
                return;
            }
        };
        for server in servers {
            if let Err(e) = self.engine.mappings().delete_mapping(self.platform_type, &server.id).await {
                warn!(server = %server.id, error = %e, "failed to purge mapping");
            }
        }
    }

    /// Changes scope, name or credentials. New credentials must log in.
    pub async fn update_instance(&self, uuid: &str, update: PlatformUpdate) -> Result<PlatformInstance> {
        let current = self.entry(uuid).await?;
        let mut instance = current.instance.clone();
        let credentials_changed = update.touches_credentials();

        if let Some(name) = update.name {
            instance.name = name;
        }
        if let Some(endpoint) = update.api_endpoint {
            instance.api_endpoint = endpoint;
        }
        if let Some(username) = update.api_username {
            instance.api_username = username;
        }
        if let Some(password) = update.api_password {
            instance.api_password = password;
        }
        if let Some(scope) = update.takeover_scope {
            instance.takeover_scope = scope;
        }

        let adapter = if credentials_changed {
            self.check_unique(&instance).await?;
            let adapter = self.factory.build(&instance);
            if let Err(e) = adapter.login().await {
                warn!(platform = %instance.name, error = %e, "login with new credentials failed");
                return Err(TakeoverError::LoginFailed(instance.name.clone()));
            }
            adapter
        } else {
            current.adapter.clone()
        };

        self.store.update_platform(&instance).await?;
        let updated = instance.clone();
        self.with_cache(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.instance.uuid == updated.uuid) {
                entry.instance = updated;
                entry.adapter = adapter;
                entry.topology = None;
            }
        });
        info!(platform = %instance.name, uuid, credentials_changed, "platform updated");
        Ok(instance)
    }

    /// Re-reads the topology of every cached platform. A platform that
    /// cannot be reached is reported `failed`; the others are unaffected.
    pub async fn refresh_topology(&self) -> Result<Vec<PlatformView>> {
        let entries = self.snapshot().await?;
        let fetched = join_all(entries.iter().map(|entry| fetch_topology(entry.adapter.as_ref()))).await;

        let mut views = Vec::with_capacity(entries.len());
        for (entry, result) in entries.into_iter().zip(fetched) {
            let (status, topology) = match result {
                Ok(topology) => (InstanceStatus::Ok, topology),
                Err(e) => {
                    warn!(platform = %entry.instance.name, error = %e, "topology unavailable");
                    (InstanceStatus::Failed, Vec::new())
                }
            };
            let fresh = (status == InstanceStatus::Ok).then(|| topology.clone());
            let uuid = entry.instance.uuid.clone();
            self.with_cache(|cached| {
                if let Some(cached) = cached.iter_mut().find(|e| e.instance.uuid == uuid) {
                    cached.topology = fresh;
                }
            });
            views.push(PlatformView { instance: entry.instance, status, topology });
        }
        Ok(views)
    }

    pub async fn list_instances(&self) -> Result<Vec<PlatformView>> {
        self.refresh_topology().await
    }

    async fn topology_of(&self, entry: &CachedPlatform) -> Result<Vec<DatacenterTopology>> {
        match &entry.topology {
            Some(topology) => Ok(topology.clone()),
            None => fetch_topology(entry.adapter.as_ref()).await,
        }
    }

    pub async fn datacenters(&self) -> Result<Vec<PlatformScoped<Datacenter>>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await? {
            match self.topology_of(&entry).await {
                Ok(topology) => out.extend(topology.into_iter().map(|dc| scoped(&entry.instance, dc.datacenter))),
                Err(e) => warn!(platform = %entry.instance.name, error = %e, "skipping platform"),
            }
        }
        Ok(out)
    }

    pub async fn clusters(&self) -> Result<Vec<PlatformScoped<Cluster>>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await? {
            match self.topology_of(&entry).await {
                Ok(topology) => out.extend(
                    topology
                        .into_iter()
                        .flat_map(|dc| dc.clusters)
                        .map(|cluster| scoped(&entry.instance, cluster)),
                ),
                Err(e) => warn!(platform = %entry.instance.name, error = %e, "skipping platform"),
            }
        }
        Ok(out)
    }

    pub async fn hosts(&self) -> Result<Vec<PlatformScoped<HypervisorHost>>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await? {
            let hosts = match self.topology_of(&entry).await {
                Ok(topology) => fetch_hosts(entry.adapter.as_ref(), &topology).await,
                Err(e) => Err(e),
            };
            match hosts {
                Ok(hosts) => out.extend(hosts.into_iter().map(|h| scoped(&entry.instance, h))),
                Err(e) => warn!(platform = %entry.instance.name, error = %e, "skipping platform"),
            }
        }
        Ok(out)
    }

    pub async fn templates(&self, uuid: &str) -> Result<Vec<Template>> {
        let entry = self.entry(uuid).await?;
        entry.adapter.list_templates().await
    }

    /// VM and host counters of every cached platform. VM samples carry the
    /// compute id once the VM is adopted. A failing platform is skipped.
    pub async fn collect_utilization(&self) -> Result<Vec<ResourceCounters>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await? {
            match self.utilization_of(&entry).await {
                Ok(mut resources) => out.append(&mut resources),
                Err(e) => warn!(platform = %entry.instance.name, error = %e, "utilization skipped"),
            }
        }
        Ok(out)
    }

    async fn utilization_of(&self, entry: &CachedPlatform) -> Result<Vec<ResourceCounters>> {
        let source = entry.instance.name.clone();
        let mut out = Vec::new();

        for vm in entry.adapter.list_vms(true).await? {
            let counters = match vm.counters {
                Some(counters) => counters,
                None => match entry.adapter.vm_utilization(&vm.external_id).await {
                    Ok(counters) => counters,
                    Err(e) => {
                        debug!(vm = %vm.external_id, error = %e, "vm counters unavailable");
                        continue;
                    }
                },
            };
            let resource_id = self
                .engine
                .mappings()
                .mapping_by_external(self.platform_type, &vm.external_id)
                .await?
                .map(|m| m.internal_id)
                .unwrap_or(vm.external_id);
            out.push(ResourceCounters { resource_id, source: source.clone(), counters });
        }

        let topology = self.topology_of(entry).await?;
        for host in fetch_hosts(entry.adapter.as_ref(), &topology).await? {
            match entry.adapter.host_utilization(&host.id).await {
                Ok(counters) => out.push(ResourceCounters { resource_id: host.id, source: source.clone(), counters }),
                Err(e) => debug!(host = %host.id, error = %e, "host counters unavailable"),
            }
        }
        Ok(out)
    }

    /// Remote VMs of one platform that fall inside its takeover scope.
    async fn scoped_vms(&self, entry: &CachedPlatform) -> Result<Vec<RemoteVm>> {
        let topology = self.topology_of(entry).await?;
        let in_scope = scoped_cluster_ids(&entry.instance, &topology);
        let vms = entry.adapter.list_vms(false).await?;
        let total = vms.len();
        let vms: Vec<RemoteVm> = vms.into_iter().filter(|vm| in_scope.contains(&vm.cluster_id)).collect();
        debug!(platform = %entry.instance.name, total, in_scope = vms.len(), "inventory pulled");
        Ok(vms)
    }

    async fn sync_entry(&self, entry: &CachedPlatform, only_these_ids: &BTreeSet<String>) -> Result<SyncReport> {
        let vms = self.scoped_vms(entry).await?;
        self.engine.synchronize(&self.target_for(&entry.instance), &vms, only_these_ids).await
    }

    /// Reconciles every cached platform. Callers hold the sync lease.
    /// A platform whose inventory cannot be read is skipped for this pass.
    pub(crate) async fn sync_all(&self) -> Result<Vec<(String, Result<SyncReport>)>> {
        let mut outcomes = Vec::new();
        for entry in self.snapshot().await? {
            let outcome = self.sync_entry(&entry, &BTreeSet::new()).await;
            match &outcome {
                Ok(report) => info!(
                    platform = %entry.instance.name,
                    removed = report.removed,
                    imported = report.imported.created.len(),
                    updated = report.updated,
                    healed = report.healed,
                    "platform synchronized"
                ),
                Err(e) => error!(platform = %entry.instance.name, error = %e, "platform sync skipped"),
            }
            outcomes.push((entry.instance.name.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Admin "sync now" for one platform.
    pub async fn sync_instance(&self, uuid: &str, only_these_ids: &BTreeSet<String>) -> Result<SyncReport> {
        let _lease = self.guard.begin_sync()?;
        let entry = self.entry(uuid).await?;
        self.sync_entry(&entry, only_these_ids).await
    }

    /// Admin-selected first import of some of a platform's VMs. VMs already
    /// adopted onto the platform's host are left alone.
    pub async fn take_over(&self, uuid: &str, vm_ids: &BTreeSet<String>) -> Result<TakeoverReport> {
        let _lease = self.guard.begin_sync()?;
        let entry = self.entry(uuid).await?;
        let target = self.target_for(&entry.instance);

        let local_ids: HashSet<String> = self
            .engine
            .compute()
            .list_servers(&target.host)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let adopted: HashSet<String> = self
            .engine
            .mappings()
            .list_mappings(self.platform_type)
            .await?
            .into_iter()
            .filter(|m| local_ids.contains(&m.internal_id))
            .map(|m| m.external_id)
            .collect();

        let selected: Vec<RemoteVm> = entry
            .adapter
            .list_vms(false)
            .await?
            .into_iter()
            .filter(|vm| vm_ids.contains(&vm.external_id) && !adopted.contains(&vm.external_id))
            .collect();
        self.engine.take_over_new_vms(&target, selected).await
    }
}

fn scoped<T>(instance: &PlatformInstance, item: T) -> PlatformScoped<T> {
    PlatformScoped { platform_uuid: instance.uuid.clone(), platform_name: instance.name.clone(), item }
}

/// Cluster ids selected by the instance's `(datacenter, cluster)` scope.
pub fn scoped_cluster_ids(instance: &PlatformInstance, topology: &[DatacenterTopology]) -> HashSet<String> {
    topology
        .iter()
        .filter_map(|dc| instance.takeover_scope.get(&dc.datacenter.name).map(|names| (dc, names)))
        .flat_map(|(dc, names)| dc.clusters.iter().filter(move |c| names.contains(&c.name)))
        .map(|c| c.id.clone())
        .collect()
}
