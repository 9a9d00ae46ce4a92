/**
 * RECONCILIATION ENGINE - converges compute-platform VM records onto a platform's inventory
 *
 * ROLE :
 * - take-over : first import of VMs that already run on an external platform
 * - synchronize : steady-state diff (new / stale / common) and convergence
 *
 * OPERATION :
 * Remote ids are translated through the mapping table, compared by id with
 * the servers on the platform's compute host, then:
 *   new    -> created on the compute platform (throttled, concurrent)
 *   stale  -> deleted locally together with their mapping row
 *   common -> display name / power state brought in line with the platform
 * Servers stuck in `error` are purged first so a failed import is retried
 * on the next pass.
 *
 * Per-VM failures are logged and counted, never propagated; only the image
 * pre-flight aborts a take-over batch.
 */

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::compute::ComputeApi;
use crate::config::{KernelConfig, PlatformsConf};
use crate::error::{Result, TakeoverError};
use crate::flavors::FlavorMatcher;
use crate::models::{CreateServer, PlatformType, RemoteVm, Server, ServerPatch, UuidMapping, VmState};
use crate::store::MappingStore;

/// Metadata key carrying the platform id while an adoption is in flight.
pub const ADOPTION_TAG: &str = "uuid";
pub const PLATFORM_TYPE_TAG: &str = "platformtype";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub platforms: PlatformsConf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&KernelConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            poll_attempts: cfg.takeover.poll_attempts,
            poll_interval: Duration::from_secs(cfg.takeover.poll_interval_secs),
            batch_size: cfg.takeover.batch_size.max(1),
            batch_pause: Duration::from_secs(cfg.takeover.batch_pause_secs),
            platforms: cfg.platforms.clone(),
        }
    }
}

/// Where adopted VMs of one platform instance land on the compute platform.
#[derive(Debug, Clone)]
pub struct TakeoverTarget {
    pub platform_type: PlatformType,
    pub platform_name: String,
    pub host: String,
    pub zone: String,
    pub network_id: String,
}

impl TakeoverTarget {
    /// `zone:host`, which pins the new server to the platform's compute host.
    pub fn placement_zone(&self) -> String {
        format!("{}:{}", self.zone, self.host)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TakeoverReport {
    /// Platform ids of the VMs created on the compute platform.
    pub created: Vec<String>,
    /// Created, but the compute platform put them in `error`.
    pub errored: usize,
    /// Local records deleted because their id was reused by an incoming VM.
    pub replaced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub healed: usize,
    pub removed: usize,
    pub updated: usize,
    pub failed: usize,
    pub imported: TakeoverReport,
}

/// How an adopted server left the `building` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Active,
    Errored,
    StillBuilding,
    Vanished,
}

/// Admits creations in batches of `batch_size`, sleeping `pause` before
/// each new batch.
#[derive(Debug)]
pub struct DispatchThrottle {
    batch_size: usize,
    pause: Duration,
    admitted: usize,
}

impl DispatchThrottle {
    pub fn new(batch_size: usize, pause: Duration) -> Self {
        Self { batch_size: batch_size.max(1), pause, admitted: 0 }
    }

    pub async fn admit(&mut self) {
        if self.admitted > 0 && self.admitted % self.batch_size == 0 {
            debug!(admitted = self.admitted, pause_secs = self.pause.as_secs(), "dispatch throttled");
            tokio::time::sleep(self.pause).await;
        }
        self.admitted += 1;
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    compute: Arc<dyn ComputeApi>,
    mappings: Arc<dyn MappingStore>,
    flavors: FlavorMatcher,
    settings: Arc<EngineSettings>,
}

impl ReconciliationEngine {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        mappings: Arc<dyn MappingStore>,
        flavors: FlavorMatcher,
        mut settings: EngineSettings,
    ) -> Self {
        settings.batch_size = settings.batch_size.max(1);
        Self { compute, mappings, flavors, settings: Arc::new(settings) }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeApi> {
        &self.compute
    }

    pub fn mappings(&self) -> &Arc<dyn MappingStore> {
        &self.mappings
    }

    /// First import of `remote_vms` onto `target.host`.
    ///
    /// Fails only when no image is tagged for the platform type, before any
    /// creation is attempted.
    pub async fn take_over_new_vms(&self, target: &TakeoverTarget, remote_vms: Vec<RemoteVm>) -> Result<TakeoverReport> {
        let mut report = TakeoverReport::default();
        if remote_vms.is_empty() {
            return Ok(report);
        }

        let platform_type = target.platform_type;
        let disk_format = &self.settings.platforms.for_type(platform_type).image_disk_format;
        let image_id = self
            .compute
            .find_image(disk_format)
            .await?
            .ok_or(TakeoverError::ImageNotFound(platform_type))?;

        let local_ids: HashSet<String> =
            self.compute.list_servers(&target.host).await?.into_iter().map(|s| s.id).collect();

        let mut prepared = Vec::with_capacity(remote_vms.len());
        for vm in remote_vms {
            if local_ids.contains(&vm.external_id) {
                warn!(platform = %target.platform_name, vm = %vm.external_id, "id already used by a local record, replacing it");
                if let Err(e) = self.purge_local(platform_type, &vm.external_id).await {
                    error!(platform = %target.platform_name, vm = %vm.external_id, error = %e, "failed to remove stale record");
                    report.failed += 1;
                    continue;
                }
                report.replaced += 1;
            }
            // flavors are settled one VM at a time so a batch never creates the same shape twice
            match self.flavors.ensure(&vm.shape()).await {
                Ok(flavor_id) => prepared.push((vm, flavor_id)),
                Err(e) => {
                    error!(platform = %target.platform_name, vm = %vm.external_id, error = %e, "no flavor for VM");
                    report.failed += 1;
                }
            }
        }

        info!(platform = %target.platform_name, count = prepared.len(), host = %target.host, "taking over VMs");

        let in_flight = Arc::new(Semaphore::new(self.settings.batch_size));
        let mut throttle = DispatchThrottle::new(self.settings.batch_size, self.settings.batch_pause);
        let mut workers = JoinSet::new();

        for (vm, flavor_id) in prepared {
            throttle.admit().await;
            let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                break;
            };
            let engine = self.clone();
            let target = target.clone();
            let image_id = image_id.clone();
            workers.spawn(async move {
                let _permit = permit;
                let external_id = vm.external_id.clone();
                let outcome = engine.adopt_one(&target, &image_id, vm, flavor_id).await;
                (external_id, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((external_id, Ok(Settlement::Vanished))) => {
                    warn!(platform = %target.platform_name, vm = %external_id, "created server vanished before settling");
                    report.failed += 1;
                }
                Ok((external_id, Ok(settlement))) => {
                    if settlement == Settlement::Errored {
                        report.errored += 1;
                    }
                    report.created.push(external_id);
                }
                Ok((external_id, Err(e))) => {
                    error!(platform = %target.platform_name, vm = %external_id, error = %e, "take-over failed");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(platform = %target.platform_name, error = %e, "take-over worker aborted");
                    report.failed += 1;
                }
            }
        }
        report.created.sort();

        info!(
            platform = %target.platform_name,
            created = report.created.len(),
            errored = report.errored,
            failed = report.failed,
            "take-over finished"
        );
        Ok(report)
    }

    async fn adopt_one(
        &self,
        target: &TakeoverTarget,
        image_id: &str,
        vm: RemoteVm,
        flavor_id: String,
    ) -> Result<Settlement> {
        let metadata = BTreeMap::from([
            (PLATFORM_TYPE_TAG.to_string(), target.platform_type.as_str().to_string()),
            (ADOPTION_TAG.to_string(), vm.external_id.clone()),
        ]);
        let server = self
            .compute
            .create_server(CreateServer {
                name: vm.name.clone(),
                image_id: image_id.to_string(),
                flavor_id: flavor_id.clone(),
                availability_zone: target.placement_zone(),
                network_id: target.network_id.clone(),
                metadata,
            })
            .await?;

        self.mappings
            .upsert_mapping(&UuidMapping {
                platform_type: target.platform_type,
                external_id: vm.external_id.clone(),
                internal_id: server.id.clone(),
                ip: vm.ip.clone(),
                flavor_id: Some(flavor_id),
            })
            .await?;
        debug!(vm = %vm.external_id, server = %server.id, "server created, waiting for build");

        self.await_settled(target, &server.id, &vm).await
    }

    /// Polls until the server leaves `building`, bounded by `poll_attempts`.
    async fn await_settled(&self, target: &TakeoverTarget, server_id: &str, vm: &RemoteVm) -> Result<Settlement> {
        for _ in 0..self.settings.poll_attempts {
            let Some(server) = self.compute.get_server(server_id).await? else {
                warn!(server = %server_id, "server disappeared while building");
                self.mappings.delete_mapping(target.platform_type, server_id).await?;
                return Ok(Settlement::Vanished);
            };
            match server.vm_state {
                VmState::Building => tokio::time::sleep(self.settings.poll_interval).await,
                VmState::Error => {
                    warn!(server = %server_id, host = %target.host, "server build errored, pinning host");
                    let patch = ServerPatch { host: Some(target.host.clone()), ..Default::default() };
                    self.compute.update_server(server_id, patch).await?;
                    return Ok(Settlement::Errored);
                }
                _ => {
                    let patch = ServerPatch {
                        name: Some(vm.name.clone()),
                        power_state: Some(vm.power_state),
                        vm_state: Some(VmState::from(vm.power_state)),
                        remove_metadata: vec![ADOPTION_TAG.to_string()],
                        ..Default::default()
                    };
                    self.compute.update_server(server_id, patch).await?;
                    return Ok(Settlement::Active);
                }
            }
        }
        warn!(server = %server_id, attempts = self.settings.poll_attempts, "server still building, giving up wait");
        Ok(Settlement::StillBuilding)
    }

    /// Steady-state convergence of the servers on `target.host` onto
    /// `remote_vms`.
    ///
    /// A non-empty `only_these_ids` (internal or platform ids) limits the
    /// display/power-state refresh of common VMs to those ids.
    pub async fn synchronize(
        &self,
        target: &TakeoverTarget,
        remote_vms: &[RemoteVm],
        only_these_ids: &BTreeSet<String>,
    ) -> Result<SyncReport> {
        let platform_type = target.platform_type;
        let mut report = SyncReport::default();

        let mut local: BTreeMap<String, Server> = BTreeMap::new();
        for server in self.compute.list_servers(&target.host).await? {
            if server.is_failed() {
                info!(platform = %target.platform_name, server = %server.id, "removing failed import");
                match self.purge_local(platform_type, &server.id).await {
                    Ok(()) => report.healed += 1,
                    Err(e) => {
                        error!(server = %server.id, error = %e, "failed to remove errored server");
                        report.failed += 1;
                    }
                }
                continue;
            }
            local.insert(server.id.clone(), server);
        }

        let remote = self.index_by_internal_id(platform_type, remote_vms).await?;

        let stale: Vec<String> = local.keys().filter(|id| !remote.contains_key(*id)).cloned().collect();
        let new: Vec<RemoteVm> = remote
            .iter()
            .filter(|(id, _)| !local.contains_key(*id))
            .map(|(_, vm)| (*vm).clone())
            .collect();
        debug!(
            platform = %target.platform_name,
            local = local.len(),
            remote = remote.len(),
            new = new.len(),
            stale = stale.len(),
            "diff computed"
        );

        for id in &stale {
            match self.purge_local(platform_type, id).await {
                Ok(()) => {
                    info!(platform = %target.platform_name, server = %id, "removed VM gone from platform");
                    report.removed += 1;
                }
                Err(e) => {
                    error!(platform = %target.platform_name, server = %id, error = %e, "failed to remove stale VM");
                    report.failed += 1;
                }
            }
        }

        for (id, server) in &local {
            let Some(vm) = remote.get(id) else { continue };
            let selected = only_these_ids.is_empty()
                || only_these_ids.contains(id)
                || only_these_ids.contains(&vm.external_id);
            if selected {
                match self.refresh_state(server, vm).await {
                    Ok(true) => report.updated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(server = %id, error = %e, "state refresh failed");
                        report.failed += 1;
                    }
                }
            }
            if platform_type.has_distinct_ids() {
                if let Err(e) = self.refresh_mapping(platform_type, id, vm).await {
                    error!(server = %id, error = %e, "mapping refresh failed");
                    report.failed += 1;
                }
            }
        }

        if !new.is_empty() {
            report.imported = self.take_over_new_vms(target, new).await?;
        }
        Ok(report)
    }

    /// Keys every remote VM by the compute id it has (or will have): the
    /// mapped internal id once adopted, its own id otherwise.
    async fn index_by_internal_id<'a>(
        &self,
        platform_type: PlatformType,
        remote_vms: &'a [RemoteVm],
    ) -> Result<BTreeMap<String, &'a RemoteVm>> {
        let internal_of: HashMap<String, String> = self
            .mappings
            .list_mappings(platform_type)
            .await?
            .into_iter()
            .map(|m| (m.external_id, m.internal_id))
            .collect();

        Ok(remote_vms
            .iter()
            .map(|vm| {
                let id = internal_of.get(&vm.external_id).cloned().unwrap_or_else(|| vm.external_id.clone());
                (id, vm)
            })
            .collect())
    }

    /// Returns whether the server had to be updated. A server still carrying
    /// the adoption tag is left alone while it builds, then has its adoption
    /// finished here.
    async fn refresh_state(&self, server: &Server, vm: &RemoteVm) -> Result<bool> {
        let adopting = server.metadata.contains_key(ADOPTION_TAG);
        if adopting && server.vm_state == VmState::Building {
            debug!(server = %server.id, "adoption still building");
            return Ok(false);
        }

        let mut patch = ServerPatch::default();
        if server.name != vm.name {
            patch.name = Some(vm.name.clone());
        }
        if adopting || server.power_state != vm.power_state {
            patch.power_state = Some(vm.power_state);
            patch.vm_state = Some(VmState::from(vm.power_state));
        }
        if adopting {
            patch.remove_metadata = vec![ADOPTION_TAG.to_string()];
        }
        if patch.is_empty() {
            return Ok(false);
        }
        debug!(server = %server.id, ?patch, "syncing display state");
        self.compute.update_server(&server.id, patch).await?;
        Ok(true)
    }

    async fn refresh_mapping(&self, platform_type: PlatformType, internal_id: &str, vm: &RemoteVm) -> Result<()> {
        let flavor_id = self.flavors.ensure(&vm.shape()).await?;
        self.mappings
            .upsert_mapping(&UuidMapping {
                platform_type,
                external_id: vm.external_id.clone(),
                internal_id: internal_id.to_string(),
                ip: vm.ip.clone(),
                flavor_id: Some(flavor_id),
            })
            .await
    }

    /// Deletes a local server and its mapping row.
    pub async fn purge_local(&self, platform_type: PlatformType, internal_id: &str) -> Result<()> {
        self.compute.delete_server(internal_id).await?;
        self.mappings.delete_mapping(platform_type, internal_id).await
    }
}
