/*!
Scriptable external platforms

`FakePlatform` serves a mutable inventory (topology, VMs, templates,
counters). `FakeAdapterFactory` hands out the fake registered for an
instance's API endpoint, so a test keeps a handle on the very inventory the
registry polls.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use takeover_kernel::adapters::{AdapterFactory, PlatformAdapter};
use takeover_kernel::models::{
    Cluster, Counter, Datacenter, DatacenterTopology, HypervisorHost, PlatformInstance, PowerState, RemoteVm,
    Template,
};
use takeover_kernel::{Result, TakeoverError};

pub const DEFAULT_DATACENTER: &str = "dc-east";
pub const DEFAULT_CLUSTER: &str = "prod";
pub const DEFAULT_CLUSTER_ID: &str = "cl-1";
pub const DEFAULT_HOST_ID: &str = "hv-1";

/// A running 4096 MB / 2 vCPU / 40 GB VM in the default cluster.
pub fn remote_vm(external_id: &str, name: &str) -> RemoteVm {
    RemoteVm {
        external_id: external_id.to_string(),
        name: name.to_string(),
        power_state: PowerState::Running,
        vcpus: 2,
        ram_mb: 4096,
        disk_gb: 40,
        ip: Some("10.0.0.10".into()),
        cluster_id: DEFAULT_CLUSTER_ID.to_string(),
        host_id: DEFAULT_HOST_ID.to_string(),
        counters: None,
    }
}

#[derive(Default)]
struct Inventory {
    topology: Vec<DatacenterTopology>,
    hosts: Vec<HypervisorHost>,
    vms: Vec<RemoteVm>,
    templates: Vec<Template>,
    host_counters: HashMap<String, Vec<Counter>>,
    vm_counters: HashMap<String, Vec<Counter>>,
    reject_login: bool,
    unreachable: bool,
    logins: usize,
}

#[derive(Default)]
pub struct FakePlatform {
    inventory: Mutex<Inventory>,
}

impl FakePlatform {
    /// One datacenter holding one cluster with one hypervisor host.
    pub fn new() -> Arc<Self> {
        let platform = Self::default();
        {
            let mut inv = platform.inventory.lock();
            inv.topology.push(DatacenterTopology {
                datacenter: Datacenter { id: "dc-1".into(), name: DEFAULT_DATACENTER.into() },
                clusters: vec![Cluster {
                    id: DEFAULT_CLUSTER_ID.into(),
                    name: DEFAULT_CLUSTER.into(),
                    datacenter_id: "dc-1".into(),
                }],
            });
            inv.hosts.push(HypervisorHost {
                id: DEFAULT_HOST_ID.into(),
                name: "esx-01".into(),
                cluster_id: DEFAULT_CLUSTER_ID.into(),
                cpu_cores: Some(32),
                memory_mb: Some(262_144),
            });
        }
        Arc::new(platform)
    }

    pub fn add_cluster(&self, datacenter_name: &str, cluster: Cluster) {
        let mut inv = self.inventory.lock();
        match inv.topology.iter_mut().find(|dc| dc.datacenter.name == datacenter_name) {
            Some(dc) => dc.clusters.push(cluster),
            None => inv.topology.push(DatacenterTopology {
                datacenter: Datacenter { id: cluster.datacenter_id.clone(), name: datacenter_name.to_string() },
                clusters: vec![cluster],
            }),
        }
    }

    pub fn set_vms(&self, vms: Vec<RemoteVm>) {
        self.inventory.lock().vms = vms;
    }

    pub fn update_vm(&self, external_id: &str, apply: impl FnOnce(&mut RemoteVm)) {
        if let Some(vm) = self.inventory.lock().vms.iter_mut().find(|vm| vm.external_id == external_id) {
            apply(vm);
        }
    }

    pub fn set_templates(&self, templates: Vec<Template>) {
        self.inventory.lock().templates = templates;
    }

    pub fn set_host_counters(&self, host_id: &str, counters: Vec<Counter>) {
        self.inventory.lock().host_counters.insert(host_id.to_string(), counters);
    }

    pub fn set_vm_counters(&self, external_id: &str, counters: Vec<Counter>) {
        self.inventory.lock().vm_counters.insert(external_id.to_string(), counters);
    }

    pub fn reject_login(&self, reject: bool) {
        self.inventory.lock().reject_login = reject;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inventory.lock().unreachable = unreachable;
    }

    pub fn logins(&self) -> usize {
        self.inventory.lock().logins
    }

    fn check_reachable(&self) -> Result<()> {
        if self.inventory.lock().unreachable {
            return Err(TakeoverError::RemoteConnect("platform endpoint unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for FakePlatform {
    async fn login(&self) -> Result<()> {
        self.check_reachable()?;
        let mut inv = self.inventory.lock();
        inv.logins += 1;
        if inv.reject_login {
            return Err(TakeoverError::LoginFailed("fake platform".into()));
        }
        Ok(())
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>> {
        self.check_reachable()?;
        Ok(self.inventory.lock().topology.iter().map(|dc| dc.datacenter.clone()).collect())
    }

    async fn list_clusters(&self, datacenter_id: &str) -> Result<Vec<Cluster>> {
        self.check_reachable()?;
        Ok(self
            .inventory
            .lock()
            .topology
            .iter()
            .filter(|dc| dc.datacenter.id == datacenter_id)
            .flat_map(|dc| dc.clusters.clone())
            .collect())
    }

    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<HypervisorHost>> {
        self.check_reachable()?;
        Ok(self.inventory.lock().hosts.iter().filter(|h| h.cluster_id == cluster_id).cloned().collect())
    }

    async fn list_vms(&self, with_monitoring: bool) -> Result<Vec<RemoteVm>> {
        self.check_reachable()?;
        let inv = self.inventory.lock();
        Ok(inv
            .vms
            .iter()
            .cloned()
            .map(|mut vm| {
                if with_monitoring {
                    vm.counters = inv.vm_counters.get(&vm.external_id).cloned();
                }
                vm
            })
            .collect())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        self.check_reachable()?;
        Ok(self.inventory.lock().templates.clone())
    }

    async fn host_utilization(&self, host_id: &str) -> Result<Vec<Counter>> {
        self.check_reachable()?;
        Ok(self.inventory.lock().host_counters.get(host_id).cloned().unwrap_or_default())
    }

    async fn vm_utilization(&self, vm_id: &str) -> Result<Vec<Counter>> {
        self.check_reachable()?;
        Ok(self.inventory.lock().vm_counters.get(vm_id).cloned().unwrap_or_default())
    }
}

/// Resolves adapters by API endpoint. Unknown endpoints get an unreachable
/// platform.
#[derive(Default)]
pub struct FakeAdapterFactory {
    platforms: Mutex<HashMap<String, Arc<FakePlatform>>>,
}

impl FakeAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, api_endpoint: &str, platform: Arc<FakePlatform>) {
        self.platforms.lock().insert(api_endpoint.to_string(), platform);
    }

    pub fn get(&self, api_endpoint: &str) -> Option<Arc<FakePlatform>> {
        self.platforms.lock().get(api_endpoint).cloned()
    }
}

impl AdapterFactory for FakeAdapterFactory {
    fn build(&self, instance: &PlatformInstance) -> Arc<dyn PlatformAdapter> {
        let platform = match self.get(&instance.api_endpoint) {
            Some(platform) => platform,
            None => {
                log::warn!("[fake-platform] no platform at {}", instance.api_endpoint);
                let missing = FakePlatform::new();
                missing.set_unreachable(true);
                missing
            }
        };
        platform
    }
}
