use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::TakeoverError;

/// Kind of external virtualization platform under takeover.
///
/// `A` is the vCenter-class platform, `B` the proprietary hypervisor manager
/// whose VM ids differ from the ids the compute platform hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlatformType {
    A,
    B,
}

impl PlatformType {
    pub const ALL: [PlatformType; 2] = [PlatformType::A, PlatformType::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::A => "A",
            PlatformType::B => "B",
        }
    }

    /// Whether the platform's VM ids differ from the ids the compute
    /// platform assigns on adoption. Mapping rows of such platforms are the
    /// only link between the two and carry live IP/flavor details.
    pub fn has_distinct_ids(&self) -> bool {
        matches!(self, PlatformType::B)
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformType {
    type Err = TakeoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(PlatformType::A),
            "b" => Ok(PlatformType::B),
            other => Err(TakeoverError::InvalidPlatformType(other.to_string())),
        }
    }
}

/// datacenter name -> cluster names selected for takeover
pub type TakeoverScope = BTreeMap<String, BTreeSet<String>>;

/// One configured external platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInstance {
    pub uuid: String,
    pub name: String,
    pub platform_type: PlatformType,
    pub domain: String,
    /// Compute host converted to this platform's hypervisor driver.
    pub hostname: String,
    pub api_endpoint: String,
    pub api_username: String,
    #[serde(skip_serializing)]
    pub api_password: String,
    #[serde(default)]
    pub takeover_scope: TakeoverScope,
}

/// Admin input used to register a platform; the uuid is generated.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlatform {
    pub name: String,
    #[serde(default)]
    pub domain: String,
    pub hostname: String,
    pub api_endpoint: String,
    pub api_username: String,
    pub api_password: String,
    #[serde(default)]
    pub takeover_scope: TakeoverScope,
}

impl NewPlatform {
    pub fn into_instance(self, platform_type: PlatformType) -> PlatformInstance {
        PlatformInstance {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            platform_type,
            domain: self.domain,
            hostname: self.hostname,
            api_endpoint: self.api_endpoint,
            api_username: self.api_username,
            api_password: self.api_password,
            takeover_scope: self.takeover_scope,
        }
    }
}

/// Partial update of a registered platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformUpdate {
    pub name: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_username: Option<String>,
    pub api_password: Option<String>,
    pub takeover_scope: Option<TakeoverScope>,
}

impl PlatformUpdate {
    pub fn touches_credentials(&self) -> bool {
        self.api_endpoint.is_some() || self.api_username.is_some() || self.api_password.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Shutdown,
    Paused,
    Unknown,
}

/// Lifecycle state of a server record on the compute platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Building,
    Active,
    Stopped,
    Paused,
    Error,
    Unknown,
}

impl From<PowerState> for VmState {
    fn from(power: PowerState) -> Self {
        match power {
            PowerState::Running => VmState::Active,
            PowerState::Shutdown => VmState::Stopped,
            PowerState::Paused => VmState::Paused,
            PowerState::Unknown => VmState::Unknown,
        }
    }
}

/// One utilization counter reported by a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub unit: String,
    pub volume: f64,
}

/// A VM as reported by an external platform during one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVm {
    pub external_id: String,
    pub name: String,
    pub power_state: PowerState,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub ip: Option<String>,
    pub cluster_id: String,
    pub host_id: String,
    #[serde(default)]
    pub counters: Option<Vec<Counter>>,
}

impl RemoteVm {
    pub fn shape(&self) -> VmShape {
        VmShape { ram_mb: self.ram_mb, vcpus: self.vcpus, disk_gb: self.disk_gb }
    }
}

/// A server record on the compute platform (a LocalVM when scoped to a host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: Option<String>,
    pub vm_state: VmState,
    pub power_state: PowerState,
    pub flavor_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Server {
    pub fn is_failed(&self) -> bool {
        self.vm_state == VmState::Error
    }
}

/// Request body for server creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateServer {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub availability_zone: String,
    pub network_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Fields to change on an existing server record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_state: Option<VmState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_metadata: Vec<String>,
}

impl ServerPatch {
    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.name.is_none()
            && self.power_state.is_none()
            && self.vm_state.is_none()
            && self.remove_metadata.is_empty()
    }
}

/// Durable correspondence between a VM's platform id and its compute id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidMapping {
    pub platform_type: PlatformType,
    pub external_id: String,
    pub internal_id: String,
    pub ip: Option<String>,
    pub flavor_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmShape {
    pub ram_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub ram_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u64,
}

impl Flavor {
    pub fn fits(&self, shape: &VmShape) -> bool {
        self.ram_mb == shape.ram_mb && self.vcpus == shape.vcpus && self.disk_gb == shape.disk_gb
    }
}

// Inventory topology as reported by the adapters

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub datacenter_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorHost {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
}

/// Datacenter with its clusters, as shown in platform listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterTopology {
    pub datacenter: Datacenter,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Ok,
    Failed,
}

/// Registry listing entry: the persisted instance plus its live topology.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformView {
    #[serde(flatten)]
    pub instance: PlatformInstance,
    pub status: InstanceStatus,
    pub topology: Vec<DatacenterTopology>,
}

/// Normalized utilization sample handed to the metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub counter_name: String,
    pub counter_unit: String,
    pub resource_id: String,
    pub counter_volume: f64,
    pub timestamp: String,
    pub source: String,
    pub project_id: String,
    pub user_id: String,
}
