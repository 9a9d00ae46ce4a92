/**
 * PLATFORM ADAPTERS - inventory access to the external virtualization platforms
 *
 * ROLE : one thin client per registered platform instance, exposing only the
 * inventory reads the takeover core needs (topology, VMs, templates, counters).
 *
 * ARCHITECTURE : `PlatformAdapter` trait + `AdapterFactory` building a live
 * adapter from a persisted `PlatformInstance`. `rest` holds the HTTP client
 * used in production; tests plug in the devkit's in-memory platforms.
 */

pub mod rest;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    Cluster, Counter, Datacenter, DatacenterTopology, HypervisorHost, PlatformInstance, RemoteVm, Template,
};

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Opens (or validates) a session against the platform.
    async fn login(&self) -> Result<()>;

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>>;

    async fn list_clusters(&self, datacenter_id: &str) -> Result<Vec<Cluster>>;

    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<HypervisorHost>>;

    /// Lists every VM; `with_monitoring` asks the platform to attach counters.
    async fn list_vms(&self, with_monitoring: bool) -> Result<Vec<RemoteVm>>;

    async fn list_templates(&self) -> Result<Vec<Template>>;

    async fn host_utilization(&self, host_id: &str) -> Result<Vec<Counter>>;

    async fn vm_utilization(&self, vm_id: &str) -> Result<Vec<Counter>>;
}

pub trait AdapterFactory: Send + Sync {
    fn build(&self, instance: &PlatformInstance) -> Arc<dyn PlatformAdapter>;
}

/// Datacenters with their clusters for one platform.
pub async fn fetch_topology(adapter: &dyn PlatformAdapter) -> Result<Vec<DatacenterTopology>> {
    let mut topology = Vec::new();
    for datacenter in adapter.list_datacenters().await? {
        let clusters = adapter.list_clusters(&datacenter.id).await?;
        topology.push(DatacenterTopology { datacenter, clusters });
    }
    Ok(topology)
}

/// Hosts of every cluster in `topology`.
pub async fn fetch_hosts(
    adapter: &dyn PlatformAdapter,
    topology: &[DatacenterTopology],
) -> Result<Vec<HypervisorHost>> {
    let mut hosts = Vec::new();
    for cluster in topology.iter().flat_map(|dc| dc.clusters.iter()) {
        hosts.extend(adapter.list_hosts(&cluster.id).await?);
    }
    Ok(hosts)
}
