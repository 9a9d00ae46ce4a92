use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{AdapterFactory, PlatformAdapter};
use crate::error::{Result, TakeoverError};
use crate::models::{
    Cluster, Counter, Datacenter, HypervisorHost, PlatformInstance, PlatformType, RemoteVm, Template,
};

fn api_prefix(platform_type: PlatformType) -> &'static str {
    match platform_type {
        PlatformType::A => "/rest/vcenter",
        PlatformType::B => "/api/v1",
    }
}

/// JSON/HTTP inventory client shared by both platform types.
pub struct RestPlatformAdapter {
    client: Client,
    name: String,
    base: String,
    username: String,
    password: String,
}

impl RestPlatformAdapter {
    pub fn new(client: Client, instance: &PlatformInstance) -> Self {
        let base = format!(
            "{}{}",
            instance.api_endpoint.trim_end_matches('/'),
            api_prefix(instance.platform_type)
        );
        Self {
            client,
            name: instance.name.clone(),
            base,
            username: instance.api_username.clone(),
            password: instance.api_password.clone(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        debug!(platform = %self.name, %url, "inventory request");
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TakeoverError::RemoteRequest(format!("{} on GET {}", resp.status(), url)));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl PlatformAdapter for RestPlatformAdapter {
    async fn login(&self) -> Result<()> {
        let url = format!("{}/session", self.base);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TakeoverError::LoginFailed(self.name.clone())),
            s => Err(TakeoverError::RemoteRequest(format!("{} on POST {}", s, url))),
        }
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>> {
        self.get("/datacenters").await
    }

    async fn list_clusters(&self, datacenter_id: &str) -> Result<Vec<Cluster>> {
        self.get(&format!("/datacenters/{}/clusters", datacenter_id)).await
    }

    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<HypervisorHost>> {
        self.get(&format!("/clusters/{}/hosts", cluster_id)).await
    }

    async fn list_vms(&self, with_monitoring: bool) -> Result<Vec<RemoteVm>> {
        self.get(&format!("/vms?monitoring={}", with_monitoring)).await
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        self.get("/templates").await
    }

    async fn host_utilization(&self, host_id: &str) -> Result<Vec<Counter>> {
        self.get(&format!("/hosts/{}/utilization", host_id)).await
    }

    async fn vm_utilization(&self, vm_id: &str) -> Result<Vec<Counter>> {
        self.get(&format!("/vms/{}/utilization", vm_id)).await
    }
}

/// Builds `RestPlatformAdapter`s that share one connection pool.
pub struct RestAdapterFactory {
    client: Client,
}

impl RestAdapterFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl AdapterFactory for RestAdapterFactory {
    fn build(&self, instance: &PlatformInstance) -> Arc<dyn PlatformAdapter> {
        Arc::new(RestPlatformAdapter::new(self.client.clone(), instance))
    }
}
