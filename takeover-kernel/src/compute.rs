//! Compute-platform API: servers, flavors and images.
//!
//! The reconciliation engine only talks to the compute platform through
//! [`ComputeApi`]; [`RestComputeClient`] is the HTTP implementation used by
//! the kernel binary.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TakeoverError};
use crate::models::{CreateServer, Flavor, Server, ServerPatch};

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_server(&self, request: CreateServer) -> Result<Server>;

    /// `None` when the server no longer exists.
    async fn get_server(&self, id: &str) -> Result<Option<Server>>;

    /// Servers placed on one compute host.
    async fn list_servers(&self, host: &str) -> Result<Vec<Server>>;

    async fn update_server(&self, id: &str, patch: ServerPatch) -> Result<()>;

    /// Deleting a server that is already gone succeeds.
    async fn delete_server(&self, id: &str) -> Result<()>;

    /// Flavors visible to `tenant`, in the platform's listing order.
    async fn list_flavors(&self, tenant: &str) -> Result<Vec<Flavor>>;

    async fn create_flavor(&self, flavor: Flavor) -> Result<String>;

    /// Id of a bootable image tagged with `disk_format`.
    async fn find_image(&self, disk_format: &str) -> Result<Option<String>>;
}

pub struct RestComputeClient {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ServersEnvelope {
    servers: Vec<Server>,
}

#[derive(Deserialize)]
struct FlavorsEnvelope {
    flavors: Vec<Flavor>,
}

#[derive(Deserialize)]
struct FlavorEnvelope {
    flavor: Flavor,
}

#[derive(Deserialize)]
struct ImageRef {
    id: String,
}

#[derive(Deserialize)]
struct ImagesEnvelope {
    images: Vec<ImageRef>,
}

impl RestComputeClient {
    pub fn new(endpoint: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("X-Auth-Token", &self.token)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let resp = self.authed(req).send().await?;
        if !resp.status().is_success() {
            return Err(TakeoverError::RemoteRequest(format!("{} failed: {}", what, resp.status())));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ComputeApi for RestComputeClient {
    async fn create_server(&self, request: CreateServer) -> Result<Server> {
        let body = serde_json::json!({ "server": request });
        let env: ServerEnvelope = self
            .send_json(self.client.post(self.url("/servers")).json(&body), "create server")
            .await?;
        Ok(env.server)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>> {
        let resp = self.authed(self.client.get(self.url(&format!("/servers/{}", id)))).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json::<ServerEnvelope>().await?.server)),
            s => Err(TakeoverError::RemoteRequest(format!("get server {} failed: {}", id, s))),
        }
    }

    async fn list_servers(&self, host: &str) -> Result<Vec<Server>> {
        let req = self.client.get(self.url("/servers/detail")).query(&[("host", host), ("all_tenants", "1")]);
        let env: ServersEnvelope = self.send_json(req, "list servers").await?;
        // the host filter is advisory on some deployments
        Ok(env.servers.into_iter().filter(|s| s.host.as_deref() == Some(host)).collect())
    }

    async fn update_server(&self, id: &str, patch: ServerPatch) -> Result<()> {
        let body = serde_json::json!({ "server": patch });
        let resp = self
            .authed(self.client.put(self.url(&format!("/servers/{}", id))).json(&body))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TakeoverError::RemoteRequest(format!("update server {} failed: {}", id, resp.status())));
        }
        Ok(())
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        let resp = self.authed(self.client.delete(self.url(&format!("/servers/{}", id)))).send().await?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(TakeoverError::RemoteRequest(format!("delete server {} failed: {}", id, s))),
        }
    }

    async fn list_flavors(&self, tenant: &str) -> Result<Vec<Flavor>> {
        let req = self.client.get(self.url("/flavors/detail")).query(&[("tenant_id", tenant)]);
        let env: FlavorsEnvelope = self.send_json(req, "list flavors").await?;
        Ok(env.flavors)
    }

    async fn create_flavor(&self, flavor: Flavor) -> Result<String> {
        let body = serde_json::json!({ "flavor": flavor });
        let env: FlavorEnvelope = self
            .send_json(self.client.post(self.url("/flavors")).json(&body), "create flavor")
            .await?;
        Ok(env.flavor.id)
    }

    async fn find_image(&self, disk_format: &str) -> Result<Option<String>> {
        let req = self
            .client
            .get(self.url("/images"))
            .query(&[("disk_format", disk_format), ("status", "active")]);
        let env: ImagesEnvelope = self.send_json(req, "list images").await?;
        Ok(env.images.into_iter().next().map(|img| img.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let client = RestComputeClient::new("http://nova:8774/v2.1/", "tok", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/servers"), "http://nova:8774/v2.1/servers");
    }

    #[test]
    fn server_payload_deserializes() {
        let env: ServerEnvelope = serde_json::from_str(
            r#"{"server":{"id":"s1","name":"web","host":"compute-1","vm_state":"building",
                "power_state":"running","flavor_id":"f1","metadata":{"uuid":"v1"}}}"#,
        )
        .unwrap();
        assert_eq!(env.server.id, "s1");
        assert_eq!(env.server.metadata.get("uuid").map(String::as_str), Some("v1"));
    }
}
