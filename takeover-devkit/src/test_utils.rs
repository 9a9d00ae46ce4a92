/*!
Test harness for the takeover kernel

Wires a complete `Scheduler` over the in-memory collaborators:
- `FakeCompute` with an importable image for each platform type
- `FakeAdapterFactory` resolving fake platforms by API endpoint
- `MockChannel` answering host commands with a running service
- `MemoryStore` for platform rows and id mappings
- `MemorySink` collecting metric batches
*/

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use takeover_kernel::config::KernelConfig;
use takeover_kernel::models::{NewPlatform, PlatformInstance, PlatformType, TakeoverScope};
use takeover_kernel::registry::PlatformRegistry;
use takeover_kernel::scheduler::{Collaborators, Scheduler};

use crate::channel_stub::MockChannel;
use crate::compute_stub::FakeCompute;
use crate::metrics_stub::MemorySink;
use crate::platform_stub::{FakeAdapterFactory, FakePlatform, DEFAULT_CLUSTER, DEFAULT_DATACENTER};
use crate::store_stub::MemoryStore;

pub const IMAGE_A: &str = "img-vmdk";
pub const IMAGE_B: &str = "img-raw";

/// Scope selecting the default cluster of a fresh `FakePlatform`.
pub fn default_scope() -> TakeoverScope {
    TakeoverScope::from([(DEFAULT_DATACENTER.to_string(), BTreeSet::from([DEFAULT_CLUSTER.to_string()]))])
}

pub struct TestHarness {
    pub config: KernelConfig,
    pub compute: Arc<FakeCompute>,
    pub adapters: Arc<FakeAdapterFactory>,
    pub channel: Arc<MockChannel>,
    pub sink: Arc<MemorySink>,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<Scheduler>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        Self::with_config(KernelConfig::default()).await
    }

    pub async fn with_config(config: KernelConfig) -> Result<Self> {
        let compute = Arc::new(
            FakeCompute::new()
                .with_image(&config.platforms.a.image_disk_format, IMAGE_A)
                .with_image(&config.platforms.b.image_disk_format, IMAGE_B),
        );
        Self::assemble(config, compute).await
    }

    /// Harness over a caller-prepared compute platform (no images are added).
    pub async fn assemble(config: KernelConfig, compute: Arc<FakeCompute>) -> Result<Self> {
        env_logger::try_init().ok();

        let adapters = Arc::new(FakeAdapterFactory::new());
        let channel = Arc::new(MockChannel::new());
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryStore::new());

        let scheduler = Scheduler::assemble(
            &config,
            Collaborators {
                compute: compute.clone(),
                platforms: store.clone(),
                mappings: store.clone(),
                adapters: adapters.clone(),
                channel: channel.clone(),
                sink: sink.clone(),
            },
        );
        log::info!("test harness ready");

        Ok(Self { config, compute, adapters, channel, sink, store, scheduler })
    }

    pub fn registry(&self, platform_type: PlatformType) -> &Arc<PlatformRegistry> {
        self.scheduler.registry(platform_type)
    }

    /// Creates a fake platform at `https://<name>.lab` and registers it with
    /// the default scope on compute host `<name>-host`.
    pub async fn add_platform(&self, platform_type: PlatformType, name: &str) -> Result<(PlatformInstance, Arc<FakePlatform>)> {
        let endpoint = format!("https://{name}.lab");
        let platform = FakePlatform::new();
        self.adapters.insert(&endpoint, platform.clone());

        let instance = self
            .registry(platform_type)
            .register(self.new_platform(name, &endpoint), &[], &[])
            .await?;
        log::info!("registered {} platform {}", platform_type, name);
        Ok((instance, platform))
    }

    pub fn new_platform(&self, name: &str, endpoint: &str) -> NewPlatform {
        NewPlatform {
            name: name.to_string(),
            domain: "default".to_string(),
            hostname: format!("{name}-host"),
            api_endpoint: endpoint.to_string(),
            api_username: "admin".to_string(),
            api_password: "secret".to_string(),
            takeover_scope: default_scope(),
        }
    }
}
