/*!
In-memory compute platform

Servers, flavors and images live in a mutex-guarded map. Every creation is
logged with its (tokio) timestamp so tests can check throttling, and the
number of concurrently running creations is tracked when a creation delay
is configured.

Behaviour knobs:
- `building_polls`: how many `get_server` calls report `building` before a
  server settles
- `fail_build(name)`: servers created with that display name settle in `error`
- `lose_build(name)`: servers created with that display name disappear on
  their first poll
- `finish_builds()`: every server still `building` settles at once
- `set_unreachable(true)`: every call fails with `RemoteConnect`
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use takeover_kernel::compute::ComputeApi;
use takeover_kernel::models::{CreateServer, Flavor, PowerState, Server, ServerPatch, VmState};
use takeover_kernel::reconcile::{ADOPTION_TAG, PLATFORM_TYPE_TAG};
use takeover_kernel::{Result, TakeoverError};

#[derive(Debug, Clone)]
pub struct CreateRecord {
    pub server_id: String,
    pub request: CreateServer,
    pub at: Instant,
}

#[derive(Default)]
struct World {
    servers: BTreeMap<String, Server>,
    /// server id -> remaining `building` answers
    building: HashMap<String, u32>,
    flavors: Vec<Flavor>,
    images: HashMap<String, String>,
    creates: Vec<CreateRecord>,
    deletes: Vec<String>,
    updates: Vec<(String, ServerPatch)>,
    flavors_created: usize,
    failing_builds: HashSet<String>,
    lost_builds: HashSet<String>,
    building_polls: u32,
    create_delay: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
    unreachable: bool,
}

#[derive(Default)]
pub struct FakeCompute {
    world: Mutex<World>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an importable image for a disk format (`vmdk`, `raw`).
    pub fn with_image(self, disk_format: &str, image_id: &str) -> Self {
        self.world.lock().images.insert(disk_format.to_string(), image_id.to_string());
        self
    }

    pub fn with_flavor(self, flavor: Flavor) -> Self {
        self.world.lock().flavors.push(flavor);
        self
    }

    pub fn set_building_polls(&self, polls: u32) {
        self.world.lock().building_polls = polls;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.world.lock().create_delay = Some(delay);
    }

    pub fn fail_build(&self, name: &str) {
        self.world.lock().failing_builds.insert(name.to_string());
    }

    pub fn lose_build(&self, name: &str) {
        self.world.lock().lost_builds.insert(name.to_string());
    }

    /// Settles every building server as if its remaining polls had run.
    pub fn finish_builds(&self) {
        let mut world = self.world.lock();
        let World { servers, building, failing_builds, .. } = &mut *world;
        building.clear();
        for server in servers.values_mut().filter(|s| s.vm_state == VmState::Building) {
            settle(server, failing_builds);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.world.lock().unreachable = unreachable;
    }

    /// Places a server directly, as if it had been created earlier.
    pub fn seed_server(&self, server: Server) {
        self.world.lock().servers.insert(server.id.clone(), server);
    }

    pub fn server(&self, id: &str) -> Option<Server> {
        self.world.lock().servers.get(id).cloned()
    }

    pub fn servers_on(&self, host: &str) -> Vec<Server> {
        self.world
            .lock()
            .servers
            .values()
            .filter(|s| s.host.as_deref() == Some(host))
            .cloned()
            .collect()
    }

    pub fn creates(&self) -> Vec<CreateRecord> {
        self.world.lock().creates.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.world.lock().deletes.clone()
    }

    pub fn updates(&self) -> Vec<(String, ServerPatch)> {
        self.world.lock().updates.clone()
    }

    pub fn flavors(&self) -> Vec<Flavor> {
        self.world.lock().flavors.clone()
    }

    pub fn flavors_created(&self) -> usize {
        self.world.lock().flavors_created
    }

    pub fn max_in_flight(&self) -> usize {
        self.world.lock().max_in_flight
    }

    fn check_reachable(&self) -> Result<()> {
        if self.world.lock().unreachable {
            return Err(TakeoverError::RemoteConnect("compute endpoint unreachable".into()));
        }
        Ok(())
    }
}

/// `zone:host` targets a host; a bare zone leaves placement to the scheduler.
fn host_of(availability_zone: &str) -> Option<String> {
    availability_zone.split_once(':').map(|(_, host)| host.to_string())
}

fn settle(server: &mut Server, failing_builds: &HashSet<String>) {
    server.vm_state = if failing_builds.contains(&server.name) { VmState::Error } else { VmState::Active };
    server.power_state = PowerState::Running;
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn create_server(&self, request: CreateServer) -> Result<Server> {
        self.check_reachable()?;

        let delay = {
            let mut world = self.world.lock();
            world.in_flight += 1;
            world.max_in_flight = world.max_in_flight.max(world.in_flight);
            world.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut world = self.world.lock();
        world.in_flight -= 1;

        // platform A drivers keep the platform id as the server id
        let keeps_id = request.metadata.get(PLATFORM_TYPE_TAG).map(String::as_str) == Some("A");
        let id = match request.metadata.get(ADOPTION_TAG) {
            Some(tag) if keeps_id => tag.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let server = Server {
            id: id.clone(),
            name: request.name.clone(),
            host: host_of(&request.availability_zone),
            vm_state: VmState::Building,
            power_state: PowerState::Unknown,
            flavor_id: request.flavor_id.clone(),
            metadata: request.metadata.clone(),
        };
        let polls = world.building_polls;
        world.building.insert(id.clone(), polls);
        world.servers.insert(id.clone(), server.clone());
        world.creates.push(CreateRecord { server_id: id.clone(), request, at: Instant::now() });
        log::debug!("[fake-compute] created {} ({})", id, server.name);
        Ok(server)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>> {
        self.check_reachable()?;
        let mut world = self.world.lock();
        let World { servers, building, failing_builds, lost_builds, .. } = &mut *world;
        let Some(server) = servers.get_mut(id) else {
            return Ok(None);
        };
        if server.vm_state == VmState::Building {
            if lost_builds.contains(&server.name) {
                log::debug!("[fake-compute] {} lost while building", id);
                servers.remove(id);
                building.remove(id);
                return Ok(None);
            }
            match building.get_mut(id) {
                Some(remaining) if *remaining > 0 => *remaining -= 1,
                _ => settle(server, failing_builds),
            }
        }
        Ok(Some(server.clone()))
    }

    async fn list_servers(&self, host: &str) -> Result<Vec<Server>> {
        self.check_reachable()?;
        Ok(self.servers_on(host))
    }

    async fn update_server(&self, id: &str, patch: ServerPatch) -> Result<()> {
        self.check_reachable()?;
        let mut world = self.world.lock();
        let Some(server) = world.servers.get_mut(id) else {
            return Err(TakeoverError::RemoteRequest(format!("404 on PUT /servers/{id}")));
        };
        if let Some(host) = &patch.host {
            server.host = Some(host.clone());
        }
        if let Some(name) = &patch.name {
            server.name = name.clone();
        }
        if let Some(power_state) = patch.power_state {
            server.power_state = power_state;
        }
        if let Some(vm_state) = patch.vm_state {
            server.vm_state = vm_state;
        }
        for key in &patch.remove_metadata {
            server.metadata.remove(key);
        }
        world.updates.push((id.to_string(), patch));
        Ok(())
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        self.check_reachable()?;
        let mut world = self.world.lock();
        world.servers.remove(id);
        world.building.remove(id);
        world.deletes.push(id.to_string());
        Ok(())
    }

    async fn list_flavors(&self, _tenant: &str) -> Result<Vec<Flavor>> {
        self.check_reachable()?;
        Ok(self.flavors())
    }

    async fn create_flavor(&self, flavor: Flavor) -> Result<String> {
        self.check_reachable()?;
        let mut world = self.world.lock();
        let id = flavor.id.clone();
        world.flavors.push(flavor);
        world.flavors_created += 1;
        log::debug!("[fake-compute] flavor {} created", id);
        Ok(id)
    }

    async fn find_image(&self, disk_format: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.world.lock().images.get(disk_format).cloned())
    }
}
