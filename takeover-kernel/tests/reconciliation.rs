use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use takeover_devkit::platform_stub::remote_vm;
use takeover_devkit::test_utils::{IMAGE_A, IMAGE_B};
use takeover_devkit::{FakeCompute, TestHarness};
use takeover_kernel::config::KernelConfig;
use takeover_kernel::models::{Cluster, Flavor, PlatformType, PowerState, Server, UuidMapping, VmState};
use takeover_kernel::reconcile::{ADOPTION_TAG, PLATFORM_TYPE_TAG};
use takeover_kernel::store::MappingStore;
use takeover_kernel::TakeoverError;

fn ids(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn adopted_vm_is_removed_once_gone_from_platform() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);

    let outcome = harness.scheduler.reconcile_once().await.unwrap();
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failed, 0);

    let server = harness.compute.server("v1").expect("v1 adopted");
    assert_eq!(server.host.as_deref(), Some(instance.hostname.as_str()));
    assert_eq!(server.name, "web");
    assert_eq!(server.power_state, PowerState::Running);
    assert_eq!(server.vm_state, VmState::Active);
    assert!(!server.metadata.contains_key(ADOPTION_TAG));

    let creates = harness.compute.creates();
    assert_eq!(creates.len(), 1);
    assert_eq!(
        creates[0].request.metadata,
        BTreeMap::from([
            (PLATFORM_TYPE_TAG.to_string(), "A".to_string()),
            (ADOPTION_TAG.to_string(), "v1".to_string()),
        ])
    );
    assert_eq!(creates[0].request.availability_zone, format!("nova:{}", instance.hostname));

    let mappings = harness.store.mappings_of(PlatformType::A);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].external_id, "v1");
    assert_eq!(mappings[0].internal_id, "v1");
    assert_eq!(mappings[0].ip.as_deref(), Some("10.0.0.10"));
    assert_eq!(harness.compute.flavors_created(), 1);

    platform.set_vms(vec![]);
    harness.scheduler.reconcile_once().await.unwrap();

    assert!(harness.compute.server("v1").is_none());
    assert!(harness.store.mappings_of(PlatformType::A).is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_pass_changes_nothing() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_vms(vec![remote_vm("b1", "app-1"), remote_vm("b2", "app-2"), remote_vm("b3", "app-3")]);

    harness.scheduler.reconcile_once().await.unwrap();
    let mappings_before = harness.store.mappings_of(PlatformType::B);
    let mut servers_before: Vec<String> =
        harness.compute.servers_on(&instance.hostname).into_iter().map(|s| s.id).collect();
    servers_before.sort();
    let creates_before = harness.compute.creates().len();
    let flavors_before = harness.compute.flavors_created();

    harness.scheduler.reconcile_once().await.unwrap();
    let mut servers_after: Vec<String> =
        harness.compute.servers_on(&instance.hostname).into_iter().map(|s| s.id).collect();
    servers_after.sort();

    assert_eq!(creates_before, 3);
    assert_eq!(harness.store.mappings_of(PlatformType::B), mappings_before);
    assert_eq!(servers_after, servers_before);
    assert_eq!(harness.compute.creates().len(), creates_before);
    assert_eq!(harness.compute.flavors_created(), flavors_before);
    assert!(harness.compute.deletes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn platform_b_servers_are_linked_through_mappings() {
    let harness = TestHarness::new().await.unwrap();
    let (_, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_vms(vec![remote_vm("b1", "app-1")]);

    harness.scheduler.reconcile_once().await.unwrap();

    let mapping = harness.store.mappings_of(PlatformType::B).pop().expect("mapping stored");
    assert_eq!(mapping.external_id, "b1");
    assert_ne!(mapping.internal_id, "b1");
    assert!(harness.compute.server(&mapping.internal_id).is_some());
    assert_eq!(harness.compute.creates()[0].request.image_id, IMAGE_B);
}

#[tokio::test(start_paused = true)]
async fn diff_creates_new_removes_stale_and_refreshes_common() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);
    harness.scheduler.reconcile_once().await.unwrap();

    harness.compute.seed_server(Server {
        id: "ghost".into(),
        name: "leftover".into(),
        host: Some(instance.hostname.clone()),
        vm_state: VmState::Active,
        power_state: PowerState::Running,
        flavor_id: "f-old".into(),
        metadata: Default::default(),
    });
    platform.set_vms(vec![remote_vm("v1", "web"), remote_vm("v2", "db")]);
    platform.update_vm("v1", |vm| {
        vm.name = "web-renamed".into();
        vm.power_state = PowerState::Shutdown;
    });

    let report = harness
        .registry(PlatformType::A)
        .sync_instance(&instance.uuid, &BTreeSet::new())
        .await
        .unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.imported.created, vec!["v2".to_string()]);
    assert!(harness.compute.server("ghost").is_none());

    let v1 = harness.compute.server("v1").unwrap();
    assert_eq!(v1.name, "web-renamed");
    assert_eq!(v1.power_state, PowerState::Shutdown);
    assert_eq!(v1.vm_state, VmState::Stopped);
    assert!(harness.compute.server("v2").is_some());
}

#[tokio::test(start_paused = true)]
async fn only_selected_ids_get_their_state_refreshed() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web"), remote_vm("v2", "db")]);
    harness.scheduler.reconcile_once().await.unwrap();

    platform.update_vm("v1", |vm| vm.name = "web-2".into());
    platform.update_vm("v2", |vm| vm.name = "db-2".into());

    let report = harness
        .registry(PlatformType::A)
        .sync_instance(&instance.uuid, &ids(&["v1"]))
        .await
        .unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(harness.compute.server("v1").unwrap().name, "web-2");
    assert_eq!(harness.compute.server("v2").unwrap().name, "db");
}

#[tokio::test(start_paused = true)]
async fn identical_shapes_share_one_new_flavor() {
    let harness = TestHarness::new().await.unwrap();
    let (_, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_vms(vec![remote_vm("b1", "a"), remote_vm("b2", "b"), remote_vm("b3", "c")]);

    harness.scheduler.reconcile_once().await.unwrap();

    assert_eq!(harness.compute.flavors_created(), 1);
    let flavor_ids: BTreeSet<String> =
        harness.compute.creates().into_iter().map(|c| c.request.flavor_id).collect();
    assert_eq!(flavor_ids.len(), 1);

    let flavor = harness.compute.flavors().pop().unwrap();
    assert!(flavor.name.starts_with("vflavor-"));
    assert_eq!((flavor.ram_mb, flavor.vcpus, flavor.disk_gb), (4096, 2, 40));
}

#[tokio::test(start_paused = true)]
async fn existing_flavor_is_reused() {
    let compute = Arc::new(
        FakeCompute::new()
            .with_image("vmdk", IMAGE_A)
            .with_flavor(Flavor { id: "m1.medium".into(), name: "m1.medium".into(), ram_mb: 4096, vcpus: 2, disk_gb: 40 }),
    );
    let harness = TestHarness::assemble(KernelConfig::default(), compute).await.unwrap();
    let (_, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);

    harness.scheduler.reconcile_once().await.unwrap();

    assert_eq!(harness.compute.flavors_created(), 0);
    assert_eq!(harness.compute.creates()[0].request.flavor_id, "m1.medium");
}

#[tokio::test(start_paused = true)]
async fn missing_image_aborts_before_any_creation() {
    let harness = TestHarness::assemble(KernelConfig::default(), Arc::new(FakeCompute::new())).await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web"), remote_vm("v2", "db")]);

    let err = harness
        .registry(PlatformType::A)
        .take_over(&instance.uuid, &ids(&["v1", "v2"]))
        .await
        .unwrap_err();

    assert!(matches!(err, TakeoverError::ImageNotFound(PlatformType::A)));
    assert!(harness.compute.creates().is_empty());
    assert_eq!(harness.compute.flavors_created(), 0);
    assert!(harness.store.mappings_of(PlatformType::A).is_empty());
}

#[tokio::test(start_paused = true)]
async fn errored_build_is_pinned_then_healed_next_pass() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);
    harness.compute.fail_build("web");

    let report = harness
        .registry(PlatformType::A)
        .take_over(&instance.uuid, &ids(&["v1"]))
        .await
        .unwrap();
    assert_eq!(report.created, vec!["v1".to_string()]);
    assert_eq!(report.errored, 1);
    let pinned = harness
        .compute
        .updates()
        .into_iter()
        .any(|(id, patch)| id == "v1" && patch.host.as_deref() == Some(instance.hostname.as_str()));
    assert!(pinned);

    let sync = harness
        .registry(PlatformType::A)
        .sync_instance(&instance.uuid, &BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(sync.healed, 1);
    assert_eq!(sync.imported.created, vec!["v1".to_string()]);
    assert_eq!(harness.compute.creates().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn vms_outside_takeover_scope_are_ignored() {
    let harness = TestHarness::new().await.unwrap();
    let (_, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.add_cluster(
        takeover_devkit::platform_stub::DEFAULT_DATACENTER,
        Cluster { id: "cl-2".into(), name: "dev".into(), datacenter_id: "dc-1".into() },
    );
    let mut outside = remote_vm("v2", "scratch");
    outside.cluster_id = "cl-2".into();
    platform.set_vms(vec![remote_vm("v1", "web"), outside]);

    harness.scheduler.reconcile_once().await.unwrap();

    assert!(harness.compute.server("v1").is_some());
    assert!(harness.compute.server("v2").is_none());
}

#[tokio::test(start_paused = true)]
async fn unreachable_platform_keeps_its_servers() {
    let harness = TestHarness::new().await.unwrap();
    let (_, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);
    harness.scheduler.reconcile_once().await.unwrap();

    platform.set_unreachable(true);
    let outcome = harness.scheduler.reconcile_once().await.unwrap();

    assert_eq!(outcome.failed, 1);
    assert!(harness.compute.server("v1").is_some());
    assert_eq!(harness.store.mappings_of(PlatformType::A).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn take_over_skips_already_adopted_vms() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_vms(vec![remote_vm("b1", "a"), remote_vm("b2", "b"), remote_vm("b3", "c")]);
    let registry = harness.registry(PlatformType::B);

    let first = registry.take_over(&instance.uuid, &ids(&["b2"])).await.unwrap();
    assert_eq!(first.created, vec!["b2".to_string()]);

    let second = registry.take_over(&instance.uuid, &ids(&["b2"])).await.unwrap();
    assert!(second.created.is_empty());
    assert_eq!(harness.compute.creates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reused_id_replaces_the_local_record() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    harness.compute.seed_server(Server {
        id: "v1".into(),
        name: "leftover".into(),
        host: Some(instance.hostname.clone()),
        vm_state: VmState::Active,
        power_state: PowerState::Running,
        flavor_id: "f-old".into(),
        metadata: Default::default(),
    });
    harness
        .store
        .upsert_mapping(&UuidMapping {
            platform_type: PlatformType::A,
            external_id: "retired".into(),
            internal_id: "v1".into(),
            ip: None,
            flavor_id: Some("f-old".into()),
        })
        .await
        .unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);

    let report = harness
        .registry(PlatformType::A)
        .take_over(&instance.uuid, &ids(&["v1"]))
        .await
        .unwrap();

    assert_eq!(report.replaced, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.created, vec!["v1".to_string()]);
    assert_eq!(harness.compute.deletes(), vec!["v1".to_string()]);
    assert_eq!(harness.compute.creates().len(), 1);
    assert_eq!(harness.compute.server("v1").unwrap().name, "web");

    let mappings = harness.store.mappings_of(PlatformType::A);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].external_id, "v1");
    assert_eq!(mappings[0].internal_id, "v1");
}

#[tokio::test(start_paused = true)]
async fn sync_finishes_an_adoption_left_building() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);
    harness.compute.set_building_polls(u32::MAX);

    let report = harness
        .registry(PlatformType::A)
        .take_over(&instance.uuid, &ids(&["v1"]))
        .await
        .unwrap();
    assert_eq!(report.created, vec!["v1".to_string()]);

    harness.scheduler.reconcile_once().await.unwrap();
    let building = harness.compute.server("v1").unwrap();
    assert_eq!(building.vm_state, VmState::Building);
    assert!(building.metadata.contains_key(ADOPTION_TAG));
    assert!(harness.compute.updates().is_empty());

    harness.compute.finish_builds();
    let sync = harness
        .registry(PlatformType::A)
        .sync_instance(&instance.uuid, &BTreeSet::new())
        .await
        .unwrap();

    assert_eq!(sync.updated, 1);
    let adopted = harness.compute.server("v1").unwrap();
    assert_eq!(adopted.vm_state, VmState::Active);
    assert_eq!(adopted.power_state, PowerState::Running);
    assert!(!adopted.metadata.contains_key(ADOPTION_TAG));
    assert_eq!(harness.compute.creates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn vanished_build_is_counted_as_failed() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web"), remote_vm("v2", "db")]);
    harness.compute.lose_build("web");

    let report = harness
        .registry(PlatformType::A)
        .take_over(&instance.uuid, &ids(&["v1", "v2"]))
        .await
        .unwrap();

    assert_eq!(report.created, vec!["v2".to_string()]);
    assert_eq!(report.failed, 1);
    assert!(harness.compute.server("v1").is_none());
    let mappings = harness.store.mappings_of(PlatformType::A);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].external_id, "v2");
}
