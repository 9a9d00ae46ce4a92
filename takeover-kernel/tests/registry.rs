use std::collections::BTreeSet;

use takeover_devkit::channel_stub::SERVICE_FAILED;
use takeover_devkit::platform_stub::remote_vm;
use takeover_devkit::{FakePlatform, TestHarness};
use takeover_kernel::models::{InstanceStatus, PlatformType, PlatformUpdate, Template, TakeoverScope};
use takeover_kernel::store::PlatformStore;
use takeover_kernel::TakeoverError;

fn cmds(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn rejected_login_persists_nothing() {
    let harness = TestHarness::new().await.unwrap();
    let platform = FakePlatform::new();
    platform.reject_login(true);
    harness.adapters.insert("https://lab.lab", platform.clone());

    let err = harness
        .registry(PlatformType::A)
        .register(
            harness.new_platform("lab", "https://lab.lab"),
            &cmds(&["systemctl restart nova-compute", "systemctl status nova-compute"]),
            &cmds(&["systemctl stop nova-compute"]),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TakeoverError::LoginFailed(ref name) if name == "lab"));
    assert_eq!(platform.logins(), 1);
    assert_eq!(harness.store.platform_count(), 0);
    assert!(harness.channel.ran().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_service_check_replays_rollback_and_persists_nothing() {
    let harness = TestHarness::new().await.unwrap();
    harness.adapters.insert("https://lab.lab", FakePlatform::new());
    harness.channel.set_status(SERVICE_FAILED);

    let apply = cmds(&[
        "cp /etc/nova/nova.conf.platform-a /etc/nova/nova.conf",
        "systemctl restart nova-compute",
        "systemctl status nova-compute",
    ]);
    let rollback = cmds(&["cp /etc/nova/nova.conf.bak /etc/nova/nova.conf", "systemctl restart nova-compute"]);

    let err = harness
        .registry(PlatformType::A)
        .register(harness.new_platform("lab", "https://lab.lab"), &apply, &rollback)
        .await
        .unwrap_err();

    assert!(matches!(err, TakeoverError::ComputeServiceActivationFailed { ref host, .. } if host == "lab-host"));
    let mut expected = apply.clone();
    expected.extend(rollback);
    assert_eq!(harness.channel.commands_for("lab-host"), expected);
    assert_eq!(harness.store.platform_count(), 0);
    assert!(harness.registry(PlatformType::A).list_instances().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn successful_registration_runs_commands_and_is_listed() {
    let harness = TestHarness::new().await.unwrap();
    harness.adapters.insert("https://lab.lab", FakePlatform::new());
    let apply = cmds(&["systemctl restart nova-compute", "systemctl status nova-compute"]);

    let instance = harness
        .registry(PlatformType::A)
        .register(harness.new_platform("lab", "https://lab.lab"), &apply, &[])
        .await
        .unwrap();

    assert_eq!(harness.channel.commands_for("lab-host"), apply);
    let views = harness.registry(PlatformType::A).list_instances().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].instance.uuid, instance.uuid);
    assert_eq!(views[0].status, InstanceStatus::Ok);
    assert_eq!(views[0].topology.len(), 1);
    assert!(harness.registry(PlatformType::B).list_instances().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hostname_and_endpoint_are_unique_across_types() {
    let harness = TestHarness::new().await.unwrap();
    harness.add_platform(PlatformType::A, "lab").await.unwrap();

    let err = harness
        .registry(PlatformType::B)
        .register(harness.new_platform("lab", "https://other.lab"), &[], &[])
        .await
        .unwrap_err();

    assert!(matches!(err, TakeoverError::DuplicatePlatform { field: "hostname", .. }));
    assert_eq!(harness.store.platform_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn one_unreachable_platform_does_not_hide_the_others() {
    let harness = TestHarness::new().await.unwrap();
    harness.add_platform(PlatformType::A, "alpha").await.unwrap();
    let (_, beta) = harness.add_platform(PlatformType::A, "beta").await.unwrap();
    beta.set_unreachable(true);

    let views = harness.registry(PlatformType::A).list_instances().await.unwrap();

    assert_eq!(views.len(), 2);
    let alpha = views.iter().find(|v| v.instance.name == "alpha").unwrap();
    let beta = views.iter().find(|v| v.instance.name == "beta").unwrap();
    assert_eq!(alpha.status, InstanceStatus::Ok);
    assert_eq!(beta.status, InstanceStatus::Failed);
    assert!(beta.topology.is_empty());
}

#[tokio::test(start_paused = true)]
async fn deregister_during_sync_is_rejected_without_side_effects() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, _) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    let registry = harness.registry(PlatformType::A);

    let lease = harness.scheduler.guard().begin_sync().unwrap();
    let err = registry.deregister(&instance.uuid, &cmds(&["systemctl stop nova-compute"])).await.unwrap_err();

    assert!(matches!(err, TakeoverError::SyncInProgress));
    assert_eq!(harness.store.platform_count(), 1);
    assert!(harness.channel.ran().is_empty());
    assert_eq!(registry.list_instances().await.unwrap().len(), 1);

    drop(lease);
    registry.deregister(&instance.uuid, &cmds(&["systemctl stop nova-compute"])).await.unwrap();
    assert_eq!(harness.store.platform_count(), 0);
    assert_eq!(harness.channel.commands_for("lab-host"), cmds(&["systemctl stop nova-compute"]));
}

#[tokio::test(start_paused = true)]
async fn deregister_purges_mappings_of_the_host() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_vms(vec![remote_vm("b1", "app-1"), remote_vm("b2", "app-2")]);
    harness.scheduler.reconcile_once().await.unwrap();
    assert_eq!(harness.store.mappings_of(PlatformType::B).len(), 2);

    harness.registry(PlatformType::B).deregister(&instance.uuid, &[]).await.unwrap();

    assert!(harness.store.mappings_of(PlatformType::B).is_empty());
    assert!(harness.registry(PlatformType::B).list_instances().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deregister_of_unknown_platform_is_not_found() {
    let harness = TestHarness::new().await.unwrap();
    let err = harness.registry(PlatformType::A).deregister("nope", &[]).await.unwrap_err();
    assert!(matches!(err, TakeoverError::PlatformNotFound(_)));
    assert!(!harness.scheduler.guard().is_deleting());
}

#[tokio::test(start_paused = true)]
async fn scope_update_is_persisted() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    platform.set_vms(vec![remote_vm("v1", "web")]);
    let registry = harness.registry(PlatformType::A);

    let update = PlatformUpdate { takeover_scope: Some(TakeoverScope::new()), ..Default::default() };
    let updated = registry.update_instance(&instance.uuid, update).await.unwrap();
    assert!(updated.takeover_scope.is_empty());

    let stored = harness.store.get_platform(&instance.uuid).await.unwrap().unwrap();
    assert!(stored.takeover_scope.is_empty());
    assert_eq!(platform.logins(), 1);

    harness.scheduler.reconcile_once().await.unwrap();
    assert!(harness.compute.creates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn credential_change_must_log_in() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, _) = harness.add_platform(PlatformType::A, "lab").await.unwrap();
    let moved = FakePlatform::new();
    moved.reject_login(true);
    harness.adapters.insert("https://lab-new.lab", moved.clone());
    let registry = harness.registry(PlatformType::A);

    let update = PlatformUpdate { api_endpoint: Some("https://lab-new.lab".into()), ..Default::default() };
    let err = registry.update_instance(&instance.uuid, update.clone()).await.unwrap_err();
    assert!(matches!(err, TakeoverError::LoginFailed(_)));
    let stored = harness.store.get_platform(&instance.uuid).await.unwrap().unwrap();
    assert_eq!(stored.api_endpoint, "https://lab.lab");

    moved.reject_login(false);
    let updated = registry.update_instance(&instance.uuid, update).await.unwrap();
    assert_eq!(updated.api_endpoint, "https://lab-new.lab");
    assert_eq!(moved.logins(), 2);
}

#[tokio::test(start_paused = true)]
async fn aggregates_flatten_every_platform() {
    let harness = TestHarness::new().await.unwrap();
    harness.add_platform(PlatformType::A, "alpha").await.unwrap();
    harness.add_platform(PlatformType::A, "beta").await.unwrap();
    let registry = harness.registry(PlatformType::A);

    let datacenters = registry.datacenters().await.unwrap();
    let clusters = registry.clusters().await.unwrap();
    let hosts = registry.hosts().await.unwrap();

    assert_eq!(datacenters.len(), 2);
    assert_eq!(clusters.len(), 2);
    assert_eq!(hosts.len(), 2);
    let names: BTreeSet<&str> = hosts.iter().map(|h| h.platform_name.as_str()).collect();
    assert_eq!(names, BTreeSet::from(["alpha", "beta"]));
}

#[tokio::test(start_paused = true)]
async fn templates_come_from_the_instance_adapter() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, platform) = harness.add_platform(PlatformType::B, "hv").await.unwrap();
    platform.set_templates(vec![Template { id: "t1".into(), name: "centos-7".into() }]);
    let registry = harness.registry(PlatformType::B);

    let templates = registry.templates(&instance.uuid).await.unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].name, "centos-7");

    let err = registry.templates("missing").await.unwrap_err();
    assert!(matches!(err, TakeoverError::PlatformNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn sync_now_is_refused_while_a_pass_runs() {
    let harness = TestHarness::new().await.unwrap();
    let (instance, _) = harness.add_platform(PlatformType::A, "lab").await.unwrap();

    let _lease = harness.scheduler.guard().begin_sync().unwrap();
    let err = harness
        .registry(PlatformType::A)
        .sync_instance(&instance.uuid, &BTreeSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TakeoverError::SyncInProgress));
}
