/**
 * SCHEDULER - process-wide owner of the platform registries and background loops
 *
 * ROLE : wires the registries over shared collaborators, runs the periodic
 * reconciliation pass and the periodic utilization collection, and exposes
 * the guard that keeps deletions and passes apart.
 *
 * LOOPS : each loop ticks on its own interval (first tick one period after
 * start). Every iteration runs in its own task, so an error or a panic is
 * logged and the loop carries on with the next tick. Both loops stop when
 * the shutdown channel flips to `true`.
 */

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::AdapterFactory;
use crate::compute::ComputeApi;
use crate::config::KernelConfig;
use crate::error::Result;
use crate::flavors::FlavorMatcher;
use crate::guard::SyncGuard;
use crate::health::{HealthTracker, SystemHealth};
use crate::metrics::{now_timestamp, reshape, MetricsSink, SampleOwner};
use crate::models::PlatformType;
use crate::pusher::{CommandChannel, RemoteConfigPusher};
use crate::reconcile::{EngineSettings, ReconciliationEngine};
use crate::registry::{Placement, PlatformRegistry};
use crate::store::{MappingStore, PlatformStore};

/// External services the scheduler is built over.
pub struct Collaborators {
    pub compute: Arc<dyn ComputeApi>,
    pub platforms: Arc<dyn PlatformStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub adapters: Arc<dyn AdapterFactory>,
    pub channel: Arc<dyn CommandChannel>,
    pub sink: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    /// The guard was held elsewhere; nothing ran.
    pub skipped: bool,
    pub synced: usize,
    pub failed: usize,
}

pub struct Scheduler {
    registry_a: Arc<PlatformRegistry>,
    registry_b: Arc<PlatformRegistry>,
    guard: Arc<SyncGuard>,
    sink: Arc<dyn MetricsSink>,
    health: HealthTracker,
    owner: SampleOwner,
    sync_interval: Duration,
    monitor_interval: Duration,
}

impl Scheduler {
    pub fn assemble(cfg: &KernelConfig, deps: Collaborators) -> Arc<Self> {
        let guard = SyncGuard::new();
        let flavors = FlavorMatcher::new(deps.compute.clone(), cfg.compute.tenant.clone());
        let engine = ReconciliationEngine::new(
            deps.compute.clone(),
            deps.mappings.clone(),
            flavors,
            EngineSettings::from_config(cfg),
        );
        let pusher = Arc::new(RemoteConfigPusher::new(deps.channel, cfg.ssh.success_marker.clone()));
        let placement = Placement {
            zone: cfg.compute.availability_zone.clone(),
            network_id: cfg.compute.network_id.clone(),
        };
        let registry = |platform_type| {
            Arc::new(PlatformRegistry::new(
                platform_type,
                deps.platforms.clone(),
                deps.adapters.clone(),
                pusher.clone(),
                engine.clone(),
                guard.clone(),
                placement.clone(),
            ))
        };

        Arc::new(Self {
            registry_a: registry(PlatformType::A),
            registry_b: registry(PlatformType::B),
            guard: guard.clone(),
            sink: deps.sink,
            health: HealthTracker::new(),
            owner: SampleOwner::from(&cfg.compute),
            sync_interval: cfg.scheduler.sync_interval(),
            monitor_interval: cfg.scheduler.monitor_interval(),
        })
    }

    pub fn registry(&self, platform_type: PlatformType) -> &Arc<PlatformRegistry> {
        match platform_type {
            PlatformType::A => &self.registry_a,
            PlatformType::B => &self.registry_b,
        }
    }

    fn registries(&self) -> [&Arc<PlatformRegistry>; 2] {
        [&self.registry_a, &self.registry_b]
    }

    pub fn guard(&self) -> &Arc<SyncGuard> {
        &self.guard
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub async fn system_health(&self) -> SystemHealth {
        let mut platforms = BTreeMap::new();
        for registry in self.registries() {
            match registry.snapshot().await {
                Ok(entries) => {
                    platforms.insert(registry.platform_type().to_string(), entries.len());
                }
                Err(e) => warn!(platform_type = %registry.platform_type(), error = %e, "platform count unavailable"),
            }
        }
        self.health.report(self.guard.state(), platforms)
    }

    /// One reconciliation pass over every platform of both types, under
    /// the sync lease. Skipped when a deletion or another pass holds the
    /// guard.
    pub async fn reconcile_once(&self) -> Result<PassOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let _lease = match self.guard.begin_sync() {
            Ok(lease) => lease,
            Err(e) => {
                info!(reason = %e, "reconciliation pass skipped");
                return Ok(PassOutcome { skipped: true, ..PassOutcome::default() });
            }
        };

        let mut outcome = PassOutcome::default();
        for registry in self.registries() {
            let platform_type = registry.platform_type();
            if let Err(e) = registry.refresh_topology().await {
                error!(%platform_type, error = %e, "topology refresh failed");
                outcome.failed += 1;
                continue;
            }
            match registry.sync_all().await {
                Ok(results) => {
                    for (_, result) in results {
                        if result.is_ok() {
                            outcome.synced += 1;
                        } else {
                            outcome.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(%platform_type, error = %e, "platform listing failed");
                    outcome.failed += 1;
                }
            }
        }

        let detail = (outcome.failed > 0).then(|| format!("{} platform(s) failed", outcome.failed));
        self.health.sync_log().record(started_at, outcome.failed == 0, detail);
        info!(synced = outcome.synced, failed = outcome.failed, "reconciliation pass finished");
        Ok(outcome)
    }

    /// Pulls VM and host counters from every platform and writes them to
    /// the sink as one batch. Returns the number of samples written.
    pub async fn collect_metrics_once(&self) -> Result<usize> {
        let started_at = OffsetDateTime::now_utc();
        let mut resources = Vec::new();
        let mut failed = 0;
        for registry in self.registries() {
            match registry.collect_utilization().await {
                Ok(mut collected) => resources.append(&mut collected),
                Err(e) => {
                    warn!(platform_type = %registry.platform_type(), error = %e, "utilization collection failed");
                    failed += 1;
                }
            }
        }

        let samples = reshape(&resources, &self.owner, &now_timestamp());
        if let Err(e) = self.sink.write(&samples).await {
            self.health.monitor_log().record(started_at, false, Some(e.to_string()));
            return Err(e);
        }

        let detail = (failed > 0).then(|| format!("{failed} platform type(s) failed"));
        self.health.monitor_log().record(started_at, failed == 0, detail);
        debug!(samples = samples.len(), "metrics collected");
        Ok(samples.len())
    }

    /// Starts the reconciliation and monitoring loops.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let reconcile = {
            let scheduler = self.clone();
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.reconcile_once().await.map(|_| ()) }
            }
        };
        let monitor = {
            let scheduler = self.clone();
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.collect_metrics_once().await.map(|_| ()) }
            }
        };
        vec![
            spawn_periodic("reconcile", self.sync_interval, shutdown.clone(), reconcile),
            spawn_periodic("monitor", self.monitor_interval, shutdown, monitor),
        ]
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, period_secs = period.as_secs(), "loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::spawn(job()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(task = name, error = %e, "iteration failed"),
                        Err(e) => error!(task = name, error = %e, "iteration aborted"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(task = name, "loop stopped");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_task_survives_errors_and_panics() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_secs(60), rx, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(crate::error::TakeoverError::RemoteConnect("down".into())),
                    1 => panic!("iteration blew up"),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(122)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
