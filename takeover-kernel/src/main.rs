/**
 * TAKEOVER KERNEL - service entry point
 *
 * ROLE : bootstraps config, store, collaborators and the scheduler, starts
 * the reconciliation and monitoring loops, then serves the admin API until
 * Ctrl-C.
 */

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use takeover_kernel::adapters::rest::RestAdapterFactory;
use takeover_kernel::compute::RestComputeClient;
use takeover_kernel::config::load_config;
use takeover_kernel::http::{build_router, AppState};
use takeover_kernel::metrics::MqttMetricsSink;
use takeover_kernel::pusher::SshChannel;
use takeover_kernel::scheduler::{Collaborators, Scheduler};
use takeover_kernel::store::SqliteStore;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("takeover_kernel=info")))
        .init();

    let cfg = load_config().await;

    if let Err(e) = std::fs::create_dir_all("./data") {
        warn!(error = %e, "failed to create data dir");
    }
    let store = Arc::new(
        SqliteStore::open(&cfg.database_url)
            .await
            .with_context(|| format!("opening store {}", cfg.database_url))?,
    );

    let compute = RestComputeClient::new(&cfg.compute.endpoint, &cfg.compute.token, REMOTE_TIMEOUT)
        .context("building compute client")?;
    let adapters = RestAdapterFactory::new(REMOTE_TIMEOUT).context("building platform adapter factory")?;

    let scheduler = Scheduler::assemble(
        &cfg,
        Collaborators {
            compute: Arc::new(compute),
            platforms: store.clone(),
            mappings: store,
            adapters: Arc::new(adapters),
            channel: Arc::new(SshChannel::new(cfg.ssh.clone())),
            sink: Arc::new(MqttMetricsSink::connect(&cfg.metrics)),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = scheduler.spawn_loops(shutdown_rx);

    let api_key = std::env::var("TAKEOVER_API_KEY").ok();
    if api_key.as_deref().map_or(true, str::is_empty) {
        warn!("TAKEOVER_API_KEY not set, admin API will refuse every request");
    }
    let app = build_router(AppState::new(scheduler, api_key));

    let addr: SocketAddr = cfg.listen_addr.parse().with_context(|| format!("invalid listen_addr {}", cfg.listen_addr))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(%addr, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("admin API server")?;

    shutdown_tx.send(true).ok();
    for handle in loops {
        handle.await.ok();
    }
    info!("kernel stopped");
    Ok(())
}
