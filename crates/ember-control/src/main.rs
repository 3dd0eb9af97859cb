use std::sync::Arc;

use ember_control::{
    cluster::ClusterCoordinator,
    config::ControlConfig,
    executor::{RemoteExecutor, SshExecutor},
    fleet::Fleet,
    heartbeat::{HeartbeatService, LivenessSweep, SweepSettings},
    http::{self, AppState},
    installer::{Provisioner, ProvisionerSettings},
    lifecycle::Lifecycle,
    metrics::MetricsStore,
    notifier::{Notifier, TracingNotifier, WebhookNotifier},
    ports::PortAllocator,
    store::{DbStore, MemoryStore, Store},
    tasks::{Dispatcher, DispatcherSettings, TaskQueue},
};
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

async fn open_store(cfg: &ControlConfig) -> anyhow::Result<Arc<dyn Store>> {
    let Some(url) = cfg.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using the in-memory store, state is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let db = ember_db::connect(url).await?;

    // Apply migrations on boot (idempotent).
    ember_migration::Migrator::up(&db, None).await?;
    Ok(Arc::new(DbStore::new(Arc::new(db))))
}

fn notifier(cfg: &ControlConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    Ok(match cfg.notify_webhook_url.as_deref() {
        Some(url) => {
            tracing::info!(%url, "posting events to webhook");
            Arc::new(WebhookNotifier::new(url)?)
        }
        None => Arc::new(TracingNotifier),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = ControlConfig::from_env();
    let store = open_store(&cfg).await?;
    let notifier = notifier(&cfg)?;
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(cfg.ssh.clone()));

    let ports = Arc::new(PortAllocator::new(
        store.clone(),
        executor.clone(),
        cfg.port_probe_attempts,
        cfg.command_timeout,
    ));
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        executor,
        ports,
        notifier.clone(),
        ProvisionerSettings::from(&cfg),
    ));
    let metrics = Arc::new(MetricsStore::new(cfg.metrics_capacity));

    let shutdown = CancellationToken::new();
    let sweep = LivenessSweep::new(store.clone(), notifier.clone(), SweepSettings::from(&cfg))
        .spawn(shutdown.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Lifecycle::new(provisioner.clone()),
        notifier,
        DispatcherSettings::from(&cfg),
    ))
    .spawn(shutdown.clone());

    let state = AppState {
        fleet: Arc::new(Fleet::new(store.clone())),
        tasks: TaskQueue::new(store.clone()),
        heartbeat: HeartbeatService::new(store.clone(), metrics),
        clusters: Arc::new(ClusterCoordinator::new(provisioner.clone())),
        provisioner,
        store,
    };
    let app = http::router(state);

    tracing::info!(addr = %cfg.bind_addr, "ember-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(sweep, dispatcher);
    Ok(())
}
