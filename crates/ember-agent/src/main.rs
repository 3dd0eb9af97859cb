use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod host;
mod reporter;

use config::AgentConfig;
use reporter::Reporter;

fn init_logging(cfg: &AgentConfig) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer());

    let Some(log_dir) = &cfg.log_dir else {
        registry.init();
        return Ok(());
    };
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("ember-agent")
        .filename_suffix("log")
        .build(log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // The writer flushes on drop; keep it for the life of the process.
    std::mem::forget(guard);
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    tracing::info!(dir = %log_dir.display(), "logging to file");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    init_logging(&cfg)?;

    let shutdown = CancellationToken::new();
    let heartbeat = tokio::spawn(Reporter::new(cfg)?.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    heartbeat.await?;
    Ok(())
}
