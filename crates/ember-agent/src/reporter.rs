use std::time::Duration;

use ember_core::{HeartbeatReport, ReportedState};
use tokio_util::sync::CancellationToken;

use crate::{config::AgentConfig, host};

/// Longest pause between heartbeats while the control plane is unreachable.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct Reporter {
    client: reqwest::Client,
    cfg: AgentConfig,
}

/// Doubles `interval` per consecutive failure, capped at [`MAX_BACKOFF`].
fn next_delay(interval: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1u32 << failures.min(8);
    interval.saturating_mul(factor).min(MAX_BACKOFF.max(interval))
}

impl Reporter {
    pub fn new(cfg: AgentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ember-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self { client, cfg })
    }

    pub async fn report(&self) -> HeartbeatReport {
        let ports = self.cfg.probe_ports.iter().map(|p| host::probe_port(*p)).collect();
        HeartbeatReport {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            state: ReportedState::Ready,
            error: None,
            capabilities: host::capabilities(),
            metrics: Some(host::metrics(&self.cfg.data_root).await),
            ports,
        }
    }

    pub async fn send(&self, report: &HeartbeatReport) -> anyhow::Result<()> {
        self.client
            .post(self.cfg.heartbeat_url())
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            agent_id = %self.cfg.agent_id,
            control = %self.cfg.control_url,
            interval_s = self.cfg.interval.as_secs(),
            "heartbeat loop started"
        );
        let mut failures = 0u32;
        loop {
            let report = self.report().await;
            match self.send(&report).await {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(failures, "control plane reachable again");
                    }
                    failures = 0;
                    tracing::debug!(ports = report.ports.len(), "heartbeat sent");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(failures, error = %e, "heartbeat failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(next_delay(self.cfg.interval, failures)) => {}
            }
        }
        tracing::info!("heartbeat loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;

    fn cfg(control_url: &str) -> AgentConfig {
        AgentConfig {
            control_url: control_url.to_string(),
            agent_id: Uuid::nil(),
            interval: Duration::from_secs(30),
            request_timeout: Duration::from_millis(500),
            probe_ports: Vec::new(),
            data_root: PathBuf::from("/"),
            log_dir: None,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let i = Duration::from_secs(30);
        assert_eq!(next_delay(i, 0), i);
        assert_eq!(next_delay(i, 1), Duration::from_secs(60));
        assert_eq!(next_delay(i, 2), Duration::from_secs(120));
        assert_eq!(next_delay(i, 20), MAX_BACKOFF);
        let slow = Duration::from_secs(600);
        assert_eq!(next_delay(slow, 3), slow);
    }

    #[tokio::test]
    async fn report_is_ready_with_metrics() {
        let r = Reporter::new(cfg("http://127.0.0.1:9")).unwrap();
        let report = r.report().await;
        assert_eq!(report.state, ReportedState::Ready);
        assert_eq!(report.agent_version, env!("CARGO_PKG_VERSION"));
        assert!(report.metrics.is_some());
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_an_error() {
        let r = Reporter::new(cfg("http://127.0.0.1:9")).unwrap();
        let report = r.report().await;
        assert!(r.send(&report).await.is_err());
    }
}
