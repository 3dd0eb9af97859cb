use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ember_core::{
    Agent, AgentStatus, HeartbeatReport, MachineStatus, ReportedState, TaskStatus, TaskType,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::ControlConfig,
    error::ProvisionError,
    metrics::{MetricSample, MetricsStore},
    notifier::{Event, EventKind, Notifier},
    store::{Store, TaskUpdate},
};

const AGENT_OFFLINE: &str = "agent went offline";

#[derive(Clone)]
pub struct HeartbeatService {
    store: Arc<dyn Store>,
    metrics: Arc<MetricsStore>,
}

impl HeartbeatService {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<MetricsStore>) -> Self {
        Self { store, metrics }
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub async fn record(
        &self,
        agent_id: Uuid,
        report: HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Result<Agent, ProvisionError> {
        let mut agent = self.store.get_agent(agent_id).await?;
        let previous = agent.status;

        agent.status = match report.state {
            ReportedState::Ready => AgentStatus::Online,
            ReportedState::Updating => AgentStatus::Updating,
            ReportedState::Error => AgentStatus::Error,
        };
        agent.last_heartbeat = Some(now);
        agent.capabilities = report.capabilities;
        agent.version = Some(report.agent_version);
        agent.last_error = report.error;
        self.store.update_agent(&agent).await?;
        self.store
            .set_machine_status(agent.machine_id, MachineStatus::Online, now)
            .await?;

        if let Some(m) = &report.metrics {
            self.metrics.record(MetricSample::from_report(agent_id, now, m));
        }
        let busy = report.ports.iter().filter(|p| !p.available).count();
        if previous != agent.status {
            tracing::info!(%agent_id, from = %previous, to = %agent.status, "agent status changed");
        }
        tracing::debug!(%agent_id, probed_ports = report.ports.len(), busy, "heartbeat recorded");
        Ok(agent)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub grace: Duration,
    pub interval: Duration,
    pub task_stale_after: Duration,
}

impl From<&ControlConfig> for SweepSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            grace: cfg.heartbeat_grace,
            interval: cfg.sweep_interval,
            task_stale_after: cfg.task_stale_after,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub agents_offline: Vec<Uuid>,
    pub machines_offline: Vec<Uuid>,
    pub tasks_failed: Vec<Uuid>,
}

/// Flips silent agents and their machines offline and fails RUNNING tasks
/// stranded on them.
pub struct LivenessSweep {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    settings: SweepSettings,
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    match chrono::Duration::from_std(limit) {
        Ok(limit) => now.signed_duration_since(at) > limit,
        Err(_) => false,
    }
}

impl LivenessSweep {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, settings: SweepSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep(Utc::now()).await {
                    tracing::warn!(error = %e, "liveness sweep failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.interval) => {}
                }
            }
        })
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ProvisionError> {
        let mut report = SweepReport::default();

        let agents = self.store.list_agents().await?;
        let mut offline_agents = Vec::new();
        for agent in agents {
            let seen = agent.last_heartbeat.unwrap_or(agent.created_at);
            if agent.status != AgentStatus::Offline && older_than(seen, now, self.settings.grace) {
                // Conditional: a heartbeat landing after the listing wins.
                let marked = self
                    .store
                    .mark_agent_offline(agent.id, agent.status, agent.last_heartbeat)
                    .await?;
                if !marked {
                    continue;
                }
                tracing::warn!(agent_id = %agent.id, last_heartbeat = ?agent.last_heartbeat, "agent missed heartbeats; marking offline");
                report.agents_offline.push(agent.id);
                offline_agents.push(agent.id);
            } else if agent.status == AgentStatus::Offline {
                offline_agents.push(agent.id);
            }
        }

        for machine in self.store.list_machines().await? {
            if machine.status == MachineStatus::Offline {
                continue;
            }
            let agents = self.store.list_agents_for_machine(machine.id).await?;
            if !agents.is_empty() && agents.iter().all(|a| a.status == AgentStatus::Offline) {
                self.store
                    .set_machine_status(machine.id, MachineStatus::Offline, now)
                    .await?;
                tracing::warn!(machine_id = %machine.id, name = %machine.name, "all agents offline; marking machine offline");
                report.machines_offline.push(machine.id);
            }
        }

        for task in self.store.list_tasks(Some(TaskStatus::Running), 1000).await? {
            let stranded = task.task_type != TaskType::InstallAgent
                && task.agent_id.is_some_and(|a| offline_agents.contains(&a))
                && older_than(
                    task.started_at.unwrap_or(task.created_at),
                    now,
                    self.settings.task_stale_after,
                );
            if !stranded {
                continue;
            }
            let update = TaskUpdate {
                status: Some(TaskStatus::Failed),
                error: Some(AGENT_OFFLINE.to_string()),
                ..Default::default()
            };
            // A worker may finish the task concurrently; losing that race is fine.
            if self.store.transition_task(task.id, update, now).await.is_err() {
                continue;
            }
            tracing::warn!(task_id = %task.id, "failing task stranded on offline agent");
            self.notifier
                .notify(Event::new(
                    EventKind::TaskFailed,
                    task.server_id,
                    serde_json::json!({
                        "taskId": task.id,
                        "type": task.task_type,
                        "error": AGENT_OFFLINE,
                    }),
                ))
                .await;
            report.tasks_failed.push(task.id);
        }

        Ok(report)
    }
}
