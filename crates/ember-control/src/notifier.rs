//! Status-change hooks. Delivery formatting lives with the receiver.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "install.completed")]
    InstallCompleted,
    #[serde(rename = "install.failed")]
    InstallFailed,
    #[serde(rename = "server.status_changed")]
    ServerStatusChanged,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "cluster.failover")]
    ClusterFailover,
    #[serde(rename = "transfer.completed")]
    TransferCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::InstallCompleted => "install.completed",
            EventKind::InstallFailed => "install.failed",
            EventKind::ServerStatusChanged => "server.status_changed",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::ClusterFailover => "cluster.failover",
            EventKind::TransferCompleted => "transfer.completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event: EventKind,
    pub server_id: Option<Uuid>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event: EventKind, server_id: Option<Uuid>, data: serde_json::Value) -> Self {
        Self {
            event,
            server_id,
            data,
        }
    }
}

/// Never fails the caller; implementations log their own delivery errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Event);
}

#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: Event) {
        tracing::info!(
            event = event.event.as_str(),
            server_id = ?event.server_id,
            data = %event.data,
            "notification"
        );
    }
}

/// POSTs each event as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ember-control/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: Event) {
        let res = self
            .client
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = res {
            tracing::warn!(event = event.event.as_str(), error = %e, "webhook delivery failed");
        }
    }
}
