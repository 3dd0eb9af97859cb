use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use ember_core::{InstallProgress, InstallState, LogLine};
use uuid::Uuid;

use crate::{error::ProvisionError, store::Store};

const MAX_LOG_LINE_BYTES: usize = 4096;

/// Durable, pollable install progress plus an append-only log per server.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn Store>,
}

fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (done.min(total) * 100 / total) as u8
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn put(
        &self,
        server_id: Uuid,
        status: InstallState,
        message: impl Into<String>,
        progress: u8,
        current_step: u32,
        total_steps: u32,
        error: Option<String>,
    ) -> Result<(), ProvisionError> {
        let record = InstallProgress {
            server_id,
            status,
            message: message.into(),
            progress,
            current_step,
            total_steps,
            error,
            timestamp: Utc::now(),
        };
        self.store.put_progress(&record).await?;
        Ok(())
    }

    /// Resets the record to step 0 / 0 %.
    pub async fn begin(
        &self,
        server_id: Uuid,
        total_steps: u32,
        message: &str,
    ) -> Result<(), ProvisionError> {
        self.put(server_id, InstallState::Installing, message, 0, 0, total_steps, None)
            .await?;
        self.log(server_id, message).await
    }

    pub async fn step_started(
        &self,
        server_id: Uuid,
        step: u32,
        total_steps: u32,
        message: &str,
    ) -> Result<(), ProvisionError> {
        self.put(
            server_id,
            InstallState::Installing,
            message,
            percent(step.saturating_sub(1), total_steps),
            step,
            total_steps,
            None,
        )
        .await?;
        self.log(server_id, &format!("[{step}/{total_steps}] {message}"))
            .await
    }

    pub async fn step_completed(
        &self,
        server_id: Uuid,
        step: u32,
        total_steps: u32,
        message: &str,
    ) -> Result<(), ProvisionError> {
        self.put(
            server_id,
            InstallState::Installing,
            message,
            percent(step, total_steps),
            step,
            total_steps,
            None,
        )
        .await
    }

    pub async fn fail(
        &self,
        server_id: Uuid,
        step: u32,
        total_steps: u32,
        error: &str,
    ) -> Result<(), ProvisionError> {
        let progress = percent(step.saturating_sub(1), total_steps);
        self.put(
            server_id,
            InstallState::Error,
            format!("step {step} failed"),
            progress,
            step,
            total_steps,
            Some(error.to_string()),
        )
        .await?;
        self.log(server_id, &format!("ERROR: {error}")).await
    }

    pub async fn complete(
        &self,
        server_id: Uuid,
        total_steps: u32,
        message: &str,
    ) -> Result<(), ProvisionError> {
        self.put(
            server_id,
            InstallState::Installed,
            message,
            100,
            total_steps,
            total_steps,
            None,
        )
        .await?;
        self.log(server_id, message).await
    }

    pub async fn warn(&self, server_id: Uuid, message: &str) -> Result<(), ProvisionError> {
        tracing::warn!(%server_id, "{message}");
        self.log(server_id, &format!("WARN: {message}")).await
    }

    /// Appends `"<rfc3339> <text>"` to the server's log.
    pub async fn log(&self, server_id: Uuid, text: &str) -> Result<(), ProvisionError> {
        let now = Utc::now();
        let text = crate::error::tail(text, MAX_LOG_LINE_BYTES);
        let line = format!("{} {text}", now.to_rfc3339_opts(SecondsFormat::Millis, true));
        self.store.append_log(server_id, &line, now).await?;
        Ok(())
    }

    pub async fn snapshot(&self, server_id: Uuid) -> Result<InstallProgress, ProvisionError> {
        Ok(self
            .store
            .get_progress(server_id)
            .await?
            .unwrap_or_else(|| InstallProgress::not_installed(server_id, Utc::now())))
    }

    pub async fn read_log(
        &self,
        server_id: Uuid,
        after: u64,
        limit: u64,
    ) -> Result<Vec<LogLine>, ProvisionError> {
        Ok(self.store.read_log(server_id, after, limit.clamp(1, 1000)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn step_progress_brackets_each_step() {
        let tracker = ProgressTracker::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4();
        tracker.begin(id, 8, "installing").await.unwrap();

        tracker.step_started(id, 3, 8, "prepare").await.unwrap();
        let p = tracker.snapshot(id).await.unwrap();
        assert_eq!((p.current_step, p.progress), (3, 25));

        tracker.step_completed(id, 3, 8, "prepared").await.unwrap();
        assert_eq!(tracker.snapshot(id).await.unwrap().progress, 37);

        tracker.complete(id, 8, "done").await.unwrap();
        let p = tracker.snapshot(id).await.unwrap();
        assert_eq!(p.status, InstallState::Installed);
        assert_eq!(p.progress, 100);
    }

    #[tokio::test]
    async fn failure_keeps_step_and_error() {
        let tracker = ProgressTracker::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4();
        tracker.begin(id, 8, "installing").await.unwrap();
        tracker.fail(id, 5, 8, "render blew up").await.unwrap();
        let p = tracker.snapshot(id).await.unwrap();
        assert_eq!(p.status, InstallState::Error);
        assert_eq!(p.current_step, 5);
        assert_eq!(p.error.as_deref(), Some("render blew up"));

        let log = tracker.read_log(id, 0, 10).await.unwrap();
        assert!(log.last().unwrap().line.ends_with("ERROR: render blew up"));
    }

    #[tokio::test]
    async fn unknown_server_reads_as_not_installed() {
        let tracker = ProgressTracker::new(Arc::new(MemoryStore::new()));
        let p = tracker.snapshot(Uuid::new_v4()).await.unwrap();
        assert_eq!(p.status, InstallState::NotInstalled);
        assert_eq!(p.current_step, 0);
    }
}
