use std::{sync::Arc, time::Duration};

use chrono::Utc;
use ember_core::{AgentStatus, Task, TaskStatus, TaskType};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::ControlConfig,
    lifecycle::Lifecycle,
    notifier::{Event, EventKind, Notifier},
    retry::{RetryPolicy, run_with_retry},
    store::{Store, StoreError, TaskUpdate},
};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub interval: Duration,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl From<&ControlConfig> for DispatcherSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            interval: cfg.dispatch_interval,
            workers: cfg.dispatch_workers,
            retry: cfg.retry,
        }
    }
}

/// Smallest page read from the PENDING backlog per query.
const MIN_PAGE: usize = 16;

enum Eligibility {
    /// `via` is the machine agent to bind an unbound task to.
    Ready { via: Option<Uuid> },
    Waiting,
}

/// Claims PENDING tasks and runs them on a bounded worker pool.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    lifecycle: Lifecycle,
    notifier: Arc<dyn Notifier>,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: Lifecycle,
        notifier: Arc<dyn Notifier>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            store,
            lifecycle,
            notifier,
            settings,
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                workers = self.settings.workers,
                interval_ms = self.settings.interval.as_millis() as u64,
                "task dispatcher started"
            );
            loop {
                self.tick(&shutdown).await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.interval) => {}
                }
            }
            tracing::info!("task dispatcher stopped");
        })
    }

    /// One polling pass. Returns handles for the tasks it started. Pages
    /// through the whole PENDING backlog, oldest first, until the worker
    /// pool is full; tasks still waiting for an agent never hide newer ones.
    pub async fn tick(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut started = Vec::new();
        let available = self.permits.available_permits();
        if available == 0 || shutdown.is_cancelled() {
            return started;
        }

        let page_size = (available * 4).max(MIN_PAGE) as u64;
        let mut cursor = None;
        loop {
            let page = match self
                .store
                .list_tasks_after(TaskStatus::Pending, cursor, page_size)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "listing pending tasks failed");
                    return started;
                }
            };
            let last_page = (page.len() as u64) < page_size;

            for task in page {
                cursor = Some((task.created_at, task.id));
                let via = match self.eligible(&task).await {
                    Ok(Eligibility::Ready { via }) => via,
                    Ok(Eligibility::Waiting) => continue,
                    Err(e) => {
                        tracing::debug!(task_id = %task.id, error = %e, "eligibility check failed");
                        continue;
                    }
                };
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    return started;
                };
                let claim = TaskUpdate {
                    status: Some(TaskStatus::Running),
                    attempts: Some(1),
                    agent_id: via,
                    ..Default::default()
                };
                let task = match self.store.transition_task(task.id, claim, Utc::now()).await {
                    Ok(t) => t,
                    // Cancelled or claimed elsewhere since the listing.
                    Err(StoreError::InvalidTransition { .. } | StoreError::NotFound { .. }) => continue,
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "claiming task failed");
                        continue;
                    }
                };

                let this = self.clone();
                let cancel = shutdown.child_token();
                started.push(tokio::spawn(async move {
                    this.execute(task, cancel).await;
                    drop(permit);
                }));
            }

            if last_page {
                return started;
            }
        }
    }

    /// INSTALL_AGENT tasks bootstrap the agent, so they need no live one.
    /// Everything else waits for an ONLINE agent: the task's own, or any on
    /// the server's machine, which the claim then records on the task.
    async fn eligible(&self, task: &Task) -> Result<Eligibility, StoreError> {
        if task.task_type == TaskType::InstallAgent {
            return Ok(Eligibility::Ready { via: None });
        }
        if let Some(agent_id) = task.agent_id {
            let online = self.store.get_agent(agent_id).await?.status == AgentStatus::Online;
            return Ok(if online {
                Eligibility::Ready { via: None }
            } else {
                Eligibility::Waiting
            });
        }
        let Some(server_id) = task.server_id else {
            return Ok(Eligibility::Waiting);
        };
        let server = self.store.get_server(server_id).await?;
        let agents = self.store.list_agents_for_machine(server.machine_id).await?;
        Ok(
            match agents.iter().find(|a| a.status == AgentStatus::Online) {
                Some(a) => Eligibility::Ready { via: Some(a.id) },
                None => Eligibility::Waiting,
            },
        )
    }

    async fn execute(&self, task: Task, cancel: CancellationToken) {
        let started = std::time::Instant::now();
        tracing::info!(task_id = %task.id, task_type = %task.task_type, server_id = ?task.server_id, "task started");

        let store = &self.store;
        let lifecycle = &self.lifecycle;
        let task_ref = &task;
        let cancel_ref = &cancel;
        let retried = run_with_retry(self.settings.retry, move |attempt| async move {
            if attempt > 1 {
                store
                    .transition_task(
                        task_ref.id,
                        TaskUpdate {
                            attempts: Some(attempt),
                            ..Default::default()
                        },
                        Utc::now(),
                    )
                    .await?;
            }
            lifecycle.run(task_ref, cancel_ref).await
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (update, kind, data) = match retried.result {
            Ok(result) => {
                tracing::info!(task_id = %task.id, attempts = retried.attempts, elapsed_ms, "task completed");
                (
                    TaskUpdate {
                        status: Some(TaskStatus::Completed),
                        result: Some(result.clone()),
                        attempts: Some(retried.attempts),
                        ..Default::default()
                    },
                    EventKind::TaskCompleted,
                    serde_json::json!({
                        "taskId": task.id,
                        "type": task.task_type,
                        "attempts": retried.attempts,
                        "result": result,
                    }),
                )
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, attempts = retried.attempts, elapsed_ms, error = %e, "task failed");
                (
                    TaskUpdate {
                        status: Some(TaskStatus::Failed),
                        error: Some(e.to_string()),
                        attempts: Some(retried.attempts),
                        ..Default::default()
                    },
                    EventKind::TaskFailed,
                    serde_json::json!({
                        "taskId": task.id,
                        "type": task.task_type,
                        "attempts": retried.attempts,
                        "code": e.code(),
                        "error": e.to_string(),
                    }),
                )
            }
        };

        if let Err(e) = self.store.transition_task(task.id, update, Utc::now()).await {
            // The sweep may already have failed a task whose agent vanished.
            tracing::warn!(task_id = %task.id, error = %e, "recording task outcome failed");
            return;
        }
        self.notifier
            .notify(Event::new(kind, task.server_id, data))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use ember_core::{InstallState, ServerStatus, TaskCommand};

    use super::*;
    use crate::{
        config::CleanupPolicy,
        installer::{Provisioner, ProvisionerSettings},
        notifier::recording::RecordingNotifier,
        ports::PortAllocator,
        store::MemoryStore,
        tasks::{NewTask, TaskQueue},
        testing::{FakeExecutor, agent, machine, minecraft_config, server},
    };

    struct Rig {
        store: Arc<MemoryStore>,
        exec: Arc<FakeExecutor>,
        notifier: Arc<RecordingNotifier>,
        queue: TaskQueue,
        dispatcher: Arc<Dispatcher>,
        server_id: Uuid,
        agent_id: Uuid,
        machine_id: Uuid,
    }

    async fn rig(workers: usize, agent_status: AgentStatus) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let m = machine();
        store.insert_machine(&m).await.unwrap();
        let mut a = agent(m.id);
        a.status = agent_status;
        store.insert_agent(&a).await.unwrap();
        let mut srv = server(m.id, minecraft_config());
        srv.agent_id = Some(a.id);
        srv.install_state = InstallState::Installed;
        store.insert_server(&srv).await.unwrap();

        let exec = FakeExecutor::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let ports = Arc::new(PortAllocator::new(
            store.clone(),
            exec.clone(),
            50,
            Duration::from_secs(1),
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            exec.clone(),
            ports,
            notifier.clone(),
            ProvisionerSettings {
                remote_root: "/srv/ember".into(),
                command_timeout: Duration::from_secs(5),
                install_timeout: Duration::from_secs(5),
                health_attempts: 1,
                health_interval: Duration::ZERO,
                cleanup_policy: CleanupPolicy::Warn,
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Lifecycle::new(provisioner),
            notifier.clone(),
            DispatcherSettings {
                interval: Duration::from_millis(10),
                workers,
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            },
        ));
        Rig {
            queue: TaskQueue::new(store.clone()),
            store,
            exec,
            notifier,
            dispatcher,
            server_id: srv.id,
            agent_id: a.id,
            machine_id: m.id,
        }
    }

    async fn enqueue(r: &Rig, task_type: TaskType, command: TaskCommand) -> Task {
        r.queue
            .create(NewTask {
                task_type,
                server_id: Some(r.server_id),
                agent_id: None,
                command,
            })
            .await
            .unwrap()
    }

    async fn drain(r: &Rig) -> usize {
        let handles = r.dispatcher.tick(&CancellationToken::new()).await;
        let n = handles.len();
        for h in handles {
            h.await.unwrap();
        }
        n
    }

    #[tokio::test]
    async fn start_task_completes_and_notifies() {
        let r = rig(4, AgentStatus::Online).await;
        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        assert_eq!(drain(&r).await, 1);

        let done = r.store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.result.unwrap()["status"], "ONLINE");
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        assert!(r.notifier.kinds().contains(&EventKind::TaskCompleted));
        assert_eq!(
            r.store.get_server(r.server_id).await.unwrap().status,
            ServerStatus::Online
        );
    }

    #[tokio::test]
    async fn offline_agent_keeps_task_pending() {
        let r = rig(4, AgentStatus::Offline).await;
        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        assert_eq!(drain(&r).await, 0);
        assert_eq!(r.store.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
        assert!(r.exec.commands().is_empty());
    }

    #[tokio::test]
    async fn offline_backlog_does_not_block_online_agents() {
        let r = rig(1, AgentStatus::Offline).await;
        for _ in 0..(MIN_PAGE * 2 + 3) {
            enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        }

        let other = machine();
        r.store.insert_machine(&other).await.unwrap();
        let live = agent(other.id);
        r.store.insert_agent(&live).await.unwrap();
        let mut srv = server(other.id, minecraft_config());
        srv.agent_id = Some(live.id);
        srv.install_state = InstallState::Installed;
        r.store.insert_server(&srv).await.unwrap();
        let healthy = r
            .queue
            .create(NewTask {
                task_type: TaskType::Start,
                server_id: Some(srv.id),
                agent_id: None,
                command: TaskCommand::Start,
            })
            .await
            .unwrap();

        assert_eq!(drain(&r).await, 1);
        assert_eq!(r.store.get_task(healthy.id).await.unwrap().status, TaskStatus::Completed);
        let waiting = r.store.list_tasks(Some(TaskStatus::Pending), 1000).await.unwrap();
        assert_eq!(waiting.len(), MIN_PAGE * 2 + 3);
    }

    #[tokio::test]
    async fn unbound_task_is_bound_to_the_agent_that_runs_it() {
        let r = rig(4, AgentStatus::Online).await;
        let mut srv = r.store.get_server(r.server_id).await.unwrap();
        srv.agent_id = None;
        r.store.update_server(&srv).await.unwrap();

        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        assert_eq!(task.agent_id, None);
        assert_eq!(drain(&r).await, 1);
        let done = r.store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.agent_id, Some(r.agent_id));
    }

    #[tokio::test]
    async fn agent_install_runs_without_live_agent() {
        let r = rig(4, AgentStatus::Offline).await;
        let task = r
            .queue
            .create(NewTask {
                task_type: TaskType::InstallAgent,
                server_id: None,
                agent_id: None,
                command: TaskCommand::InstallAgent {
                    machine_id: r.machine_id,
                    agent_id: r.agent_id,
                    download_url: "https://downloads.example/ember-agent".into(),
                    control_url: "http://10.0.0.1:8080".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(drain(&r).await, 1);
        assert_eq!(r.store.get_task(task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn connectivity_failures_are_retried() {
        let r = rig(4, AgentStatus::Online).await;
        r.exec.unreachable_times("systemctl start", 2);
        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        drain(&r).await;
        let done = r.store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempts, 3);
    }

    #[tokio::test]
    async fn remote_failure_is_not_retried() {
        let r = rig(4, AgentStatus::Online).await;
        r.exec.fail("systemctl stop", 1, "unit busy");
        let task = enqueue(&r, TaskType::Stop, TaskCommand::Stop).await;
        drain(&r).await;
        let done = r.store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert!(done.error.unwrap().contains("unit busy"));
        assert!(r.notifier.kinds().contains(&EventKind::TaskFailed));
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let r = rig(1, AgentStatus::Online).await;
        let first = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        let second = enqueue(&r, TaskType::Restart, TaskCommand::Restart).await;

        let handles = r.dispatcher.tick(&CancellationToken::new()).await;
        assert_eq!(handles.len(), 1);
        assert_eq!(r.store.get_task(second.id).await.unwrap().status, TaskStatus::Pending);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(r.store.get_task(first.id).await.unwrap().status, TaskStatus::Completed);

        assert_eq!(drain(&r).await, 1);
        assert_eq!(r.store.get_task(second.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_task_is_never_claimed() {
        let r = rig(4, AgentStatus::Online).await;
        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        r.queue.cancel(task.id).await.unwrap();
        assert_eq!(drain(&r).await, 0);
        assert_eq!(r.store.get_task(task.id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let r = rig(2, AgentStatus::Online).await;
        let task = enqueue(&r, TaskType::Start, TaskCommand::Start).await;
        let shutdown = CancellationToken::new();
        let join = r.dispatcher.clone().spawn(shutdown.clone());
        for _ in 0..200 {
            if r.store.get_task(task.id).await.unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        join.await.unwrap();
        assert_eq!(r.store.get_task(task.id).await.unwrap().status, TaskStatus::Completed);
    }
}
