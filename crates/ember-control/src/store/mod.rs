//! Persistence boundary for every entity the engine reads or writes.

mod db;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::{
    Agent, AgentStatus, CharacterTransfer, Cluster, FailoverEvent, InstallProgress, LogLine, Machine,
    MachineStatus, PortAllocation, Server, Task, TaskStatus, TransferStatus,
};
use uuid::Uuid;

pub use db::DbStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Requested change to a task's status plus the fields that travel with it.
/// `started_at` is stamped on RUNNING and `completed_at` on terminal states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: Option<u32>,
    /// Binds the task to the agent it runs through.
    pub agent_id: Option<Uuid>,
}

impl TaskUpdate {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Applies `update` to `task`, refusing any status move the task state
/// machine does not allow. Shared by every store implementation.
pub(crate) fn apply_task_update(
    task: &mut Task,
    update: &TaskUpdate,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    if let Some(next) = update.status {
        if !task.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        task.status = next;
        if next == TaskStatus::Running {
            task.started_at = Some(now);
        }
        if next.is_terminal() {
            task.completed_at = Some(now);
        }
    } else if task.status.is_terminal() {
        return Err(StoreError::InvalidTransition {
            entity: "task",
            from: task.status.to_string(),
            to: task.status.to_string(),
        });
    }
    if let Some(result) = &update.result {
        task.result = Some(result.clone());
    }
    if let Some(error) = &update.error {
        task.error = Some(error.clone());
    }
    if let Some(attempts) = update.attempts {
        task.attempts = attempts;
    }
    if let Some(agent_id) = update.agent_id {
        task.agent_id = Some(agent_id);
    }
    Ok(())
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_machine(&self, machine: &Machine) -> StoreResult<()>;
    async fn get_machine(&self, id: Uuid) -> StoreResult<Machine>;
    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;
    async fn set_machine_status(
        &self,
        id: Uuid,
        status: MachineStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Fails with a conflict while agents or servers still reference the machine.
    async fn delete_machine(&self, id: Uuid) -> StoreResult<()>;

    async fn insert_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn list_agents_for_machine(&self, machine_id: Uuid) -> StoreResult<Vec<Agent>>;
    async fn update_agent(&self, agent: &Agent) -> StoreResult<()>;
    /// Marks the agent OFFLINE only while its status and heartbeat are still
    /// the ones the caller read. Returns whether the row changed.
    async fn mark_agent_offline(
        &self,
        id: Uuid,
        seen_status: AgentStatus,
        seen_heartbeat: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    async fn insert_server(&self, server: &Server) -> StoreResult<()>;
    async fn get_server(&self, id: Uuid) -> StoreResult<Server>;
    async fn update_server(&self, server: &Server) -> StoreResult<()>;
    async fn delete_server(&self, id: Uuid) -> StoreResult<()>;
    async fn list_servers_in_cluster(&self, cluster_id: Uuid) -> StoreResult<Vec<Server>>;

    async fn insert_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, id: Uuid) -> StoreResult<Task>;
    /// Oldest first.
    async fn list_tasks(&self, status: Option<TaskStatus>, limit: u64) -> StoreResult<Vec<Task>>;
    /// Tasks in `status` ordered after the `(created_at, id)` cursor, oldest
    /// first.
    async fn list_tasks_after(
        &self,
        status: TaskStatus,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u64,
    ) -> StoreResult<Vec<Task>>;
    /// Atomically applies `update`; concurrent writers racing on the same
    /// task see [`StoreError::InvalidTransition`].
    async fn transition_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Task>;

    async fn list_port_allocations(&self, machine_id: Uuid) -> StoreResult<Vec<PortAllocation>>;
    async fn get_port_allocation(&self, server_id: Uuid) -> StoreResult<Option<PortAllocation>>;
    /// Conflict when any port is already held on the machine or the server
    /// already has an allocation.
    async fn insert_port_allocation(&self, allocation: &PortAllocation) -> StoreResult<()>;
    async fn delete_port_allocation(&self, server_id: Uuid)
    -> StoreResult<Option<PortAllocation>>;
    /// Re-keys `from`'s allocation to `to`, releasing whatever `to` held.
    async fn move_port_allocation(&self, from: Uuid, to: Uuid) -> StoreResult<PortAllocation>;

    async fn put_progress(&self, progress: &InstallProgress) -> StoreResult<()>;
    async fn get_progress(&self, server_id: Uuid) -> StoreResult<Option<InstallProgress>>;
    async fn append_log(&self, server_id: Uuid, line: &str, at: DateTime<Utc>) -> StoreResult<u64>;
    /// Lines with `seq > after`, oldest first.
    async fn read_log(&self, server_id: Uuid, after: u64, limit: u64) -> StoreResult<Vec<LogLine>>;

    async fn insert_cluster(&self, cluster: &Cluster) -> StoreResult<()>;
    async fn get_cluster(&self, id: Uuid) -> StoreResult<Cluster>;

    async fn insert_transfer(&self, transfer: &CharacterTransfer) -> StoreResult<()>;
    async fn get_transfer(&self, id: Uuid) -> StoreResult<CharacterTransfer>;
    /// Writes `transfer` only if the stored status is still `expected`.
    async fn update_transfer(
        &self,
        transfer: &CharacterTransfer,
        expected: TransferStatus,
    ) -> StoreResult<()>;

    async fn insert_failover_event(&self, event: &FailoverEvent) -> StoreResult<()>;
    async fn list_failover_events(&self, cluster_id: Uuid) -> StoreResult<Vec<FailoverEvent>>;
}
