use std::sync::Arc;

use chrono::Utc;
use ember_core::{Task, TaskCommand, TaskStatus, TaskType, ValidationErrors};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ProvisionError,
    store::{Store, StoreError, TaskUpdate},
};

/// Request to enqueue a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub server_id: Option<Uuid>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    pub command: TaskCommand,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validates and stores a PENDING task. A server task without an explicit
    /// agent targets the server's agent.
    pub async fn create(&self, req: NewTask) -> Result<Task, ProvisionError> {
        let mut errs = ValidationErrors::new();
        if req.command.task_type() != req.task_type {
            errs.add(
                "command",
                format!(
                    "Command is {} but task type is {}.",
                    req.command.task_type(),
                    req.task_type
                ),
            );
        }
        let needs_server = req.task_type != TaskType::InstallAgent;
        if needs_server && req.server_id.is_none() {
            errs.add("server_id", "Required for this task type.");
        }
        if !needs_server && req.server_id.is_some() {
            errs.add("server_id", "Agent installs are not tied to a server.");
        }
        errs.finish(())?;

        let mut agent_id = req.agent_id;
        if let Some(server_id) = req.server_id {
            let server = self.store.get_server(server_id).await?;
            agent_id = agent_id.or(server.agent_id);
        }
        if let TaskCommand::InstallAgent {
            agent_id: target, ..
        } = &req.command
        {
            agent_id = Some(*target);
        }
        if let Some(id) = agent_id {
            self.store.get_agent(id).await?;
        }

        let task = Task {
            id: Uuid::new_v4(),
            task_type: req.task_type,
            status: TaskStatus::Pending,
            agent_id,
            server_id: req.server_id,
            command: req.command,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.store.insert_task(&task).await?;
        tracing::info!(task_id = %task.id, task_type = %task.task_type, server_id = ?task.server_id, "task queued");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, ProvisionError> {
        Ok(self.store.get_task(id).await?)
    }

    /// Only PENDING tasks can be cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<Task, ProvisionError> {
        match self
            .store
            .transition_task(id, TaskUpdate::to(TaskStatus::Cancelled), Utc::now())
            .await
        {
            Ok(task) => {
                tracing::info!(task_id = %id, "task cancelled");
                Ok(task)
            }
            Err(StoreError::InvalidTransition { from, .. }) => Err(ProvisionError::ResourceConflict(
                format!("task {id} is {from}; only PENDING tasks can be cancelled"),
            )),
            Err(e) => Err(e.into()),
        }
    }
}
