use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    AgentStatus, GameConfig, GameKind, InstallState, MachineStatus, PortRole, ServerStatus,
    TaskStatus, TaskType, TransferStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_ref: String,
    pub status: MachineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub game: GameKind,
    pub status: ServerStatus,
    pub install_state: InstallState,
    pub machine_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub cluster_id: Option<Uuid>,
    /// Game port from the active allocation, if any.
    pub port: Option<u16>,
    pub max_players: u32,
    pub configuration: GameConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Work carried by a task, one variant per [`TaskType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCommand {
    Provision {
        #[serde(default)]
        preferred_base_port: Option<u16>,
    },
    Start,
    Stop,
    Restart,
    Update,
    Backup {
        #[serde(default)]
        label: Option<String>,
    },
    Delete,
    InstallAgent {
        machine_id: Uuid,
        agent_id: Uuid,
        download_url: String,
        control_url: String,
    },
}

impl TaskCommand {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskCommand::Provision { .. } => TaskType::Provision,
            TaskCommand::Start => TaskType::Start,
            TaskCommand::Stop => TaskType::Stop,
            TaskCommand::Restart => TaskType::Restart,
            TaskCommand::Update => TaskType::Update,
            TaskCommand::Backup { .. } => TaskType::Backup,
            TaskCommand::Delete => TaskType::Delete,
            TaskCommand::InstallAgent { .. } => TaskType::InstallAgent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub agent_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub command: TaskCommand,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub machine_id: Uuid,
    pub server_id: Uuid,
    pub ports: BTreeMap<PortRole, u16>,
    pub created_at: DateTime<Utc>,
}

impl PortAllocation {
    pub fn port_set(&self) -> BTreeSet<u16> {
        self.ports.values().copied().collect()
    }

    pub fn game_port(&self) -> Option<u16> {
        self.ports.get(&PortRole::Game).copied()
    }

    pub fn overlaps(&self, other: &PortAllocation) -> bool {
        self.machine_id == other.machine_id
            && self.ports.values().any(|p| other.ports.values().any(|q| p == q))
    }
}

/// Pollable install record. Serialized as
/// `{status, message, progress, currentStep, totalSteps, error?, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub server_id: Uuid,
    pub status: InstallState,
    pub message: String,
    pub progress: u8,
    pub current_step: u32,
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InstallProgress {
    pub fn not_installed(server_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            server_id,
            status: InstallState::NotInstalled,
            message: "not installed".to_string(),
            progress: 0,
            current_step: 0,
            total_steps: 0,
            error: None,
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic cursor within one server's log.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub machine_id: Uuid,
    pub game: GameKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterTransfer {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub source_server_id: Uuid,
    pub target_server_id: Uuid,
    pub character_id: String,
    pub requested_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub from_server_id: Uuid,
    pub to_server_id: Uuid,
    pub ports: BTreeMap<PortRole, u16>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
