use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::{
    Agent, AgentStatus, CharacterTransfer, Cluster, FailoverEvent, InstallProgress, LogLine, Machine,
    MachineStatus, PortAllocation, Server, Task, TaskStatus, TransferStatus,
};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, TaskUpdate, apply_task_update};

#[derive(Default)]
struct Inner {
    machines: HashMap<Uuid, Machine>,
    agents: HashMap<Uuid, Agent>,
    servers: HashMap<Uuid, Server>,
    tasks: HashMap<Uuid, Task>,
    allocations: HashMap<Uuid, PortAllocation>,
    progress: HashMap<Uuid, InstallProgress>,
    logs: HashMap<Uuid, Vec<LogLine>>,
    clusters: HashMap<Uuid, Cluster>,
    transfers: HashMap<Uuid, CharacterTransfer>,
    failovers: Vec<FailoverEvent>,
}

impl Inner {
    fn check_ports_free(&self, allocation: &PortAllocation, ignore: &[Uuid]) -> StoreResult<()> {
        let held = self
            .allocations
            .values()
            .filter(|a| !ignore.contains(&a.server_id))
            .find(|a| a.overlaps(allocation));
        match held {
            Some(other) => Err(StoreError::Conflict(format!(
                "ports {:?} overlap allocation of server {} on machine {}",
                allocation.port_set(),
                other.server_id,
                allocation.machine_id
            ))),
            None => Ok(()),
        }
    }
}

/// Process-local [`Store`]. Used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> StoreResult<T>) -> StoreResult<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }
}

fn insert_new<T: Clone>(
    map: &mut HashMap<Uuid, T>,
    entity: &'static str,
    id: Uuid,
    value: &T,
) -> StoreResult<()> {
    if map.contains_key(&id) {
        return Err(StoreError::Conflict(format!("{entity} {id} already exists")));
    }
    map.insert(id, value.clone());
    Ok(())
}

fn get_cloned<T: Clone>(map: &HashMap<Uuid, T>, entity: &'static str, id: Uuid) -> StoreResult<T> {
    map.get(&id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(entity, id))
}

fn replace<T: Clone>(
    map: &mut HashMap<Uuid, T>,
    entity: &'static str,
    id: Uuid,
    value: &T,
) -> StoreResult<()> {
    let slot = map
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found(entity, id))?;
    *slot = value.clone();
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_machine(&self, machine: &Machine) -> StoreResult<()> {
        self.with(|s| insert_new(&mut s.machines, "machine", machine.id, machine))
    }

    async fn get_machine(&self, id: Uuid) -> StoreResult<Machine> {
        self.with(|s| get_cloned(&s.machines, "machine", id))
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        self.with(|s| {
            let mut out: Vec<_> = s.machines.values().cloned().collect();
            out.sort_by_key(|m| m.created_at);
            Ok(out)
        })
    }

    async fn set_machine_status(
        &self,
        id: Uuid,
        status: MachineStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with(|s| {
            let m = s
                .machines
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("machine", id))?;
            if m.status != status {
                m.status = status;
                m.updated_at = now;
            }
            Ok(())
        })
    }

    async fn delete_machine(&self, id: Uuid) -> StoreResult<()> {
        self.with(|s| {
            if !s.machines.contains_key(&id) {
                return Err(StoreError::not_found("machine", id));
            }
            let agents = s.agents.values().filter(|a| a.machine_id == id).count();
            let servers = s.servers.values().filter(|v| v.machine_id == id).count();
            if agents > 0 || servers > 0 {
                return Err(StoreError::Conflict(format!(
                    "machine {id} still has {agents} agent(s) and {servers} server(s)"
                )));
            }
            s.machines.remove(&id);
            Ok(())
        })
    }

    async fn insert_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.with(|s| {
            if !s.machines.contains_key(&agent.machine_id) {
                return Err(StoreError::not_found("machine", agent.machine_id));
            }
            insert_new(&mut s.agents, "agent", agent.id, agent)
        })
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        self.with(|s| get_cloned(&s.agents, "agent", id))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.with(|s| {
            let mut out: Vec<_> = s.agents.values().cloned().collect();
            out.sort_by_key(|a| a.created_at);
            Ok(out)
        })
    }

    async fn list_agents_for_machine(&self, machine_id: Uuid) -> StoreResult<Vec<Agent>> {
        self.with(|s| {
            let mut out: Vec<_> = s
                .agents
                .values()
                .filter(|a| a.machine_id == machine_id)
                .cloned()
                .collect();
            out.sort_by_key(|a| a.created_at);
            Ok(out)
        })
    }

    async fn update_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.with(|s| replace(&mut s.agents, "agent", agent.id, agent))
    }

    async fn mark_agent_offline(
        &self,
        id: Uuid,
        seen_status: AgentStatus,
        seen_heartbeat: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        self.with(|s| {
            let agent = s
                .agents
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("agent", id))?;
            if agent.status != seen_status || agent.last_heartbeat != seen_heartbeat {
                return Ok(false);
            }
            agent.status = AgentStatus::Offline;
            Ok(true)
        })
    }

    async fn insert_server(&self, server: &Server) -> StoreResult<()> {
        self.with(|s| {
            if !s.machines.contains_key(&server.machine_id) {
                return Err(StoreError::not_found("machine", server.machine_id));
            }
            insert_new(&mut s.servers, "server", server.id, server)
        })
    }

    async fn get_server(&self, id: Uuid) -> StoreResult<Server> {
        self.with(|s| get_cloned(&s.servers, "server", id))
    }

    async fn update_server(&self, server: &Server) -> StoreResult<()> {
        self.with(|s| replace(&mut s.servers, "server", server.id, server))
    }

    async fn delete_server(&self, id: Uuid) -> StoreResult<()> {
        self.with(|s| {
            s.servers
                .remove(&id)
                .ok_or_else(|| StoreError::not_found("server", id))?;
            s.allocations.remove(&id);
            Ok(())
        })
    }

    async fn list_servers_in_cluster(&self, cluster_id: Uuid) -> StoreResult<Vec<Server>> {
        self.with(|s| {
            let mut out: Vec<_> = s
                .servers
                .values()
                .filter(|v| v.cluster_id == Some(cluster_id))
                .cloned()
                .collect();
            out.sort_by_key(|v| v.created_at);
            Ok(out)
        })
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        self.with(|s| insert_new(&mut s.tasks, "task", task.id, task))
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        self.with(|s| get_cloned(&s.tasks, "task", id))
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: u64) -> StoreResult<Vec<Task>> {
        self.with(|s| {
            let mut out: Vec<_> = s
                .tasks
                .values()
                .filter(|t| status.is_none_or(|st| t.status == st))
                .cloned()
                .collect();
            out.sort_by_key(|t| (t.created_at, t.id));
            out.truncate(limit as usize);
            Ok(out)
        })
    }

    async fn list_tasks_after(
        &self,
        status: TaskStatus,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u64,
    ) -> StoreResult<Vec<Task>> {
        self.with(|s| {
            let mut out: Vec<_> = s
                .tasks
                .values()
                .filter(|t| t.status == status && after.is_none_or(|c| (t.created_at, t.id) > c))
                .cloned()
                .collect();
            out.sort_by_key(|t| (t.created_at, t.id));
            out.truncate(limit as usize);
            Ok(out)
        })
    }

    async fn transition_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Task> {
        self.with(|s| {
            let task = s
                .tasks
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("task", id))?;
            let mut next = task.clone();
            apply_task_update(&mut next, &update, now)?;
            *task = next.clone();
            Ok(next)
        })
    }

    async fn list_port_allocations(&self, machine_id: Uuid) -> StoreResult<Vec<PortAllocation>> {
        self.with(|s| {
            let mut out: Vec<_> = s
                .allocations
                .values()
                .filter(|a| a.machine_id == machine_id)
                .cloned()
                .collect();
            out.sort_by_key(|a| (a.created_at, a.server_id));
            Ok(out)
        })
    }

    async fn get_port_allocation(&self, server_id: Uuid) -> StoreResult<Option<PortAllocation>> {
        self.with(|s| Ok(s.allocations.get(&server_id).cloned()))
    }

    async fn insert_port_allocation(&self, allocation: &PortAllocation) -> StoreResult<()> {
        self.with(|s| {
            if s.allocations.contains_key(&allocation.server_id) {
                return Err(StoreError::Conflict(format!(
                    "server {} already holds a port allocation",
                    allocation.server_id
                )));
            }
            s.check_ports_free(allocation, &[])?;
            s.allocations
                .insert(allocation.server_id, allocation.clone());
            Ok(())
        })
    }

    async fn delete_port_allocation(
        &self,
        server_id: Uuid,
    ) -> StoreResult<Option<PortAllocation>> {
        self.with(|s| Ok(s.allocations.remove(&server_id)))
    }

    async fn move_port_allocation(&self, from: Uuid, to: Uuid) -> StoreResult<PortAllocation> {
        self.with(|s| {
            let mut moved = s
                .allocations
                .get(&from)
                .cloned()
                .ok_or_else(|| StoreError::not_found("port allocation", from))?;
            moved.server_id = to;
            s.check_ports_free(&moved, &[from, to])?;
            s.allocations.remove(&from);
            s.allocations.insert(to, moved.clone());
            Ok(moved)
        })
    }

    async fn put_progress(&self, progress: &InstallProgress) -> StoreResult<()> {
        self.with(|s| {
            s.progress.insert(progress.server_id, progress.clone());
            Ok(())
        })
    }

    async fn get_progress(&self, server_id: Uuid) -> StoreResult<Option<InstallProgress>> {
        self.with(|s| Ok(s.progress.get(&server_id).cloned()))
    }

    async fn append_log(&self, server_id: Uuid, line: &str, at: DateTime<Utc>) -> StoreResult<u64> {
        self.with(|s| {
            let lines = s.logs.entry(server_id).or_default();
            let seq = lines.last().map(|l| l.seq + 1).unwrap_or(1);
            lines.push(LogLine {
                seq,
                at,
                line: line.to_string(),
            });
            Ok(seq)
        })
    }

    async fn read_log(&self, server_id: Uuid, after: u64, limit: u64) -> StoreResult<Vec<LogLine>> {
        self.with(|s| {
            Ok(s.logs
                .get(&server_id)
                .map(|lines| {
                    lines
                        .iter()
                        .filter(|l| l.seq > after)
                        .take(limit as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn insert_cluster(&self, cluster: &Cluster) -> StoreResult<()> {
        self.with(|s| {
            if !s.machines.contains_key(&cluster.machine_id) {
                return Err(StoreError::not_found("machine", cluster.machine_id));
            }
            insert_new(&mut s.clusters, "cluster", cluster.id, cluster)
        })
    }

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Cluster> {
        self.with(|s| get_cloned(&s.clusters, "cluster", id))
    }

    async fn insert_transfer(&self, transfer: &CharacterTransfer) -> StoreResult<()> {
        self.with(|s| insert_new(&mut s.transfers, "transfer", transfer.id, transfer))
    }

    async fn get_transfer(&self, id: Uuid) -> StoreResult<CharacterTransfer> {
        self.with(|s| get_cloned(&s.transfers, "transfer", id))
    }

    async fn update_transfer(
        &self,
        transfer: &CharacterTransfer,
        expected: TransferStatus,
    ) -> StoreResult<()> {
        self.with(|s| {
            let slot = s
                .transfers
                .get_mut(&transfer.id)
                .ok_or_else(|| StoreError::not_found("transfer", transfer.id))?;
            if slot.status != expected {
                return Err(StoreError::InvalidTransition {
                    entity: "transfer",
                    from: slot.status.to_string(),
                    to: transfer.status.to_string(),
                });
            }
            *slot = transfer.clone();
            Ok(())
        })
    }

    async fn insert_failover_event(&self, event: &FailoverEvent) -> StoreResult<()> {
        self.with(|s| {
            s.failovers.push(event.clone());
            Ok(())
        })
    }

    async fn list_failover_events(&self, cluster_id: Uuid) -> StoreResult<Vec<FailoverEvent>> {
        self.with(|s| {
            Ok(s.failovers
                .iter()
                .filter(|e| e.cluster_id == cluster_id)
                .cloned()
                .collect())
        })
    }
}
