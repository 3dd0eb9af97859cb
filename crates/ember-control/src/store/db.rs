use std::{collections::BTreeMap, fmt::Display, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::{
    Agent, AgentStatus, CharacterTransfer, Cluster, FailoverEvent, InstallProgress, LogLine, Machine,
    MachineStatus, PortAllocation, PortRole, Server, Task, TaskStatus, TransferStatus,
};
use ember_db::entities::{
    agents, allocated_ports, character_transfers, clusters, failover_events, install_log_lines,
    install_progress, machines, port_allocations, servers, tasks,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, TaskUpdate, apply_task_update};

/// [`Store`] backed by PostgreSQL through sea-orm.
#[derive(Clone)]
pub struct DbStore {
    db: Arc<DatabaseConnection>,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn db_err(err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => StoreError::Conflict(msg),
        Some(SqlErr::ForeignKeyConstraintViolation(msg)) => StoreError::Conflict(msg),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn parse<T>(column: &str, raw: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: serde_json::Value) -> StoreResult<T> {
    serde_json::from_value(raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("encode json: {e}")))
}

fn port_u16(column: &str, raw: i32) -> StoreResult<u16> {
    u16::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column}: {raw} out of range")))
}

fn machine_from(m: machines::Model) -> StoreResult<Machine> {
    Ok(Machine {
        id: m.id,
        name: m.name,
        address: m.address,
        ssh_port: port_u16("machines.ssh_port", m.ssh_port)?,
        ssh_user: m.ssh_user,
        ssh_key_ref: m.ssh_key_ref,
        status: parse("machines.status", &m.status)?,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    })
}

fn agent_from(m: agents::Model) -> StoreResult<Agent> {
    Ok(Agent {
        id: m.id,
        machine_id: m.machine_id,
        status: parse("agents.status", &m.status)?,
        last_heartbeat: m.last_heartbeat.map(|t| t.with_timezone(&Utc)),
        capabilities: from_json("agents.capabilities", m.capabilities)?,
        version: m.version,
        last_error: m.last_error,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

fn agent_active(a: &Agent) -> StoreResult<agents::ActiveModel> {
    Ok(agents::ActiveModel {
        id: Set(a.id),
        machine_id: Set(a.machine_id),
        status: Set(a.status.to_string()),
        last_heartbeat: Set(a.last_heartbeat.map(Into::into)),
        capabilities: Set(to_json(&a.capabilities)?),
        version: Set(a.version.clone()),
        last_error: Set(a.last_error.clone()),
        created_at: Set(a.created_at.into()),
    })
}

fn server_from(m: servers::Model) -> StoreResult<Server> {
    Ok(Server {
        id: m.id,
        owner_id: m.owner_id,
        name: m.name,
        game: parse("servers.game", &m.game)?,
        status: parse("servers.status", &m.status)?,
        install_state: parse("servers.install_state", &m.install_state)?,
        machine_id: m.machine_id,
        agent_id: m.agent_id,
        cluster_id: m.cluster_id,
        port: m.port.map(|p| port_u16("servers.port", p)).transpose()?,
        max_players: u32::try_from(m.max_players).unwrap_or(0),
        configuration: from_json("servers.configuration", m.configuration)?,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    })
}

fn server_active(s: &Server) -> StoreResult<servers::ActiveModel> {
    Ok(servers::ActiveModel {
        id: Set(s.id),
        owner_id: Set(s.owner_id),
        name: Set(s.name.clone()),
        game: Set(s.game.to_string()),
        status: Set(s.status.to_string()),
        install_state: Set(s.install_state.to_string()),
        machine_id: Set(s.machine_id),
        agent_id: Set(s.agent_id),
        cluster_id: Set(s.cluster_id),
        port: Set(s.port.map(i32::from)),
        max_players: Set(i32::try_from(s.max_players).unwrap_or(i32::MAX)),
        configuration: Set(to_json(&s.configuration)?),
        created_at: Set(s.created_at.into()),
        updated_at: Set(s.updated_at.into()),
    })
}

fn task_from(m: tasks::Model) -> StoreResult<Task> {
    Ok(Task {
        id: m.id,
        task_type: parse("tasks.task_type", &m.task_type)?,
        status: parse("tasks.status", &m.status)?,
        agent_id: m.agent_id,
        server_id: m.server_id,
        command: from_json("tasks.command", m.command)?,
        result: m.result,
        error: m.error,
        attempts: u32::try_from(m.attempts).unwrap_or(0),
        created_at: m.created_at.with_timezone(&Utc),
        started_at: m.started_at.map(|t| t.with_timezone(&Utc)),
        completed_at: m.completed_at.map(|t| t.with_timezone(&Utc)),
    })
}

fn task_active(t: &Task) -> StoreResult<tasks::ActiveModel> {
    Ok(tasks::ActiveModel {
        id: Set(t.id),
        task_type: Set(t.task_type.to_string()),
        status: Set(t.status.to_string()),
        agent_id: Set(t.agent_id),
        server_id: Set(t.server_id),
        command: Set(to_json(&t.command)?),
        result: Set(t.result.clone()),
        error: Set(t.error.clone()),
        attempts: Set(i32::try_from(t.attempts).unwrap_or(i32::MAX)),
        created_at: Set(t.created_at.into()),
        started_at: Set(t.started_at.map(Into::into)),
        completed_at: Set(t.completed_at.map(Into::into)),
    })
}

fn allocation_from(m: port_allocations::Model) -> StoreResult<PortAllocation> {
    Ok(PortAllocation {
        machine_id: m.machine_id,
        server_id: m.server_id,
        ports: from_json::<BTreeMap<PortRole, u16>>("port_allocations.ports", m.ports)?,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

fn progress_from(m: install_progress::Model) -> StoreResult<InstallProgress> {
    Ok(InstallProgress {
        server_id: m.server_id,
        status: parse("install_progress.status", &m.status)?,
        message: m.message,
        progress: m.progress.clamp(0, 100) as u8,
        current_step: u32::try_from(m.current_step).unwrap_or(0),
        total_steps: u32::try_from(m.total_steps).unwrap_or(0),
        error: m.error,
        timestamp: m.updated_at.with_timezone(&Utc),
    })
}

fn cluster_from(m: clusters::Model) -> StoreResult<Cluster> {
    Ok(Cluster {
        id: m.id,
        owner_id: m.owner_id,
        machine_id: m.machine_id,
        game: parse("clusters.game", &m.game)?,
        name: m.name,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

fn transfer_from(m: character_transfers::Model) -> StoreResult<CharacterTransfer> {
    Ok(CharacterTransfer {
        id: m.id,
        cluster_id: m.cluster_id,
        source_server_id: m.source_server_id,
        target_server_id: m.target_server_id,
        character_id: m.character_id,
        requested_by: m.requested_by,
        approved_by: m.approved_by,
        status: parse("character_transfers.status", &m.status)?,
        error: m.error,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    })
}

fn transfer_active(t: &CharacterTransfer) -> character_transfers::ActiveModel {
    character_transfers::ActiveModel {
        id: Set(t.id),
        cluster_id: Set(t.cluster_id),
        source_server_id: Set(t.source_server_id),
        target_server_id: Set(t.target_server_id),
        character_id: Set(t.character_id.clone()),
        requested_by: Set(t.requested_by),
        approved_by: Set(t.approved_by),
        status: Set(t.status.to_string()),
        error: Set(t.error.clone()),
        created_at: Set(t.created_at.into()),
        updated_at: Set(t.updated_at.into()),
    }
}

fn failover_from(m: failover_events::Model) -> StoreResult<FailoverEvent> {
    Ok(FailoverEvent {
        id: m.id,
        cluster_id: m.cluster_id,
        from_server_id: m.from_server_id,
        to_server_id: m.to_server_id,
        ports: from_json("failover_events.ports", m.ports)?,
        reason: m.reason,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

async fn write_allocation<C: ConnectionTrait>(conn: &C, a: &PortAllocation) -> StoreResult<()> {
    port_allocations::Entity::insert(port_allocations::ActiveModel {
        server_id: Set(a.server_id),
        machine_id: Set(a.machine_id),
        ports: Set(to_json(&a.ports)?),
        created_at: Set(a.created_at.into()),
    })
    .exec_without_returning(conn)
    .await
    .map_err(db_err)?;

    if a.ports.is_empty() {
        return Ok(());
    }
    let rows = a.ports.iter().map(|(role, port)| allocated_ports::ActiveModel {
        machine_id: Set(a.machine_id),
        port: Set(i32::from(*port)),
        server_id: Set(a.server_id),
        role: Set(role.to_string()),
    });
    allocated_ports::Entity::insert_many(rows)
        .exec_without_returning(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn remove_allocation<C: ConnectionTrait>(
    conn: &C,
    server_id: Uuid,
) -> StoreResult<Option<PortAllocation>> {
    let Some(row) = port_allocations::Entity::find_by_id(server_id)
        .one(conn)
        .await
        .map_err(db_err)?
    else {
        return Ok(None);
    };
    allocated_ports::Entity::delete_many()
        .filter(allocated_ports::Column::ServerId.eq(server_id))
        .exec(conn)
        .await
        .map_err(db_err)?;
    port_allocations::Entity::delete_by_id(server_id)
        .exec(conn)
        .await
        .map_err(db_err)?;
    allocation_from(row).map(Some)
}

#[async_trait]
impl Store for DbStore {
    async fn insert_machine(&self, m: &Machine) -> StoreResult<()> {
        machines::Entity::insert(machines::ActiveModel {
            id: Set(m.id),
            name: Set(m.name.clone()),
            address: Set(m.address.clone()),
            ssh_port: Set(i32::from(m.ssh_port)),
            ssh_user: Set(m.ssh_user.clone()),
            ssh_key_ref: Set(m.ssh_key_ref.clone()),
            status: Set(m.status.to_string()),
            created_at: Set(m.created_at.into()),
            updated_at: Set(m.updated_at.into()),
        })
        .exec_without_returning(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_machine(&self, id: Uuid) -> StoreResult<Machine> {
        machines::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("machine", id))
            .and_then(machine_from)
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        machines::Entity::find()
            .order_by_asc(machines::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(machine_from)
            .collect()
    }

    async fn set_machine_status(
        &self,
        id: Uuid,
        status: MachineStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let res = machines::Entity::update_many()
            .col_expr(machines::Column::Status, Expr::value(status.to_string()))
            .col_expr(machines::Column::UpdatedAt, Expr::value(now))
            .filter(machines::Column::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::not_found("machine", id));
        }
        Ok(())
    }

    async fn delete_machine(&self, id: Uuid) -> StoreResult<()> {
        let db = &*self.db;
        let agents = agents::Entity::find()
            .filter(agents::Column::MachineId.eq(id))
            .count(db)
            .await
            .map_err(db_err)?;
        let servers = servers::Entity::find()
            .filter(servers::Column::MachineId.eq(id))
            .count(db)
            .await
            .map_err(db_err)?;
        if agents > 0 || servers > 0 {
            return Err(StoreError::Conflict(format!(
                "machine {id} still has {agents} agent(s) and {servers} server(s)"
            )));
        }
        let res = machines::Entity::delete_by_id(id)
            .exec(db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::not_found("machine", id));
        }
        Ok(())
    }

    async fn insert_agent(&self, agent: &Agent) -> StoreResult<()> {
        agents::Entity::insert(agent_active(agent)?)
            .exec_without_returning(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        agents::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("agent", id))
            .and_then(agent_from)
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        agents::Entity::find()
            .order_by_asc(agents::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(agent_from)
            .collect()
    }

    async fn list_agents_for_machine(&self, machine_id: Uuid) -> StoreResult<Vec<Agent>> {
        agents::Entity::find()
            .filter(agents::Column::MachineId.eq(machine_id))
            .order_by_asc(agents::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(agent_from)
            .collect()
    }

    async fn update_agent(&self, agent: &Agent) -> StoreResult<()> {
        match agent_active(agent)?.update(&*self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(StoreError::not_found("agent", agent.id)),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn mark_agent_offline(
        &self,
        id: Uuid,
        seen_status: AgentStatus,
        seen_heartbeat: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let query = agents::Entity::update_many()
            .col_expr(
                agents::Column::Status,
                Expr::value(AgentStatus::Offline.to_string()),
            )
            .filter(agents::Column::Id.eq(id))
            .filter(agents::Column::Status.eq(seen_status.to_string()));
        let query = match seen_heartbeat {
            Some(at) => query.filter(agents::Column::LastHeartbeat.eq(at.fixed_offset())),
            None => query.filter(agents::Column::LastHeartbeat.is_null()),
        };
        let res = query.exec(&*self.db).await.map_err(db_err)?;
        Ok(res.rows_affected > 0)
    }

    async fn insert_server(&self, server: &Server) -> StoreResult<()> {
        servers::Entity::insert(server_active(server)?)
            .exec_without_returning(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> StoreResult<Server> {
        servers::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("server", id))
            .and_then(server_from)
    }

    async fn update_server(&self, server: &Server) -> StoreResult<()> {
        match server_active(server)?.update(&*self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(StoreError::not_found("server", server.id)),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn delete_server(&self, id: Uuid) -> StoreResult<()> {
        let txn = self.db.begin().await.map_err(db_err)?;
        remove_allocation(&txn, id).await?;
        install_log_lines::Entity::delete_many()
            .filter(install_log_lines::Column::ServerId.eq(id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        install_progress::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(db_err)?;
        let res = servers::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::not_found("server", id));
        }
        txn.commit().await.map_err(db_err)
    }

    async fn list_servers_in_cluster(&self, cluster_id: Uuid) -> StoreResult<Vec<Server>> {
        servers::Entity::find()
            .filter(servers::Column::ClusterId.eq(cluster_id))
            .order_by_asc(servers::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(server_from)
            .collect()
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        tasks::Entity::insert(task_active(task)?)
            .exec_without_returning(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        tasks::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("task", id))
            .and_then(task_from)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: u64) -> StoreResult<Vec<Task>> {
        let mut query = tasks::Entity::find();
        if let Some(status) = status {
            query = query.filter(tasks::Column::Status.eq(status.to_string()));
        }
        query
            .order_by_asc(tasks::Column::CreatedAt)
            .order_by_asc(tasks::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(task_from)
            .collect()
    }

    async fn list_tasks_after(
        &self,
        status: TaskStatus,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u64,
    ) -> StoreResult<Vec<Task>> {
        let mut query = tasks::Entity::find().filter(tasks::Column::Status.eq(status.to_string()));
        if let Some((at, id)) = after {
            let at = at.fixed_offset();
            query = query.filter(
                Condition::any().add(tasks::Column::CreatedAt.gt(at)).add(
                    Condition::all()
                        .add(tasks::Column::CreatedAt.eq(at))
                        .add(tasks::Column::Id.gt(id)),
                ),
            );
        }
        query
            .order_by_asc(tasks::Column::CreatedAt)
            .order_by_asc(tasks::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(task_from)
            .collect()
    }

    async fn transition_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Task> {
        let current = self.get_task(id).await?;
        let mut next = current.clone();
        apply_task_update(&mut next, &update, now)?;

        // Guarded on the status we read so a concurrent claim or cancel wins
        // cleanly instead of being overwritten.
        let res = tasks::Entity::update_many()
            .set(task_active(&next)?)
            .filter(tasks::Column::Id.eq(id))
            .filter(tasks::Column::Status.eq(current.status.to_string()))
            .exec(&*self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            let latest = self.get_task(id).await?;
            return Err(StoreError::InvalidTransition {
                entity: "task",
                from: latest.status.to_string(),
                to: next.status.to_string(),
            });
        }
        Ok(next)
    }

    async fn list_port_allocations(&self, machine_id: Uuid) -> StoreResult<Vec<PortAllocation>> {
        port_allocations::Entity::find()
            .filter(port_allocations::Column::MachineId.eq(machine_id))
            .order_by_asc(port_allocations::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(allocation_from)
            .collect()
    }

    async fn get_port_allocation(&self, server_id: Uuid) -> StoreResult<Option<PortAllocation>> {
        port_allocations::Entity::find_by_id(server_id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .map(allocation_from)
            .transpose()
    }

    async fn insert_port_allocation(&self, allocation: &PortAllocation) -> StoreResult<()> {
        let txn = self.db.begin().await.map_err(db_err)?;
        write_allocation(&txn, allocation).await?;
        txn.commit().await.map_err(db_err)
    }

    async fn delete_port_allocation(
        &self,
        server_id: Uuid,
    ) -> StoreResult<Option<PortAllocation>> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let removed = remove_allocation(&txn, server_id).await?;
        txn.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn move_port_allocation(&self, from: Uuid, to: Uuid) -> StoreResult<PortAllocation> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let mut moved = remove_allocation(&txn, from)
            .await?
            .ok_or_else(|| StoreError::not_found("port allocation", from))?;
        remove_allocation(&txn, to).await?;
        moved.server_id = to;
        write_allocation(&txn, &moved).await?;
        txn.commit().await.map_err(db_err)?;
        Ok(moved)
    }

    async fn put_progress(&self, p: &InstallProgress) -> StoreResult<()> {
        install_progress::Entity::insert(install_progress::ActiveModel {
            server_id: Set(p.server_id),
            status: Set(p.status.to_string()),
            message: Set(p.message.clone()),
            progress: Set(i16::from(p.progress)),
            current_step: Set(i32::try_from(p.current_step).unwrap_or(i32::MAX)),
            total_steps: Set(i32::try_from(p.total_steps).unwrap_or(i32::MAX)),
            error: Set(p.error.clone()),
            updated_at: Set(p.timestamp.into()),
        })
        .on_conflict(
            OnConflict::column(install_progress::Column::ServerId)
                .update_columns([
                    install_progress::Column::Status,
                    install_progress::Column::Message,
                    install_progress::Column::Progress,
                    install_progress::Column::CurrentStep,
                    install_progress::Column::TotalSteps,
                    install_progress::Column::Error,
                    install_progress::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_progress(&self, server_id: Uuid) -> StoreResult<Option<InstallProgress>> {
        install_progress::Entity::find_by_id(server_id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .map(progress_from)
            .transpose()
    }

    async fn append_log(&self, server_id: Uuid, line: &str, at: DateTime<Utc>) -> StoreResult<u64> {
        let row = install_log_lines::ActiveModel {
            server_id: Set(server_id),
            line: Set(line.to_string()),
            created_at: Set(at.into()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(u64::try_from(row.id).unwrap_or(0))
    }

    async fn read_log(&self, server_id: Uuid, after: u64, limit: u64) -> StoreResult<Vec<LogLine>> {
        let after = i64::try_from(after).unwrap_or(i64::MAX);
        let rows = install_log_lines::Entity::find()
            .filter(install_log_lines::Column::ServerId.eq(server_id))
            .filter(install_log_lines::Column::Id.gt(after))
            .order_by_asc(install_log_lines::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| LogLine {
                seq: u64::try_from(r.id).unwrap_or(0),
                at: r.created_at.with_timezone(&Utc),
                line: r.line,
            })
            .collect())
    }

    async fn insert_cluster(&self, c: &Cluster) -> StoreResult<()> {
        clusters::Entity::insert(clusters::ActiveModel {
            id: Set(c.id),
            owner_id: Set(c.owner_id),
            machine_id: Set(c.machine_id),
            game: Set(c.game.to_string()),
            name: Set(c.name.clone()),
            created_at: Set(c.created_at.into()),
        })
        .exec_without_returning(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_cluster(&self, id: Uuid) -> StoreResult<Cluster> {
        clusters::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("cluster", id))
            .and_then(cluster_from)
    }

    async fn insert_transfer(&self, transfer: &CharacterTransfer) -> StoreResult<()> {
        character_transfers::Entity::insert(transfer_active(transfer))
            .exec_without_returning(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_transfer(&self, id: Uuid) -> StoreResult<CharacterTransfer> {
        character_transfers::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("transfer", id))
            .and_then(transfer_from)
    }

    async fn update_transfer(
        &self,
        transfer: &CharacterTransfer,
        expected: TransferStatus,
    ) -> StoreResult<()> {
        let res = character_transfers::Entity::update_many()
            .set(transfer_active(transfer))
            .filter(character_transfers::Column::Id.eq(transfer.id))
            .filter(character_transfers::Column::Status.eq(expected.to_string()))
            .exec(&*self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            let latest = self.get_transfer(transfer.id).await?;
            return Err(StoreError::InvalidTransition {
                entity: "transfer",
                from: latest.status.to_string(),
                to: transfer.status.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_failover_event(&self, e: &FailoverEvent) -> StoreResult<()> {
        failover_events::Entity::insert(failover_events::ActiveModel {
            id: Set(e.id),
            cluster_id: Set(e.cluster_id),
            from_server_id: Set(e.from_server_id),
            to_server_id: Set(e.to_server_id),
            ports: Set(to_json(&e.ports)?),
            reason: Set(e.reason.clone()),
            created_at: Set(e.created_at.into()),
        })
        .exec_without_returning(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_failover_events(&self, cluster_id: Uuid) -> StoreResult<Vec<FailoverEvent>> {
        failover_events::Entity::find()
            .filter(failover_events::Column::ClusterId.eq(cluster_id))
            .order_by_asc(failover_events::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(failover_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ember_core::{AgentStatus, ServerStatus};

    use super::*;

    #[test]
    fn status_columns_parse_or_report_corruption() {
        let now = Utc::now().fixed_offset();
        let row = agents::Model {
            id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            status: "UPDATING".into(),
            last_heartbeat: Some(now),
            capabilities: serde_json::json!(["systemd", "steamcmd"]),
            version: Some("0.1.0".into()),
            last_error: None,
            created_at: now,
        };
        let agent = agent_from(row.clone()).unwrap();
        assert_eq!(agent.status, AgentStatus::Updating);
        assert_eq!(agent.capabilities, vec!["systemd", "steamcmd"]);

        let bad = agents::Model {
            status: "ASLEEP".into(),
            ..row
        };
        assert!(matches!(agent_from(bad), Err(StoreError::Corrupt(_))));
        assert_eq!(ServerStatus::Online.to_string(), "ONLINE");
    }

    #[test]
    fn out_of_range_port_is_corrupt() {
        assert!(port_u16("servers.port", 70_000).is_err());
        assert_eq!(port_u16("servers.port", 7777).unwrap(), 7777);
    }
}
