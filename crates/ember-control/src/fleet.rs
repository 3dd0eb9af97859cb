//! Operator-facing registration of machines, agents and servers.

use std::sync::Arc;

use chrono::Utc;
use ember_core::{
    Agent, AgentStatus, GameConfig, InstallState, Machine, MachineStatus, Server, ServerStatus,
    ValidationErrors,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    cluster::ClusterCoordinator,
    error::ProvisionError,
    installer::installer_for,
    shell::ensure_safe_token,
    store::Store,
};

#[derive(Debug, Clone, Deserialize)]
pub struct NewMachine {
    pub name: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_ref: String,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub machine_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub owner_id: Uuid,
    pub name: String,
    pub machine_id: Uuid,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub cluster_id: Option<Uuid>,
    pub max_players: u32,
    pub configuration: GameConfig,
}

fn check_name(errs: &mut ValidationErrors, field: &str, name: &str) {
    if name.trim().is_empty() || name.len() > 64 || name.chars().any(char::is_control) {
        errs.add(field, "Required, at most 64 characters on one line.");
    }
}

pub struct Fleet {
    store: Arc<dyn Store>,
}

impl Fleet {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_machine(&self, req: NewMachine) -> Result<Machine, ProvisionError> {
        let mut errs = ValidationErrors::new();
        check_name(&mut errs, "name", &req.name);
        for (field, value) in [
            ("address", &req.address),
            ("ssh_user", &req.ssh_user),
            ("ssh_key_ref", &req.ssh_key_ref),
        ] {
            if let Err(msg) = ensure_safe_token(value) {
                errs.add(field, format!("Invalid value: {msg}."));
            }
        }
        if req.ssh_port == 0 {
            errs.add("ssh_port", "Must be between 1 and 65535.");
        }
        errs.finish(())?;

        let now = Utc::now();
        let machine = Machine {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            address: req.address,
            ssh_port: req.ssh_port,
            ssh_user: req.ssh_user,
            ssh_key_ref: req.ssh_key_ref,
            status: MachineStatus::Offline,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_machine(&machine).await?;
        tracing::info!(machine_id = %machine.id, address = %machine.address, "machine registered");
        Ok(machine)
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>, ProvisionError> {
        Ok(self.store.list_machines().await?)
    }

    pub async fn delete_machine(&self, id: Uuid) -> Result<(), ProvisionError> {
        self.store.delete_machine(id).await?;
        tracing::info!(machine_id = %id, "machine removed");
        Ok(())
    }

    /// New agents stay OFFLINE until their first heartbeat.
    pub async fn register_agent(&self, req: NewAgent) -> Result<Agent, ProvisionError> {
        self.store.get_machine(req.machine_id).await?;
        let agent = Agent {
            id: Uuid::new_v4(),
            machine_id: req.machine_id,
            status: AgentStatus::Offline,
            last_heartbeat: None,
            capabilities: Vec::new(),
            version: None,
            last_error: None,
            created_at: Utc::now(),
        };
        self.store.insert_agent(&agent).await?;
        tracing::info!(agent_id = %agent.id, machine_id = %agent.machine_id, "agent registered");
        Ok(agent)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent, ProvisionError> {
        Ok(self.store.get_agent(id).await?)
    }

    pub async fn create_server(&self, req: NewServer) -> Result<Server, ProvisionError> {
        let now = Utc::now();
        let server = Server {
            id: Uuid::new_v4(),
            owner_id: req.owner_id,
            name: req.name.trim().to_string(),
            game: req.configuration.kind(),
            status: ServerStatus::Offline,
            install_state: InstallState::NotInstalled,
            machine_id: req.machine_id,
            agent_id: req.agent_id,
            cluster_id: req.cluster_id,
            port: None,
            max_players: req.max_players,
            configuration: req.configuration,
            created_at: now,
            updated_at: now,
        };

        let mut errs = ValidationErrors::new();
        check_name(&mut errs, "name", &server.name);
        if let Err(cfg) = installer_for(server.game).validate_config(&server) {
            for (field, msg) in cfg.into_fields() {
                errs.add(format!("configuration.{field}"), msg);
            }
        }
        self.store.get_machine(server.machine_id).await?;
        if let Some(agent_id) = server.agent_id {
            let agent = self.store.get_agent(agent_id).await?;
            if agent.machine_id != server.machine_id {
                errs.add("agent_id", "Agent runs on a different machine.");
            }
        }
        if let Some(cluster_id) = server.cluster_id {
            let cluster = self.store.get_cluster(cluster_id).await?;
            if let Err(member) = ClusterCoordinator::check_member(&cluster, &server) {
                for (field, msg) in member.into_fields() {
                    errs.add(field, msg);
                }
            }
        }
        errs.finish(())?;

        self.store.insert_server(&server).await?;
        tracing::info!(server_id = %server.id, game = %server.game, machine_id = %server.machine_id, "server created");
        Ok(server)
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Server, ProvisionError> {
        Ok(self.store.get_server(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent, ark_config, machine, minecraft_config, seeded_store};

    fn new_server(machine_id: Uuid, configuration: GameConfig) -> NewServer {
        NewServer {
            owner_id: Uuid::new_v4(),
            name: "survival".into(),
            machine_id,
            agent_id: None,
            cluster_id: None,
            max_players: 10,
            configuration,
        }
    }

    #[tokio::test]
    async fn machine_fields_are_allow_listed() {
        let (store, _) = seeded_store().await;
        let fleet = Fleet::new(store);
        let Err(ProvisionError::Validation(errs)) = fleet
            .create_machine(NewMachine {
                name: "fra-02".into(),
                address: "10.0.0.6; reboot".into(),
                ssh_port: 0,
                ssh_user: "ember".into(),
                ssh_key_ref: "../id_rsa".into(),
            })
            .await
        else {
            panic!("expected validation error");
        };
        assert!(errs.get("address").is_some());
        assert!(errs.get("ssh_port").is_some());
        assert!(errs.get("ssh_key_ref").is_some());
        assert!(errs.get("ssh_user").is_none());
    }

    #[tokio::test]
    async fn registered_agent_starts_offline() {
        let (store, m) = seeded_store().await;
        let fleet = Fleet::new(store);
        let a = fleet.register_agent(NewAgent { machine_id: m.id }).await.unwrap();
        assert_eq!(a.status, AgentStatus::Offline);
        assert!(a.last_heartbeat.is_none());

        let missing = fleet
            .register_agent(NewAgent {
                machine_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(missing, Err(ProvisionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn server_starts_not_installed() {
        let (store, m) = seeded_store().await;
        let a = agent(m.id);
        store.insert_agent(&a).await.unwrap();
        let fleet = Fleet::new(store);
        let mut req = new_server(m.id, minecraft_config());
        req.agent_id = Some(a.id);
        let s = fleet.create_server(req).await.unwrap();
        assert_eq!(s.install_state, InstallState::NotInstalled);
        assert_eq!(s.status, ServerStatus::Offline);
        assert_eq!(fleet.get_server(s.id).await.unwrap(), s);
    }

    #[tokio::test]
    async fn agent_on_other_machine_is_rejected() {
        let (store, m) = seeded_store().await;
        let other = machine();
        store.insert_machine(&other).await.unwrap();
        let a = agent(other.id);
        store.insert_agent(&a).await.unwrap();
        let fleet = Fleet::new(store);

        let mut req = new_server(m.id, ark_config());
        req.agent_id = Some(a.id);
        req.name = String::new();
        let Err(ProvisionError::Validation(errs)) = fleet.create_server(req).await else {
            panic!("expected validation error");
        };
        assert!(errs.get("agent_id").is_some());
        assert!(errs.get("name").is_some());
    }

    #[tokio::test]
    async fn busy_machine_cannot_be_deleted() {
        let (store, m) = seeded_store().await;
        let fleet = Fleet::new(store);
        fleet.register_agent(NewAgent { machine_id: m.id }).await.unwrap();
        let err = fleet.delete_machine(m.id).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
