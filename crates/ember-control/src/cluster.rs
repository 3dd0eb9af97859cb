//! Shared storage, character transfers and failover for clustered games.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use chrono::Utc;
use ember_core::{
    CharacterTransfer, Cluster, FailoverEvent, GameKind, InstallState, PortAllocation, Server,
    ServerStatus, TransferStatus, ValidationErrors,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ProvisionError,
    installer::{JobHandle, Provisioner, Target},
    notifier::{Event, EventKind},
    shell::{RemoteCommand, RemoteScript, ensure_safe_token},
    store::Store,
};

/// Root of a cluster's shared storage on its machine.
pub fn shared_root(remote_root: &str, owner_id: Uuid, machine_id: Uuid) -> String {
    format!(
        "{}/clusters/{owner_id}-{machine_id}",
        remote_root.trim_end_matches('/')
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCluster {
    pub owner_id: Uuid,
    pub machine_id: Uuid,
    pub game: GameKind,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTransfer {
    pub source_server_id: Uuid,
    pub target_server_id: Uuid,
    pub character_id: String,
    pub requested_by: Uuid,
}

pub struct ClusterCoordinator {
    provisioner: Arc<Provisioner>,
}

fn empty_allocation(server: &Server) -> PortAllocation {
    PortAllocation {
        machine_id: server.machine_id,
        server_id: server.id,
        ports: BTreeMap::new(),
        created_at: Utc::now(),
    }
}

impl ClusterCoordinator {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.provisioner.store()
    }

    fn root_of(&self, cluster: &Cluster) -> String {
        shared_root(
            &self.provisioner.settings().remote_root,
            cluster.owner_id,
            cluster.machine_id,
        )
    }

    pub async fn create(&self, req: NewCluster) -> Result<Cluster, ProvisionError> {
        let mut errs = ValidationErrors::new();
        if !req.game.supports_clustering() {
            errs.add("game", format!("{} does not support clusters.", req.game));
        }
        let name = req.name.trim();
        if name.is_empty() || name.len() > 64 || name.chars().any(char::is_control) {
            errs.add("name", "Required, at most 64 characters on one line.");
        }
        errs.finish(())?;
        self.store().get_machine(req.machine_id).await?;

        let cluster = Cluster {
            id: Uuid::new_v4(),
            owner_id: req.owner_id,
            machine_id: req.machine_id,
            game: req.game,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.store().insert_cluster(&cluster).await?;
        tracing::info!(cluster_id = %cluster.id, game = %cluster.game, "cluster created");
        Ok(cluster)
    }

    pub async fn get(&self, cluster_id: Uuid) -> Result<Cluster, ProvisionError> {
        Ok(self.store().get_cluster(cluster_id).await?)
    }

    pub async fn members(&self, cluster_id: Uuid) -> Result<Vec<Server>, ProvisionError> {
        Ok(self.store().list_servers_in_cluster(cluster_id).await?)
    }

    /// Rejects a server that cannot join `cluster`.
    pub fn check_member(cluster: &Cluster, server: &Server) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if server.game != cluster.game {
            errs.add("game", format!("Cluster runs {}.", cluster.game));
        }
        if server.machine_id != cluster.machine_id {
            errs.add("machine_id", "Cluster members must share the cluster's machine.");
        }
        if server.owner_id != cluster.owner_id {
            errs.add("owner_id", "Cluster members must share the cluster's owner.");
        }
        errs.finish(())
    }

    /// Creates the shared layout on the cluster's machine. Idempotent.
    pub async fn prepare(&self, cluster_id: Uuid) -> Result<String, ProvisionError> {
        let cluster = self.store().get_cluster(cluster_id).await?;
        let machine = self.store().get_machine(cluster.machine_id).await?;
        let root = self.root_of(&cluster);
        let owner = format!("{}:", machine.ssh_user);
        let script = RemoteScript::new()
            .then(
                RemoteCommand::new("mkdir")
                    .args(["-p", &format!("{root}/instances"), &format!("{root}/transfer")])
                    .sudo(),
            )
            .then(RemoteCommand::new("chown").args(["-R", owner.as_str(), root.as_str()]).sudo());
        self.provisioner
            .executor()
            .execute(
                &crate::executor::Connection::for_machine(&machine),
                &script,
                self.provisioner.settings().command_timeout,
            )
            .await?
            .check("prepare cluster storage")?;
        tracing::info!(%cluster_id, %root, "cluster storage prepared");
        Ok(root)
    }

    pub async fn request_transfer(
        &self,
        cluster_id: Uuid,
        req: NewTransfer,
    ) -> Result<CharacterTransfer, ProvisionError> {
        self.store().get_cluster(cluster_id).await?;
        let source = self.store().get_server(req.source_server_id).await?;
        let target = self.store().get_server(req.target_server_id).await?;

        let mut errs = ValidationErrors::new();
        if source.cluster_id != Some(cluster_id) {
            errs.add("source_server_id", "Not a member of this cluster.");
        }
        if target.cluster_id != Some(cluster_id) {
            errs.add("target_server_id", "Not a member of this cluster.");
        }
        if source.id == target.id {
            errs.add("target_server_id", "Source and target must differ.");
        }
        if let Err(msg) = ensure_safe_token(&req.character_id) {
            errs.add("character_id", format!("Invalid character id: {msg}."));
        }
        errs.finish(())?;

        let now = Utc::now();
        let transfer = CharacterTransfer {
            id: Uuid::new_v4(),
            cluster_id,
            source_server_id: source.id,
            target_server_id: target.id,
            character_id: req.character_id,
            requested_by: req.requested_by,
            approved_by: None,
            status: TransferStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store().insert_transfer(&transfer).await?;
        tracing::info!(transfer_id = %transfer.id, %cluster_id, "character transfer requested");
        Ok(transfer)
    }

    pub async fn get_transfer(&self, id: Uuid) -> Result<CharacterTransfer, ProvisionError> {
        Ok(self.store().get_transfer(id).await?)
    }

    async fn decide(
        &self,
        id: Uuid,
        approver: Uuid,
        next: TransferStatus,
    ) -> Result<CharacterTransfer, ProvisionError> {
        let mut transfer = self.store().get_transfer(id).await?;
        if !transfer.status.can_transition_to(next) {
            return Err(ProvisionError::InvalidTransition {
                entity: "transfer",
                from: transfer.status.to_string(),
                to: next.to_string(),
            });
        }
        transfer.status = next;
        transfer.approved_by = Some(approver);
        transfer.updated_at = Utc::now();
        self.store()
            .update_transfer(&transfer, TransferStatus::Pending)
            .await?;
        Ok(transfer)
    }

    pub async fn reject_transfer(
        &self,
        id: Uuid,
        approver: Uuid,
    ) -> Result<CharacterTransfer, ProvisionError> {
        let t = self.decide(id, approver, TransferStatus::Rejected).await?;
        tracing::info!(transfer_id = %id, %approver, "character transfer rejected");
        Ok(t)
    }

    /// Approves, copies the character through the cluster's staging
    /// directory and records the outcome.
    pub async fn approve_transfer(
        &self,
        id: Uuid,
        approver: Uuid,
    ) -> Result<CharacterTransfer, ProvisionError> {
        let mut transfer = self.decide(id, approver, TransferStatus::Approved).await?;

        let copied = self.copy_character(&transfer).await;
        transfer.updated_at = Utc::now();
        match &copied {
            Ok(()) => transfer.status = TransferStatus::Transferred,
            Err(e) => {
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(e.to_string());
            }
        }
        self.store()
            .update_transfer(&transfer, TransferStatus::Approved)
            .await?;

        match copied {
            Ok(()) => {
                tracing::info!(transfer_id = %id, character = %transfer.character_id, "character transferred");
                self.provisioner
                    .notifier()
                    .notify(Event::new(
                        EventKind::TransferCompleted,
                        Some(transfer.target_server_id),
                        serde_json::json!({
                            "transferId": transfer.id,
                            "clusterId": transfer.cluster_id,
                            "sourceServerId": transfer.source_server_id,
                            "characterId": transfer.character_id,
                        }),
                    ))
                    .await;
            }
            Err(e) => {
                tracing::warn!(transfer_id = %id, error = %e, "character transfer failed");
            }
        }
        Ok(transfer)
    }

    async fn copy_character(&self, t: &CharacterTransfer) -> Result<(), ProvisionError> {
        let cluster = self.store().get_cluster(t.cluster_id).await?;
        let source = self.provisioner.target(t.source_server_id).await?;
        let target = self.provisioner.target(t.target_server_id).await?;

        let src_alloc = empty_allocation(&source.server);
        let dst_alloc = empty_allocation(&target.server);
        let src = source
            .installer
            .character_path(&source.context(&src_alloc), &t.character_id);
        let dst = target
            .installer
            .character_path(&target.context(&dst_alloc), &t.character_id);

        let file_name = Path::new(&src)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| t.character_id.clone());
        let staging = format!("{}/transfer/{}", self.root_of(&cluster), t.id);
        let staged = format!("{staging}/{file_name}");
        let dst_parent = Path::new(&dst)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());

        let script = RemoteScript::new()
            .then(RemoteCommand::new("mkdir").args(["-p", staging.as_str()]))
            .then(RemoteCommand::new("cp").args(["-a", src.as_str(), staged.as_str()]))
            .then(RemoteCommand::new("mkdir").args(["-p", dst_parent.as_str()]))
            .then(RemoteCommand::new("cp").args(["-a", "-T", staged.as_str(), dst.as_str()]))
            .then(RemoteCommand::new("rm").args(["-rf", staging.as_str()]));
        self.provisioner
            .executor()
            .execute(&source.conn, &script, self.provisioner.settings().command_timeout)
            .await?
            .check("copy character")?;
        Ok(())
    }

    /// Moves a failed member's ports to a standby and brings the standby up
    /// on them.
    pub async fn failover(
        &self,
        cluster_id: Uuid,
        from: Uuid,
        to: Uuid,
        reason: &str,
    ) -> Result<FailoverEvent, ProvisionError> {
        self.store().get_cluster(cluster_id).await?;
        let mut failed = self.provisioner.target(from).await?;
        let mut standby = self.provisioner.target(to).await?;

        let mut errs = ValidationErrors::new();
        if failed.server.cluster_id != Some(cluster_id) {
            errs.add("from", "Not a member of this cluster.");
        }
        if standby.server.cluster_id != Some(cluster_id) {
            errs.add("to", "Not a member of this cluster.");
        }
        if from == to {
            errs.add("to", "Standby must differ from the failed server.");
        }
        if standby.server.install_state != InstallState::Installed {
            errs.add("to", "Standby must be installed.");
        }
        errs.finish(())?;

        let settings = self.provisioner.settings();
        let exec = self.provisioner.executor();

        // Disabled as well as stopped: the unit still names the moved ports
        // and must not come back on boot.
        for action in ["stop", "disable"] {
            let cmd = RemoteCommand::new("systemctl")
                .args([action, failed.paths.unit_name.as_str()])
                .sudo();
            match exec.execute(&failed.conn, &cmd.into(), settings.command_timeout).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    tracing::warn!(server_id = %from, action, exit_code = out.exit_code, "failed member unit returned non-zero")
                }
                Err(e) => tracing::warn!(server_id = %from, action, error = %e, "could not reach failed member unit"),
            }
        }

        let moved = self.store().move_port_allocation(from, to).await?;
        // Without ports the failed member only comes back through an install.
        failed.server.port = None;
        failed.server.install_state = InstallState::NotInstalled;
        failed.server.updated_at = Utc::now();
        self.store().update_server(&failed.server).await?;
        self.provisioner
            .set_status(&mut failed.server, ServerStatus::Offline)
            .await?;
        standby.server.port = moved.game_port();
        standby.server.updated_at = Utc::now();
        self.store().update_server(&standby.server).await?;

        let event = FailoverEvent {
            id: Uuid::new_v4(),
            cluster_id,
            from_server_id: from,
            to_server_id: to,
            ports: moved.ports.clone(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.store().insert_failover_event(&event).await?;
        tracing::warn!(%cluster_id, %from, %to, reason, "cluster failover");

        self.restart_on(&mut standby, &moved).await?;

        self.provisioner
            .notifier()
            .notify(Event::new(
                EventKind::ClusterFailover,
                Some(to),
                serde_json::json!({
                    "clusterId": cluster_id,
                    "from": from,
                    "to": to,
                    "ports": moved.ports,
                    "reason": reason,
                }),
            ))
            .await;
        Ok(event)
    }

    /// Points `standby` at `ports`, applies it and restarts the unit. Live
    /// config files are edited in place; the unit is re-rendered.
    async fn restart_on(
        &self,
        standby: &mut Target,
        ports: &PortAllocation,
    ) -> Result<(), ProvisionError> {
        let settings = self.provisioner.settings();
        let exec = self.provisioner.executor();
        let artifacts = standby.installer.render(&standby.context(ports))?;

        self.provisioner
            .set_status(&mut standby.server, ServerStatus::Starting)
            .await?;
        let applied = async {
            let ctx = standby.context(ports);
            for file in &artifacts.files {
                let read = RemoteCommand::new("cat").arg(file.path.as_str());
                let live = exec
                    .execute(&standby.conn, &read.into(), settings.command_timeout)
                    .await?;
                let contents = if live.success() {
                    standby.installer.retarget_file(&ctx, file, &live.stdout)?
                } else {
                    tracing::warn!(server_id = %standby.server.id, path = %file.path, "live config unreadable; uploading rendered copy");
                    None
                };
                let contents = contents.unwrap_or_else(|| file.contents.clone());
                exec.upload(
                    &standby.conn,
                    &file.path,
                    contents.as_bytes(),
                    file.mode,
                    settings.command_timeout,
                )
                .await?;
            }
            let unit = &artifacts.unit;
            exec.upload(
                &standby.conn,
                &unit.path,
                unit.contents.as_bytes(),
                unit.mode,
                settings.command_timeout,
            )
            .await?;
            let owner = format!("{}:", standby.machine.ssh_user);
            let script = RemoteScript::new()
                .then(
                    RemoteCommand::new("chown")
                        .args(["-R", owner.as_str(), standby.paths.root.as_str()])
                        .sudo(),
                )
                .then(RemoteCommand::new("systemctl").arg("daemon-reload").sudo())
                .then(
                    RemoteCommand::new("systemctl")
                        .args(["restart", standby.paths.unit_name.as_str()])
                        .sudo(),
                );
            exec.execute(&standby.conn, &script, settings.command_timeout)
                .await?
                .check("restart standby")?;
            Ok::<_, ProvisionError>(())
        }
        .await;

        let status = if applied.is_ok() {
            ServerStatus::Online
        } else {
            ServerStatus::Error
        };
        self.provisioner.set_status(&mut standby.server, status).await?;
        applied
    }

    /// Reinstalls every member in the background, each from step 0.
    pub async fn reinstall_cluster(
        &self,
        cluster_id: Uuid,
    ) -> Result<Vec<JobHandle>, ProvisionError> {
        let members = self.members(cluster_id).await?;
        self.prepare(cluster_id).await?;
        let mut handles = Vec::with_capacity(members.len());
        for server in members {
            handles.push(self.provisioner.spawn_reinstall(server.id)?);
        }
        tracing::info!(%cluster_id, members = handles.len(), "cluster reinstall started");
        Ok(handles)
    }
}
