//! Day-two operations on installed servers and agent bootstrap.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use ember_core::{AgentStatus, InstallState, ServerStatus, Task, TaskCommand, ValidationErrors};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::CleanupPolicy,
    error::{PartialCleanupWarning, ProvisionError},
    executor::Connection,
    installer::{JobState, Provisioner, Target, service_unit::substitute},
    shell::{RemoteCommand, RemoteScript, ensure_safe_token},
    store::Store,
};

const AGENT_BINARY: &str = "/usr/local/bin/ember-agent";
const AGENT_UNIT_PATH: &str = "/etc/systemd/system/ember-agent.service";

const AGENT_UNIT_TEMPLATE: &str = "\
[Unit]
Description=ember agent
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
Environment=EMBER_CONTROL_URL={{CONTROL_URL}}
Environment=EMBER_AGENT_ID={{AGENT_ID}}
ExecStart={{BINARY}}
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Lifecycle {
    provisioner: Arc<Provisioner>,
}

fn require_installed(target: &Target) -> Result<(), ProvisionError> {
    if target.server.install_state == InstallState::Installed {
        return Ok(());
    }
    Err(ProvisionError::InvalidTransition {
        entity: "server",
        from: target.server.install_state.to_string(),
        to: "operation on installed server".to_string(),
    })
}

fn check_url(field: &str, value: &str, schemes: &[&str], errs: &mut ValidationErrors) {
    let ok_scheme = schemes
        .iter()
        .any(|s| value.strip_prefix(s).is_some_and(|rest| !rest.is_empty()));
    if !ok_scheme {
        errs.add(field, format!("Must start with {}.", schemes.join(" or ")));
    } else if value.chars().any(|c| c.is_whitespace() || c.is_control() || c == '"') {
        errs.add(field, "Must not contain whitespace or quotes.");
    }
}

impl Lifecycle {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    /// Executes one claimed task and returns the JSON stored as its result.
    pub async fn run(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ProvisionError> {
        let server_id = || {
            task.server_id
                .ok_or_else(|| ProvisionError::not_found("server", "task has no server"))
        };
        match &task.command {
            TaskCommand::Provision {
                preferred_base_port,
            } => {
                let server = self
                    .provisioner
                    .install(server_id()?, *preferred_base_port, cancel)
                    .await?;
                Ok(serde_json::json!({ "port": server.port }))
            }
            TaskCommand::Start => {
                let s = self.start(server_id()?).await?;
                Ok(serde_json::json!({ "status": s }))
            }
            TaskCommand::Stop => {
                let s = self.stop(server_id()?).await?;
                Ok(serde_json::json!({ "status": s }))
            }
            TaskCommand::Restart => {
                let s = self.restart(server_id()?).await?;
                Ok(serde_json::json!({ "status": s }))
            }
            TaskCommand::Update => {
                let s = self.update(server_id()?).await?;
                Ok(serde_json::json!({ "status": s }))
            }
            TaskCommand::Backup { label } => {
                let info = self.backup(server_id()?, label.as_deref()).await?;
                Ok(serde_json::to_value(info).unwrap_or_default())
            }
            TaskCommand::Delete => {
                let warnings = self.delete(server_id()?).await?;
                let warnings: Vec<String> = warnings.iter().map(ToString::to_string).collect();
                Ok(serde_json::json!({ "deleted": true, "warnings": warnings }))
            }
            TaskCommand::InstallAgent {
                machine_id,
                agent_id,
                download_url,
                control_url,
            } => {
                self.install_agent(*machine_id, *agent_id, download_url, control_url)
                    .await?;
                Ok(serde_json::json!({ "agentId": agent_id }))
            }
        }
    }

    async fn systemctl(&self, target: &Target, verb: &str) -> Result<(), ProvisionError> {
        let cmd = RemoteCommand::new("systemctl")
            .args([verb, target.paths.unit_name.as_str()])
            .sudo();
        self.provisioner
            .executor()
            .execute(&target.conn, &cmd.into(), self.provisioner.settings().command_timeout)
            .await?
            .check(format!("systemctl {verb}"))?;
        Ok(())
    }

    /// Moves through `during` to `after` around one systemctl verb. A failed
    /// command leaves the server in ERROR.
    async fn drive(
        &self,
        target: &mut Target,
        verb: &str,
        during: ServerStatus,
        after: ServerStatus,
    ) -> Result<(), ProvisionError> {
        self.provisioner.set_status(&mut target.server, during).await?;
        if let Err(e) = self.systemctl(target, verb).await {
            tracing::warn!(server_id = %target.server.id, verb, error = %e, "service command failed");
            self.provisioner
                .set_status(&mut target.server, ServerStatus::Error)
                .await?;
            return Err(e);
        }
        self.provisioner.set_status(&mut target.server, after).await
    }

    pub async fn start(&self, server_id: Uuid) -> Result<ServerStatus, ProvisionError> {
        let mut target = self.provisioner.target(server_id).await?;
        require_installed(&target)?;
        self.drive(&mut target, "start", ServerStatus::Starting, ServerStatus::Online)
            .await?;
        tracing::info!(%server_id, "server started");
        Ok(target.server.status)
    }

    pub async fn stop(&self, server_id: Uuid) -> Result<ServerStatus, ProvisionError> {
        let mut target = self.provisioner.target(server_id).await?;
        require_installed(&target)?;
        self.drive(&mut target, "stop", ServerStatus::Stopping, ServerStatus::Offline)
            .await?;
        tracing::info!(%server_id, "server stopped");
        Ok(target.server.status)
    }

    pub async fn restart(&self, server_id: Uuid) -> Result<ServerStatus, ProvisionError> {
        let mut target = self.provisioner.target(server_id).await?;
        require_installed(&target)?;
        self.drive(&mut target, "restart", ServerStatus::Starting, ServerStatus::Online)
            .await?;
        Ok(target.server.status)
    }

    /// Stop, re-run the game's update script, start.
    pub async fn update(&self, server_id: Uuid) -> Result<ServerStatus, ProvisionError> {
        let mut target = self.provisioner.target(server_id).await?;
        require_installed(&target)?;
        let allocation = self
            .provisioner
            .store()
            .get_port_allocation(server_id)
            .await?
            .ok_or_else(|| ProvisionError::not_found("port allocation", server_id))?;

        self.drive(&mut target, "stop", ServerStatus::Stopping, ServerStatus::Offline)
            .await?;

        let script = target.installer.update_script(&target.context(&allocation));
        let res = self
            .provisioner
            .executor()
            .execute(&target.conn, &script, self.provisioner.settings().install_timeout)
            .await
            .and_then(|out| out.check("update game files"));
        if let Err(e) = res {
            self.provisioner
                .set_status(&mut target.server, ServerStatus::Error)
                .await?;
            return Err(e);
        }

        self.drive(&mut target, "start", ServerStatus::Starting, ServerStatus::Online)
            .await?;
        tracing::info!(%server_id, "server updated");
        Ok(target.server.status)
    }

    /// Archives the data directory into the backups directory.
    pub async fn backup(
        &self,
        server_id: Uuid,
        label: Option<&str>,
    ) -> Result<BackupInfo, ProvisionError> {
        let target = self.provisioner.target(server_id).await?;
        require_installed(&target)?;

        let now = Utc::now();
        let name = match label {
            Some(l) => {
                if let Err(msg) = ensure_safe_token(l) {
                    let mut errs = ValidationErrors::new();
                    errs.add("label", format!("Invalid backup label: {msg}."));
                    return Err(errs.into());
                }
                l.to_string()
            }
            None => format!("backup-{}", now.format("%Y%m%dT%H%M%SZ")),
        };
        let path = format!("{}/{name}.tar.gz", target.paths.backups_dir);

        let script = RemoteScript::new()
            .then(RemoteCommand::new("mkdir").args(["-p", target.paths.backups_dir.as_str()]))
            .then(RemoteCommand::new("tar").args([
                "-czf",
                path.as_str(),
                "-C",
                target.paths.data_dir.as_str(),
                ".",
            ]));
        self.provisioner
            .executor()
            .execute(&target.conn, &script, self.provisioner.settings().install_timeout)
            .await?
            .check("backup")?;
        tracing::info!(%server_id, %path, "backup written");
        Ok(BackupInfo {
            path,
            created_at: now,
        })
    }

    /// Removes remote artifacts and backups, releases ports, then deletes
    /// the row.
    pub async fn delete(&self, server_id: Uuid) -> Result<Vec<PartialCleanupWarning>, ProvisionError> {
        if let Some((_, JobState::Running)) =
            self.provisioner.jobs().state(server_id)
        {
            return Err(ProvisionError::ResourceConflict(format!(
                "server {server_id} has a running install job"
            )));
        }
        let mut target = self.provisioner.target(server_id).await?;
        self.provisioner
            .set_status(&mut target.server, ServerStatus::Stopping)
            .await?;

        let mut warnings = self.provisioner.cleanup(&target).await;
        let remove_backups =
            RemoteCommand::new("rm").args(["-rf", &target.paths.backups_dir]).sudo();
        let removed = self
            .provisioner
            .executor()
            .execute(
                &target.conn,
                &remove_backups.into(),
                self.provisioner.settings().command_timeout,
            )
            .await
            .and_then(|out| out.check("remove backups"));
        if let Err(e) = removed {
            tracing::warn!(%server_id, error = %e, "partial cleanup");
            warnings.push(PartialCleanupWarning {
                step: "remove backups".to_string(),
                message: e.to_string(),
            });
        }
        if let (CleanupPolicy::Abort, Some(first)) =
            (self.provisioner.settings().cleanup_policy, warnings.first())
        {
            self.provisioner
                .set_status(&mut target.server, ServerStatus::Error)
                .await?;
            return Err(ProvisionError::remote(
                format!("cleanup: {}", first.step),
                -1,
                &first.message,
            ));
        }

        self.provisioner.ports().deallocate(server_id).await?;
        self.provisioner.store().delete_server(server_id).await?;
        tracing::info!(%server_id, warnings = warnings.len(), "server deleted");
        Ok(warnings)
    }

    /// Downloads the agent binary onto a machine and runs it under systemd.
    pub async fn install_agent(
        &self,
        machine_id: Uuid,
        agent_id: Uuid,
        download_url: &str,
        control_url: &str,
    ) -> Result<(), ProvisionError> {
        let store = self.provisioner.store();
        let machine = store.get_machine(machine_id).await?;
        let mut agent = store.get_agent(agent_id).await?;

        let mut errs = ValidationErrors::new();
        if agent.machine_id != machine_id {
            errs.add("agent_id", "Agent belongs to a different machine.");
        }
        check_url("download_url", download_url, &["https://"], &mut errs);
        check_url("control_url", control_url, &["http://", "https://"], &mut errs);
        errs.finish(())?;

        let vars = BTreeMap::from([
            ("CONTROL_URL".to_string(), control_url.to_string()),
            ("AGENT_ID".to_string(), agent_id.to_string()),
            ("BINARY".to_string(), AGENT_BINARY.to_string()),
        ]);
        let unit = substitute(AGENT_UNIT_TEMPLATE, &vars).map_err(ProvisionError::Render)?;

        agent.status = AgentStatus::Updating;
        store.update_agent(&agent).await?;

        let conn = Connection::for_machine(&machine);
        let settings = self.provisioner.settings();
        let exec = self.provisioner.executor();
        let partial = format!("{AGENT_BINARY}.part");
        let fetch = RemoteScript::new()
            .then(
                RemoteCommand::new("curl")
                    .args(["-fsSL", "--retry", "3", "-o", partial.as_str(), download_url])
                    .sudo(),
            )
            .then(RemoteCommand::new("chmod").args(["0755", partial.as_str()]).sudo())
            .then(RemoteCommand::new("mv").args(["-f", partial.as_str(), AGENT_BINARY]).sudo());

        let res = async {
            exec.execute(&conn, &fetch, settings.install_timeout)
                .await?
                .check("download agent")?;
            exec.upload(&conn, AGENT_UNIT_PATH, unit.as_bytes(), "0644", settings.command_timeout)
                .await?;
            let enable = RemoteScript::new()
                .then(RemoteCommand::new("systemctl").arg("daemon-reload").sudo())
                .then(
                    RemoteCommand::new("systemctl")
                        .args(["enable", "--now", "ember-agent.service"])
                        .sudo(),
                )
                .then(
                    RemoteCommand::new("systemctl")
                        .args(["restart", "ember-agent.service"])
                        .sudo(),
                );
            exec.execute(&conn, &enable, settings.command_timeout)
                .await?
                .check("enable agent")?;
            Ok::<_, ProvisionError>(())
        }
        .await;

        if let Err(e) = res {
            agent.status = AgentStatus::Error;
            agent.last_error = Some(e.to_string());
            store.update_agent(&agent).await?;
            return Err(e);
        }
        tracing::info!(%machine_id, %agent_id, host = %machine.address, "agent installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_core::TaskType;

    use super::*;
    use crate::{
        config::CleanupPolicy,
        installer::ProvisionerSettings,
        notifier::recording::RecordingNotifier,
        ports::PortAllocator,
        store::{MemoryStore, Store},
        testing::{FakeExecutor, agent, machine, minecraft_config, server},
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        exec: Arc<FakeExecutor>,
        lifecycle: Lifecycle,
        server_id: Uuid,
        machine_id: Uuid,
    }

    async fn fixture(installed: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let m = machine();
        store.insert_machine(&m).await.unwrap();
        let mut srv = server(m.id, minecraft_config());
        if installed {
            srv.install_state = InstallState::Installed;
            srv.status = ServerStatus::Online;
        }
        store.insert_server(&srv).await.unwrap();

        let exec = FakeExecutor::new();
        let ports = Arc::new(PortAllocator::new(
            store.clone(),
            exec.clone(),
            50,
            Duration::from_secs(1),
        ));
        if installed {
            // Allocate through a separate executor so probes stay out of the log.
            PortAllocator::new(store.clone(), FakeExecutor::new(), 50, Duration::from_secs(1))
                .allocate(m.id, srv.id, srv.game, None)
                .await
                .unwrap();
        }
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            exec.clone(),
            ports,
            Arc::new(RecordingNotifier::default()),
            ProvisionerSettings {
                remote_root: "/srv/ember".into(),
                command_timeout: Duration::from_secs(5),
                install_timeout: Duration::from_secs(5),
                health_attempts: 1,
                health_interval: Duration::ZERO,
                cleanup_policy: CleanupPolicy::Warn,
            },
        ));
        Fixture {
            store,
            exec,
            lifecycle: Lifecycle::new(provisioner),
            server_id: srv.id,
            machine_id: m.id,
        }
    }

    #[tokio::test]
    async fn stop_then_start_round_trips_status() {
        let f = fixture(true).await;
        assert_eq!(f.lifecycle.stop(f.server_id).await.unwrap(), ServerStatus::Offline);
        assert_eq!(f.lifecycle.start(f.server_id).await.unwrap(), ServerStatus::Online);
        let cmds = f.exec.commands();
        assert!(cmds[0].starts_with("sudo -n systemctl stop ember-"));
        assert!(cmds[1].starts_with("sudo -n systemctl start ember-"));
    }

    #[tokio::test]
    async fn failed_start_marks_server_errored() {
        let f = fixture(true).await;
        f.exec.fail("systemctl start", 1, "Job failed");
        let err = f.lifecycle.start(f.server_id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteExecution { exit_code: 1, .. }));
        let srv = f.store.get_server(f.server_id).await.unwrap();
        assert_eq!(srv.status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn lifecycle_requires_installed_server() {
        let f = fixture(false).await;
        let err = f.lifecycle.start(f.server_id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
        assert!(f.exec.commands().is_empty());
    }

    #[tokio::test]
    async fn update_stops_runs_script_and_starts() {
        let f = fixture(true).await;
        let status = f.lifecycle.update(f.server_id).await.unwrap();
        assert_eq!(status, ServerStatus::Online);
        let stop = f.exec.position("systemctl stop").unwrap();
        let fetch = f.exec.position("curl -fsSL").unwrap();
        let start = f.exec.position("systemctl start").unwrap();
        assert!(stop < fetch && fetch < start);
    }

    #[tokio::test]
    async fn backup_archives_data_dir() {
        let f = fixture(true).await;
        let info = f.lifecycle.backup(f.server_id, Some("nightly")).await.unwrap();
        assert_eq!(
            info.path,
            format!("/srv/ember/backups/{}/nightly.tar.gz", f.server_id)
        );
        let tar = &f.exec.commands()[0];
        assert!(tar.contains("tar -czf"));
        assert!(tar.contains(&format!("-C /srv/ember/instances/{}/data .", f.server_id)));

        let err = f.lifecycle.backup(f.server_id, Some("../etc")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_releases_ports_and_row() {
        let f = fixture(true).await;
        f.exec.fail("rm -rf /srv/ember/instances", 1, "busy");
        let warnings = f.lifecycle.delete(f.server_id).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step, "remove instance directory");
        assert!(
            f.exec
                .position(&format!("rm -rf /srv/ember/backups/{}", f.server_id))
                .is_some()
        );
        assert!(f.store.get_server(f.server_id).await.is_err());
        assert!(f.store.get_port_allocation(f.server_id).await.unwrap().is_none());
        assert!(f.store.list_port_allocations(f.machine_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_agent_uploads_unit_and_enables_it() {
        let f = fixture(false).await;
        let a = agent(f.machine_id);
        f.store.insert_agent(&a).await.unwrap();
        let task = Task {
            id: Uuid::new_v4(),
            task_type: TaskType::InstallAgent,
            status: ember_core::TaskStatus::Running,
            agent_id: Some(a.id),
            server_id: None,
            command: TaskCommand::InstallAgent {
                machine_id: f.machine_id,
                agent_id: a.id,
                download_url: "https://downloads.example/ember-agent".into(),
                control_url: "https://control.example".into(),
            },
            result: None,
            error: None,
            attempts: 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        f.lifecycle.run(&task, &CancellationToken::new()).await.unwrap();

        let unit = f
            .exec
            .calls()
            .into_iter()
            .find(|c| c.command.contains("tee /etc/systemd/system/ember-agent.service"))
            .and_then(|c| c.stdin)
            .unwrap();
        let unit = String::from_utf8(unit).unwrap();
        assert!(unit.contains(&format!("Environment=EMBER_AGENT_ID={}", a.id)));
        assert!(unit.contains("Environment=EMBER_CONTROL_URL=https://control.example\n"));
        assert!(f.exec.position("enable --now ember-agent.service").is_some());
        assert_eq!(
            f.store.get_agent(a.id).await.unwrap().status,
            AgentStatus::Updating
        );
    }

    #[tokio::test]
    async fn install_agent_rejects_plain_http_download() {
        let f = fixture(false).await;
        let a = agent(f.machine_id);
        f.store.insert_agent(&a).await.unwrap();
        let err = f
            .lifecycle
            .install_agent(f.machine_id, a.id, "http://insecure/agent", "ftp://x")
            .await
            .unwrap_err();
        let ProvisionError::Validation(errs) = err else {
            panic!("expected validation error");
        };
        assert!(errs.get("download_url").is_some());
        assert!(errs.get("control_url").is_some());
        assert!(f.exec.commands().is_empty());
    }
}
