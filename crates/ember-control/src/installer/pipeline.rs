use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use ember_core::{InstallState, Machine, PortAllocation, Server, ServerStatus, ValidationErrors};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    cluster,
    config::{CleanupPolicy, ControlConfig},
    error::{PartialCleanupWarning, ProvisionError},
    executor::{Connection, RemoteExecutor},
    notifier::{Event, EventKind, Notifier},
    ports::PortAllocator,
    progress::ProgressTracker,
    shell::{RemoteCommand, RemoteScript, ensure_safe_path},
    store::Store,
};

use super::{GameInstaller, InstallContext, InstancePaths, RenderedArtifacts, installer_for};

pub const INSTALL_STEPS: [&str; 8] = [
    "validate configuration",
    "allocate ports",
    "prepare remote directories",
    "install game files",
    "render service configuration",
    "apply service configuration",
    "start service",
    "health check",
];

const TOTAL_STEPS: u32 = INSTALL_STEPS.len() as u32;

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub remote_root: String,
    pub command_timeout: Duration,
    pub install_timeout: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub cleanup_policy: CleanupPolicy,
}

impl From<&ControlConfig> for ProvisionerSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            remote_root: cfg.remote_root.clone(),
            command_timeout: cfg.command_timeout,
            install_timeout: cfg.install_timeout,
            health_attempts: cfg.health_attempts,
            health_interval: cfg.health_interval,
            cleanup_policy: cfg.cleanup_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub server_id: Uuid,
    pub kind: &'static str,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

struct JobEntry {
    handle: JobHandle,
    join: Option<JoinHandle<()>>,
    finished: bool,
}

/// Background install jobs, at most one running per server.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    fn register(&self, server_id: Uuid, kind: &'static str) -> Result<JobHandle, ProvisionError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&server_id)
            && !existing.finished
        {
            return Err(ProvisionError::ResourceConflict(format!(
                "server {server_id} already has a running {} job",
                existing.handle.kind
            )));
        }
        let handle = JobHandle {
            id: Uuid::new_v4(),
            server_id,
            kind,
            cancel: CancellationToken::new(),
        };
        map.insert(
            server_id,
            JobEntry {
                handle: handle.clone(),
                join: None,
                finished: false,
            },
        );
        Ok(handle)
    }

    fn attach(&self, handle: &JobHandle, join: JoinHandle<()>) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&handle.server_id)
            && entry.handle.id == handle.id
        {
            entry.join = Some(join);
        }
    }

    fn finish(&self, handle: &JobHandle) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&handle.server_id)
            && entry.handle.id == handle.id
        {
            entry.finished = true;
        }
    }

    pub fn state(&self, server_id: Uuid) -> Option<(JobHandle, JobState)> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&server_id).map(|e| {
            let state = if e.finished {
                JobState::Finished
            } else {
                JobState::Running
            };
            (e.handle.clone(), state)
        })
    }

    /// Requests cancellation; the job stops before its next step.
    pub fn cancel(&self, server_id: Uuid) -> bool {
        match self.state(server_id) {
            Some((handle, JobState::Running)) => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits for the server's current job to finish.
    pub async fn wait(&self, server_id: Uuid) {
        let join = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.get_mut(&server_id).and_then(|e| e.join.take())
        };
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// A server with everything needed to act on it remotely.
pub(crate) struct Target {
    pub server: Server,
    pub machine: Machine,
    pub conn: Connection,
    pub paths: InstancePaths,
    pub cluster_dir: Option<String>,
    pub installer: Arc<dyn GameInstaller>,
}

impl Target {
    pub fn context<'a>(&'a self, ports: &'a PortAllocation) -> InstallContext<'a> {
        InstallContext {
            server: &self.server,
            ports,
            paths: self.paths.clone(),
            run_as: self.machine.ssh_user.clone(),
            cluster_dir: self.cluster_dir.clone(),
        }
    }
}

pub struct Provisioner {
    store: Arc<dyn Store>,
    executor: Arc<dyn RemoteExecutor>,
    ports: Arc<PortAllocator>,
    progress: ProgressTracker,
    notifier: Arc<dyn Notifier>,
    settings: ProvisionerSettings,
    jobs: JobRegistry,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn RemoteExecutor>,
        ports: Arc<PortAllocator>,
        notifier: Arc<dyn Notifier>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            progress: ProgressTracker::new(store.clone()),
            store,
            executor,
            ports,
            notifier,
            settings,
            jobs: JobRegistry::default(),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub(crate) fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub(crate) fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    pub(crate) async fn target(&self, server_id: Uuid) -> Result<Target, ProvisionError> {
        let server = self.store.get_server(server_id).await?;
        let machine = self.store.get_machine(server.machine_id).await?;
        let (base, cluster_dir) = match server.cluster_id {
            Some(cluster_id) => {
                let c = self.store.get_cluster(cluster_id).await?;
                let shared = cluster::shared_root(&self.settings.remote_root, c.owner_id, c.machine_id);
                (shared.clone(), Some(format!("{shared}/transfer")))
            }
            None => (self.settings.remote_root.clone(), None),
        };
        Ok(Target {
            paths: InstancePaths::new(&base, server.id),
            conn: Connection::for_machine(&machine),
            installer: installer_for(server.game),
            server,
            machine,
            cluster_dir,
        })
    }

    /// Persists a lifecycle status change and emits `server.status_changed`.
    pub(crate) async fn set_status(
        &self,
        server: &mut Server,
        status: ServerStatus,
    ) -> Result<(), ProvisionError> {
        if server.status == status {
            return Ok(());
        }
        let from = server.status;
        server.status = status;
        server.updated_at = Utc::now();
        self.store.update_server(server).await?;
        self.notifier
            .notify(Event::new(
                EventKind::ServerStatusChanged,
                Some(server.id),
                serde_json::json!({ "from": from, "to": status }),
            ))
            .await;
        Ok(())
    }

    async fn set_install_state(
        &self,
        server: &mut Server,
        state: InstallState,
    ) -> Result<(), ProvisionError> {
        server.install_state = state;
        server.updated_at = Utc::now();
        self.store.update_server(server).await?;
        Ok(())
    }

    pub fn spawn_install(
        self: &Arc<Self>,
        server_id: Uuid,
        preferred_base: Option<u16>,
    ) -> Result<JobHandle, ProvisionError> {
        let handle = self.jobs.register(server_id, "install")?;
        let this = self.clone();
        let token = handle.cancel.clone();
        let job = handle.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = this.install(server_id, preferred_base, &token).await {
                tracing::warn!(%server_id, error = %e, "install job failed");
            }
            this.jobs.finish(&job);
        });
        self.jobs.attach(&handle, join);
        Ok(handle)
    }

    pub fn spawn_reinstall(self: &Arc<Self>, server_id: Uuid) -> Result<JobHandle, ProvisionError> {
        let handle = self.jobs.register(server_id, "reinstall")?;
        let this = self.clone();
        let token = handle.cancel.clone();
        let job = handle.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = this.reinstall(server_id, &token).await {
                tracing::warn!(%server_id, error = %e, "reinstall job failed");
            }
            this.jobs.finish(&job);
        });
        self.jobs.attach(&handle, join);
        Ok(handle)
    }

    /// Runs the full pipeline for a server that is not installed yet.
    pub async fn install(
        &self,
        server_id: Uuid,
        preferred_base: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<Server, ProvisionError> {
        let mut target = self.target(server_id).await?;
        match target.server.install_state {
            InstallState::NotInstalled | InstallState::Error => {}
            other => {
                return Err(ProvisionError::InvalidTransition {
                    entity: "server",
                    from: other.to_string(),
                    to: InstallState::Installing.to_string(),
                });
            }
        }

        tracing::info!(%server_id, game = %target.server.game, machine = %target.machine.name, "install started");
        self.progress.begin(server_id, TOTAL_STEPS, "installation started").await?;
        self.set_install_state(&mut target.server, InstallState::Installing).await?;
        self.set_status(&mut target.server, ServerStatus::Provisioning).await?;
        self.run_steps(target, preferred_base, cancel).await
    }

    /// Resets progress, tears down the previous deployment and installs from
    /// step 1 again. The port allocation survives.
    pub async fn reinstall(
        &self,
        server_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Server, ProvisionError> {
        let mut target = self.target(server_id).await?;
        if target.server.install_state == InstallState::Installing {
            return Err(ProvisionError::InvalidTransition {
                entity: "server",
                from: InstallState::Installing.to_string(),
                to: InstallState::Installing.to_string(),
            });
        }

        tracing::info!(%server_id, game = %target.server.game, "reinstall started");
        self.progress.begin(server_id, TOTAL_STEPS, "reinstall started").await?;
        self.set_install_state(&mut target.server, InstallState::Installing).await?;
        self.set_status(&mut target.server, ServerStatus::Provisioning).await?;

        let warnings = self.cleanup(&target).await;
        for w in &warnings {
            self.progress.warn(server_id, &w.to_string()).await?;
        }
        if let (CleanupPolicy::Abort, Some(first)) = (self.settings.cleanup_policy, warnings.first()) {
            let err = ProvisionError::remote(
                format!("cleanup: {}", first.step),
                -1,
                &first.message,
            );
            self.fail(&mut target.server, 0, &err).await;
            return Err(err);
        }

        self.run_steps(target, None, cancel).await
    }

    /// Stops and removes the deployed service and instance directory. Every
    /// step runs even when an earlier one fails; failures come back as
    /// warnings.
    pub(crate) async fn cleanup(&self, target: &Target) -> Vec<PartialCleanupWarning> {
        let unit = target.paths.unit_name.as_str();
        let timeout = self.settings.command_timeout;
        let mut warnings = Vec::new();

        // A unit that is not running exits non-zero; that is fine.
        let stop = RemoteCommand::new("systemctl").args(["stop", unit]).sudo();
        if let Err(e) = self.executor.execute(&target.conn, &stop.into(), timeout).await {
            warnings.push(PartialCleanupWarning {
                step: "stop service".to_string(),
                message: e.to_string(),
            });
        }

        let steps: [(&str, RemoteScript); 4] = [
            (
                "disable service",
                RemoteCommand::new("systemctl").args(["disable", unit]).sudo().into(),
            ),
            (
                "remove unit file",
                RemoteCommand::new("rm").args(["-f", &target.paths.unit_path]).sudo().into(),
            ),
            (
                "reload systemd",
                RemoteCommand::new("systemctl").arg("daemon-reload").sudo().into(),
            ),
            (
                "remove instance directory",
                RemoteCommand::new("rm").args(["-rf", &target.paths.root]).sudo().into(),
            ),
        ];
        for (step, script) in steps {
            let res = self
                .executor
                .execute(&target.conn, &script, timeout)
                .await
                .and_then(|out| out.check(step));
            if let Err(e) = res {
                warnings.push(PartialCleanupWarning {
                    step: step.to_string(),
                    message: e.to_string(),
                });
            }
        }

        for w in &warnings {
            tracing::warn!(server_id = %target.server.id, step = %w.step, message = %w.message, "partial cleanup");
        }
        warnings
    }

    async fn run_steps(
        &self,
        target: Target,
        preferred_base: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<Server, ProvisionError> {
        let server_id = target.server.id;
        let mut run = Run {
            p: self,
            target,
            preferred_base,
            allocation: None,
            artifacts: None,
            cancel,
        };

        for (idx, name) in INSTALL_STEPS.iter().enumerate() {
            let step = idx as u32 + 1;
            let outcome = async {
                if cancel.is_cancelled() {
                    return Err(ProvisionError::Cancelled);
                }
                self.progress
                    .step_started(server_id, step, TOTAL_STEPS, name)
                    .await?;
                run.step(step).await?;
                self.progress
                    .step_completed(server_id, step, TOTAL_STEPS, name)
                    .await
            }
            .await;

            if let Err(err) = outcome {
                tracing::warn!(%server_id, step, step_name = name, error = %err, "install step failed");
                self.fail(&mut run.target.server, step, &err).await;
                return Err(err);
            }
        }

        let mut server = run.target.server;
        server.port = run.allocation.as_ref().and_then(PortAllocation::game_port);
        self.set_install_state(&mut server, InstallState::Installed).await?;
        self.set_status(&mut server, ServerStatus::Online).await?;
        self.progress
            .complete(server_id, TOTAL_STEPS, "installation completed")
            .await?;
        tracing::info!(%server_id, port = ?server.port, "install completed");
        self.notifier
            .notify(Event::new(
                EventKind::InstallCompleted,
                Some(server_id),
                serde_json::json!({ "ports": run.allocation.map(|a| a.ports) }),
            ))
            .await;
        Ok(server)
    }

    /// Records a failure at `step`. Store errors here are logged only; the
    /// original error is what the caller sees.
    async fn fail(&self, server: &mut Server, step: u32, err: &ProvisionError) {
        let message = err.to_string();
        if let Err(e) = self.progress.fail(server.id, step, TOTAL_STEPS, &message).await {
            tracing::error!(server_id = %server.id, error = %e, "could not record install failure");
        }
        server.install_state = InstallState::Error;
        if let Err(e) = self.set_status(server, ServerStatus::Error).await {
            tracing::error!(server_id = %server.id, error = %e, "could not mark server as errored");
        }
        self.notifier
            .notify(Event::new(
                EventKind::InstallFailed,
                Some(server.id),
                serde_json::json!({ "step": step, "code": err.code(), "error": message }),
            ))
            .await;
    }
}

/// State threaded through one pipeline run.
struct Run<'a> {
    p: &'a Provisioner,
    target: Target,
    preferred_base: Option<u16>,
    allocation: Option<PortAllocation>,
    artifacts: Option<RenderedArtifacts>,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn allocation(&self) -> Result<&PortAllocation, ProvisionError> {
        self.allocation
            .as_ref()
            .ok_or_else(|| ProvisionError::not_found("port allocation", self.target.server.id))
    }

    async fn step(&mut self, step: u32) -> Result<(), ProvisionError> {
        let settings = &self.p.settings;
        let conn = &self.target.conn;
        let paths = &self.target.paths;
        match step {
            1 => {
                self.target.installer.validate_config(&self.target.server)?;
                if let Err(msg) = ensure_safe_path(&paths.root) {
                    let mut errs = ValidationErrors::new();
                    errs.add("remote_root", msg);
                    return Err(errs.into());
                }
                Ok(())
            }
            2 => {
                let allocation = self
                    .p
                    .ports
                    .allocate(
                        self.target.machine.id,
                        self.target.server.id,
                        self.target.server.game,
                        self.preferred_base,
                    )
                    .await?;
                self.target.server.port = allocation.game_port();
                self.target.server.updated_at = Utc::now();
                self.p.store.update_server(&self.target.server).await?;
                self.allocation = Some(allocation);
                Ok(())
            }
            3 => {
                let owner = format!("{}:", self.target.machine.ssh_user);
                let script = RemoteScript::new()
                    .then(
                        RemoteCommand::new("mkdir")
                            .args(["-p", &paths.install_dir, &paths.data_dir, &paths.backups_dir])
                            .sudo(),
                    )
                    .then(
                        RemoteCommand::new("chown")
                            .args(["-R", &owner, &paths.root, &paths.backups_dir])
                            .sudo(),
                    );
                self.p
                    .executor
                    .execute(conn, &script, settings.command_timeout)
                    .await?
                    .check(INSTALL_STEPS[2])?;
                Ok(())
            }
            4 => {
                let ctx = self.target.context(self.allocation()?);
                let script = self.target.installer.install_script(&ctx);
                let out = self
                    .p
                    .executor
                    .execute(conn, &script, settings.install_timeout)
                    .await?
                    .check(INSTALL_STEPS[3])?;
                if !out.stdout.trim().is_empty() {
                    self.p
                        .progress
                        .log(self.target.server.id, &crate::error::tail(&out.stdout, 2048))
                        .await?;
                }
                Ok(())
            }
            5 => {
                let ctx = self.target.context(self.allocation()?);
                self.artifacts = Some(self.target.installer.render(&ctx)?);
                Ok(())
            }
            6 => {
                let artifacts = self
                    .artifacts
                    .as_ref()
                    .ok_or_else(|| ProvisionError::Render("nothing rendered".to_string()))?;
                for file in &artifacts.files {
                    self.p
                        .executor
                        .upload(conn, &file.path, file.contents.as_bytes(), file.mode, settings.command_timeout)
                        .await?;
                }
                self.p
                    .executor
                    .upload(
                        conn,
                        &artifacts.unit.path,
                        artifacts.unit.contents.as_bytes(),
                        artifacts.unit.mode,
                        settings.command_timeout,
                    )
                    .await?;
                let owner = format!("{}:", self.target.machine.ssh_user);
                let script = RemoteScript::new()
                    .then(RemoteCommand::new("chown").args(["-R", &owner, &paths.root]).sudo())
                    .then(RemoteCommand::new("systemctl").arg("daemon-reload").sudo())
                    .then(RemoteCommand::new("systemctl").args(["enable", &paths.unit_name]).sudo());
                self.p
                    .executor
                    .execute(conn, &script, settings.command_timeout)
                    .await?
                    .check(INSTALL_STEPS[5])?;
                Ok(())
            }
            7 => {
                let p = self.p;
                p.set_status(&mut self.target.server, ServerStatus::Starting).await?;
                let start = RemoteCommand::new("systemctl")
                    .args(["restart", &self.target.paths.unit_name])
                    .sudo();
                p.executor
                    .execute(&self.target.conn, &start.into(), settings.command_timeout)
                    .await?
                    .check(INSTALL_STEPS[6])?;
                Ok(())
            }
            8 => self.health_check().await,
            _ => Ok(()),
        }
    }

    async fn health_check(&mut self) -> Result<(), ProvisionError> {
        let settings = &self.p.settings;
        let probe = {
            let ctx = self.target.context(self.allocation()?);
            self.target.installer.readiness_probe(&ctx)?
        };
        let attempts = settings.health_attempts.max(1);
        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            match self
                .p
                .executor
                .execute(&self.target.conn, &probe, settings.command_timeout)
                .await
            {
                Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                    tracing::debug!(server_id = %self.target.server.id, attempt, "server is ready");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(server_id = %self.target.server.id, attempt, error = %e, "readiness probe failed");
                }
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ProvisionError::Cancelled),
                    _ = tokio::time::sleep(settings.health_interval) => {}
                }
            }
        }

        let is_active = RemoteCommand::new("systemctl").args(["is-active", &self.target.paths.unit_name]);
        let out = self
            .p
            .executor
            .execute(&self.target.conn, &is_active.into(), settings.command_timeout)
            .await?;
        if out.success() {
            self.p
                .progress
                .warn(
                    self.target.server.id,
                    &format!("game port not ready after {attempts} probes, but the service is running"),
                )
                .await?;
            return Ok(());
        }
        Err(ProvisionError::remote(
            INSTALL_STEPS[7],
            out.exit_code,
            format!("service is not running ({})", out.stdout.trim()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_core::{GameKind, PortRole};

    use super::*;
    use crate::{
        notifier::recording::RecordingNotifier,
        store::MemoryStore,
        testing::{FakeExecutor, machine, minecraft_config, server},
    };

    struct Harness {
        store: Arc<MemoryStore>,
        exec: Arc<FakeExecutor>,
        notifier: Arc<RecordingNotifier>,
        provisioner: Arc<Provisioner>,
        server: Server,
    }

    fn settings(policy: CleanupPolicy) -> ProvisionerSettings {
        ProvisionerSettings {
            remote_root: "/srv/ember".to_string(),
            command_timeout: Duration::from_secs(5),
            install_timeout: Duration::from_secs(5),
            health_attempts: 2,
            health_interval: Duration::from_millis(1),
            cleanup_policy: policy,
        }
    }

    async fn harness(policy: CleanupPolicy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let m = machine();
        store.insert_machine(&m).await.unwrap();
        let srv = server(m.id, minecraft_config());
        store.insert_server(&srv).await.unwrap();

        let exec = FakeExecutor::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let ports = Arc::new(PortAllocator::new(
            store.clone(),
            exec.clone(),
            200,
            Duration::from_secs(1),
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            exec.clone(),
            ports,
            notifier.clone(),
            settings(policy),
        ));
        Harness {
            store,
            exec,
            notifier,
            provisioner,
            server: srv,
        }
    }

    #[tokio::test]
    async fn install_runs_all_steps_in_order() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.service_ready();
        let token = CancellationToken::new();
        let srv = h.provisioner.install(h.server.id, None, &token).await.unwrap();

        assert_eq!(srv.install_state, InstallState::Installed);
        assert_eq!(srv.status, ServerStatus::Online);
        assert_eq!(srv.port, Some(25565));

        let p = h.provisioner.progress().snapshot(srv.id).await.unwrap();
        assert_eq!(p.status, InstallState::Installed);
        assert_eq!((p.current_step, p.total_steps, p.progress), (8, 8, 100));

        let mkdir = h.exec.position("mkdir -p").unwrap();
        let curl = h.exec.position("curl -fsSL").unwrap();
        let unit = h.exec.position("tee /etc/systemd/system/ember-").unwrap();
        let enable = h.exec.position("systemctl enable").unwrap();
        let restart = h.exec.position("systemctl restart").unwrap();
        let probe = h.exec.position("ss -Hlntup").unwrap();
        assert!(mkdir < curl && curl < unit && unit < enable && enable < restart && restart < probe);

        let uploaded = h
            .exec
            .calls()
            .into_iter()
            .find(|c| c.command.contains("server.properties"))
            .and_then(|c| c.stdin)
            .unwrap();
        assert!(String::from_utf8(uploaded).unwrap().contains("server-port=25565"));
        assert!(h.notifier.kinds().contains(&EventKind::InstallCompleted));
    }

    #[tokio::test]
    async fn timeout_at_step_three_marks_everything_errored() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.timeout_on("mkdir -p");
        let token = CancellationToken::new();
        let err = h
            .provisioner
            .install(h.server.id, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));

        let p = h.provisioner.progress().snapshot(h.server.id).await.unwrap();
        assert_eq!(p.status, InstallState::Error);
        assert_eq!(p.current_step, 3);
        assert_eq!(p.total_steps, 8);
        assert!(p.error.unwrap().contains("timed out"));

        let srv = h.store.get_server(h.server.id).await.unwrap();
        assert_eq!(srv.status, ServerStatus::Error);
        assert_eq!(srv.install_state, InstallState::Error);
        assert!(h.notifier.kinds().contains(&EventKind::InstallFailed));
        // No rollback: the allocation from step 2 stays.
        assert!(h.store.get_port_allocation(h.server.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_config_fails_at_step_one_with_field_errors() {
        let h = harness(CleanupPolicy::Warn).await;
        let mut srv = h.server.clone();
        srv.max_players = 0;
        h.store.update_server(&srv).await.unwrap();

        let err = h
            .provisioner
            .install(srv.id, None, &CancellationToken::new())
            .await
            .unwrap_err();
        let ProvisionError::Validation(errs) = err else {
            panic!("expected validation error");
        };
        assert!(errs.get("max_players").is_some());
        let p = h.provisioner.progress().snapshot(srv.id).await.unwrap();
        assert_eq!(p.current_step, 1);
        assert!(h.exec.commands().is_empty());
    }

    #[tokio::test]
    async fn reinstall_while_online_stops_first_and_ignores_stop_exit() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.service_ready();
        let token = CancellationToken::new();
        let installed = h.provisioner.install(h.server.id, None, &token).await.unwrap();
        assert_eq!(installed.status, ServerStatus::Online);
        let ports_before = h.store.get_port_allocation(h.server.id).await.unwrap();

        let before = h.exec.commands().len();
        h.exec.fail("systemctl stop", 5, "Unit not loaded");
        let srv = h.provisioner.reinstall(h.server.id, &token).await.unwrap();
        assert_eq!(srv.install_state, InstallState::Installed);

        let cmds = h.exec.commands()[before..].to_vec();
        let at = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        assert_eq!(at("systemctl stop"), 0);
        assert!(at("systemctl stop") < at("systemctl disable"));
        assert!(at("systemctl disable") < at("rm -rf"));
        assert!(at("rm -rf") < at("mkdir -p"));

        let ports_after = h.store.get_port_allocation(h.server.id).await.unwrap();
        assert_eq!(ports_before, ports_after);

        let log = h.provisioner.progress().read_log(h.server.id, 0, 1000).await.unwrap();
        assert!(log.iter().any(|l| l.line.ends_with("reinstall started")));
        assert!(!log.iter().any(|l| l.line.contains("WARN: cleanup step 'stop service'")));
    }

    #[tokio::test]
    async fn reinstall_keeps_backups() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.service_ready();
        let token = CancellationToken::new();
        h.provisioner.install(h.server.id, None, &token).await.unwrap();
        let target = h.provisioner.target(h.server.id).await.unwrap();
        let backups = target.paths.backups_dir.clone();
        assert_eq!(backups, format!("/srv/ember/backups/{}", h.server.id));

        let before = h.exec.commands().len();
        h.provisioner.reinstall(h.server.id, &token).await.unwrap();
        let removals: Vec<_> = h.exec.commands()[before..]
            .iter()
            .filter(|c| c.contains("rm -rf"))
            .cloned()
            .collect();
        assert_eq!(removals.len(), 1);
        assert!(removals[0].contains(&target.paths.root));
        assert!(!removals[0].contains(&backups));
    }

    #[tokio::test]
    async fn reinstall_resets_progress_to_step_zero() {
        let h = harness(CleanupPolicy::Abort).await;
        h.exec.service_ready();
        let token = CancellationToken::new();
        h.provisioner.install(h.server.id, None, &token).await.unwrap();

        h.exec.fail("systemctl disable", 1, "permission denied");
        let err = h.provisioner.reinstall(h.server.id, &token).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteExecution { .. }));

        let p = h.provisioner.progress().snapshot(h.server.id).await.unwrap();
        assert_eq!(p.status, InstallState::Error);
        assert_eq!(p.current_step, 0);
        assert_eq!(p.progress, 0);
        assert!(h.exec.position("curl -fsSL").is_some());
        assert_eq!(
            h.exec.commands().iter().filter(|c| c.contains("curl -fsSL")).count(),
            1,
            "aborted reinstall must not reach the install step"
        );
    }

    #[tokio::test]
    async fn running_service_without_bound_port_succeeds_with_warning() {
        let h = harness(CleanupPolicy::Warn).await;
        let srv = h
            .provisioner
            .install(h.server.id, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(srv.install_state, InstallState::Installed);
        let log = h.provisioner.progress().read_log(srv.id, 0, 1000).await.unwrap();
        assert!(log.iter().any(|l| l.line.contains("WARN: game port not ready")));
    }

    #[tokio::test]
    async fn dead_service_fails_health_check() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.reply("systemctl is-active", 3, "failed");
        let err = h
            .provisioner
            .install(h.server.id, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteExecution { exit_code: 3, .. }));
        let p = h.provisioner.progress().snapshot(h.server.id).await.unwrap();
        assert_eq!(p.current_step, 8);
    }

    #[tokio::test]
    async fn installed_server_rejects_plain_install() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.service_ready();
        let token = CancellationToken::new();
        h.provisioner.install(h.server.id, None, &token).await.unwrap();
        let err = h.provisioner.install(h.server.id, None, &token).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancelled_job_stops_before_next_step() {
        let h = harness(CleanupPolicy::Warn).await;
        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .provisioner
            .install(h.server.id, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
        assert!(h.exec.commands().is_empty());
        let p = h.provisioner.progress().snapshot(h.server.id).await.unwrap();
        assert_eq!((p.status, p.current_step), (InstallState::Error, 1));
    }

    #[tokio::test]
    async fn spawned_jobs_are_tracked_per_server() {
        let h = harness(CleanupPolicy::Warn).await;
        h.exec.service_ready();
        let handle = h.provisioner.spawn_install(h.server.id, Some(25600)).unwrap();
        assert_eq!(handle.kind, "install");
        h.provisioner.jobs().wait(h.server.id).await;
        let (_, state) = h.provisioner.jobs().state(h.server.id).unwrap();
        assert_eq!(state, JobState::Finished);

        let alloc = h.store.get_port_allocation(h.server.id).await.unwrap().unwrap();
        assert_eq!(alloc.ports[&PortRole::Game], 25600);
        assert_eq!(h.server.game, GameKind::Minecraft);

        // A finished job does not block the next one.
        h.provisioner.spawn_reinstall(h.server.id).unwrap();
        h.provisioner.jobs().wait(h.server.id).await;
        assert!(!h.provisioner.jobs().cancel(h.server.id));
    }
}
