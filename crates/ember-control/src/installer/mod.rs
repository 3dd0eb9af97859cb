//! Per-game installers and the pipeline that drives them.

mod games;
mod pipeline;
pub mod service_unit;

use std::sync::Arc;

use ember_core::{GameKind, PortAllocation, PortRole, Server, ValidationErrors};
use uuid::Uuid;

use crate::{
    error::ProvisionError,
    shell::{RemoteCommand, RemoteScript},
};

pub use games::{ArkAscendedInstaller, DstInstaller, MinecraftInstaller, TerrariaInstaller};
pub(crate) use pipeline::Target;
pub use pipeline::{
    INSTALL_STEPS, JobHandle, JobRegistry, JobState, Provisioner, ProvisionerSettings,
};

/// Remote layout of one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub root: String,
    pub install_dir: String,
    pub data_dir: String,
    /// Outside `root`, so cleanup on reinstall leaves backups alone.
    pub backups_dir: String,
    pub unit_name: String,
    pub unit_path: String,
}

impl InstancePaths {
    /// `base` is the directory holding `instances/`: the remote root for a
    /// standalone server, the cluster's shared root for a member.
    pub fn new(base: &str, server_id: Uuid) -> Self {
        let base = base.trim_end_matches('/');
        let root = format!("{base}/instances/{server_id}");
        let unit_name = unit_name(server_id);
        Self {
            install_dir: format!("{root}/game"),
            data_dir: format!("{root}/data"),
            backups_dir: format!("{base}/backups/{server_id}"),
            unit_path: format!("/etc/systemd/system/{unit_name}"),
            unit_name,
            root,
        }
    }
}

pub fn unit_name(server_id: Uuid) -> String {
    format!("ember-{server_id}.service")
}

/// Everything an installer needs to render and script one server.
#[derive(Debug, Clone)]
pub struct InstallContext<'a> {
    pub server: &'a Server,
    pub ports: &'a PortAllocation,
    pub paths: InstancePaths,
    /// Account the service runs as.
    pub run_as: String,
    /// Shared cross-instance transfer directory for cluster members.
    pub cluster_dir: Option<String>,
}

impl InstallContext<'_> {
    pub fn port(&self, role: PortRole) -> Result<u16, ProvisionError> {
        self.ports.ports.get(&role).copied().ok_or_else(|| {
            ProvisionError::ResourceConflict(format!(
                "allocation for server {} has no {role} port",
                self.server.id
            ))
        })
    }
}

/// How the service is launched. Strings may use the unit placeholders
/// (`{{INSTALL_DIR}}`, `{{PORT_GAME}}`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Launch {
    pub exec_start: String,
    pub exec_stop: Option<String>,
    pub environment: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: String,
    pub contents: String,
    pub mode: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    pub unit: RenderedFile,
    pub files: Vec<RenderedFile>,
}

pub trait GameInstaller: Send + Sync {
    fn kind(&self) -> GameKind;

    /// Reports every violation, not just the first.
    fn validate_config(&self, server: &Server) -> Result<(), ValidationErrors>;

    fn launch(&self, ctx: &InstallContext<'_>) -> Result<Launch, ProvisionError>;

    fn config_files(&self, ctx: &InstallContext<'_>) -> Result<Vec<RenderedFile>, ProvisionError>;

    /// Downloads and unpacks game files into the install directory.
    fn install_script(&self, ctx: &InstallContext<'_>) -> RemoteScript;

    fn update_script(&self, ctx: &InstallContext<'_>) -> RemoteScript {
        self.install_script(ctx)
    }

    /// Directory holding world and character saves.
    fn save_dir(&self, ctx: &InstallContext<'_>) -> String;

    /// File or directory holding one character's save data. `character_id`
    /// has already passed the token allow-list.
    fn character_path(&self, ctx: &InstallContext<'_>, character_id: &str) -> String {
        format!("{}/{character_id}", self.save_dir(ctx))
    }

    /// Points the live copy of a rendered config file at the ports in
    /// `ctx`, leaving every other key as found. `None` uploads `file` as
    /// rendered.
    fn retarget_file(
        &self,
        _ctx: &InstallContext<'_>,
        _file: &RenderedFile,
        _live: &str,
    ) -> Result<Option<String>, ProvisionError> {
        Ok(None)
    }

    /// Pure: no remote effects.
    fn render(&self, ctx: &InstallContext<'_>) -> Result<RenderedArtifacts, ProvisionError> {
        let unit = service_unit::render_unit(ctx, &self.launch(ctx)?)?;
        Ok(RenderedArtifacts {
            unit: RenderedFile {
                path: ctx.paths.unit_path.clone(),
                contents: unit,
                mode: "0644",
            },
            files: self.config_files(ctx)?,
        })
    }

    /// Succeeds with non-empty stdout once the game port is bound. `-p`
    /// names the owning process, which needs root.
    fn readiness_probe(&self, ctx: &InstallContext<'_>) -> Result<RemoteScript, ProvisionError> {
        let port = ctx.port(PortRole::Game)?;
        Ok(RemoteCommand::new("ss")
            .args(["-Hlntup", "sport", "=", &format!(":{port}")])
            .sudo()
            .into())
    }
}

pub fn installer_for(kind: GameKind) -> Arc<dyn GameInstaller> {
    match kind {
        GameKind::ArkAscended => Arc::new(ArkAscendedInstaller),
        GameKind::Minecraft => Arc::new(MinecraftInstaller),
        GameKind::Terraria => Arc::new(TerrariaInstaller),
        GameKind::DontStarveTogether => Arc::new(DstInstaller),
    }
}
