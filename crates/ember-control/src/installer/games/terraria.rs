use ember_core::{GameConfig, GameKind, PortRole, Server, TerrariaConfig, ValidationErrors};

use crate::{
    config_doc::{ConfigDocument, Flavor},
    error::ProvisionError,
    installer::{GameInstaller, InstallContext, Launch, RenderedFile},
    shell::{RemoteCommand, RemoteScript, ensure_safe_token},
};

use super::{check_secret, validate_common};

const DOWNLOAD_BASE: &str = "https://terraria.org/api/download/pc-dedicated-server";

pub struct TerrariaInstaller;

fn config(server: &Server) -> Result<&TerrariaConfig, ProvisionError> {
    match &server.configuration {
        GameConfig::Terraria(c) => Ok(c),
        other => {
            let mut errs = ValidationErrors::new();
            errs.add("configuration", format!("Expected TERRARIA settings, got {}.", other.kind()));
            Err(errs.into())
        }
    }
}

fn version(ctx: &InstallContext<'_>) -> String {
    match &ctx.server.configuration {
        GameConfig::Terraria(c) => c.version.clone(),
        _ => String::new(),
    }
}

impl GameInstaller for TerrariaInstaller {
    fn kind(&self) -> GameKind {
        GameKind::Terraria
    }

    fn validate_config(&self, server: &Server) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        validate_common(server, GameKind::Terraria, 1..=255, 512, &mut errs);
        let GameConfig::Terraria(cfg) = &server.configuration else {
            return errs.finish(());
        };

        // Server package versions look like "1453".
        if cfg.version.len() < 3
            || cfg.version.len() > 6
            || !cfg.version.chars().all(|c| c.is_ascii_digit())
        {
            errs.add("version", "Must be a server package version like 1453.");
        }
        if let Err(msg) = ensure_safe_token(&cfg.world_name) {
            errs.add("world_name", format!("Invalid world name: {msg}."));
        }
        if !(1..=3).contains(&cfg.world_size) {
            errs.add("world_size", "Must be 1 (small), 2 (medium) or 3 (large).");
        }
        if let Some(pw) = &cfg.password {
            check_secret("password", pw, 1, &mut errs);
        }
        errs.finish(())
    }

    fn launch(&self, _ctx: &InstallContext<'_>) -> Result<Launch, ProvisionError> {
        Ok(Launch {
            exec_start: "{{INSTALL_DIR}}/Linux/TerrariaServer.bin.x86_64 -config {{DATA_DIR}}/serverconfig.txt"
                .to_string(),
            exec_stop: None,
            environment: Vec::new(),
        })
    }

    fn config_files(&self, ctx: &InstallContext<'_>) -> Result<Vec<RenderedFile>, ProvisionError> {
        let cfg = config(ctx.server)?;
        let worlds = self.save_dir(ctx);
        let mut doc = ConfigDocument::new(Flavor::Properties);
        doc.set(None, "world", format!("{worlds}/{}.wld", cfg.world_name));
        doc.set(None, "worldpath", worlds);
        doc.set(None, "worldname", cfg.world_name.clone());
        // Only used when the world file does not exist yet.
        doc.set(None, "autocreate", cfg.world_size.to_string());
        doc.set(None, "port", ctx.port(PortRole::Game)?.to_string());
        doc.set(None, "maxplayers", ctx.server.max_players.to_string());
        if let Some(pw) = &cfg.password {
            doc.set(None, "password", pw.clone());
        }
        doc.set(None, "secure", "1");
        doc.set(None, "upnp", "0");

        Ok(vec![RenderedFile {
            path: format!("{}/serverconfig.txt", ctx.paths.data_dir),
            contents: doc.render(),
            mode: "0640",
        }])
    }

    fn install_script(&self, ctx: &InstallContext<'_>) -> RemoteScript {
        let version = version(ctx);
        let archive = format!("{}/terraria-server-{version}.zip", ctx.paths.data_dir);
        let unpack = format!("{}/unpack", ctx.paths.data_dir);
        // The archive nests everything under a "<version>/" directory.
        let unpacked = format!("{unpack}/{version}");
        RemoteScript::new()
            .then(RemoteCommand::new("curl").args([
                "-fsSL",
                "--retry",
                "3",
                "-o",
                &archive,
                &format!("{DOWNLOAD_BASE}/terraria-server-{version}.zip"),
            ]))
            .then(RemoteCommand::new("rm").args(["-rf", &unpack]))
            .then(RemoteCommand::new("unzip").args(["-q", "-o", &archive, "-d", &unpack]))
            .then(RemoteCommand::new("cp").args([
                "-a",
                &format!("{unpacked}/Linux"),
                &ctx.paths.install_dir,
            ]))
            .then(RemoteCommand::new("chmod").args([
                "+x",
                &format!("{}/Linux/TerrariaServer.bin.x86_64", ctx.paths.install_dir),
            ]))
            .then(RemoteCommand::new("rm").args(["-rf", &unpack, &archive]))
    }

    fn save_dir(&self, ctx: &InstallContext<'_>) -> String {
        format!("{}/worlds", ctx.paths.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use ember_core::{PortAllocation, ResourceLimits};
    use uuid::Uuid;

    use super::*;
    use crate::{installer::InstancePaths, testing::server};

    fn terraria(world_name: &str, world_size: u8) -> GameConfig {
        GameConfig::Terraria(TerrariaConfig {
            version: "1453".into(),
            world_name: world_name.into(),
            world_size,
            password: None,
            resources: ResourceLimits {
                memory_mb: 2048,
                cpu_percent: 100,
            },
        })
    }

    #[test]
    fn world_name_must_be_path_safe() {
        let srv = server(Uuid::new_v4(), terraria("my world/..", 4));
        let errs = TerrariaInstaller.validate_config(&srv).unwrap_err();
        assert!(errs.get("world_name").is_some());
        assert!(errs.get("world_size").is_some());
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn serverconfig_points_at_data_dir() {
        let srv = server(Uuid::new_v4(), terraria("island", 2));
        let ports = PortAllocation {
            machine_id: srv.machine_id,
            server_id: srv.id,
            ports: BTreeMap::from([(PortRole::Game, 7778)]),
            created_at: Utc::now(),
        };
        let ctx = InstallContext {
            server: &srv,
            ports: &ports,
            paths: InstancePaths::new("/srv/ember", srv.id),
            run_as: "ember".into(),
            cluster_dir: None,
        };
        let files = TerrariaInstaller.config_files(&ctx).unwrap();
        let doc = ConfigDocument::parse(&files[0].contents, Flavor::Properties);
        assert_eq!(doc.get(None, "port"), Some("7778"));
        assert_eq!(doc.get(None, "autocreate"), Some("2"));
        assert_eq!(
            doc.get(None, "world"),
            Some(format!("/srv/ember/instances/{}/data/worlds/island.wld", srv.id).as_str())
        );
        let script = TerrariaInstaller.install_script(&ctx).render();
        assert!(script.contains("terraria-server-1453.zip"));
    }
}
