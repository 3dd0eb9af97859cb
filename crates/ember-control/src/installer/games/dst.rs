use ember_core::{DontStarveTogetherConfig, GameConfig, GameKind, PortRole, Server, ValidationErrors};

use crate::{
    config_doc::{ConfigDocument, Flavor},
    error::ProvisionError,
    installer::{GameInstaller, InstallContext, Launch, RenderedFile},
    shell::{RemoteCommand, RemoteScript},
};

use super::{check_line_text, check_secret, steamcmd, validate_common};

const STEAM_APP_ID: u32 = 343050;
const GAME_MODES: &[&str] = &["survival", "endless", "wilderness"];

const CLUSTER_INI: &str = "\
[GAMEPLAY]
pause_when_empty = true

[NETWORK]
cluster_intention = cooperative
offline_cluster = false

[MISC]
console_enabled = true

[SHARD]
shard_enabled = false
";

pub struct DstInstaller;

fn config(server: &Server) -> Result<&DontStarveTogetherConfig, ProvisionError> {
    match &server.configuration {
        GameConfig::DontStarveTogether(c) => Ok(c),
        other => {
            let mut errs = ValidationErrors::new();
            errs.add(
                "configuration",
                format!("Expected DONT_STARVE_TOGETHER settings, got {}.", other.kind()),
            );
            Err(errs.into())
        }
    }
}

fn cluster_dir(ctx: &InstallContext<'_>) -> String {
    format!("{}/klei/DoNotStarveTogether/Cluster_1", ctx.paths.data_dir)
}

impl GameInstaller for DstInstaller {
    fn kind(&self) -> GameKind {
        GameKind::DontStarveTogether
    }

    fn validate_config(&self, server: &Server) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        validate_common(server, GameKind::DontStarveTogether, 1..=64, 1024, &mut errs);
        let GameConfig::DontStarveTogether(cfg) = &server.configuration else {
            return errs.finish(());
        };

        if cfg.cluster_token.trim().is_empty() {
            errs.add("cluster_token", "Required. Paste your Klei cluster token.");
        } else {
            check_secret("cluster_token", cfg.cluster_token.trim(), 1, &mut errs);
        }
        check_line_text("cluster_name", &cfg.cluster_name, true, 64, &mut errs);
        if let Some(pw) = &cfg.password {
            check_secret("password", pw, 1, &mut errs);
        }
        if !GAME_MODES.contains(&cfg.game_mode.as_str()) {
            errs.add("game_mode", format!("Must be one of: {}.", GAME_MODES.join(", ")));
        }
        errs.finish(())
    }

    fn launch(&self, _ctx: &InstallContext<'_>) -> Result<Launch, ProvisionError> {
        Ok(Launch {
            exec_start: "{{INSTALL_DIR}}/bin64/dontstarve_dedicated_server_nullrenderer_x64 \
                         -persistent_storage_root {{DATA_DIR}}/klei -conf_dir DoNotStarveTogether \
                         -cluster Cluster_1 -shard Master"
                .to_string(),
            exec_stop: None,
            environment: Vec::new(),
        })
    }

    fn config_files(&self, ctx: &InstallContext<'_>) -> Result<Vec<RenderedFile>, ProvisionError> {
        let cfg = config(ctx.server)?;
        let dir = cluster_dir(ctx);

        let mut cluster = ConfigDocument::parse(CLUSTER_INI, Flavor::Ini);
        let gameplay = Some("GAMEPLAY");
        cluster.set(gameplay, "game_mode", cfg.game_mode.clone());
        cluster.set(gameplay, "max_players", ctx.server.max_players.to_string());
        cluster.set(gameplay, "pvp", cfg.pvp.to_string());
        let network = Some("NETWORK");
        cluster.set(network, "cluster_name", cfg.cluster_name.trim());
        cluster.set(network, "cluster_password", cfg.password.clone().unwrap_or_default());

        let mut master = ConfigDocument::parse("[NETWORK]\nserver_port = 0\n", Flavor::Ini);
        master.set(Some("NETWORK"), "server_port", ctx.port(PortRole::Game)?.to_string());
        master.set(Some("SHARD"), "is_master", "true");
        master.set(Some("SHARD"), "name", "Master");
        master.set(Some("STEAM"), "master_server_port", ctx.port(PortRole::Master)?.to_string());
        master.set(Some("STEAM"), "authentication_port", ctx.port(PortRole::Auth)?.to_string());

        Ok(vec![
            RenderedFile {
                path: format!("{dir}/cluster.ini"),
                contents: cluster.render(),
                mode: "0640",
            },
            RenderedFile {
                path: format!("{dir}/cluster_token.txt"),
                contents: format!("{}\n", cfg.cluster_token.trim()),
                mode: "0600",
            },
            RenderedFile {
                path: format!("{dir}/Master/server.ini"),
                contents: master.render(),
                mode: "0640",
            },
        ])
    }

    fn install_script(&self, ctx: &InstallContext<'_>) -> RemoteScript {
        steamcmd(STEAM_APP_ID, &ctx.paths.install_dir, false).then(
            RemoteCommand::new("mkdir").args(["-p", &format!("{}/Master", cluster_dir(ctx))]),
        )
    }

    fn save_dir(&self, ctx: &InstallContext<'_>) -> String {
        format!("{}/Master/save", cluster_dir(ctx))
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

    fn dst(token: &str, mode: &str) -> GameConfig {
        GameConfig::DontStarveTogether(DontStarveTogetherConfig {
            cluster_token: token.into(),
            cluster_name: "Ember Wilds".into(),
            password: Some("berries".into()),
            pvp: false,
            game_mode: mode.into(),
            resources: ResourceLimits {
                memory_mb: 2048,
                cpu_percent: 150,
            },
        })
    }

    #[test]
    fn token_and_mode_are_required() {
        let srv = server(Uuid::new_v4(), dst("  ", "battle-royale"));
        let errs = DstInstaller.validate_config(&srv).unwrap_err();
        assert_eq!(
            errs.get("cluster_token"),
            Some("Required. Paste your Klei cluster token.")
        );
        assert!(errs.get("game_mode").is_some());
    }

    #[test]
    fn shard_ini_carries_steam_ports() {
        let srv = server(Uuid::new_v4(), dst("pds-g^KU_abc", "endless"));
        let ports = PortAllocation {
            machine_id: srv.machine_id,
            server_id: srv.id,
            ports: BTreeMap::from([
                (PortRole::Game, 11000),
                (PortRole::Master, 27017),
                (PortRole::Auth, 8767),
            ]),
            created_at: Utc::now(),
        };
        let ctx = InstallContext {
            server: &srv,
            ports: &ports,
            paths: InstancePaths::new("/srv/ember", srv.id),
            run_as: "ember".into(),
            cluster_dir: None,
        };
        let files = DstInstaller.config_files(&ctx).unwrap();
        let cluster = ConfigDocument::parse(&files[0].contents, Flavor::Ini);
        assert_eq!(cluster.get(Some("GAMEPLAY"), "game_mode"), Some("endless"));
        assert_eq!(cluster.get(Some("NETWORK"), "cluster_password"), Some("berries"));
        assert!(files[0].contents.contains("cluster_name = Ember Wilds\n"));
        assert_eq!(files[1].contents, "pds-g^KU_abc\n");
        assert_eq!(files[1].mode, "0600");
        let shard = ConfigDocument::parse(&files[2].contents, Flavor::Ini);
        assert_eq!(shard.get(Some("NETWORK"), "server_port"), Some("11000"));
        assert_eq!(shard.get(Some("STEAM"), "master_server_port"), Some("27017"));
        assert_eq!(shard.get(Some("STEAM"), "authentication_port"), Some("8767"));
    }
}
