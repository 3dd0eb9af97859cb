use ember_core::{ArkAscendedConfig, GameConfig, GameKind, PortRole, Server, ValidationErrors};

use crate::{
    config_doc::{ConfigDocument, Flavor},
    error::ProvisionError,
    installer::{GameInstaller, InstallContext, Launch, RenderedFile},
    shell::{RemoteCommand, RemoteScript, ensure_safe_token},
};

use super::{check_line_text, check_secret, steamcmd, validate_common};

const STEAM_APP_ID: u32 = 2430930;

/// Keys the installer writes itself; user settings may not override them.
const MANAGED_SETTINGS: &[&str] = &[
    "ServerAdminPassword",
    "ServerPassword",
    "RCONEnabled",
    "RCONPort",
];

const GAME_USER_SETTINGS: &str = "\
[ServerSettings]
RCONEnabled=True
ShowMapPlayerLocation=True

[SessionSettings]

[/Script/Engine.GameSession]
";

pub struct ArkAscendedInstaller;

fn config(server: &Server) -> Result<&ArkAscendedConfig, ProvisionError> {
    match &server.configuration {
        GameConfig::ArkAscended(c) => Ok(c),
        other => {
            let mut errs = ValidationErrors::new();
            errs.add("configuration", format!("Expected ARK_ASCENDED settings, got {}.", other.kind()));
            Err(errs.into())
        }
    }
}

impl GameInstaller for ArkAscendedInstaller {
    fn kind(&self) -> GameKind {
        GameKind::ArkAscended
    }

    fn validate_config(&self, server: &Server) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        validate_common(server, GameKind::ArkAscended, 1..=70, 8192, &mut errs);
        let GameConfig::ArkAscended(cfg) = &server.configuration else {
            return errs.finish(());
        };

        check_line_text("session_name", &cfg.session_name, true, 64, &mut errs);
        if let Err(msg) = ensure_safe_token(&cfg.map) {
            errs.add("map", format!("Invalid map name: {msg}."));
        }
        check_secret("admin_password", &cfg.admin_password, 8, &mut errs);
        if let Some(pw) = &cfg.server_password {
            check_secret("server_password", pw, 1, &mut errs);
        }
        if cfg.mods.contains(&0) {
            errs.add("mods", "Mod ids must be positive CurseForge project ids.");
        }
        for (key, value) in &cfg.settings {
            let field = format!("settings.{key}");
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                errs.add(field, "Setting names may only contain letters, digits and '_'.");
            } else if MANAGED_SETTINGS.contains(&key.as_str()) {
                errs.add(field, "Managed by ember; use the dedicated field.");
            } else {
                check_line_text(&field, value, false, 256, &mut errs);
            }
        }
        errs.finish(())
    }

    fn launch(&self, ctx: &InstallContext<'_>) -> Result<Launch, ProvisionError> {
        let cfg = config(ctx.server)?;
        let mut exec = format!(
            "/usr/local/bin/proton run {{{{INSTALL_DIR}}}}/ShooterGame/Binaries/Win64/ArkAscendedServer.exe \
             {}?listen?Port={{{{PORT_GAME}}}}?QueryPort={{{{PORT_QUERY}}}}?RCONPort={{{{PORT_RCON}}}} \
             -WinLiveMaxPlayers={{{{MAX_PLAYERS}}}} -server -log",
            cfg.map
        );
        if !cfg.mods.is_empty() {
            let ids: Vec<String> = cfg.mods.iter().map(u64::to_string).collect();
            exec.push_str(&format!(" -mods={}", ids.join(",")));
        }
        if let (Some(cluster_id), Some(dir)) = (ctx.server.cluster_id, &ctx.cluster_dir) {
            exec.push_str(&format!(" -clusterid={cluster_id} -ClusterDirOverride={dir}"));
        }
        Ok(Launch {
            exec_start: exec,
            exec_stop: None,
            environment: vec![
                (
                    "STEAM_COMPAT_DATA_PATH".to_string(),
                    "{{DATA_DIR}}/proton".to_string(),
                ),
                (
                    "STEAM_COMPAT_CLIENT_INSTALL_PATH".to_string(),
                    "{{DATA_DIR}}/steam".to_string(),
                ),
            ],
        })
    }

    fn config_files(&self, ctx: &InstallContext<'_>) -> Result<Vec<RenderedFile>, ProvisionError> {
        let cfg = config(ctx.server)?;
        let mut doc = ConfigDocument::parse(GAME_USER_SETTINGS, Flavor::Ini);
        let server = Some("ServerSettings");
        doc.set(server, "ServerAdminPassword", cfg.admin_password.clone());
        match &cfg.server_password {
            Some(pw) => doc.set(server, "ServerPassword", pw.clone()),
            None => doc.set(server, "ServerPassword", ""),
        }
        doc.set(server, "RCONPort", ctx.port(PortRole::Rcon)?.to_string());
        for (key, value) in &cfg.settings {
            doc.set(server, key, value.clone());
        }
        let session = Some("SessionSettings");
        doc.set(session, "SessionName", cfg.session_name.trim());
        doc.set(session, "Port", ctx.port(PortRole::Game)?.to_string());
        doc.set(session, "QueryPort", ctx.port(PortRole::Query)?.to_string());
        doc.set(
            Some("/Script/Engine.GameSession"),
            "MaxPlayers",
            ctx.server.max_players.to_string(),
        );

        Ok(vec![RenderedFile {
            path: format!(
                "{}/Config/WindowsServer/GameUserSettings.ini",
                self.save_dir(ctx)
            ),
            contents: doc.render(),
            mode: "0640",
        }])
    }

    fn retarget_file(
        &self,
        ctx: &InstallContext<'_>,
        file: &RenderedFile,
        live: &str,
    ) -> Result<Option<String>, ProvisionError> {
        if !file.path.ends_with("/GameUserSettings.ini") || live.trim().is_empty() {
            return Ok(None);
        }
        let mut doc = ConfigDocument::parse(live, Flavor::Ini);
        doc.set(Some("ServerSettings"), "RCONPort", ctx.port(PortRole::Rcon)?.to_string());
        doc.set(Some("SessionSettings"), "Port", ctx.port(PortRole::Game)?.to_string());
        doc.set(Some("SessionSettings"), "QueryPort", ctx.port(PortRole::Query)?.to_string());
        Ok(Some(doc.render()))
    }

    fn install_script(&self, ctx: &InstallContext<'_>) -> RemoteScript {
        let mut script = steamcmd(STEAM_APP_ID, &ctx.paths.install_dir, true);
        script = script.then(
            RemoteCommand::new("mkdir").args(["-p", &format!("{}/proton", ctx.paths.data_dir)]),
        );
        script
    }

    fn save_dir(&self, ctx: &InstallContext<'_>) -> String {
        format!("{}/ShooterGame/Saved", ctx.paths.install_dir)
    }

    fn character_path(&self, ctx: &InstallContext<'_>, character_id: &str) -> String {
        let map = config(ctx.server).map(|c| c.map.clone()).unwrap_or_default();
        format!("{}/SavedArks/{map}/{character_id}.arkprofile", self.save_dir(ctx))
    }
}
