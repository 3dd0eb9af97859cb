use ember_core::{GameConfig, GameKind, MinecraftConfig, PortRole, Server, ValidationErrors};

use crate::{
    config_doc::{ConfigDocument, Flavor},
    error::ProvisionError,
    installer::{GameInstaller, InstallContext, Launch, RenderedFile},
    shell::{RemoteCommand, RemoteScript},
};

use super::{check_line_text, check_secret, validate_common};

/// Properties derived from allocation and typed fields.
const MANAGED_PROPERTIES: &[&str] = &[
    "server-port",
    "query.port",
    "rcon.port",
    "rcon.password",
    "enable-rcon",
    "max-players",
    "motd",
];

const SERVER_PROPERTIES: &str = "\
#Minecraft server properties
enable-query=false
enable-rcon=true
level-name=world
online-mode=true
";

pub struct MinecraftInstaller;

fn config(server: &Server) -> Result<&MinecraftConfig, ProvisionError> {
    match &server.configuration {
        GameConfig::Minecraft(c) => Ok(c),
        other => {
            let mut errs = ValidationErrors::new();
            errs.add("configuration", format!("Expected MINECRAFT settings, got {}.", other.kind()));
            Err(errs.into())
        }
    }
}

fn valid_version(v: &str) -> bool {
    !v.is_empty()
        && v.len() <= 32
        && v.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

impl GameInstaller for MinecraftInstaller {
    fn kind(&self) -> GameKind {
        GameKind::Minecraft
    }

    fn validate_config(&self, server: &Server) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        validate_common(server, GameKind::Minecraft, 1..=1000, 1024, &mut errs);
        let GameConfig::Minecraft(cfg) = &server.configuration else {
            return errs.finish(());
        };

        if !valid_version(&cfg.version) {
            errs.add("version", "Must look like 1.21.1 (letters, digits, '.', '-', '_').");
        }
        let url = cfg.server_jar_url.trim();
        if !url.starts_with("https://") || url.len() <= "https://".len() {
            errs.add("server_jar_url", "Must be an https:// URL.");
        } else if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
            errs.add("server_jar_url", "Must not contain whitespace.");
        }
        if !cfg.accept_eula {
            errs.add("accept_eula", "The Minecraft EULA must be accepted.");
        }
        if let Some(motd) = &cfg.motd {
            check_line_text("motd", motd, false, 59, &mut errs);
        }
        check_secret("rcon_password", &cfg.rcon_password, 8, &mut errs);
        for (key, value) in &cfg.properties {
            let field = format!("properties.{key}");
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
            {
                errs.add(field, "Invalid property name.");
            } else if MANAGED_PROPERTIES.contains(&key.as_str()) {
                errs.add(field, "Managed by ember; use the dedicated field.");
            } else {
                check_line_text(&field, value, false, 256, &mut errs);
            }
        }
        errs.finish(())
    }

    fn launch(&self, ctx: &InstallContext<'_>) -> Result<Launch, ProvisionError> {
        let memory = ctx.server.configuration.resources().memory_mb;
        // Leave headroom under MemoryMax for JVM overhead.
        let heap = (memory.saturating_mul(3) / 4).max(512);
        Ok(Launch {
            exec_start: format!(
                "/usr/bin/java -Xms{}M -Xmx{heap}M -jar {{{{INSTALL_DIR}}}}/server.jar nogui",
                (heap / 2).max(256)
            ),
            exec_stop: None,
            environment: vec![("EMBER_WEB_MAP_PORT".to_string(), "{{PORT_WEB_MAP}}".to_string())],
        })
    }

    fn config_files(&self, ctx: &InstallContext<'_>) -> Result<Vec<RenderedFile>, ProvisionError> {
        let cfg = config(ctx.server)?;
        let mut props = ConfigDocument::parse(SERVER_PROPERTIES, Flavor::Properties);
        for (key, value) in &cfg.properties {
            props.set(None, key, value.clone());
        }
        props.set(None, "server-port", ctx.port(PortRole::Game)?.to_string());
        props.set(None, "rcon.port", ctx.port(PortRole::Rcon)?.to_string());
        props.set(None, "rcon.password", cfg.rcon_password.clone());
        props.set(None, "max-players", ctx.server.max_players.to_string());
        props.set(
            None,
            "motd",
            cfg.motd.clone().unwrap_or_else(|| ctx.server.name.clone()),
        );

        let dir = &ctx.paths.install_dir;
        Ok(vec![
            RenderedFile {
                path: format!("{dir}/server.properties"),
                contents: props.render(),
                mode: "0640",
            },
            RenderedFile {
                path: format!("{dir}/eula.txt"),
                contents: "eula=true\n".to_string(),
                mode: "0644",
            },
        ])
    }

    fn install_script(&self, ctx: &InstallContext<'_>) -> RemoteScript {
        let url = match &ctx.server.configuration {
            GameConfig::Minecraft(c) => c.server_jar_url.trim().to_string(),
            _ => String::new(),
        };
        let jar = format!("{}/server.jar", ctx.paths.install_dir);
        let partial = format!("{jar}.part");
        RemoteScript::new()
            .then(RemoteCommand::new("curl").args(["-fsSL", "--retry", "3", "-o", &partial, &url]))
            .then(RemoteCommand::new("mv").args(["-f", &partial, &jar]))
    }

    fn save_dir(&self, ctx: &InstallContext<'_>) -> String {
        format!("{}/world", ctx.paths.install_dir)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use ember_core::PortAllocation;
    use uuid::Uuid;

    use super::*;
    use crate::{
        installer::InstancePaths,
        testing::{minecraft_config, server},
    };

    #[test]
    fn eula_and_managed_properties_are_enforced() {
        let mut srv = server(Uuid::new_v4(), minecraft_config());
        if let GameConfig::Minecraft(c) = &mut srv.configuration {
            c.accept_eula = false;
            c.server_jar_url = "http://insecure.example/server.jar".into();
            c.properties.insert("server-port".into(), "1".into());
            c.properties.insert("view-distance".into(), "12".into());
        }
        let errs = MinecraftInstaller.validate_config(&srv).unwrap_err();
        assert!(errs.get("accept_eula").is_some());
        assert!(errs.get("server_jar_url").is_some());
        assert!(errs.get("properties.server-port").is_some());
        assert!(errs.get("properties.view-distance").is_none());
    }

    #[test]
    fn properties_take_ports_from_allocation() {
        let mut srv = server(Uuid::new_v4(), minecraft_config());
        if let GameConfig::Minecraft(c) = &mut srv.configuration {
            c.properties.insert("view-distance".into(), "12".into());
        }
        let ports = PortAllocation {
            machine_id: srv.machine_id,
            server_id: srv.id,
            ports: BTreeMap::from([
                (PortRole::Game, 25566),
                (PortRole::Rcon, 25576),
                (PortRole::WebMap, 8124),
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
        let out = MinecraftInstaller.render(&ctx).unwrap();
        let props = ConfigDocument::parse(&out.files[0].contents, Flavor::Properties);
        assert_eq!(props.get(None, "server-port"), Some("25566"));
        assert_eq!(props.get(None, "rcon.port"), Some("25576"));
        assert_eq!(props.get(None, "view-distance"), Some("12"));
        assert_eq!(props.get(None, "level-name"), Some("world"));
        assert_eq!(out.files[1].contents, "eula=true\n");
        assert!(out.unit.contents.contains("-Xmx3072M"));
        assert!(out.unit.contents.contains("EMBER_WEB_MAP_PORT=8124"));
    }
}
