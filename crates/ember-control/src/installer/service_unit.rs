//! systemd unit rendering with `{{NAME}}` placeholder substitution.

use std::collections::BTreeMap;

use crate::error::ProvisionError;

use super::{InstallContext, Launch};

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=ember {{GAME}} server {{SERVER_ID}}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={{RUN_AS}}
WorkingDirectory={{INSTALL_DIR}}
{{ENVIRONMENT}}ExecStart={{EXEC_START}}
{{EXEC_STOP}}Restart=on-failure
RestartSec=10
TimeoutStopSec=90
MemoryMax={{MEMORY_MB}}M
CPUQuota={{CPU_PERCENT}}%

[Install]
WantedBy=multi-user.target
";

/// Replaces every `{{NAME}}` in `template`. Unknown names are an error so a
/// typo never reaches a remote host as literal braces.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err("unterminated placeholder".to_string());
        };
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| format!("unknown placeholder {{{{{name}}}}}"))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Placeholder values shared by the unit and launch strings.
pub fn placeholders(ctx: &InstallContext<'_>) -> BTreeMap<String, String> {
    let resources = ctx.server.configuration.resources();
    let mut vars = BTreeMap::from([
        ("SERVER_ID".to_string(), ctx.server.id.to_string()),
        ("GAME".to_string(), ctx.server.game.to_string()),
        ("RUN_AS".to_string(), ctx.run_as.clone()),
        ("INSTALL_DIR".to_string(), ctx.paths.install_dir.clone()),
        ("DATA_DIR".to_string(), ctx.paths.data_dir.clone()),
        ("MEMORY_MB".to_string(), resources.memory_mb.to_string()),
        ("CPU_PERCENT".to_string(), resources.cpu_percent.to_string()),
        ("MAX_PLAYERS".to_string(), ctx.server.max_players.to_string()),
    ]);
    for (role, port) in &ctx.ports.ports {
        vars.insert(
            format!("PORT_{}", role.as_str().to_ascii_uppercase()),
            port.to_string(),
        );
    }
    vars
}

pub fn render_unit(ctx: &InstallContext<'_>, launch: &Launch) -> Result<String, ProvisionError> {
    let mut vars = placeholders(ctx);

    let exec_start = substitute(&launch.exec_start, &vars).map_err(ProvisionError::Render)?;
    let exec_stop = match &launch.exec_stop {
        Some(cmd) => format!(
            "ExecStop={}\n",
            substitute(cmd, &vars).map_err(ProvisionError::Render)?
        ),
        None => String::new(),
    };
    let mut environment = String::new();
    for (key, value) in &launch.environment {
        let value = substitute(value, &vars).map_err(ProvisionError::Render)?;
        environment.push_str(&format!("Environment=\"{key}={value}\"\n"));
    }

    vars.insert("EXEC_START".to_string(), exec_start);
    vars.insert("EXEC_STOP".to_string(), exec_stop);
    vars.insert("ENVIRONMENT".to_string(), environment);
    substitute(UNIT_TEMPLATE, &vars).map_err(ProvisionError::Render)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use ember_core::{PortAllocation, PortRole};
    use uuid::Uuid;

    use super::*;
    use crate::{
        installer::InstancePaths,
        testing::{minecraft_config, server},
    };

    #[test]
    fn unknown_placeholder_is_rejected() {
        let vars = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert_eq!(substitute("x{{A}}y{{ A }}", &vars).unwrap(), "x1y1");
        assert!(substitute("{{B}}", &vars).is_err());
        assert!(substitute("{{A", &vars).is_err());
    }

    #[test]
    fn unit_carries_limits_ports_and_commands() {
        let srv = server(Uuid::new_v4(), minecraft_config());
        let ports = PortAllocation {
            machine_id: srv.machine_id,
            server_id: srv.id,
            ports: BTreeMap::from([(PortRole::Game, 25565), (PortRole::WebMap, 8123)]),
            created_at: Utc::now(),
        };
        let ctx = InstallContext {
            server: &srv,
            ports: &ports,
            paths: InstancePaths::new("/srv/ember", srv.id),
            run_as: "ember".to_string(),
            cluster_dir: None,
        };
        let launch = Launch {
            exec_start: "/usr/bin/java -jar {{INSTALL_DIR}}/server.jar --port {{PORT_GAME}}".into(),
            exec_stop: None,
            environment: vec![("WEB_MAP_PORT".into(), "{{PORT_WEB_MAP}}".into())],
        };
        let unit = render_unit(&ctx, &launch).unwrap();
        assert!(unit.contains("MemoryMax=4096M\n"));
        assert!(unit.contains("CPUQuota=200%\n"));
        assert!(unit.contains(&format!(
            "ExecStart=/usr/bin/java -jar /srv/ember/instances/{}/game/server.jar --port 25565\n",
            srv.id
        )));
        assert!(unit.contains("Environment=\"WEB_MAP_PORT=8123\"\nExecStart="));
        assert!(!unit.contains("ExecStop"));
        assert!(!unit.contains("{{"));
    }
}
