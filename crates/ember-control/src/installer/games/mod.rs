mod ark;
mod dst;
mod minecraft;
mod terraria;

use std::ops::RangeInclusive;

use ember_core::{GameKind, ResourceLimits, Server, ValidationErrors};

use crate::shell::{RemoteCommand, RemoteScript};

pub use ark::ArkAscendedInstaller;
pub use dst::DstInstaller;
pub use minecraft::MinecraftInstaller;
pub use terraria::TerrariaInstaller;

const MAX_CPU_PERCENT: u32 = 6400;

/// Checks shared by every game: the configuration variant, player count and
/// resource limits.
fn validate_common(
    server: &Server,
    kind: GameKind,
    players: RangeInclusive<u32>,
    min_memory_mb: u32,
    errs: &mut ValidationErrors,
) {
    if server.configuration.kind() != kind {
        errs.add(
            "configuration",
            format!(
                "Expected {kind} settings, got {}.",
                server.configuration.kind()
            ),
        );
    }
    if server.game != kind {
        errs.add("game", format!("Installer handles {kind}, server is {}.", server.game));
    }
    if !players.contains(&server.max_players) {
        errs.add(
            "max_players",
            format!("Must be between {} and {}.", players.start(), players.end()),
        );
    }
    if server.name.trim().is_empty() {
        errs.add("name", "Required.");
    }
    check_resources(server.configuration.resources(), min_memory_mb, errs);
}

fn check_resources(limits: &ResourceLimits, min_memory_mb: u32, errs: &mut ValidationErrors) {
    if limits.memory_mb < min_memory_mb {
        errs.add(
            "resources.memory_mb",
            format!("Must be at least {min_memory_mb} MB."),
        );
    }
    if !(1..=MAX_CPU_PERCENT).contains(&limits.cpu_percent) {
        errs.add(
            "resources.cpu_percent",
            format!("Must be between 1 and {MAX_CPU_PERCENT}."),
        );
    }
}

/// Free text that ends up inside a config file line.
fn check_line_text(field: &str, value: &str, required: bool, max_len: usize, errs: &mut ValidationErrors) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if required {
            errs.add(field, "Required.");
        }
        return;
    }
    if value.chars().any(char::is_control) {
        errs.add(field, "Must not contain control characters or line breaks.");
    } else if value.len() > max_len {
        errs.add(field, format!("Must be at most {max_len} characters."));
    }
}

fn check_secret(field: &str, value: &str, min_len: usize, errs: &mut ValidationErrors) {
    if value.len() < min_len {
        errs.add(field, format!("Must be at least {min_len} characters."));
    } else if value.chars().any(|c| c.is_control() || c.is_whitespace()) {
        errs.add(field, "Must not contain whitespace.");
    }
}

/// Installs or updates a Steam app into `install_dir` with `steamcmd`.
fn steamcmd(app_id: u32, install_dir: &str, windows: bool) -> RemoteScript {
    let mut cmd = RemoteCommand::new("steamcmd");
    if windows {
        cmd = cmd.arg("+@sSteamCmdForcePlatformType").arg("windows");
    }
    RemoteScript::new().then(cmd.args([
        "+force_install_dir",
        install_dir,
        "+login",
        "anonymous",
        "+app_update",
        &app_id.to_string(),
        "validate",
        "+quit",
    ]))
}
