//! Parameterized construction of remote shell commands.
//!
//! Remote commands are never assembled by formatting user input into a shell
//! string. Each argument is quoted on its own, and values that name remote
//! resources (paths, unit names, ids) must also pass an allow-list check.

use std::fmt;

const MAX_TOKEN_LEN: usize = 128;

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',' | '-')
}

/// Quotes one argument for a POSIX shell. Plain words are left untouched.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_plain) {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Allow-list for identifiers that end up in remote paths or unit names.
pub fn ensure_safe_token(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value.len() > MAX_TOKEN_LEN {
        return Err(format!("must be at most {MAX_TOKEN_LEN} characters"));
    }
    if value.starts_with('-') || value.starts_with('.') {
        return Err("must not start with '-' or '.'".to_string());
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("contains disallowed character {bad:?}"));
    }
    Ok(())
}

/// Absolute path whose every component passes [`ensure_safe_token`].
pub fn ensure_safe_path(path: &str) -> Result<(), String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("must be an absolute path".to_string());
    };
    for part in rest.split('/').filter(|p| !p.is_empty()) {
        ensure_safe_token(part).map_err(|e| format!("component {part:?} {e}"))?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    sudo: bool,
    stdout_to: Option<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
            stdout_to: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through `sudo -n` so a missing sudoers entry fails instead of
    /// prompting.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn stdout_to(mut self, path: impl Into<String>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        if self.sudo {
            parts.push("sudo".to_string());
            parts.push("-n".to_string());
        }
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|a| quote(a)));
        let mut out = parts.join(" ");
        if let Some(path) = &self.stdout_to {
            out.push_str(" > ");
            out.push_str(&quote(path));
        }
        out
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScriptStep {
    command: RemoteCommand,
    best_effort: bool,
}

/// A sequence of commands that stops at the first failing required step.
/// Best-effort steps have their exit status discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteScript {
    steps: Vec<ScriptStep>,
}

impl RemoteScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, command: RemoteCommand) -> Self {
        self.steps.push(ScriptStep {
            command,
            best_effort: false,
        });
        self
    }

    pub fn then_ignore_failure(mut self, command: RemoteCommand) -> Self {
        self.steps.push(ScriptStep {
            command,
            best_effort: true,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn render(&self) -> String {
        self.steps
            .iter()
            .map(|s| {
                if s.best_effort {
                    format!("{{ {} || true; }}", s.command.render())
                } else {
                    s.command.render()
                }
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

impl From<RemoteCommand> for RemoteScript {
    fn from(command: RemoteCommand) -> Self {
        RemoteScript::new().then(command)
    }
}

impl fmt::Display for RemoteScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_stay_unquoted() {
        assert_eq!(quote("/srv/ember/instances/abc-1"), "/srv/ember/instances/abc-1");
        assert_eq!(quote("--now"), "--now");
    }

    #[test]
    fn metacharacters_are_neutralised() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("x;y|z&"), "'x;y|z&'");
    }

    #[test]
    fn command_renders_with_sudo_and_redirect() {
        let cmd = RemoteCommand::new("tee")
            .arg("/etc/systemd/system/ember-1.service")
            .sudo()
            .stdout_to("/dev/null");
        assert_eq!(
            cmd.render(),
            "sudo -n tee /etc/systemd/system/ember-1.service > /dev/null"
        );
    }

    #[test]
    fn script_joins_and_marks_best_effort() {
        let script = RemoteScript::new()
            .then_ignore_failure(RemoteCommand::new("systemctl").args(["stop", "ember-1"]))
            .then(RemoteCommand::new("rm").args(["-rf", "/srv/x"]));
        assert_eq!(
            script.render(),
            "{ systemctl stop ember-1 || true; } && rm -rf /srv/x"
        );
    }

    #[test]
    fn token_allow_list() {
        assert!(ensure_safe_token("TheIsland_WP").is_ok());
        assert!(ensure_safe_token("").is_err());
        assert!(ensure_safe_token("-rf").is_err());
        assert!(ensure_safe_token("a/b").is_err());
        assert!(ensure_safe_token("a b").is_err());
        assert!(ensure_safe_token("..").is_err());
    }

    #[test]
    fn path_allow_list() {
        assert!(ensure_safe_path("/srv/ember/instances/1").is_ok());
        assert!(ensure_safe_path("srv/ember").is_err());
        assert!(ensure_safe_path("/srv/../etc").is_err());
        assert!(ensure_safe_path("/srv/$HOME").is_err());
    }
}
