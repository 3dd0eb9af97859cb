use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::retry::RetryPolicy;

/// What a reinstall does when a best-effort cleanup step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Log a partial-cleanup warning and keep going.
    Warn,
    /// Fail the reinstall before any install step runs.
    Abort,
}

impl CleanupPolicy {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("abort") | Some("strict") | Some("fail") => CleanupPolicy::Abort,
            _ => CleanupPolicy::Warn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub binary: PathBuf,
    /// Directory holding private keys; machines refer to them by file name.
    pub key_dir: PathBuf,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub ssh: SshConfig,
    /// Root under which instance and cluster directories live on machines.
    pub remote_root: String,
    pub command_timeout: Duration,
    /// Timeout for long-running remote steps (downloads, steamcmd).
    pub install_timeout: Duration,
    pub port_probe_attempts: u32,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub cleanup_policy: CleanupPolicy,
    pub dispatch_interval: Duration,
    pub dispatch_workers: usize,
    pub retry: RetryPolicy,
    pub heartbeat_grace: Duration,
    pub sweep_interval: Duration,
    pub task_stale_after: Duration,
    pub metrics_capacity: usize,
    pub notify_webhook_url: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_u64(raw: Option<String>) -> Option<u64> {
    raw.as_deref().and_then(|v| v.trim().parse::<u64>().ok())
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ControlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ms = |name: &str, default: u64, min: u64, max: u64| {
            Duration::from_millis(
                parse_u64(lookup(name))
                    .map(|v| v.clamp(min, max))
                    .unwrap_or(default),
            )
        };
        let secs = |name: &str, default: u64, min: u64, max: u64| {
            Duration::from_secs(
                parse_u64(lookup(name))
                    .map(|v| v.clamp(min, max))
                    .unwrap_or(default),
            )
        };

        let bind_addr = non_empty(lookup("EMBER_BIND"))
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| ([0, 0, 0, 0], 8080).into());

        let ssh = SshConfig {
            binary: non_empty(lookup("EMBER_SSH_BIN"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ssh")),
            key_dir: non_empty(lookup("EMBER_SSH_KEY_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./keys")),
            connect_timeout_secs: parse_u64(lookup("EMBER_SSH_CONNECT_TIMEOUT_SECS"))
                .map(|v| v.clamp(1, 120))
                .unwrap_or(10),
        };

        let retry = RetryPolicy {
            max_attempts: parse_u64(lookup("EMBER_TASK_MAX_ATTEMPTS"))
                .map(|v| v.clamp(1, 20) as u32)
                .unwrap_or(3),
            base_delay: ms("EMBER_TASK_BACKOFF_MS", 2_000, 1, 10 * 60_000),
            max_delay: ms("EMBER_TASK_BACKOFF_MAX_MS", 60_000, 1, 60 * 60_000),
        };

        Self {
            bind_addr,
            database_url: non_empty(lookup("DATABASE_URL")),
            ssh,
            remote_root: non_empty(lookup("EMBER_REMOTE_ROOT"))
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "/srv/ember".to_string()),
            command_timeout: ms("EMBER_COMMAND_TIMEOUT_MS", 60_000, 1_000, 30 * 60_000),
            install_timeout: ms("EMBER_INSTALL_TIMEOUT_MS", 30 * 60_000, 10_000, 4 * 60 * 60_000),
            port_probe_attempts: parse_u64(lookup("EMBER_PORT_PROBE_ATTEMPTS"))
                .map(|v| v.clamp(1, 10_000) as u32)
                .unwrap_or(200),
            health_attempts: parse_u64(lookup("EMBER_HEALTH_ATTEMPTS"))
                .map(|v| v.clamp(1, 600) as u32)
                .unwrap_or(30),
            health_interval: ms("EMBER_HEALTH_INTERVAL_MS", 5_000, 0, 5 * 60_000),
            cleanup_policy: CleanupPolicy::parse(lookup("EMBER_CLEANUP_POLICY").as_deref()),
            dispatch_interval: ms("EMBER_DISPATCH_INTERVAL_MS", 2_000, 50, 60_000),
            dispatch_workers: parse_u64(lookup("EMBER_DISPATCH_WORKERS"))
                .map(|v| v.clamp(1, 256) as usize)
                .unwrap_or(8),
            retry,
            heartbeat_grace: secs("EMBER_HEARTBEAT_GRACE_SECS", 300, 5, 24 * 60 * 60),
            sweep_interval: ms("EMBER_SWEEP_INTERVAL_MS", 30_000, 100, 10 * 60_000),
            task_stale_after: secs("EMBER_TASK_STALE_SECS", 15 * 60, 10, 7 * 24 * 60 * 60),
            metrics_capacity: parse_u64(lookup("EMBER_METRICS_CAPACITY"))
                .map(|v| v.clamp(1, 100_000) as usize)
                .unwrap_or(360),
            notify_webhook_url: non_empty(lookup("EMBER_NOTIFY_WEBHOOK_URL")),
        }
    }
}
