use std::{path::PathBuf, time::Duration};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub control_url: String,
    pub agent_id: Uuid,
    pub interval: Duration,
    pub request_timeout: Duration,
    /// Ports reported as busy or free on every heartbeat.
    pub probe_ports: Vec<u16>,
    /// Filesystem whose free space is reported.
    pub data_root: PathBuf,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_ports(raw: &str) -> Vec<u16> {
    let mut out: Vec<u16> = raw
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let control_url = non_empty(lookup("EMBER_CONTROL_URL"))
            .ok_or_else(|| anyhow::anyhow!("EMBER_CONTROL_URL is required"))?;
        if !(control_url.starts_with("http://") || control_url.starts_with("https://")) {
            anyhow::bail!("EMBER_CONTROL_URL must be an http(s) URL");
        }
        let agent_id = non_empty(lookup("EMBER_AGENT_ID"))
            .ok_or_else(|| anyhow::anyhow!("EMBER_AGENT_ID is required"))?
            .parse::<Uuid>()
            .map_err(|e| anyhow::anyhow!("EMBER_AGENT_ID: {e}"))?;

        let interval_secs = non_empty(lookup("EMBER_AGENT_INTERVAL_SECS"))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 3600))
            .unwrap_or(30);

        Ok(Self {
            control_url: control_url.trim_end_matches('/').to_string(),
            agent_id,
            interval: Duration::from_secs(interval_secs),
            request_timeout: Duration::from_secs(10),
            probe_ports: parse_ports(
                &non_empty(lookup("EMBER_AGENT_PROBE_PORTS")).unwrap_or_default(),
            ),
            data_root: non_empty(lookup("EMBER_AGENT_DATA_ROOT"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/srv/ember")),
            log_dir: non_empty(lookup("EMBER_AGENT_LOG_DIR")).map(PathBuf::from),
        })
    }

    pub fn heartbeat_url(&self) -> String {
        format!("{}/agents/{}/heartbeat", self.control_url, self.agent_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_and_clamping() {
        let id = Uuid::new_v4().to_string();
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("EMBER_CONTROL_URL", "https://control.example/"),
            ("EMBER_AGENT_ID", &id),
            ("EMBER_AGENT_INTERVAL_SECS", "0"),
            ("EMBER_AGENT_PROBE_PORTS", "7777, 25565,bogus,7777,0"),
        ]))
        .unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.probe_ports, vec![7777, 25565]);
        assert_eq!(
            cfg.heartbeat_url(),
            format!("https://control.example/agents/{id}/heartbeat")
        );
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn identity_is_required() {
        let err = AgentConfig::from_lookup(lookup(&[("EMBER_CONTROL_URL", "http://c")]))
            .unwrap_err();
        assert!(err.to_string().contains("EMBER_AGENT_ID"));
        assert!(AgentConfig::from_lookup(lookup(&[
            ("EMBER_CONTROL_URL", "ftp://c"),
            ("EMBER_AGENT_ID", "00000000-0000-0000-0000-000000000000"),
        ]))
        .is_err());
    }
}
