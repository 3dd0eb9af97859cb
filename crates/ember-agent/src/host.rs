//! Local host facts reported with each heartbeat.

use std::path::Path;

use ember_core::{HostMetrics, PortProbe};

/// Tools whose presence the control plane can schedule against.
const TOOLS: [&str; 5] = ["steamcmd", "java", "curl", "tar", "ss"];

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// `(total, used)` in bytes from `/proc/meminfo`. Used excludes reclaimable
/// memory (`MemAvailable`).
fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        raw.lines().find_map(|l| {
            let rest = l.strip_prefix(name)?.strip_prefix(':')?;
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kib * 1024)
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total, total.saturating_sub(available)))
}

#[cfg(unix)]
fn free_bytes(p: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c = match CString::new(p.as_os_str().as_bytes()) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return 0;
    }
    (s.f_bsize as u64).saturating_mul(s.f_bavail as u64)
}

#[cfg(not(unix))]
fn free_bytes(_p: &Path) -> u64 {
    0
}

/// Free space of `data_root`, or of its closest existing ancestor.
fn disk_free(data_root: &Path) -> u64 {
    data_root
        .ancestors()
        .find(|p| p.exists())
        .map(free_bytes)
        .unwrap_or(0)
}

pub async fn metrics(data_root: &Path) -> HostMetrics {
    let load = tokio::fs::read_to_string("/proc/loadavg").await.ok();
    let mem = tokio::fs::read_to_string("/proc/meminfo").await.ok();
    let (mem_total_bytes, mem_used_bytes) = mem.as_deref().and_then(parse_meminfo).unwrap_or((0, 0));
    HostMetrics {
        cpu_load_1m: load.as_deref().and_then(parse_loadavg).unwrap_or(0.0),
        mem_used_bytes,
        mem_total_bytes,
        disk_free_bytes: disk_free(data_root),
    }
}

pub fn probe_port(port: u16) -> PortProbe {
    use std::io::ErrorKind;
    use std::net::TcpListener;

    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => PortProbe {
            port,
            available: true,
            error: None,
        },
        Err(e) if e.kind() == ErrorKind::AddrInUse => PortProbe {
            port,
            available: false,
            error: None,
        },
        Err(e) => PortProbe {
            port,
            available: false,
            error: Some(e.to_string()),
        },
    }
}

fn on_path(tool: &str, path_var: &str) -> bool {
    std::env::split_paths(path_var).any(|dir| dir.join(tool).is_file())
}

pub fn capabilities() -> Vec<String> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    let mut caps: Vec<String> = TOOLS
        .iter()
        .filter(|t| on_path(t, &path_var))
        .map(|t| t.to_string())
        .collect();
    if Path::new("/run/systemd/system").is_dir() {
        caps.push("systemd".to_string());
    }
    caps.sort();
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_files() {
        assert_eq!(parse_loadavg("0.42 0.30 0.25 1/512 4242\n"), Some(0.42));
        assert_eq!(parse_loadavg(""), None);

        let meminfo = "MemTotal:       16384 kB\nMemFree:         1024 kB\nMemAvailable:    4096 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((16384 * 1024, 12288 * 1024)));
        let old_kernel = "MemTotal: 100 kB\nMemFree: 40 kB\n";
        assert_eq!(parse_meminfo(old_kernel), Some((102_400, 61_440)));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn bound_port_is_reported_busy() {
        let held = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let probe = probe_port(port);
        assert!(!probe.available);
        assert!(probe.error.is_none());
    }

    #[test]
    fn unknown_tools_are_not_capabilities() {
        assert!(!on_path("definitely-not-a-tool", "/usr/bin:/bin"));
        assert!(!on_path("sh", ""));
    }
}
