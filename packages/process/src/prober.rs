// ABOUTME: Lists the PIDs listening on a TCP port using platform tools
// ABOUTME: Lookup failures are reported as "nothing found", never as errors

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Query seam over the OS socket table.
#[async_trait]
pub trait PortProber: Send + Sync {
    /// PIDs currently listening on `port`, sorted and deduplicated.
    ///
    /// An empty list means either "nothing bound" or "lookup failed". Callers
    /// treat both the same, which can hide a live listener when the platform
    /// tools are missing; the next bind on that port then fails loudly instead.
    async fn list_pids_on_port(&self, port: u16) -> Vec<u32>;
}

/// Prober backed by `ss`/`lsof`/`/proc` on unix and `netstat` on Windows.
#[derive(Debug, Clone, Default)]
pub struct SystemPortProber;

#[async_trait]
impl PortProber for SystemPortProber {
    async fn list_pids_on_port(&self, port: u16) -> Vec<u32> {
        if port == 0 {
            return Vec::new();
        }
        let pids = find_pids_on_port(port).await;
        debug!("Port {} is held by {:?}", port, pids);
        pids
    }
}

#[cfg(target_os = "linux")]
async fn find_pids_on_port(port: u16) -> Vec<u32> {
    // Try using ss first (modern Linux)
    if let Some(pids) = try_ss_for_port(port).await {
        if !pids.is_empty() {
            return pids;
        }
    }

    if let Some(pids) = try_lsof_for_port(port).await {
        if !pids.is_empty() {
            return pids;
        }
    }

    // Fallback to reading /proc/net/tcp{,6}
    try_proc_net_tcp_for_port(port).await
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn find_pids_on_port(port: u16) -> Vec<u32> {
    try_lsof_for_port(port).await.unwrap_or_default()
}

#[cfg(windows)]
async fn find_pids_on_port(port: u16) -> Vec<u32> {
    let output = match Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!("netstat unavailable for port {}: {}", port, e);
            return Vec::new();
        }
    };

    parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port)
}

#[cfg(not(any(unix, windows)))]
async fn find_pids_on_port(_port: u16) -> Vec<u32> {
    tracing::warn!("Port scanning not supported on this platform");
    Vec::new()
}

#[cfg(target_os = "linux")]
async fn try_ss_for_port(port: u16) -> Option<Vec<u32>> {
    let output = Command::new("ss")
        .args(["-Htlnp", &format!("sport = :{}", port)])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| debug!("ss unavailable for port {}: {}", port, e))
        .ok()?;

    if !output.status.success() {
        return None;
    }

    Some(parse_ss_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(unix)]
async fn try_lsof_for_port(port: u16) -> Option<Vec<u32>> {
    // Listening sockets only; clients connected to the port are left alone
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| debug!("lsof unavailable for port {}: {}", port, e))
        .ok()?;

    // lsof exits 1 when nothing matches
    Some(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "linux")]
async fn try_proc_net_tcp_for_port(port: u16) -> Vec<u32> {
    let mut inodes = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = tokio::fs::read_to_string(table).await {
            inodes.extend(parse_proc_net_tcp_inodes(&content, port));
        }
    }

    if inodes.is_empty() {
        return Vec::new();
    }

    find_pids_by_inodes(&inodes).await
}

#[cfg(target_os = "linux")]
async fn find_pids_by_inodes(inodes: &BTreeSet<u64>) -> Vec<u32> {
    let targets: BTreeSet<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();
    let mut pids = BTreeSet::new();

    let mut proc_dir = match tokio::fs::read_dir("/proc").await {
        Ok(dir) => dir,
        Err(e) => {
            debug!("Failed to read /proc: {}", e);
            return Vec::new();
        }
    };

    while let Ok(Some(entry)) = proc_dir.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let Ok(mut fds) = tokio::fs::read_dir(entry.path().join("fd")).await else {
            continue;
        };
        while let Ok(Some(fd)) = fds.next_entry().await {
            if let Ok(link) = tokio::fs::read_link(fd.path()).await {
                if link.to_str().is_some_and(|l| targets.contains(l)) {
                    pids.insert(pid);
                    break;
                }
            }
        }
    }

    pids.into_iter().collect()
}

/// Extract every `pid=N` from `ss -tlnp` output.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_ss_pids(output: &str) -> Vec<u32> {
    let mut pids = BTreeSet::new();
    for line in output.lines() {
        for part in line.split("pid=").skip(1) {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse() {
                pids.insert(pid);
            }
        }
    }
    pids.into_iter().collect()
}

/// `lsof -t` prints one PID per line.
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect::<BTreeSet<u32>>()
        .into_iter()
        .collect()
}

/// Socket inodes in LISTEN state (`0A`) bound to `port` in a `/proc/net/tcp` table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_tcp_inodes(content: &str, port: u16) -> Vec<u64> {
    let port_hex = format!("{:04X}", port);
    let mut inodes = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        // Local address is in format IP:PORT, state is parts[3], inode is parts[9]
        let is_match = parts[1]
            .rsplit_once(':')
            .is_some_and(|(_ip, p)| p.eq_ignore_ascii_case(&port_hex));
        if is_match && parts[3] == "0A" {
            if let Ok(inode) = parts[9].parse::<u64>() {
                if inode != 0 {
                    inodes.push(inode);
                }
            }
        }
    }
    inodes
}

/// `netstat -ano` rows: `TCP  0.0.0.0:PORT  0.0.0.0:0  LISTENING  PID`
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids = BTreeSet::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !parts[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if parts[1].ends_with(&suffix) && parts[3] == "LISTENING" {
            if let Ok(pid) = parts[4].parse::<u32>() {
                if pid != 0 {
                    pids.insert(pid);
                }
            }
        }
    }
    pids.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ss_multiple_owners() {
        let output = "LISTEN 0 511 0.0.0.0:5173 0.0.0.0:* users:((\"node\",pid=4242,fd=21),(\"node\",pid=4243,fd=21))\n\
                      LISTEN 0 511 [::]:5173 [::]:* users:((\"node\",pid=4242,fd=22))\n";
        assert_eq!(parse_ss_pids(output), vec![4242, 4243]);
    }

    #[test]
    fn test_parse_ss_without_process_info() {
        // Sockets owned by other users show no users:(...) section
        let output = "LISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n";
        assert!(parse_ss_pids(output).is_empty());
    }

    #[test]
    fn test_parse_lsof_ignores_noise() {
        assert_eq!(parse_lsof_pids("123\n456\n123\n\nbogus\n"), vec![123, 456]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn test_parse_proc_net_tcp_listen_only() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 00000000:1850 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 98765 1 0000000000000000 100 0 0 10 0\n\
   1: 0100007F:1850 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 11111 1 0000000000000000 20 4 30 10 -1\n\
   2: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 100 0 0 10 0\n";

        // 0x1850 == 6224
        assert_eq!(parse_proc_net_tcp_inodes(content, 6224), vec![98765]);
        assert_eq!(parse_proc_net_tcp_inodes(content, 3000), vec![22222]);
        assert!(parse_proc_net_tcp_inodes(content, 8080).is_empty());
    }

    #[test]
    fn test_parse_netstat_listening_rows() {
        let output = "\n\
Active Connections\n\
\n\
  Proto  Local Address          Foreign Address        State           PID\n\
  TCP    0.0.0.0:6200           0.0.0.0:0              LISTENING       7001\n\
  TCP    127.0.0.1:62001        0.0.0.0:0              LISTENING       7002\n\
  TCP    127.0.0.1:6200         127.0.0.1:50000        ESTABLISHED     7003\n\
  TCP    [::]:6200              [::]:0                 LISTENING       7001\n";

        assert_eq!(parse_netstat_pids(output, 6200), vec![7001]);
    }

    #[tokio::test]
    async fn test_port_zero_is_never_probed() {
        assert!(SystemPortProber.list_pids_on_port(0).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finds_own_listener() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let pids = SystemPortProber.list_pids_on_port(port).await;

        // Lookup tools may be missing in minimal environments; an empty answer is allowed
        assert!(pids.is_empty() || pids.contains(&std::process::id()));
    }
}
