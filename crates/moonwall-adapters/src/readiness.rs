//! RPC readiness probing.
//!
//! A node is ready when one of its listening ports answers `system_chain`
//! (plus `eth_chainId` for Ethereum-flagged chains) over both WebSocket and
//! HTTP. Probing runs in bounded iterations with a short fixed delay.

use crate::rpc::call_once;
use moonwall_proto::{Error, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

static LISTEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)\s+\(LISTEN\)").expect("listen regex is valid"));

/// Probe tunables.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Hard cap on probe iterations.
    pub max_iterations: u32,
    /// Delay between iterations.
    pub interval: Duration,
    /// Timeout for each individual JSON-RPC call.
    pub call_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(2),
        }
    }
}

/// Methods that must answer for a chain to count as live.
pub fn liveness_methods(is_ethereum_chain: bool) -> &'static [&'static str] {
    if is_ethereum_chain {
        &["system_chain", "eth_chainId"]
    } else {
        &["system_chain"]
    }
}

/// Runs the liveness methods against one port over WebSocket and HTTP.
///
/// Returns true only if every method answers on both transports.
pub async fn check_port(port: u16, is_ethereum_chain: bool, call_timeout: Duration) -> bool {
    let ws = format!("ws://127.0.0.1:{port}");
    let http = format!("http://127.0.0.1:{port}");

    for method in liveness_methods(is_ethereum_chain) {
        let (ws_result, http_result) = tokio::join!(
            call_once(&ws, method, call_timeout),
            call_once(&http, method, call_timeout)
        );
        if let Err(e) = ws_result.and(http_result) {
            debug!(port, method = %method, error = %e, "Port not ready");
            return false;
        }
    }
    true
}

/// Polls the listening ports of `pid` until one passes `check_port`.
///
/// `exited` is consulted each iteration so a node that dies during startup
/// fails fast instead of burning the whole iteration budget.
pub async fn wait_for_pid_ready<F>(
    name: &str,
    pid: u32,
    is_ethereum_chain: bool,
    config: ProbeConfig,
    exited: F,
) -> Result<u16>
where
    F: Fn() -> bool,
{
    for iteration in 1..=config.max_iterations {
        if exited() {
            return Err(Error::launch(
                name,
                format!("process {pid} exited before becoming ready (probe iteration {iteration})"),
            ));
        }

        match listening_ports(pid).await {
            Ok(ports) => {
                for port in ports {
                    if check_port(port, is_ethereum_chain, config.call_timeout).await {
                        info!(name = %name, pid, port, iteration, "Node RPC ready");
                        return Ok(port);
                    }
                }
            }
            Err(e) => debug!(name = %name, pid, error = %e, "Port discovery failed"),
        }

        tokio::time::sleep(config.interval).await;
    }

    Err(Error::launch(
        name,
        format!(
            "no RPC port became ready after {} probe iterations",
            config.max_iterations
        ),
    ))
}

/// Polls a known port (containers, published ports) until it passes `check_port`.
pub async fn wait_for_port_ready(
    name: &str,
    port: u16,
    is_ethereum_chain: bool,
    config: ProbeConfig,
) -> Result<()> {
    for iteration in 1..=config.max_iterations {
        if check_port(port, is_ethereum_chain, config.call_timeout).await {
            info!(name = %name, port, iteration, "RPC port ready");
            return Ok(());
        }
        tokio::time::sleep(config.interval).await;
    }
    Err(Error::launch(
        name,
        format!(
            "port {port} not ready after {} probe iterations",
            config.max_iterations
        ),
    ))
}

/// Discovers TCP ports in LISTEN state owned by `pid`.
pub async fn listening_ports(pid: u32) -> Result<Vec<u16>> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(ports) = procfs_listening_ports(pid).await
            && !ports.is_empty()
        {
            return Ok(ports);
        }
    }
    lsof_listening_ports(pid).await
}

async fn lsof_listening_ports(pid: u32) -> Result<Vec<u16>> {
    let output = tokio::process::Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-iTCP", "-sTCP:LISTEN", "-n", "-P"])
        .output()
        .await?;
    Ok(parse_lsof_ports(&String::from_utf8_lossy(&output.stdout)))
}

/// Extracts listening ports from `lsof -n -P` output.
pub fn parse_lsof_ports(output: &str) -> Vec<u16> {
    let ports: BTreeSet<u16> = LISTEN_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();
    ports.into_iter().collect()
}

#[cfg(target_os = "linux")]
async fn procfs_listening_ports(pid: u32) -> std::io::Result<Vec<u16>> {
    let mut inodes = BTreeSet::new();
    let mut fds = tokio::fs::read_dir(format!("/proc/{pid}/fd")).await?;
    while let Some(entry) = fds.next_entry().await? {
        if let Ok(target) = tokio::fs::read_link(entry.path()).await
            && let Some(inode) = target
                .to_string_lossy()
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
        {
            inodes.insert(inode);
        }
    }

    let mut ports = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = tokio::fs::read_to_string(table).await {
            ports.extend(parse_proc_net_tcp(&content, &inodes));
        }
    }
    Ok(ports.into_iter().collect())
}

/// Extracts LISTEN ports whose socket inode is in `inodes` from a
/// `/proc/net/tcp` table.
pub fn parse_proc_net_tcp(content: &str, inodes: &BTreeSet<u64>) -> Vec<u16> {
    const TCP_LISTEN: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            if !inodes.contains(&inode) {
                return None;
            }
            let port_hex = fields[1].rsplit(':').next()?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}
