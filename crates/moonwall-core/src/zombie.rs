//! Zombie network supervision.
//!
//! Topology construction is delegated to a [`NetworkOrchestrator`]. Once the
//! network runs, the supervisor publishes its endpoints through `MOON_*`
//! variables, serves node control over the IPC socket in the network's temp
//! directory, and makes sure node processes do not outlive this process.

use crate::env;
use crate::foundation::{ZombiePlan, default_zombie_providers};
use crate::ipc::{IpcHandler, IpcServer, IpcTimings, SOCKET_FILE_NAME};
use crate::providers::ProviderManager;
use crate::teardown::TeardownReport;
use async_trait::async_trait;
use futures::future::join_all;
use moonwall_proto::{Error, IpcCommand, ProviderSpec, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static LOG_LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(WARN|ERROR)\b").expect("log level regex is valid"));

const STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(100);
const LOG_TAIL_INTERVAL: Duration = Duration::from_millis(500);

/// One node of a running network, as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZombieNode {
    pub name: String,
    pub pid: Option<u32>,
    pub ws_uri: String,
}

/// Builds and starts a network from a topology file.
#[async_trait]
pub trait NetworkOrchestrator: Send + Sync {
    async fn start(&self, name: &str, config: &Path) -> Result<Arc<dyn ZombieNetworkHandle>>;
}

/// A running network. Owned by the orchestrator; the supervisor only drives it.
#[async_trait]
pub trait ZombieNetworkHandle: Send + Sync {
    fn tmp_dir(&self) -> PathBuf;

    fn relay_ws_uris(&self) -> Vec<String>;

    /// Parachain id → collator websocket URIs.
    fn para_ws_uris(&self) -> BTreeMap<String, Vec<String>>;

    /// Current process table.
    fn nodes(&self) -> Vec<ZombieNode>;

    /// Drops a node from the process table after it was killed out of band.
    fn forget_process(&self, name: &str);

    async fn restart_node(&self, name: &str, timeout: Duration) -> Result<()>;

    async fn pause_node(&self, name: &str) -> Result<()>;

    async fn resume_node(&self, name: &str) -> Result<()>;

    async fn is_up(&self, name: &str) -> Result<bool>;

    async fn stop(&self) -> Result<()>;
}

/// Bounds for the post-connect block production check.
#[derive(Debug, Clone, Copy)]
pub struct BlockWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for BlockWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(1),
        }
    }
}

/// Executes IPC commands against a running network.
pub struct ZombieControl {
    network: Arc<dyn ZombieNetworkHandle>,
    providers: Arc<ProviderManager>,
    specs: Vec<ProviderSpec>,
    timings: IpcTimings,
}

impl ZombieControl {
    pub fn new(
        network: Arc<dyn ZombieNetworkHandle>,
        providers: Arc<ProviderManager>,
        specs: Vec<ProviderSpec>,
        timings: IpcTimings,
    ) -> Self {
        Self {
            network,
            providers,
            specs,
            timings,
        }
    }

    /// Resolves the node a command targets.
    fn target(&self, command: IpcCommand, node: Option<&str>) -> Result<ZombieNode> {
        let name = node.ok_or_else(|| {
            Error::IpcProtocol(format!("Command '{command}' requires a nodeName"))
        })?;
        self.network
            .nodes()
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::IpcProtocol(format!("Node '{name}' not found in network")))
    }

    async fn disconnect_providers(&self) {
        for e in self.providers.disconnect(None).await {
            warn!(error = %e, "Provider disconnect before node operation failed");
        }
    }

    async fn reconnect_providers(&self) -> Result<()> {
        self.providers.connect_all(&self.specs).await
    }

    async fn bounded<T, F>(&self, what: String, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timings.call_timeout, operation)
            .await
            .map_err(|_| Error::Timeout {
                elapsed: self.timings.call_timeout,
                what,
            })?
    }

    async fn settle(&self) {
        // TODO: probe node readiness instead of a fixed settle delay.
        tokio::time::sleep(self.timings.settle_delay).await;
    }

    fn network_map(&self) -> Value {
        let map: Map<String, Value> = self
            .network
            .nodes()
            .into_iter()
            .map(|node| {
                let name = node.name.clone();
                (name, json!(node))
            })
            .collect();
        Value::Object(map)
    }
}

#[async_trait]
impl IpcHandler for ZombieControl {
    async fn handle(&self, command: IpcCommand, node: Option<&str>) -> Result<(Value, String)> {
        match command {
            IpcCommand::NetworkMap => Ok((self.network_map(), "Network map".to_string())),
            IpcCommand::Restart => {
                let name = self.target(command, node)?.name;
                self.disconnect_providers().await;
                self.bounded(
                    format!("restart of {name}"),
                    self.network.restart_node(&name, self.timings.call_timeout),
                )
                .await?;
                self.settle().await;
                self.reconnect_providers().await?;
                Ok((json!(true), format!("{name} restarted")))
            }
            IpcCommand::Pause => {
                let name = self.target(command, node)?.name;
                self.disconnect_providers().await;
                self.bounded(format!("pause of {name}"), self.network.pause_node(&name))
                    .await?;
                self.settle().await;
                Ok((json!(true), format!("{name} paused")))
            }
            IpcCommand::Resume => {
                let name = self.target(command, node)?.name;
                self.disconnect_providers().await;
                self.bounded(format!("resume of {name}"), self.network.resume_node(&name))
                    .await?;
                self.settle().await;
                self.reconnect_providers().await?;
                Ok((json!(true), format!("{name} resumed")))
            }
            IpcCommand::Kill => {
                let target = self.target(command, node)?;
                let name = target.name;
                let pid = target.pid.ok_or_else(|| {
                    Error::IpcProtocol(format!("Node '{name}' has no tracked process"))
                })?;
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
                    Error::IpcProtocol(format!("Failed to signal {name} (pid {pid}): {e}"))
                })?;
                self.network.forget_process(&name);
                info!(node = %name, pid, "Zombie node killed");
                Ok((json!(true), format!("{name} killed")))
            }
            IpcCommand::IsUp => {
                let name = self.target(command, node)?.name;
                let up = self
                    .bounded(format!("isup of {name}"), self.network.is_up(&name))
                    .await?;
                let state = if up { "up" } else { "down" };
                Ok((json!(up), format!("{name} is {state}")))
            }
        }
    }
}

/// Supervises one running zombie network.
pub struct ZombieSupervisor {
    network: Arc<dyn ZombieNetworkHandle>,
    ipc: IpcServer,
    provider_specs: Vec<ProviderSpec>,
    guard: Option<JoinHandle<()>>,
    interrupted: watch::Receiver<bool>,
    stopped: bool,
}

impl std::fmt::Debug for ZombieSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZombieSupervisor")
            .field("tmp_dir", &self.network.tmp_dir())
            .field("socket", &self.ipc.path())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl ZombieSupervisor {
    /// Starts the network, publishes its endpoints and binds the IPC socket.
    ///
    /// `configured` providers are used as-is; when empty, the default
    /// parachain/relaychain set is derived from the published endpoints.
    pub async fn start(
        orchestrator: &dyn NetworkOrchestrator,
        plan: &ZombiePlan,
        configured: &[ProviderSpec],
        providers: Arc<ProviderManager>,
        timings: IpcTimings,
        signal_guard: bool,
    ) -> Result<Self> {
        info!(name = %plan.name, config = %plan.config_path.display(), "Starting zombie network");
        let network = orchestrator.start(&plan.name, &plan.config_path).await?;

        let socket_path = network.tmp_dir().join(SOCKET_FILE_NAME);
        publish_network_env(network.as_ref(), &socket_path);

        let provider_specs = if configured.is_empty() {
            default_zombie_providers(!plan.disable_default_eth_providers)
        } else {
            configured.to_vec()
        };

        let control = Arc::new(ZombieControl::new(
            Arc::clone(&network),
            providers,
            provider_specs.clone(),
            timings,
        ));
        let ipc = match IpcServer::bind(&socket_path, control).await {
            Ok(server) => server,
            Err(e) => {
                if let Err(stop_err) = network.stop().await {
                    warn!(error = %stop_err, "Stopping network after IPC bind failure");
                }
                return Err(e);
            }
        };

        let (interrupt_tx, interrupted) = watch::channel(false);
        let guard = signal_guard
            .then(|| spawn_signal_guard(Arc::clone(&network), tokio::signal::ctrl_c(), interrupt_tx));

        info!(
            nodes = network.nodes().len(),
            socket = %socket_path.display(),
            "Zombie network running"
        );
        Ok(Self {
            network,
            ipc,
            provider_specs,
            guard,
            interrupted,
            stopped: false,
        })
    }

    pub fn network(&self) -> &Arc<dyn ZombieNetworkHandle> {
        &self.network
    }

    pub fn socket_path(&self) -> &Path {
        self.ipc.path()
    }

    /// Flips to `true` once the signal guard has handled a Ctrl-C. Never
    /// changes when the guard is off.
    pub fn interrupted(&self) -> watch::Receiver<bool> {
        self.interrupted.clone()
    }

    /// Providers to connect for this network.
    pub fn provider_specs(&self) -> &[ProviderSpec] {
        &self.provider_specs
    }

    pub fn node_names(&self) -> Vec<String> {
        self.network.nodes().into_iter().map(|n| n.name).collect()
    }

    /// Starts echoing WARN/ERROR lines from `{tmp}/{node}.log`.
    pub fn tail_logs(&self) -> Vec<JoinHandle<()>> {
        let tmp = self.network.tmp_dir();
        self.node_names()
            .into_iter()
            .map(|name| {
                let path = tmp.join(format!("{name}.log"));
                tokio::spawn(tail_log(name, path))
            })
            .collect()
    }

    /// Stops the network, signals leftover node processes, waits for them,
    /// and closes the IPC socket. Idempotent.
    pub async fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        if self.stopped {
            return report;
        }
        self.stopped = true;

        if let Some(guard) = self.guard.take() {
            guard.abort();
        }

        let pids = tracked_pids(self.network.as_ref());
        report.record("zombie network", self.network.stop().await);

        let remaining: Vec<u32> = pids.into_iter().filter(|pid| pid_alive(*pid)).collect();
        if !remaining.is_empty() {
            debug!(pids = ?remaining, "Signalling remaining zombie processes");
            signal_pids(&remaining, Signal::SIGTERM);
            let stragglers = wait_for_pids(&remaining, STOP_GRACE).await;
            for pid in stragglers {
                report.record(
                    "zombie network",
                    Err(Error::teardown(format!("pid {pid}"), "still running after SIGTERM")),
                );
            }
        }

        report.record("ipc server", self.ipc.close());
        report
    }
}

impl Drop for ZombieSupervisor {
    fn drop(&mut self) {
        if !self.stopped {
            if let Some(guard) = self.guard.take() {
                guard.abort();
            }
            let pids: Vec<u32> = tracked_pids(self.network.as_ref())
                .into_iter()
                .filter(|pid| pid_alive(*pid))
                .collect();
            signal_pids(&pids, Signal::SIGTERM);
        }
    }
}

fn publish_network_env(network: &dyn ZombieNetworkHandle, socket_path: &Path) {
    if let Some(relay) = network.relay_ws_uris().first() {
        env::set(env::MOON_RELAY_WSS, relay);
    }
    if let Some(para) = network.para_ws_uris().values().flatten().next() {
        env::set(env::MOON_PARA_WSS, para);
    }
    let names: Vec<String> = network.nodes().into_iter().map(|n| n.name).collect();
    env::set(env::MOON_ZOMBIE_DIR, network.tmp_dir().to_string_lossy());
    env::set(env::MOON_ZOMBIE_NODES, env::join_node_list(&names));
    env::set(env::MOON_IPC_SOCKET, socket_path.to_string_lossy());
}

fn tracked_pids(network: &dyn ZombieNetworkHandle) -> Vec<u32> {
    network.nodes().into_iter().filter_map(|n| n.pid).collect()
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn signal_pids(pids: &[u32], signal: Signal) {
    for &pid in pids {
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            debug!(pid, error = %e, "Signal failed");
        }
    }
}

/// Polls until every pid is gone or `grace` elapses; returns the survivors.
async fn wait_for_pids(pids: &[u32], grace: Duration) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|pid| pid_alive(*pid)).collect();
        if alive.is_empty() || tokio::time::Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
}

/// Once `interrupt` fires, signals every tracked node and reports it on
/// `interrupted`. Exiting is left to the caller.
fn spawn_signal_guard<F>(
    network: Arc<dyn ZombieNetworkHandle>,
    interrupt: F,
    interrupted: watch::Sender<bool>,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if interrupt.await.is_ok() {
            let pids = tracked_pids(network.as_ref());
            warn!(pids = ?pids, "Interrupted, signalling zombie nodes");
            signal_pids(&pids, Signal::SIGTERM);
            let _ = interrupted.send(true);
        }
    })
}

/// Lines worth echoing from a node log.
pub fn notable_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| LOG_LEVEL_RE.is_match(line))
}

async fn tail_log(node: String, path: PathBuf) {
    let mut offset = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    let mut partial = String::new();

    loop {
        tokio::time::sleep(LOG_TAIL_INTERVAL).await;
        let Ok(len) = tokio::fs::metadata(&path).await.map(|m| m.len()) else {
            continue;
        };
        if len < offset {
            offset = 0;
            partial.clear();
        }
        if len == offset {
            continue;
        }

        let chunk = match read_from(&path, offset).await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(node = %node, error = %e, "Log tail read failed");
                continue;
            }
        };
        offset += chunk.len() as u64;
        partial.push_str(&String::from_utf8_lossy(&chunk));

        let complete = match partial.rfind('\n') {
            Some(idx) => partial.drain(..=idx).collect::<String>(),
            None => continue,
        };
        for line in notable_lines(&complete) {
            warn!(node = %node, "{line}");
        }
    }
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Waits until every chain provider reports a nonzero block height.
pub async fn wait_for_block_production(providers: &ProviderManager, wait: BlockWait) -> Result<()> {
    let chain_providers: Vec<_> = providers
        .providers()
        .await
        .into_iter()
        .filter(|p| p.kind().is_substrate() || p.kind().is_ethereum())
        .collect();

    let all_producing = join_all(chain_providers.iter().map(|provider| async move {
        loop {
            match provider.client().block_height().await {
                Ok(height) if height > 0 => {
                    info!(name = %provider.name(), height, "Chain producing blocks");
                    return;
                }
                Ok(_) => debug!(name = %provider.name(), "Waiting for first block"),
                Err(e) => debug!(name = %provider.name(), error = %e, "Block height query failed"),
            }
            tokio::time::sleep(wait.interval).await;
        }
    }));

    tokio::time::timeout(wait.timeout, all_producing)
        .await
        .map(|_| ())
        .map_err(|_| Error::Timeout {
            elapsed: wait.timeout,
            what: "block production on every chain".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notable_lines() {
        let log = "2024-01-01 INFO imported #1\n\
                   2024-01-01 WARN peer dropped\n\
                   2024-01-01 ERROR runtime panicked\n\
                   WARNING is not a level\n";
        let lines: Vec<_> = notable_lines(log).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("peer dropped"));
        assert!(lines[1].contains("runtime panicked"));
    }

    #[test]
    fn test_zombie_node_serializes_camel_case() {
        let node = ZombieNode {
            name: "alice".to_string(),
            pid: Some(42),
            ws_uri: "ws://127.0.0.1:9944".to_string(),
        };
        assert_eq!(
            json!(node),
            json!({ "name": "alice", "pid": 42, "wsUri": "ws://127.0.0.1:9944" })
        );
    }

    #[tokio::test]
    async fn test_wait_for_pids_returns_survivors() {
        // Our own pid never exits.
        let own = std::process::id();
        let survivors = wait_for_pids(&[own], Duration::from_millis(150)).await;
        assert_eq!(survivors, vec![own]);
    }

    #[tokio::test]
    async fn test_signal_guard_terminates_nodes_and_reports() {
        use crate::testing::FakeNetwork;
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let network: Arc<dyn ZombieNetworkHandle> = Arc::new(FakeNetwork::with_nodes(
            std::env::temp_dir(),
            vec![ZombieNode {
                name: "alice".to_string(),
                pid: child.id(),
                ws_uri: "ws://127.0.0.1:9944".to_string(),
            }],
        ));
        let (fire, trigger) = tokio::sync::oneshot::channel::<()>();
        let (tx, mut interrupted) = watch::channel(false);

        let guard = spawn_signal_guard(network, async move { trigger.await.map_err(std::io::Error::other) }, tx);
        assert!(!*interrupted.borrow());
        fire.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), interrupted.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        guard.await.unwrap();
    }
}
