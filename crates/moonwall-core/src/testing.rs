//! Testing utilities: in-memory collaborators for deterministic tests.
//!
//! - [`FakeConnector`]: scripted provider connections
//! - [`FakeNetwork`] / [`FakeOrchestrator`]: a zombie network that records calls

use crate::providers::ProviderConnector;
use crate::zombie::{NetworkOrchestrator, ZombieNetworkHandle, ZombieNode};
use async_trait::async_trait;
use moonwall_adapters::{Greeting, ProviderClient, RpcClient};
use moonwall_proto::{Error, ProviderKind, ProviderSpec, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a named provider behaves when connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Reject,
    FailFirst(u32),
    Hang,
    StickyDisconnect,
}

/// Provider connector following per-name scripts. Unscripted names connect.
#[derive(Debug, Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, Script>>,
    attempts: Mutex<HashMap<String, u32>>,
    block_height: Arc<AtomicU64>,
    disconnects: Arc<AtomicU32>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt for `name` fails.
    pub fn reject(self, name: &str) -> Self {
        self.script(name, Script::Reject)
    }

    /// The first `failures` attempts for `name` fail.
    pub fn fail_first(self, name: &str, failures: u32) -> Self {
        self.script(name, Script::FailFirst(failures))
    }

    /// Attempts for `name` never complete.
    pub fn hang(self, name: &str) -> Self {
        self.script(name, Script::Hang)
    }

    /// `name` connects but its disconnect fails.
    pub fn sticky(self, name: &str) -> Self {
        self.script(name, Script::StickyDisconnect)
    }

    fn script(self, name: &str, script: Script) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(name.to_string(), script);
        }
        self
    }

    /// Connection attempts made for `name`.
    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().map(|a| a.values().sum()).unwrap_or(0)
    }

    /// Successful and failed disconnect calls across all clients.
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Height reported by every client.
    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect(&self, spec: &ProviderSpec) -> Result<Box<dyn ProviderClient>> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| Error::Rpc("attempt counter poisoned".to_string()))?;
            let count = attempts.entry(spec.name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|s| s.get(&spec.name).copied());

        match script {
            Some(Script::Reject) => return Err(Error::Rpc("connection refused".to_string())),
            Some(Script::FailFirst(n)) if attempt <= n => {
                return Err(Error::Rpc(format!("not ready (attempt {attempt})")));
            }
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            _ => {}
        }

        Ok(Box::new(FakeClient {
            kind: spec.kind.clone(),
            endpoint: spec.primary_endpoint().unwrap_or_default().to_string(),
            fail_disconnect: script == Some(Script::StickyDisconnect),
            block_height: Arc::clone(&self.block_height),
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

/// Client handed out by [`FakeConnector`].
#[derive(Debug)]
pub struct FakeClient {
    kind: ProviderKind,
    endpoint: String,
    fail_disconnect: bool,
    block_height: Arc<AtomicU64>,
    disconnects: Arc<AtomicU32>,
}

#[async_trait]
impl ProviderClient for FakeClient {
    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api(&self) -> Option<&RpcClient> {
        None
    }

    async fn greet(&self) -> Result<Greeting> {
        Ok(Greeting {
            chain: "Fake Chain".to_string(),
            detail: format!("{} fake", self.kind),
        })
    }

    async fn block_height(&self) -> Result<u64> {
        Ok(self.block_height.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect {
            Err(Error::Rpc("socket already gone".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory zombie network recording every call.
#[derive(Debug)]
pub struct FakeNetwork {
    tmp_dir: PathBuf,
    relay: Vec<String>,
    paras: BTreeMap<String, Vec<String>>,
    nodes: Mutex<Vec<ZombieNode>>,
    paused: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    fail_stop: AtomicBool,
    hang_is_up: AtomicBool,
}

impl FakeNetwork {
    /// A relay node `alice` and a collator `charlie` without real processes.
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self::with_nodes(
            tmp_dir,
            vec![
                ZombieNode {
                    name: "alice".to_string(),
                    pid: None,
                    ws_uri: "ws://127.0.0.1:9944".to_string(),
                },
                ZombieNode {
                    name: "charlie".to_string(),
                    pid: None,
                    ws_uri: "ws://127.0.0.1:9947".to_string(),
                },
            ],
        )
    }

    /// First node is the relay, the rest are collators of para `1000`.
    pub fn with_nodes(tmp_dir: impl Into<PathBuf>, nodes: Vec<ZombieNode>) -> Self {
        let relay = nodes.first().map(|n| vec![n.ws_uri.clone()]).unwrap_or_default();
        let collators: Vec<String> = nodes.iter().skip(1).map(|n| n.ws_uri.clone()).collect();
        let paras = if collators.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("1000".to_string(), collators)])
        };
        Self {
            tmp_dir: tmp_dir.into(),
            relay,
            paras,
            nodes: Mutex::new(nodes),
            paused: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            fail_stop: AtomicBool::new(false),
            hang_is_up: AtomicBool::new(false),
        }
    }

    /// Makes `stop` fail.
    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Makes `is_up` never answer.
    pub fn hang_is_up(&self) {
        self.hang_is_up.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ZombieNetworkHandle for FakeNetwork {
    fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone()
    }

    fn relay_ws_uris(&self) -> Vec<String> {
        self.relay.clone()
    }

    fn para_ws_uris(&self) -> BTreeMap<String, Vec<String>> {
        self.paras.clone()
    }

    fn nodes(&self) -> Vec<ZombieNode> {
        self.nodes.lock().map(|n| n.clone()).unwrap_or_default()
    }

    fn forget_process(&self, name: &str) {
        self.record(format!("forget:{name}"));
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.retain(|n| n.name != name);
        }
    }

    async fn restart_node(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("restart:{name}"));
        Ok(())
    }

    async fn pause_node(&self, name: &str) -> Result<()> {
        self.record(format!("pause:{name}"));
        if let Ok(mut paused) = self.paused.lock() {
            paused.insert(name.to_string());
        }
        Ok(())
    }

    async fn resume_node(&self, name: &str) -> Result<()> {
        self.record(format!("resume:{name}"));
        if let Ok(mut paused) = self.paused.lock() {
            paused.remove(name);
        }
        Ok(())
    }

    async fn is_up(&self, name: &str) -> Result<bool> {
        if self.hang_is_up.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .paused
            .lock()
            .map(|p| !p.contains(name))
            .unwrap_or(false))
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop".to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Orchestrator("network already torn down".to_string()));
        }
        Ok(())
    }
}

/// Orchestrator handing out one shared [`FakeNetwork`].
#[derive(Debug)]
pub struct FakeOrchestrator {
    network: Arc<FakeNetwork>,
    starts: AtomicU32,
}

impl FakeOrchestrator {
    pub fn new(network: Arc<FakeNetwork>) -> Self {
        Self {
            network,
            starts: AtomicU32::new(0),
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkOrchestrator for FakeOrchestrator {
    async fn start(&self, name: &str, config: &Path) -> Result<Arc<dyn ZombieNetworkHandle>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.network
            .record(format!("start:{name}:{}", config.display()));
        Ok(Arc::clone(&self.network) as Arc<dyn ZombieNetworkHandle>)
    }
}
