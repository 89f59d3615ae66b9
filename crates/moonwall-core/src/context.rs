//! The root orchestrator: setup → launch → connect → teardown.
//!
//! At most one [`MoonwallContext`] is live per process. Creating a second one
//! fails unless [`ContextOptions::force`] is set, in which case the new
//! context takes over the claim.

use crate::config::{EnvironmentConfig, FoundationKind};
use crate::env;
use crate::foundation::{self, FoundationPlan, default_zombie_providers};
use crate::ipc::IpcTimings;
use crate::providers::{ConnectedProvider, DefaultConnector, ProviderConnector, ProviderManager, RetryPolicy};
use crate::teardown::TeardownReport;
use crate::zombie::{BlockWait, NetworkOrchestrator, ZombieSupervisor, wait_for_block_production};
use futures::future::{BoxFuture, join_all};
use moonwall_adapters::{
    ContainerRuntime, DockerCli, ProbeConfig, ProcessLauncher, RunningEntity, SpawnedEntities,
};
use moonwall_proto::{Error, NodeLaunchDescriptor, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Generation of the live context, 0 when none.
static ACTIVE: AtomicU64 = AtomicU64::new(0);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Bounds on one `start_network` launch batch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchTimeouts {
    pub batch: Duration,
    /// Used instead of `batch` when any node runs in a container.
    pub docker_batch: Duration,
}

impl Default for LaunchTimeouts {
    fn default() -> Self {
        Self {
            batch: Duration::from_secs(60),
            docker_batch: Duration::from_secs(300),
        }
    }
}

/// Construction options and tunables.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Replace a live context instead of failing.
    pub force: bool,
    pub log_dir: PathBuf,
    pub timeouts: LaunchTimeouts,
    pub retry: RetryPolicy,
    pub probe: ProbeConfig,
    pub ipc: IpcTimings,
    pub block_wait: BlockWait,
    /// Signal zombie nodes on Ctrl-C and report it through
    /// [`MoonwallContext::interrupted`]. Embedders that handle Ctrl-C
    /// themselves turn this off.
    pub signal_guard: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            force: false,
            log_dir: env::log_location(),
            timeouts: LaunchTimeouts::default(),
            retry: RetryPolicy::default(),
            probe: ProbeConfig::default(),
            ipc: IpcTimings::default(),
            block_wait: BlockWait::default(),
            signal_guard: true,
        }
    }
}

type CleanupHandler = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A node the context knows about. `entity` is `None` for nodes tracked
/// without being launched (`launch = false`).
#[derive(Debug)]
pub struct TrackedNode {
    pub descriptor: NodeLaunchDescriptor,
    pub entity: Option<RunningEntity>,
    pub rpc_port: Option<u16>,
}

/// Owns the lifecycle of one environment.
pub struct MoonwallContext {
    generation: u64,
    environment: EnvironmentConfig,
    options: ContextOptions,
    plan: Option<FoundationPlan>,
    nodes: Vec<TrackedNode>,
    launcher: ProcessLauncher,
    orchestrator: Option<Arc<dyn NetworkOrchestrator>>,
    zombie: Option<ZombieSupervisor>,
    providers: Arc<ProviderManager>,
    cleanup: Vec<(String, CleanupHandler)>,
}

impl std::fmt::Debug for MoonwallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoonwallContext")
            .field("generation", &self.generation)
            .field("environment", &self.environment.name)
            .field("nodes", &self.nodes)
            .field("zombie", &self.zombie)
            .finish_non_exhaustive()
    }
}

impl MoonwallContext {
    /// Claims the process-wide slot and builds a context for `environment`.
    pub fn new(environment: EnvironmentConfig, options: ContextOptions) -> Result<Self> {
        let generation = claim(options.force)?;
        debug!(env = %environment.name, generation, "Context created");

        let launcher = ProcessLauncher::new(&options.log_dir, Arc::new(DockerCli::default()))
            .with_probe(options.probe);
        let providers = Arc::new(ProviderManager::new(Arc::new(DefaultConnector), options.retry));

        Ok(Self {
            generation,
            environment,
            options,
            plan: None,
            nodes: Vec::new(),
            launcher,
            orchestrator: None,
            zombie: None,
            providers,
            cleanup: Vec::new(),
        })
    }

    /// Uses `connector` to create provider clients.
    pub fn with_connector(mut self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.providers = Arc::new(ProviderManager::new(connector, self.options.retry));
        self
    }

    /// Uses `runtime` for dockerised nodes.
    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.launcher = ProcessLauncher::new(&self.options.log_dir, runtime).with_probe(self.options.probe);
        self
    }

    /// Uses `orchestrator` to build zombie networks.
    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn NetworkOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// True while some context holds the process-wide slot.
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::SeqCst) != 0
    }

    pub fn environment(&self) -> &EnvironmentConfig {
        &self.environment
    }

    pub fn plan(&self) -> Option<&FoundationPlan> {
        self.plan.as_ref()
    }

    pub fn nodes(&self) -> &[TrackedNode] {
        &self.nodes
    }

    /// Names of every tracked node, zombie nodes included.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|n| n.descriptor.name.clone()).collect();
        if let Some(zombie) = &self.zombie {
            names.extend(zombie.node_names());
        }
        names
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    pub async fn provider(&self, name: &str) -> Option<Arc<ConnectedProvider>> {
        self.providers.get(name).await
    }

    pub fn zombie(&self) -> Option<&ZombieSupervisor> {
        self.zombie.as_ref()
    }

    /// Interrupt notifications from the zombie signal guard, once a zombie
    /// network is running.
    pub fn interrupted(&self) -> Option<tokio::sync::watch::Receiver<bool>> {
        self.zombie.as_ref().map(ZombieSupervisor::interrupted)
    }

    /// Resolves the environment into a launch/connect plan.
    ///
    /// On failure nothing is stored or published.
    pub fn setup_foundation(&mut self) -> Result<&FoundationPlan> {
        let plan = foundation::setup(&self.environment)?;

        env::set(env::MOON_TEST_ENV, &self.environment.name);
        if let Some(port) = plan.rpc_port {
            env::set(env::MOONWALL_RPC_PORT, port.to_string());
        }
        info!(
            env = %self.environment.name,
            foundation = %plan.kind,
            nodes = plan.nodes.len(),
            "Foundation ready"
        );
        Ok(self.plan.insert(plan))
    }

    /// Launches the planned nodes, or starts the zombie network.
    ///
    /// No-op under `MOON_RECYCLE` or when nodes are already tracked.
    pub async fn start_network(&mut self) -> Result<()> {
        if env::recycle() {
            info!("MOON_RECYCLE set, reusing running infrastructure");
            return Ok(());
        }
        if !self.nodes.is_empty() || self.zombie.is_some() {
            debug!(nodes = ?self.node_names(), "Network already started");
            return Ok(());
        }
        if self.plan.is_none() {
            self.setup_foundation()?;
        }
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| Error::config("Foundation plan missing after setup"))?;

        match plan.kind {
            FoundationKind::Zombie => self.start_zombie(&plan).await,
            _ => self.launch_nodes(&plan).await,
        }
    }

    async fn launch_nodes(&mut self, plan: &FoundationPlan) -> Result<()> {
        let limit = if plan.launches_docker() {
            self.options.timeouts.docker_batch
        } else {
            self.options.timeouts.batch
        };

        let (to_launch, tracked_only): (Vec<_>, Vec<_>) = plan.nodes.iter().partition(|n| n.launch);
        for node in &tracked_only {
            info!(name = %node.name, "Node marked as running, tracking without launch");
        }

        let launcher = &self.launcher;
        let spawned = SpawnedEntities::new();
        let batch = join_all(to_launch.iter().map(|node| launcher.launch_into(node, &spawned)));
        let Ok(results) = tokio::time::timeout(limit, batch).await else {
            let orphans = spawned.take();
            warn!(?limit, spawned = orphans.len(), "Launch batch timed out, terminating spawned nodes");
            let outcomes = join_all(orphans.iter().map(|entity| entity.terminate("launch batch timed out"))).await;
            for (entity, outcome) in orphans.iter().zip(outcomes) {
                if let Err(e) = outcome {
                    warn!(name = %entity.name(), error = %e, "Could not terminate node after launch timeout");
                }
            }
            return Err(Error::Timeout {
                elapsed: limit,
                what: format!("launch of {} node(s)", to_launch.len()),
            });
        };

        let mut tracked = Vec::with_capacity(plan.nodes.len());
        let mut first_error = None;
        for (node, result) in to_launch.iter().zip(results) {
            match result {
                Ok(launched) => tracked.push(TrackedNode {
                    descriptor: (*node).clone(),
                    entity: Some(launched.entity),
                    rpc_port: launched.rpc_port,
                }),
                Err(e) => {
                    warn!(name = %node.name, error = %e, "Node launch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for node in tracked {
                if let Some(entity) = node.entity
                    && let Err(kill_err) = entity.terminate("another node failed to launch").await
                {
                    debug!(name = %entity.name(), error = %kill_err, "Cleanup after failed batch");
                }
            }
            return Err(e);
        }

        tracked.extend(tracked_only.into_iter().map(|node| TrackedNode {
            descriptor: node.clone(),
            entity: None,
            rpc_port: node.rpc_port(),
        }));
        info!(nodes = tracked.len(), "Network started");
        self.nodes = tracked;
        Ok(())
    }

    async fn start_zombie(&mut self, plan: &FoundationPlan) -> Result<()> {
        let zombie_plan = plan
            .zombie
            .as_ref()
            .ok_or_else(|| Error::config("Zombie plan missing"))?;
        let orchestrator = self.orchestrator.clone().ok_or_else(|| {
            Error::config("Zombie foundation needs a network orchestrator, none was provided")
        })?;

        let supervisor = ZombieSupervisor::start(
            orchestrator.as_ref(),
            zombie_plan,
            &plan.providers,
            Arc::clone(&self.providers),
            self.options.ipc,
            self.options.signal_guard,
        )
        .await?;
        self.zombie = Some(supervisor);
        Ok(())
    }

    /// Connects the planned providers. No-op when already connected.
    ///
    /// Zombie environments then wait for every chain to produce a block,
    /// echoing WARN/ERROR node log lines meanwhile unless disabled.
    pub async fn connect_environment(&mut self, silent: bool) -> Result<()> {
        if !self.providers.is_empty().await {
            debug!("Providers already connected");
            return Ok(());
        }
        if self.plan.is_none() {
            self.setup_foundation()?;
        }
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| Error::config("Foundation plan missing after setup"))?;

        let specs = match (&self.zombie, &plan.zombie) {
            (Some(zombie), _) => zombie.provider_specs().to_vec(),
            (None, Some(zombie_plan)) if plan.providers.is_empty() => {
                default_zombie_providers(!zombie_plan.disable_default_eth_providers)
            }
            _ => plan.providers.clone(),
        };

        self.providers.connect_all(&specs).await?;

        if !silent {
            for provider in self.providers.providers().await {
                match provider.greet().await {
                    Ok(greeting) => info!(name = %provider.name(), kind = %provider.kind(), chain = %greeting, "Provider ready"),
                    Err(e) => warn!(name = %provider.name(), error = %e, "Provider greeting failed"),
                }
            }
        }

        if let (Some(zombie), Some(zombie_plan)) = (&self.zombie, &plan.zombie)
            && !zombie_plan.skip_block_check
        {
            let tails = if zombie_plan.disable_log_eavesdropping {
                Vec::new()
            } else {
                zombie.tail_logs()
            };
            let waited = wait_for_block_production(&self.providers, self.options.block_wait).await;
            for tail in tails {
                tail.abort();
            }
            waited?;
        }
        Ok(())
    }

    /// Registers an async hook run (once) by the next `disconnect`.
    pub fn register_cleanup<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: CleanupHandler = Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(handler())
        });
        self.cleanup.push((name.into(), handler));
    }

    /// Disconnects one provider or all of them, then runs and clears the
    /// cleanup handlers. Disconnecting all providers also sends a
    /// termination signal to launched nodes.
    pub async fn disconnect(&mut self, provider: Option<&str>) -> TeardownReport {
        self.disconnect_with_reason(provider, "providers disconnected").await
    }

    async fn disconnect_with_reason(&mut self, provider: Option<&str>, reason: &str) -> TeardownReport {
        let mut report = TeardownReport::new();
        report.extend(self.providers.disconnect(provider).await);

        if provider.is_none() {
            for node in &self.nodes {
                if let Some(entity) = &node.entity {
                    report.record(entity.name(), entity.kill(reason).await);
                }
            }
        }

        for (name, handler) in std::mem::take(&mut self.cleanup) {
            debug!(handler = %name, "Running cleanup handler");
            report.record(&format!("cleanup {name}"), handler().await);
        }
        report
    }

    /// Tears everything down. Never fails; step failures are collected in
    /// the returned report and logged.
    pub async fn destroy(&mut self, reason: Option<&str>) -> TeardownReport {
        let reason = reason.unwrap_or("test environment destroyed");
        info!(env = %self.environment.name, reason = %reason, "Destroying context");

        let mut report = self.disconnect_with_reason(None, reason).await;

        for node in self.nodes.drain(..) {
            if let Some(entity) = node.entity {
                report.record(entity.name(), entity.terminate(reason).await);
            }
        }

        if let Some(mut zombie) = self.zombie.take() {
            report.merge(zombie.stop().await);
        }

        report.log(&self.environment.name);
        report
    }
}

impl Drop for MoonwallContext {
    fn drop(&mut self) {
        for node in &self.nodes {
            if let Some(pid) = node.entity.as_ref().and_then(RunningEntity::pid) {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        release(self.generation);
    }
}

fn claim(force: bool) -> Result<u64> {
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
    if force {
        let previous = ACTIVE.swap(generation, Ordering::SeqCst);
        if previous != 0 {
            warn!(previous, generation, "Replacing live context");
        }
        return Ok(generation);
    }
    ACTIVE
        .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| generation)
        .map_err(|_| {
            Error::config("A MoonwallContext already exists in this process; use force to recreate it")
        })
}

fn release(generation: u64) {
    // A forced successor owns the slot now; leave it alone.
    let _ = ACTIVE.compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MoonwallConfig;
    use serial_test::serial;

    fn read_only_env() -> EnvironmentConfig {
        let config = MoonwallConfig::from_json(
            r#"{"environments":[{"name":"ro","foundation":{"type":"read_only"},
                "connections":[{"name":"eth","type":"ethers","endpoints":["ws://127.0.0.1:1"]}]}]}"#,
        )
        .unwrap();
        config.environments.into_iter().next().unwrap()
    }

    #[test]
    #[serial]
    fn test_second_context_requires_force() {
        let first = MoonwallContext::new(read_only_env(), ContextOptions::default()).unwrap();
        assert!(MoonwallContext::is_active());

        let err = MoonwallContext::new(read_only_env(), ContextOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let forced = MoonwallContext::new(
            read_only_env(),
            ContextOptions {
                force: true,
                ..ContextOptions::default()
            },
        )
        .unwrap();

        // Dropping the replaced context must not free the successor's slot.
        drop(first);
        assert!(MoonwallContext::is_active());
        drop(forced);
        assert!(!MoonwallContext::is_active());

        let again = MoonwallContext::new(read_only_env(), ContextOptions::default());
        assert!(again.is_ok());
    }

    #[tokio::test]
    #[serial]
    async fn test_cleanup_handlers_run_once() {
        use std::sync::atomic::AtomicU32;

        let mut ctx = MoonwallContext::new(read_only_env(), ContextOptions::default()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        ctx.register_cleanup("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        ctx.register_cleanup("fails", || async { Err(Error::Rpc("boom".to_string())) });

        let report = ctx.disconnect(None).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(report.errors().len(), 1);
        assert!(matches!(&report.errors()[0], Error::Teardown { entity, .. } if entity == "cleanup fails"));

        let report = ctx.disconnect(None).await;
        assert!(report.is_clean());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
