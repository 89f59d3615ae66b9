//! Context lifecycle against in-memory collaborators.

use moonwall_adapters::ProbeConfig;
use moonwall_adapters::testing::{FakeContainerRuntime, FakeRpcServer};
use moonwall_core::testing::FakeConnector;
use moonwall_core::{
    ContextOptions, EnvironmentConfig, FoundationKind, IpcTimings, LaunchTimeouts, MoonwallConfig,
    MoonwallContext, RetryPolicy, env,
};
use moonwall_proto::Error;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
environments:
  - name: dev_tracked
    testFileDir: ["suites/dev"]
    foundation:
      type: dev
      launchSpec:
        - name: moonbeam
          binPath: ./tmp/moonbeam
          running: true
          ports:
            rpcPort: 9944
  - name: read_only
    foundation:
      type: read_only
    connections:
      - name: polkadotJs
        type: polkadotJs
        endpoints: ["ws://127.0.0.1:9944"]
      - name: viem
        type: viem
        endpoints: ["ws://127.0.0.1:9944"]
  - name: read_only_bare
    foundation:
      type: read_only
"#;

fn environment(name: &str) -> EnvironmentConfig {
    MoonwallConfig::from_yaml(CONFIG)
        .unwrap()
        .environment(name)
        .unwrap()
        .clone()
}

fn options(dir: &TempDir) -> ContextOptions {
    ContextOptions {
        log_dir: dir.path().join("logs"),
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
        },
        ipc: IpcTimings {
            settle_delay: Duration::ZERO,
            ..IpcTimings::default()
        },
        signal_guard: false,
        ..ContextOptions::default()
    }
}

#[tokio::test]
#[serial]
async fn test_dev_setup_yields_one_node() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MoonwallContext::new(environment("dev_tracked"), options(&dir)).unwrap();

    let plan = ctx.setup_foundation().unwrap();
    assert_eq!(plan.kind, FoundationKind::Dev);
    assert_eq!(plan.nodes.len(), 1);
    assert_eq!(plan.providers.len(), 4);

    assert_eq!(env::get(env::MOON_TEST_ENV).as_deref(), Some("dev_tracked"));
    assert_eq!(env::get(env::MOONWALL_RPC_PORT).as_deref(), Some("9944"));
}

#[tokio::test]
#[serial]
async fn test_mismatched_foundation_leaves_no_plan() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MoonwallContext::new(environment("read_only_bare"), options(&dir)).unwrap();

    let err = ctx.setup_foundation().unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(ctx.plan().is_none());
    assert!(ctx.nodes().is_empty());
}

#[tokio::test]
#[serial]
async fn test_start_network_twice_keeps_node_set() {
    env::remove(env::MOON_RECYCLE);
    let dir = TempDir::new().unwrap();
    let mut ctx = MoonwallContext::new(environment("dev_tracked"), options(&dir)).unwrap();
    assert!(ctx.node_names().is_empty());

    ctx.start_network().await.unwrap();
    let first = ctx.node_names();
    assert_eq!(first, vec!["moonbeam"]);
    assert!(ctx.nodes()[0].entity.is_none());
    assert_eq!(ctx.nodes()[0].rpc_port, Some(9944));

    ctx.start_network().await.unwrap();
    assert_eq!(ctx.node_names(), first);

    let report = ctx.destroy(None).await;
    assert!(report.is_clean());
    assert!(ctx.node_names().is_empty());
}

#[tokio::test]
#[serial]
async fn test_recycle_skips_launch() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MoonwallContext::new(environment("dev_tracked"), options(&dir)).unwrap();

    env::set(env::MOON_RECYCLE, "true");
    ctx.start_network().await.unwrap();
    env::remove(env::MOON_RECYCLE);

    assert!(ctx.node_names().is_empty());
}

#[tokio::test]
#[serial]
async fn test_connect_environment_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(FakeConnector::new());
    let mut ctx = MoonwallContext::new(environment("read_only"), options(&dir))
        .unwrap()
        .with_connector(connector.clone());

    ctx.connect_environment(false).await.unwrap();
    ctx.connect_environment(true).await.unwrap();

    assert_eq!(connector.total_attempts(), 2);
    assert!(ctx.provider("polkadotJs").await.is_some());
    assert!(ctx.provider("viem").await.is_some());
}

#[tokio::test]
#[serial]
async fn test_rejecting_provider_fails_connect_with_attempt_count() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(FakeConnector::new().reject("viem"));
    let mut ctx = MoonwallContext::new(environment("read_only"), options(&dir))
        .unwrap()
        .with_connector(connector.clone());

    let err = ctx.connect_environment(true).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("'viem'"), "{message}");
    assert!(message.contains("3 attempt(s)"), "{message}");
    assert_eq!(connector.attempts("viem"), 3);
    assert!(ctx.providers().is_empty().await);
}

#[tokio::test]
#[serial]
async fn test_destroy_completes_despite_rejecting_disconnect() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(FakeConnector::new().sticky("polkadotJs"));
    let mut ctx = MoonwallContext::new(environment("read_only"), options(&dir))
        .unwrap()
        .with_connector(connector.clone());
    ctx.connect_environment(true).await.unwrap();

    let report = ctx.destroy(Some("test finished")).await;

    assert_eq!(report.errors().len(), 1);
    assert!(matches!(
        &report.errors()[0],
        Error::Teardown { entity, .. } if entity == "provider polkadotJs"
    ));
    assert_eq!(connector.disconnects(), 2);
    assert!(ctx.providers().is_empty().await);
}

#[tokio::test]
#[serial]
async fn test_disconnect_single_provider() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(FakeConnector::new());
    let mut ctx = MoonwallContext::new(environment("read_only"), options(&dir))
        .unwrap()
        .with_connector(connector);
    ctx.connect_environment(true).await.unwrap();

    let report = ctx.disconnect(Some("viem")).await;
    assert!(report.is_clean());
    assert_eq!(ctx.providers().names().await, vec!["polkadotJs"]);
}

#[test]
fn test_dev_foundation_rejects_zombie_spec() {
    let yaml = r#"
environments:
  - name: confused
    foundation:
      type: dev
      launchSpec:
        - name: moonbeam
          binPath: ./tmp/moonbeam
      zombieSpec:
        configPath: ./configs/zombie.json
"#;
    let err: Error = MoonwallConfig::from_yaml(yaml).unwrap_err().into();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("zombieSpec"), "{err}");
}

#[test]
fn test_read_only_foundation_rejects_launch_spec() {
    let yaml = r#"
environments:
  - name: confused
    foundation:
      type: read_only
      launchSpec:
        - name: moonbeam
          binPath: ./tmp/moonbeam
    connections:
      - name: polkadotJs
        type: polkadotJs
        endpoints: ["ws://127.0.0.1:9944"]
"#;
    let err: Error = MoonwallConfig::from_yaml(yaml).unwrap_err().into();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("launchSpec"), "{err}");
}

fn single_environment(yaml: &str) -> EnvironmentConfig {
    MoonwallConfig::from_yaml(yaml)
        .unwrap()
        .environments
        .remove(0)
}

/// A node binary that starts but never opens an RPC port.
fn silent_node(dir: &Path) -> PathBuf {
    let path = dir.join("silent-node");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect()
}

#[tokio::test]
#[serial]
async fn test_launch_batch_timeout_terminates_spawned_node() {
    env::remove(env::MOON_RECYCLE);
    let dir = TempDir::new().unwrap();
    let bin = silent_node(dir.path());
    let environment = single_environment(&format!(
        r#"
environments:
  - name: stuck
    foundation:
      type: dev
      launchSpec:
        - name: stuck
          binPath: {}
          ports:
            rpcPort: 39944
"#,
        bin.display()
    ));
    let options = ContextOptions {
        timeouts: LaunchTimeouts {
            batch: Duration::from_millis(500),
            ..LaunchTimeouts::default()
        },
        probe: ProbeConfig {
            max_iterations: 1000,
            ..ProbeConfig::default()
        },
        ..options(&dir)
    };
    let mut ctx = MoonwallContext::new(environment, options).unwrap();

    let err = ctx.start_network().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err}");
    assert!(ctx.nodes().is_empty());

    let logs = log_files(&dir.path().join("logs"));
    assert_eq!(logs.len(), 1);
    let content = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(content.contains("process killed. reason: launch batch timed out"), "{content}");

    let pid: i32 = logs[0]
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit('_').next())
        .and_then(|pid| pid.parse().ok())
        .unwrap();
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
}

async fn docker_context(
    dir: &TempDir,
    server: &FakeRpcServer,
) -> (MoonwallContext, Arc<FakeContainerRuntime>) {
    let port = server.port();
    let environment = single_environment(&format!(
        r#"
environments:
  - name: docker_dev
    foundation:
      type: dev
      launchSpec:
        - name: moonbeam
          binPath: moonbeamfoundation/moonbeam:latest
          useDocker: true
          isEthereumChain: false
          options: ["--dev", "--rpc-port={port}"]
    connections:
      - name: polkadotJs
        type: polkadotJs
        endpoints: ["ws://127.0.0.1:{port}"]
      - name: papi
        type: papi
        endpoints: ["ws://127.0.0.1:{port}"]
"#
    ));
    let runtime = Arc::new(FakeContainerRuntime::new());
    let mut ctx = MoonwallContext::new(environment, options(dir))
        .unwrap()
        .with_container_runtime(runtime.clone())
        .with_connector(Arc::new(FakeConnector::new()));
    env::remove(env::MOON_RECYCLE);
    ctx.start_network().await.unwrap();
    (ctx, runtime)
}

#[tokio::test]
#[serial]
async fn test_destroy_reason_ends_container_log() {
    let dir = TempDir::new().unwrap();
    let server = FakeRpcServer::substrate().await.unwrap();
    let (mut ctx, runtime) = docker_context(&dir, &server).await;
    ctx.connect_environment(true).await.unwrap();

    let entity = ctx.nodes()[0].entity.as_ref().unwrap();
    let log_path = entity.log_path().to_path_buf();
    assert!(log_path.ends_with(moonwall_adapters::log_file_name(
        "moonbeamfoundation/moonbeam:latest",
        &server.port().to_string(),
        &format!("moonwall_moonbeam_{}", server.port()),
    )));

    let report = ctx.destroy(Some("xyz")).await;
    assert!(report.is_clean());

    let content = std::fs::read_to_string(&log_path).unwrap();
    let last = content.lines().last().unwrap();
    assert!(last.ends_with("reason: xyz"), "{last}");
    assert!(!content.contains("providers disconnected"));
    assert_eq!(runtime.calls().iter().filter(|c| c.starts_with("stop")).count(), 1);
}

#[tokio::test]
#[serial]
async fn test_disconnect_one_provider_leaves_nodes_running() {
    let dir = TempDir::new().unwrap();
    let server = FakeRpcServer::substrate().await.unwrap();
    let (mut ctx, runtime) = docker_context(&dir, &server).await;
    ctx.connect_environment(true).await.unwrap();

    let report = ctx.disconnect(Some("papi")).await;
    assert!(report.is_clean());
    assert_eq!(ctx.providers().names().await, vec!["polkadotJs"]);
    assert!(!runtime.calls().iter().any(|c| c.starts_with("stop")));
    assert!(ctx.nodes()[0].entity.as_ref().unwrap().is_alive().await);

    let report = ctx.disconnect(None).await;
    assert!(report.is_clean());
    assert!(runtime.calls().iter().any(|c| c.starts_with("stop")));

    ctx.destroy(None).await;
}
