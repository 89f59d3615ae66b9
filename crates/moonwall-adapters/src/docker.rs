//! Containerised node launch.
//!
//! The container runtime is a trait so tests (and alternative engines) can
//! stand in for Docker. `DockerCli` drives the `docker` binary.

use crate::entity::RunningEntity;
use crate::launcher::{LaunchedNode, SpawnedEntities, append_line, log_file_name};
use crate::readiness::{ProbeConfig, wait_for_port_ready};
use async_trait::async_trait;
use moonwall_proto::{Error, NodeLaunchDescriptor, PortBinding, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Prefix marking a `runArgs` entry as an environment variable.
const ENV_PREFIX: &str = "env:";

/// Everything needed to create one node container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOptions {
    pub name: String,
    pub image: String,
    pub platform: String,
    pub cmd: Vec<String>,
    /// RPC port mapped one-to-one, followed by explicit extra bindings.
    pub port_bindings: Vec<PortBinding>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub network: Option<String>,
    /// Port the readiness probe targets on the host.
    pub rpc_port: u16,
}

impl ContainerOptions {
    /// Builds options from a dockerised launch descriptor.
    pub fn from_descriptor(node: &NodeLaunchDescriptor) -> Result<Self> {
        let docker = node.docker.clone().unwrap_or_default();
        let rpc_port = node.rpc_port().ok_or_else(|| {
            Error::config(format!(
                "Docker node '{}' needs an explicit --rpc-port=<port> argument",
                node.name
            ))
        })?;

        let mut port_bindings = vec![PortBinding {
            host_port: rpc_port,
            internal_port: rpc_port,
        }];
        port_bindings.extend(docker.expose_ports.iter().copied());

        let env = docker
            .run_args
            .iter()
            .filter_map(|arg| arg.strip_prefix(ENV_PREFIX))
            .map(str::to_string)
            .collect();

        let name = docker.container_name.unwrap_or_else(|| {
            let sanitized: String = node
                .name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("moonwall_{sanitized}_{rpc_port}")
        });

        Ok(Self {
            name,
            image: node.cmd.clone(),
            platform: host_platform().to_string(),
            cmd: node.args.clone(),
            port_bindings,
            env,
            network: docker.network,
            rpc_port,
        })
    }
}

/// Platform string for the host architecture.
pub fn host_platform() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "linux/arm64",
        _ => "linux/amd64",
    }
}

/// Container engine operations used by the launcher and teardown.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls `image`, returning once the pull has completed.
    async fn pull_image(&self, image: &str, platform: &str) -> Result<()>;
    /// Creates a container and returns its id.
    async fn create(&self, options: &ContainerOptions) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Reports `State.Running`.
    async fn is_running(&self, id: &str) -> Result<bool>;
    /// Streams container output into `log_path` in the background.
    async fn follow_logs(&self, id: &str, log_path: &Path) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
}

/// `ContainerRuntime` backed by the `docker` command.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(command = %self.binary, args = ?args, "Running container command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::launch(&self.binary, format!("cannot run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let sub = args.first().map_or("", String::as_str);
            return Err(Error::launch(
                format!("{} {sub}", self.binary),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Arguments for `docker create`.
    pub fn create_args(options: &ContainerOptions) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--platform".to_string(),
            options.platform.clone(),
            "--name".to_string(),
            options.name.clone(),
        ];
        if let Some(network) = &options.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for binding in &options.port_bindings {
            args.push("-p".to_string());
            args.push(format!("{}:{}", binding.host_port, binding.internal_port));
        }
        for entry in &options.env {
            args.push("-e".to_string());
            args.push(entry.clone());
        }
        args.push(options.image.clone());
        args.extend(options.cmd.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str, platform: &str) -> Result<()> {
        info!(image = %image, platform = %platform, "Pulling image");
        self.run(&["pull".into(), "--platform".into(), platform.into(), image.into()])
            .await
            .map(|_| ())
    }

    async fn create(&self, options: &ContainerOptions) -> Result<String> {
        self.run(&Self::create_args(options)).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start".into(), id.into()]).await.map(|_| ())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let state = self
            .run(&["inspect".into(), "-f".into(), "{{.State.Running}}".into(), id.into()])
            .await?;
        Ok(state == "true")
    }

    async fn follow_logs(&self, id: &str, log_path: &Path) -> Result<()> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;
        let mut child = Command::new(&self.binary)
            .args(["logs", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.run(&["stop".into(), id.into()]).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.run(&["rm".into(), "-f".into(), id.into()]).await.map(|_| ())
    }
}

/// Handle to a running node container.
#[derive(Clone)]
pub struct ContainerHandle {
    name: String,
    id: String,
    log_path: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    removed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub async fn is_alive(&self) -> bool {
        !self.removed.load(Ordering::SeqCst) && self.runtime.is_running(&self.id).await.unwrap_or(false)
    }

    /// Appends the reason to the container log, then stops and removes the
    /// container. A second call is a no-op.
    pub async fn terminate(&self, reason: &str) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let line = format!("{} [moonwall] container terminated. reason: {reason}", timestamp());
        if let Err(e) = append_line(&self.log_path, &line).await {
            debug!(name = %self.name, error = %e, "Could not append termination line");
        }
        self.runtime
            .stop(&self.id)
            .await
            .map_err(|e| Error::teardown(&self.name, e))?;
        self.runtime
            .remove(&self.id)
            .await
            .map_err(|e| Error::teardown(&self.name, e))
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Pulls, creates and starts a node container, then probes its RPC port.
///
/// The container is recorded in `spawned` once created. Any failure is
/// appended to the container's log file before it propagates.
pub async fn launch_container(
    runtime: Arc<dyn ContainerRuntime>,
    node: &NodeLaunchDescriptor,
    log_dir: &Path,
    probe: ProbeConfig,
    spawned: &SpawnedEntities,
) -> Result<LaunchedNode> {
    let options = ContainerOptions::from_descriptor(node)?;
    let log_path = log_dir.join(log_file_name(
        &node.cmd,
        &options.rpc_port.to_string(),
        &options.name,
    ));
    append_line(
        &log_path,
        &format!("{} [moonwall] launching container {} from {}", timestamp(), options.name, options.image),
    )
    .await?;

    let mut created: Option<ContainerHandle> = None;
    let attempt = async {
        runtime.pull_image(&options.image, &options.platform).await?;
        let id = runtime.create(&options).await?;
        let handle = ContainerHandle {
            name: node.name.clone(),
            id: id.clone(),
            log_path: log_path.clone(),
            runtime: Arc::clone(&runtime),
            removed: Arc::new(AtomicBool::new(false)),
        };
        spawned.record(RunningEntity::Container(handle.clone()));
        created = Some(handle.clone());

        runtime.start(&id).await?;
        if !runtime.is_running(&id).await? {
            return Err(Error::launch(&node.name, format!("container {id} is not running after start")));
        }
        runtime.follow_logs(&id, &log_path).await?;
        wait_for_port_ready(&node.name, options.rpc_port, node.is_ethereum_chain, probe).await?;
        Ok(handle)
    };

    let outcome = attempt.await;
    match outcome {
        Ok(handle) => {
            info!(name = %node.name, container = %handle.id, port = options.rpc_port, "Container ready");
            Ok(LaunchedNode {
                entity: RunningEntity::Container(handle),
                log_path,
                rpc_port: Some(options.rpc_port),
            })
        }
        Err(e) => {
            let line = format!("{} [moonwall] container launch failed: {e}", timestamp());
            let _ = append_line(&log_path, &line).await;
            if let Some(handle) = created
                && let Err(rm) = handle.terminate("launch failed").await
            {
                warn!(name = %node.name, container = %handle.id, error = %rm, "Could not remove failed container");
            }
            Err(e)
        }
    }
}
