//! Node process launcher.
//!
//! Spawns one node binary, redirects stdout/stderr into a per-node log file,
//! records how the process ended, and waits for its RPC port to become ready.
//! Supports graceful SIGINT termination with a SIGKILL fallback.

// PIDs are always within i32 range in practice
#![allow(clippy::cast_possible_wrap)]

use crate::docker::{ContainerRuntime, launch_container};
use crate::entity::RunningEntity;
use crate::readiness::{ProbeConfig, wait_for_pid_ready};
use moonwall_proto::{Error, NodeLaunchDescriptor, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of launching one node.
#[derive(Debug)]
pub struct LaunchedNode {
    pub entity: RunningEntity,
    /// Log file receiving the node's output.
    pub log_path: PathBuf,
    /// Port that passed the readiness probe.
    pub rpc_port: Option<u16>,
}

/// Entities spawned during a launch, recorded as soon as they exist.
///
/// A launch abandoned mid-way (e.g. by a batch timeout) leaves its entity
/// here so the caller can still terminate it.
#[derive(Debug, Clone, Default)]
pub struct SpawnedEntities(Arc<Mutex<Vec<RunningEntity>>>);

impl SpawnedEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, entity: RunningEntity) {
        if let Ok(mut entities) = self.0.lock() {
            entities.push(entity);
        }
    }

    /// Removes and returns every recorded entity.
    pub fn take(&self) -> Vec<RunningEntity> {
        self.0
            .lock()
            .map(|mut entities| std::mem::take(&mut *entities))
            .unwrap_or_default()
    }
}

/// Launches node processes and containers.
#[derive(Clone)]
pub struct ProcessLauncher {
    log_dir: PathBuf,
    probe: ProbeConfig,
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("log_dir", &self.log_dir)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl ProcessLauncher {
    /// Creates a launcher writing logs under `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            log_dir: log_dir.into(),
            probe: ProbeConfig::default(),
            runtime,
        }
    }

    /// Overrides the readiness probe settings.
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Launches the node described by `node` and waits for RPC readiness.
    pub async fn launch(&self, node: &NodeLaunchDescriptor) -> Result<LaunchedNode> {
        self.launch_into(node, &SpawnedEntities::new()).await
    }

    /// Like [`launch`](Self::launch), recording the entity in `spawned`
    /// before the readiness wait starts.
    pub async fn launch_into(&self, node: &NodeLaunchDescriptor, spawned: &SpawnedEntities) -> Result<LaunchedNode> {
        tokio::fs::create_dir_all(&self.log_dir).await?;

        if node.uses_docker() {
            return launch_container(Arc::clone(&self.runtime), node, &self.log_dir, self.probe, spawned).await;
        }

        let binary = check_binary(&node.cmd)?;
        let handle = self.spawn(node, &binary).await?;
        spawned.record(RunningEntity::Process(handle.clone()));

        let exit_watch = handle.exit_receiver();
        let ready = wait_for_pid_ready(&node.name, handle.pid(), node.is_ethereum_chain, self.probe, || {
            exit_watch.borrow().is_some()
        })
        .await;

        match ready {
            Ok(port) => Ok(LaunchedNode {
                log_path: handle.log_path().to_path_buf(),
                entity: RunningEntity::Process(handle),
                rpc_port: Some(port),
            }),
            Err(e) => {
                warn!(name = %node.name, error = %e, "Node failed readiness, terminating");
                if let Err(kill_err) = handle.terminate("readiness probe failed").await {
                    debug!(name = %node.name, error = %kill_err, "Cleanup after failed launch");
                }
                Err(e)
            }
        }
    }

    async fn spawn(&self, node: &NodeLaunchDescriptor, binary: &Path) -> Result<ProcessHandle> {
        debug!(
            name = %node.name,
            command = %binary.display(),
            args = ?node.args,
            "Spawning node"
        );

        let mut child = Command::new(binary)
            .args(&node.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch(&node.name, format!("spawn failed: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::launch(&node.name, "process exited immediately"))?;

        let port = node
            .rpc_port()
            .map_or_else(|| "auto".to_string(), |p| p.to_string());
        let log_path = self
            .log_dir
            .join(log_file_name(&node.cmd, &port, &pid.to_string()));

        let mut stdout_log = open_append(&log_path).await?;
        let mut stderr_log = open_append(&log_path).await?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let kill_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (exit_tx, exit_rx) = watch::channel(None);

        let monitor_reason = Arc::clone(&kill_reason);
        let monitor_log = log_path.clone();
        let name = node.name.clone();
        tokio::spawn(async move {
            // Drain both pipes concurrently so a full stderr buffer can't block stdout.
            let copy_out = async {
                if let Some(mut out) = stdout {
                    let _ = tokio::io::copy(&mut out, &mut stdout_log).await;
                }
            };
            let copy_err = async {
                if let Some(mut err) = stderr {
                    let _ = tokio::io::copy(&mut err, &mut stderr_log).await;
                }
            };
            let (status, (), ()) = tokio::join!(child.wait(), copy_out, copy_err);

            let reason = monitor_reason.lock().ok().and_then(|r| r.clone());
            let line = exit_message(status.as_ref().ok(), reason.as_deref());
            if let Err(e) = append_line(&monitor_log, &line).await {
                debug!(name = %name, error = %e, "Could not append exit line");
            }
            info!(name = %name, pid, killed = reason.is_some(), "Node process ended");
            let _ = exit_tx.send(Some(ExitInfo {
                code: status.as_ref().ok().and_then(ExitStatus::code),
                signal: status.as_ref().ok().and_then(ExitStatus::signal),
                killed: reason.is_some(),
            }));
        });

        info!(name = %node.name, pid, log = %log_path.display(), "Node spawned");

        Ok(ProcessHandle {
            name: node.name.clone(),
            pid,
            log_path,
            exit: exit_rx,
            kill_reason,
        })
    }
}

/// How a node process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The orchestrator asked for this exit.
    pub killed: bool,
}

/// Handle to a spawned node process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    log_path: PathBuf,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill_reason: Arc<Mutex<Option<String>>>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Exit information, once the process has ended.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Sends `signal`, recording `reason` so the exit line says the
    /// orchestrator killed the node.
    pub fn signal(&self, signal: Signal, reason: &str) -> Result<()> {
        if let Ok(mut slot) = self.kill_reason.lock()
            && slot.is_none()
        {
            *slot = Some(reason.to_string());
        }
        debug!(name = %self.name, pid = self.pid, ?signal, "Signalling node");
        kill(Pid::from_raw(self.pid as i32), signal)
            .map_err(|e| Error::teardown(&self.name, format!("kill({signal}) failed: {e}")))
    }

    /// Waits until the process has exited, up to `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut exit = self.exit.clone();
        tokio::time::timeout(timeout, exit.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// SIGINT, poll-wait for exit, SIGKILL if it lingers.
    pub async fn terminate(&self, reason: &str) -> Result<()> {
        const GRACE: Duration = Duration::from_secs(10);

        if !self.is_alive() {
            return Ok(());
        }
        self.signal(Signal::SIGINT, reason)?;
        if self.wait_for_exit(GRACE).await {
            return Ok(());
        }

        warn!(name = %self.name, pid = self.pid, "Node ignored SIGINT, sending SIGKILL");
        self.signal(Signal::SIGKILL, reason)?;
        if self.wait_for_exit(GRACE).await {
            Ok(())
        } else {
            Err(Error::teardown(&self.name, format!("pid {} still alive after SIGKILL", self.pid)))
        }
    }
}

/// Log file name: `{binary}_node_{port}_{pid}.log`.
pub fn log_file_name(cmd: &str, port: &str, id: &str) -> String {
    let binary = Path::new(cmd)
        .file_name()
        .map_or_else(|| cmd.to_string(), |n| n.to_string_lossy().to_string());
    let binary: String = binary
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{binary}_node_{port}_{id}.log")
}

fn exit_message(status: Option<&ExitStatus>, kill_reason: Option<&str>) -> String {
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    if let Some(reason) = kill_reason {
        return format!("{timestamp} [moonwall] process killed. reason: {reason}");
    }
    match status {
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => {
                format!("{timestamp} [moonwall] process exited with status code {code}")
            }
            (None, Some(signal)) => {
                format!("{timestamp} [moonwall] process terminated by external signal {signal}")
            }
            (None, None) => format!("{timestamp} [moonwall] process exited"),
        },
        None => format!("{timestamp} [moonwall] process exit status unavailable"),
    }
}

pub(crate) async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Appends one line to a log file.
pub async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = open_append(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// Checks that the node binary exists, is executable, and matches the host
/// architecture. Bare names are resolved through `PATH`.
pub fn check_binary(cmd: &str) -> Result<PathBuf> {
    let unavailable = |path: &Path, reason: &str, hint: &str| Error::BinaryUnavailable {
        path: path.display().to_string(),
        reason: reason.to_string(),
        hint: hint.to_string(),
    };

    let path = resolve_binary(cmd).ok_or_else(|| {
        unavailable(
            Path::new(cmd),
            "no such file",
            "check binPath in the environment config, or download the binary first",
        )
    })?;

    let metadata = std::fs::metadata(&path)
        .map_err(|e| unavailable(&path, &e.to_string(), "check the file permissions"))?;
    if !metadata.is_file() {
        return Err(unavailable(&path, "not a regular file", "point binPath at the node binary"));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(unavailable(
            &path,
            "not executable",
            &format!("run: chmod +x {}", path.display()),
        ));
    }

    if let Some(arch) = elf_architecture(&path)
        && arch != std::env::consts::ARCH
    {
        return Err(unavailable(
            &path,
            &format!("built for {arch}, host is {}", std::env::consts::ARCH),
            "download the binary matching this machine's architecture",
        ));
    }

    Ok(path)
}

fn resolve_binary(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return path.exists().then_some(path);
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(cmd))
            .find(|candidate| candidate.is_file())
    })
}

/// Reads the ELF machine field. `None` for non-ELF files (scripts, Mach-O).
fn elf_architecture(path: &Path) -> Option<&'static str> {
    use std::io::Read;

    let mut header = [0u8; 20];
    std::fs::File::open(path).ok()?.read_exact(&mut header).ok()?;
    if &header[..4] != b"\x7fELF" {
        return None;
    }
    // e_machine is at offset 18, endianness from EI_DATA.
    let machine = if header[5] == 2 {
        u16::from_be_bytes([header[18], header[19]])
    } else {
        u16::from_le_bytes([header[18], header[19]])
    };
    match machine {
        0x3E => Some("x86_64"),
        0xB7 => Some("aarch64"),
        0x03 => Some("x86"),
        0x28 => Some("arm"),
        0xF3 => Some("riscv64"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::DockerCli;
    use tempfile::TempDir;

    fn descriptor(cmd: &str, args: &[&str]) -> NodeLaunchDescriptor {
        NodeLaunchDescriptor {
            name: "test-node".to_string(),
            cmd: cmd.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            launch: true,
            is_ethereum_chain: false,
            docker: None,
        }
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(
            log_file_name("./bin/moonbeam", "10000", "4242"),
            "moonbeam_node_10000_4242.log"
        );
        assert_eq!(log_file_name("polkadot", "auto", "1"), "polkadot_node_auto_1.log");
    }

    #[test]
    fn test_check_binary_missing() {
        let err = check_binary("/definitely/not/here/moonbeam").unwrap_err();
        assert!(matches!(err, Error::BinaryUnavailable { .. }));
        assert!(err.to_string().contains("hint"));
    }

    #[test]
    fn test_check_binary_not_executable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = check_binary(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not executable"));
        assert!(err.to_string().contains("chmod +x"));
    }

    #[test]
    fn test_check_binary_resolves_path() {
        let path = check_binary("sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_exit_message_distinguishes_kill() {
        let killed = exit_message(None, Some("test finished"));
        assert!(killed.contains("process killed. reason: test finished"));

        let status = ExitStatus::from_raw(1 << 8);
        let exited = exit_message(Some(&status), None);
        assert!(exited.contains("exited with status code 1"));

        let status = ExitStatus::from_raw(9);
        let signalled = exit_message(Some(&status), None);
        assert!(signalled.contains("external signal 9"));
    }

    #[tokio::test]
    async fn test_node_that_exits_fails_launch_and_logs_exit() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(dir.path(), Arc::new(DockerCli::default()))
            .with_probe(ProbeConfig {
                max_iterations: 50,
                interval: Duration::from_millis(50),
                call_timeout: Duration::from_millis(100),
            });

        let err = launcher
            .launch(&descriptor("sh", &["-c", "echo booting; exit 3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch { ref name, .. } if name == "test-node"));

        let log = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("sh_node_auto_"))
            .expect("log file created");
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("booting"));
        assert!(content.contains("exited with status code 3"));
    }

    #[tokio::test]
    async fn test_terminate_records_kill_reason() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(dir.path(), Arc::new(DockerCli::default()));
        let handle = launcher
            .spawn(&descriptor("sleep", &["30"]), Path::new("sleep"))
            .await
            .unwrap();
        assert!(handle.is_alive());

        handle.terminate("end of suite").await.unwrap();
        assert!(!handle.is_alive());
        assert!(handle.exit_info().unwrap().killed);

        // The monitor appends the line before publishing the exit.
        let content = std::fs::read_to_string(handle.log_path()).unwrap();
        assert!(content.contains("process killed. reason: end of suite"));
    }

    #[tokio::test]
    async fn test_abandoned_launch_leaves_entity_in_registry() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(dir.path(), Arc::new(DockerCli::default()))
            .with_probe(ProbeConfig {
                max_iterations: 1000,
                interval: Duration::from_millis(50),
                call_timeout: Duration::from_millis(100),
            });
        let spawned = SpawnedEntities::new();

        let desc = descriptor("sleep", &["30"]);
        let launch = launcher.launch_into(&desc, &spawned);
        assert!(tokio::time::timeout(Duration::from_millis(300), launch).await.is_err());

        let entities = spawned.take();
        assert_eq!(entities.len(), 1);
        assert!(entities[0].is_alive().await);
        assert!(spawned.take().is_empty());

        entities[0].terminate("batch abandoned").await.unwrap();
        assert!(!entities[0].is_alive().await);
        let content = std::fs::read_to_string(entities[0].log_path()).unwrap();
        assert!(content.contains("process killed. reason: batch abandoned"));
    }
}
