//! Uniform handle over launched processes and containers.

use crate::docker::ContainerHandle;
use crate::launcher::ProcessHandle;
use moonwall_proto::Result;
use nix::sys::signal::Signal;
use std::path::Path;

/// A launched node, owned by the context from launch until teardown.
#[derive(Debug, Clone)]
pub enum RunningEntity {
    Process(ProcessHandle),
    Container(ContainerHandle),
}

impl RunningEntity {
    pub fn name(&self) -> &str {
        match self {
            RunningEntity::Process(p) => p.name(),
            RunningEntity::Container(c) => c.name(),
        }
    }

    pub fn log_path(&self) -> &Path {
        match self {
            RunningEntity::Process(p) => p.log_path(),
            RunningEntity::Container(c) => c.log_path(),
        }
    }

    /// OS pid for processes.
    pub fn pid(&self) -> Option<u32> {
        match self {
            RunningEntity::Process(p) => Some(p.pid()),
            RunningEntity::Container(_) => None,
        }
    }

    pub async fn is_alive(&self) -> bool {
        match self {
            RunningEntity::Process(p) => p.is_alive(),
            RunningEntity::Container(c) => c.is_alive().await,
        }
    }

    /// Fire-and-forget stop: SIGTERM for processes, stop+remove for containers.
    pub async fn kill(&self, reason: &str) -> Result<()> {
        match self {
            RunningEntity::Process(p) if p.is_alive() => p.signal(Signal::SIGTERM, reason),
            RunningEntity::Process(_) => Ok(()),
            RunningEntity::Container(c) => c.terminate(reason).await,
        }
    }

    /// Full stop: processes get SIGINT and are waited on, containers are
    /// stopped and removed.
    pub async fn terminate(&self, reason: &str) -> Result<()> {
        match self {
            RunningEntity::Process(p) => p.terminate(reason).await,
            RunningEntity::Container(c) => c.terminate(reason).await,
        }
    }
}
