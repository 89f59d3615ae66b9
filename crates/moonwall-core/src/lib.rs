//! # moonwall-core
//!
//! Runtime orchestration for Moonwall test environments.
//!
//! This crate provides:
//! - Configuration loading and foundation decoding
//! - Foundation setup: launch and connection plans per environment
//! - Provider connection management with bounded retry
//! - The IPC control protocol for running zombie networks
//! - Zombie network supervision
//! - `MoonwallContext`, which sequences setup, launch, connect and teardown

pub mod commands;
mod config;
mod context;
pub mod env;
mod foundation;
pub mod ipc;
mod providers;
mod teardown;
pub mod testing;
pub mod zombie;

pub use config::{
    BuildBlockMode, ChainRole, ChopsticksLaunchSpec, ConfigError, DevLaunchSpec, DevPorts,
    EnvironmentConfig, Foundation, FoundationKind, MoonwallConfig, RawFoundation, RunnerConfig,
    ZombieLaunchSpec,
};
pub use context::{ContextOptions, LaunchTimeouts, MoonwallContext, TrackedNode};
pub use foundation::{FoundationPlan, ZombiePlan, default_dev_providers, default_zombie_providers, setup};
pub use ipc::{IpcClient, IpcHandler, IpcServer, IpcTimings};
pub use providers::{
    ConnectedProvider, DefaultConnector, ProviderConnector, ProviderManager, RetryPolicy, populate,
};
pub use teardown::TeardownReport;
pub use zombie::{BlockWait, NetworkOrchestrator, ZombieNetworkHandle, ZombieNode, ZombieSupervisor};
