//! # moonwall-adapters
//!
//! Adapters between Moonwall and the outside world:
//! - Node process launching with log capture and exit tracking
//! - Container launching through a pluggable runtime (`docker` by default)
//! - JSON-RPC readiness probing over WebSocket and HTTP
//! - RPC client flavors backing connected providers
//!
//! ## Readiness
//!
//! A launched node counts as ready once one of its listening ports answers
//! `system_chain` (and `eth_chainId` for Ethereum chains) on both transports.

mod clients;
mod docker;
mod entity;
mod launcher;
pub mod readiness;
pub mod rpc;
pub mod testing;

pub use clients::{
    EthereumClient, Greeting, ProviderClient, SubstrateClient, UnimplementedClient, connect_client,
};
pub use docker::{ContainerHandle, ContainerOptions, ContainerRuntime, DockerCli, host_platform};
pub use entity::RunningEntity;
pub use launcher::{
    ExitInfo, LaunchedNode, ProcessHandle, ProcessLauncher, SpawnedEntities, append_line, check_binary,
    log_file_name,
};
pub use readiness::ProbeConfig;
pub use rpc::RpcClient;
