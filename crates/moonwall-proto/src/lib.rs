//! # moonwall-proto
//!
//! Shared types, error definitions, and wire messages for the Moonwall runtime.
//!
//! This crate provides the foundational abstractions used across all Moonwall crates,
//! including:
//! - The error taxonomy (configuration, binary, launch, provider, IPC, teardown)
//! - IPC request/response messages for the node control socket
//! - Declarative node launch descriptors and provider specs

mod descriptor;
mod error;
mod ipc;

pub use descriptor::{DockerConfig, NodeLaunchDescriptor, PortBinding, ProviderKind, ProviderSpec};
pub use error::{Error, Result};
pub use ipc::{IpcCommand, IpcRequest, IpcResponse, IpcStatus};
