//! Declarative launch and connection descriptors.
//!
//! These are the outputs of foundation setup and the inputs of the launcher
//! and the provider manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instruction to start one node process or container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLaunchDescriptor {
    /// Human-readable node name.
    pub name: String,
    /// Binary path, or image name when `docker` is set.
    pub cmd: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// `false` means the node is already running elsewhere: track, don't spawn.
    pub launch: bool,
    /// Probe `eth_chainId` in addition to `system_chain` during readiness.
    #[serde(default)]
    pub is_ethereum_chain: bool,
    /// Run inside a container instead of as a local process.
    #[serde(default)]
    pub docker: Option<DockerConfig>,
}

impl NodeLaunchDescriptor {
    /// Returns the RPC port named in `--rpc-port=` (or `--port=` for chopsticks).
    pub fn rpc_port(&self) -> Option<u16> {
        self.args.iter().find_map(|arg| {
            arg.strip_prefix("--rpc-port=")
                .or_else(|| arg.strip_prefix("--port="))
                .and_then(|port| port.parse().ok())
        })
    }

    pub fn uses_docker(&self) -> bool {
        self.docker.is_some()
    }
}

/// Container settings for a dockerised node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// Fixed container name; generated when absent.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Docker network to attach to.
    #[serde(default)]
    pub network: Option<String>,
    /// Extra host→container port bindings on top of the RPC port.
    #[serde(default)]
    pub expose_ports: Vec<PortBinding>,
    /// Runtime arguments. Entries prefixed with `env:` become environment variables.
    #[serde(default)]
    pub run_args: Vec<String>,
}

/// One published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host_port: u16,
    pub internal_port: u16,
}

/// The closed set of RPC client flavors.
///
/// Unrecognized names decode into `Unknown` so that configuration with a newer
/// client type still loads; connecting one yields a stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderKind {
    /// Substrate client (`polkadotJs`).
    PolkadotJs,
    /// Substrate light client flavour (`papi`).
    Papi,
    /// Ethereum client (`ethers`).
    Ethers,
    /// Ethereum client (`web3`).
    Web3,
    /// Ethereum client (`viem`).
    Viem,
    /// Anything else.
    Unknown(String),
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::PolkadotJs => "polkadotJs",
            ProviderKind::Papi => "papi",
            ProviderKind::Ethers => "ethers",
            ProviderKind::Web3 => "web3",
            ProviderKind::Viem => "viem",
            ProviderKind::Unknown(name) => name,
        }
    }

    /// Substrate-style clients speak `system_*`/`chain_*` methods.
    pub fn is_substrate(&self) -> bool {
        matches!(self, ProviderKind::PolkadotJs | ProviderKind::Papi)
    }

    /// Ethereum-style clients speak `eth_*` methods.
    pub fn is_ethereum(&self) -> bool {
        matches!(self, ProviderKind::Ethers | ProviderKind::Web3 | ProviderKind::Viem)
    }
}

impl From<String> for ProviderKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "polkadotJs" => ProviderKind::PolkadotJs,
            "papi" => ProviderKind::Papi,
            "ethers" => ProviderKind::Ethers,
            "web3" => ProviderKind::Web3,
            "viem" => ProviderKind::Viem,
            _ => ProviderKind::Unknown(value),
        }
    }
}

impl From<ProviderKind> for String {
    fn from(value: ProviderKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub endpoints: Vec<String>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, kind: ProviderKind, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoints: vec![endpoint.into()],
        }
    }

    /// First configured endpoint.
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }
}
