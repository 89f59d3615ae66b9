//! RPC client flavors backing connected providers.
//!
//! Each provider kind maps to one client implementation. Substrate kinds
//! speak `system_*`/`chain_*`, Ethereum kinds speak `eth_*`. Unknown kinds get
//! a stub that connects to nothing and reports itself as not implemented.

use crate::rpc::{RpcClient, parse_hex_u64};
use async_trait::async_trait;
use moonwall_proto::{Error, ProviderKind, ProviderSpec, Result};
use serde_json::{Value, json};
use std::fmt;
use tracing::{debug, warn};

/// Lightweight identity of the chain behind a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub chain: String,
    pub detail: String,
}

impl fmt::Display for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.chain, self.detail)
    }
}

/// A connected client of one flavor.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn endpoint(&self) -> &str;

    /// Raw JSON-RPC access, absent for stubs.
    fn api(&self) -> Option<&RpcClient>;

    /// Chain id / spec version probe for diagnostics.
    async fn greet(&self) -> Result<Greeting>;

    /// Current best block number.
    async fn block_height(&self) -> Result<u64>;

    async fn disconnect(&self) -> Result<()>;
}

/// Connects the client selected by `spec.kind` to the first endpoint.
pub async fn connect_client(spec: &ProviderSpec) -> Result<Box<dyn ProviderClient>> {
    let endpoint = spec.primary_endpoint().ok_or_else(|| {
        Error::config(format!("Provider '{}' has no endpoints", spec.name))
    })?;

    debug!(name = %spec.name, kind = %spec.kind, endpoint = %endpoint, "Connecting provider");
    match &spec.kind {
        ProviderKind::PolkadotJs | ProviderKind::Papi => {
            Ok(Box::new(SubstrateClient::connect(spec.kind.clone(), endpoint).await?))
        }
        ProviderKind::Ethers | ProviderKind::Web3 | ProviderKind::Viem => {
            Ok(Box::new(EthereumClient::connect(spec.kind.clone(), endpoint).await?))
        }
        ProviderKind::Unknown(kind) => {
            warn!(name = %spec.name, kind = %kind, "Provider type not yet implemented, using stub");
            Ok(Box::new(UnimplementedClient {
                kind: spec.kind.clone(),
                endpoint: endpoint.to_string(),
            }))
        }
    }
}

/// `polkadotJs` / `papi` client.
#[derive(Debug)]
pub struct SubstrateClient {
    kind: ProviderKind,
    rpc: RpcClient,
}

impl SubstrateClient {
    /// Connects and confirms the chain answers `system_chain`.
    pub async fn connect(kind: ProviderKind, endpoint: &str) -> Result<Self> {
        let rpc = RpcClient::connect(endpoint).await?;
        rpc.call("system_chain", json!([])).await?;
        Ok(Self { kind, rpc })
    }
}

#[async_trait]
impl ProviderClient for SubstrateClient {
    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    fn endpoint(&self) -> &str {
        self.rpc.endpoint()
    }

    fn api(&self) -> Option<&RpcClient> {
        Some(&self.rpc)
    }

    async fn greet(&self) -> Result<Greeting> {
        let chain = self.rpc.call("system_chain", json!([])).await?;
        let version = self.rpc.call("state_getRuntimeVersion", json!([])).await?;
        let spec_name = version.get("specName").and_then(Value::as_str).unwrap_or("unknown");
        let spec_version = version.get("specVersion").and_then(Value::as_u64).unwrap_or_default();
        Ok(Greeting {
            chain: chain.as_str().unwrap_or_default().to_string(),
            detail: format!("{spec_name} v{spec_version}"),
        })
    }

    async fn block_height(&self) -> Result<u64> {
        let header = self.rpc.call("chain_getHeader", json!([])).await?;
        header
            .get("number")
            .and_then(parse_hex_u64)
            .ok_or_else(|| Error::Rpc("chain_getHeader returned no block number".to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.close().await
    }
}

/// `ethers` / `web3` / `viem` client.
#[derive(Debug)]
pub struct EthereumClient {
    kind: ProviderKind,
    rpc: RpcClient,
}

impl EthereumClient {
    /// Connects and confirms the chain answers `eth_chainId`.
    pub async fn connect(kind: ProviderKind, endpoint: &str) -> Result<Self> {
        let rpc = RpcClient::connect(endpoint).await?;
        rpc.call("eth_chainId", json!([])).await?;
        Ok(Self { kind, rpc })
    }
}

#[async_trait]
impl ProviderClient for EthereumClient {
    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    fn endpoint(&self) -> &str {
        self.rpc.endpoint()
    }

    fn api(&self) -> Option<&RpcClient> {
        Some(&self.rpc)
    }

    async fn greet(&self) -> Result<Greeting> {
        let chain_id = self.rpc.call("eth_chainId", json!([])).await?;
        let chain_id = parse_hex_u64(&chain_id)
            .ok_or_else(|| Error::Rpc(format!("eth_chainId returned {chain_id}")))?;
        Ok(Greeting {
            chain: format!("chainId {chain_id}"),
            detail: format!("{} client", self.kind),
        })
    }

    async fn block_height(&self) -> Result<u64> {
        let number = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&number)
            .ok_or_else(|| Error::Rpc(format!("eth_blockNumber returned {number}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.close().await
    }
}

/// Stub for provider kinds without an implementation.
#[derive(Debug)]
pub struct UnimplementedClient {
    kind: ProviderKind,
    endpoint: String,
}

#[async_trait]
impl ProviderClient for UnimplementedClient {
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
            chain: "unknown".to_string(),
            detail: format!("provider type '{}' not yet implemented", self.kind),
        })
    }

    async fn block_height(&self) -> Result<u64> {
        Err(Error::Rpc(format!("provider type '{}' not yet implemented", self.kind)))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
