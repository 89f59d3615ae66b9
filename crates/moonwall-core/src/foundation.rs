//! Foundation setup: turns an environment into launch and connection plans.

use crate::commands::{chopsticks_command, dev_command, is_ethereum_chain};
use crate::config::{EnvironmentConfig, Foundation, FoundationKind, ZombieLaunchSpec};
use crate::env;
use moonwall_proto::{Error, NodeLaunchDescriptor, ProviderKind, ProviderSpec, Result};
use std::path::PathBuf;
use tracing::debug;

/// What an environment needs launched and connected.
#[derive(Debug, Clone)]
pub struct FoundationPlan {
    pub kind: FoundationKind,
    pub nodes: Vec<NodeLaunchDescriptor>,
    /// Providers to connect. Empty for zombie environments without explicit
    /// connections; those are derived once the network is running.
    pub providers: Vec<ProviderSpec>,
    /// RPC port of the dev node, when known before launch.
    pub rpc_port: Option<u16>,
    pub zombie: Option<ZombiePlan>,
}

/// Zombie-specific part of a plan.
#[derive(Debug, Clone)]
pub struct ZombiePlan {
    pub name: String,
    pub config_path: PathBuf,
    pub skip_block_check: bool,
    pub disable_default_eth_providers: bool,
    pub disable_log_eavesdropping: bool,
}

impl FoundationPlan {
    pub fn launches_docker(&self) -> bool {
        self.nodes.iter().any(|n| n.launch && n.uses_docker())
    }
}

/// Builds the plan for `environment`.
///
/// Pure: nothing is spawned or published, so a failed setup leaves no state
/// behind.
pub fn setup(environment: &EnvironmentConfig) -> Result<FoundationPlan> {
    let kind = environment.foundation.kind();
    debug!(env = %environment.name, foundation = %kind, "Setting up foundation");

    let plan = match &environment.foundation {
        Foundation::Dev { launch_spec } => {
            let spec = launch_spec.first().ok_or_else(|| empty_launch_spec(environment))?;
            let command = dev_command(spec);
            let is_eth = is_ethereum_chain(spec);
            let docker = if spec.use_docker {
                Some(spec.docker_config.clone().unwrap_or_default())
            } else {
                None
            };

            let providers = if environment.connections.is_empty() {
                let port = command.rpc_port.ok_or_else(|| {
                    Error::config(format!(
                        "Dev node '{}' has no resolvable RPC port and no connections are configured",
                        spec.name
                    ))
                })?;
                default_dev_providers(port, is_eth && !spec.disable_default_eth_providers)
            } else {
                environment.connections.clone()
            };

            FoundationPlan {
                kind,
                nodes: vec![NodeLaunchDescriptor {
                    name: spec.name.clone(),
                    cmd: command.cmd,
                    args: command.args,
                    launch: !spec.running,
                    is_ethereum_chain: is_eth,
                    docker,
                }],
                providers,
                rpc_port: command.rpc_port,
                zombie: None,
            }
        }
        Foundation::Chopsticks { launch_spec } => {
            require_connections(environment)?;
            let name = match launch_spec.as_slice() {
                [] => return Err(empty_launch_spec(environment)),
                [single] => single.name.clone(),
                _ => "chopsticks-xcm".to_string(),
            };
            let command = chopsticks_command(launch_spec);
            FoundationPlan {
                kind,
                nodes: vec![NodeLaunchDescriptor {
                    name,
                    cmd: command.cmd,
                    args: command.args,
                    launch: launch_spec.iter().all(|s| !s.running),
                    is_ethereum_chain: false,
                    docker: None,
                }],
                providers: environment.connections.clone(),
                rpc_port: command.rpc_port,
                zombie: None,
            }
        }
        Foundation::Zombie { zombie_spec } => FoundationPlan {
            kind,
            nodes: Vec::new(),
            providers: environment.connections.clone(),
            rpc_port: None,
            zombie: Some(zombie_plan(&environment.name, zombie_spec)),
        },
        Foundation::ReadOnly => {
            require_connections(environment)?;
            FoundationPlan {
                kind,
                nodes: Vec::new(),
                providers: environment.connections.clone(),
                rpc_port: None,
                zombie: None,
            }
        }
    };

    debug!(
        env = %environment.name,
        nodes = plan.nodes.len(),
        providers = plan.providers.len(),
        "Foundation plan ready"
    );
    Ok(plan)
}

fn empty_launch_spec(environment: &EnvironmentConfig) -> Error {
    Error::config(format!(
        "Environment '{}' uses foundation '{}' with an empty launchSpec",
        environment.name,
        environment.foundation.kind()
    ))
}

fn require_connections(environment: &EnvironmentConfig) -> Result<()> {
    if environment.connections.is_empty() {
        return Err(Error::config(format!(
            "Environment '{}' uses foundation '{}' which requires at least one connection",
            environment.name,
            environment.foundation.kind()
        )));
    }
    Ok(())
}

fn zombie_plan(env_name: &str, spec: &ZombieLaunchSpec) -> ZombiePlan {
    ZombiePlan {
        name: spec.name.clone().unwrap_or_else(|| env_name.to_string()),
        config_path: PathBuf::from(&spec.config_path),
        skip_block_check: spec.skip_block_check,
        disable_default_eth_providers: spec.disable_default_eth_providers,
        disable_log_eavesdropping: spec.disable_log_eavesdropping,
    }
}

/// Default providers of a dev node on `port`.
pub fn default_dev_providers(port: u16, with_ethereum: bool) -> Vec<ProviderSpec> {
    let endpoint = format!("ws://127.0.0.1:{port}");
    let mut providers = vec![ProviderSpec::new("polkadotJs", ProviderKind::PolkadotJs, &endpoint)];
    if with_ethereum {
        providers.extend(ethereum_providers(&endpoint));
    }
    providers
}

/// Default providers of a zombie network, read from the published
/// `MOON_PARA_WSS`/`MOON_RELAY_WSS` variables.
pub fn default_zombie_providers(with_ethereum: bool) -> Vec<ProviderSpec> {
    let mut providers = Vec::new();
    if let Some(para) = env::get(env::MOON_PARA_WSS) {
        providers.push(ProviderSpec::new("parachain", ProviderKind::PolkadotJs, &para));
        if with_ethereum {
            providers.extend(ethereum_providers(&para));
        }
    }
    if let Some(relay) = env::get(env::MOON_RELAY_WSS) {
        providers.push(ProviderSpec::new("relaychain", ProviderKind::PolkadotJs, relay));
    }
    providers
}

fn ethereum_providers(endpoint: &str) -> [ProviderSpec; 3] {
    [
        ProviderSpec::new("ethers", ProviderKind::Ethers, endpoint),
        ProviderSpec::new("w3", ProviderKind::Web3, endpoint),
        ProviderSpec::new("viem", ProviderKind::Viem, endpoint),
    ]
}
