//! Launch command construction for dev and chopsticks foundations.

use crate::config::{ChainRole, ChopsticksLaunchSpec, DevLaunchSpec};
use crate::env;
use std::path::Path;

const BASE_PORT: u32 = 10_000;

const MOONBEAM_ARGS: &[&str] = &[
    "--no-hardware-benchmarks",
    "--no-telemetry",
    "--reserved-only",
    "--rpc-cors=all",
    "--unsafe-rpc-external",
    "--unsafe-force-node-key-generation",
    "--no-grandpa",
    "--sealing=manual",
    "--force-authoring",
    "--no-prometheus",
    "--alice",
    "--chain=moonbase-dev",
    "--tmp",
];

const POLKADOT_ARGS: &[&str] = &[
    "--dev",
    "--alice",
    "--no-telemetry",
    "--no-prometheus",
    "--rpc-cors=all",
    "--unsafe-rpc-external",
    "--rpc-methods=unsafe",
    "--tmp",
];

const GENERIC_ARGS: &[&str] = &[
    "--dev",
    "--no-telemetry",
    "--no-prometheus",
    "--rpc-cors=all",
    "--unsafe-rpc-external",
    "--tmp",
];

/// A resolved node command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub cmd: String,
    pub args: Vec<String>,
    /// RPC port the node will listen on, when known up front.
    pub rpc_port: Option<u16>,
}

/// Default arguments for a node binary, keyed by its file name.
pub fn default_args(bin_path: &str) -> Vec<String> {
    let table = match binary_name(bin_path).as_str() {
        name if name.contains("moonbeam") => MOONBEAM_ARGS,
        name if name.contains("polkadot") => POLKADOT_ARGS,
        _ => GENERIC_ARGS,
    };
    table.iter().map(|s| (*s).to_string()).collect()
}

fn binary_name(bin_path: &str) -> String {
    Path::new(bin_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(bin_path)
        .to_ascii_lowercase()
}

/// Whether a dev node speaks Ethereum RPC: explicit flag, else moonbeam binaries.
pub fn is_ethereum_chain(spec: &DevLaunchSpec) -> bool {
    spec.is_ethereum_chain
        .unwrap_or_else(|| binary_name(&spec.bin_path).contains("moonbeam"))
}

/// Builds the command for a dev node.
///
/// Explicit `options` replace the default table. An RPC port is injected
/// unless the arguments already carry one: the configured `ports.rpcPort`
/// if set, a computed free port otherwise.
pub fn dev_command(spec: &DevLaunchSpec) -> LaunchCommand {
    let mut args = spec
        .options
        .clone()
        .unwrap_or_else(|| default_args(&spec.bin_path));

    let existing = find_flag_port(&args, "--rpc-port");
    let rpc_port = match existing {
        Some(port) => Some(port),
        None if args.iter().any(|a| a == "--rpc-port") => None,
        None => {
            let port = spec
                .ports
                .and_then(|p| p.rpc_port)
                .unwrap_or_else(free_port);
            args.push(format!("--rpc-port={port}"));
            Some(port)
        }
    };

    if let Some(p2p) = spec.ports.and_then(|p| p.p2p_port)
        && !args.iter().any(|a| a.starts_with("--port"))
    {
        args.push(format!("--port={p2p}"));
    }

    LaunchCommand {
        cmd: spec.bin_path.clone(),
        args,
        rpc_port,
    }
}

fn find_flag_port(args: &[String], flag: &str) -> Option<u16> {
    let prefix = format!("{flag}=");
    args.iter().enumerate().find_map(|(i, arg)| {
        if let Some(value) = arg.strip_prefix(&prefix) {
            value.parse().ok()
        } else if arg == flag {
            args.get(i + 1).and_then(|v| v.parse().ok())
        } else {
            None
        }
    })
}

/// Builds the chopsticks command: one fork for a single spec, XCM mode for several.
pub fn chopsticks_command(specs: &[ChopsticksLaunchSpec]) -> LaunchCommand {
    if let [spec] = specs {
        let mut args = vec![
            format!("--config={}", spec.config_path),
            format!("--addr={}", spec.address.as_deref().unwrap_or("127.0.0.1")),
        ];
        if let Some(port) = spec.ws_port {
            args.push(format!("--port={port}"));
        }
        args.push(format!(
            "--build-block-mode={}",
            spec.build_block_mode.unwrap_or_default()
        ));
        if let Some(wasm) = &spec.wasm_override {
            args.push(format!("--wasm-override={wasm}"));
        }
        if spec.allow_unresolved_imports {
            args.push("--allow-unresolved-imports".to_string());
        }
        return LaunchCommand {
            cmd: "chopsticks".to_string(),
            args,
            rpc_port: spec.ws_port,
        };
    }

    let mut args = vec!["xcm".to_string()];
    for spec in specs {
        let flag = match spec.role {
            ChainRole::Parachain => "--parachain",
            ChainRole::Relaychain => "--relaychain",
        };
        args.push(format!("{flag}={}", spec.config_path));
    }
    LaunchCommand {
        cmd: "chopsticks".to_string(),
        args,
        rpc_port: None,
    }
}

/// Port for this worker: `10000 + shard*1000 + pool*100 + pid%100`.
///
/// Parallel shards and runner pools land in disjoint ranges.
pub fn free_port() -> u16 {
    let shard = env::get(env::MOONWALL_TEST_SHARD)
        .as_deref()
        .and_then(parse_shard_index)
        .unwrap_or(0);
    let pool = env::get(env::VITEST_POOL_ID)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    compute_port(shard, pool, std::process::id())
}

/// Pure form of [`free_port`]. Saturates at the top of the port range.
pub fn compute_port(shard: u32, pool: u32, pid: u32) -> u16 {
    let port = BASE_PORT
        .saturating_add(shard.saturating_mul(1000))
        .saturating_add(pool.saturating_mul(100))
        .saturating_add(pid % 100);
    u16::try_from(port).unwrap_or(u16::MAX)
}

/// Parses the index from `index/total`.
fn parse_shard_index(value: &str) -> Option<u32> {
    value.split('/').next()?.trim().parse().ok()
}
