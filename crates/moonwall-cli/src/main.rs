//! # moonwall-cli
//!
//! Binary entry point for the Moonwall test harness.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - `moonwall run`: bring an environment up and keep it running until Ctrl-C
//! - `moonwall test`: bring an environment up, run its test files, tear down
//! - `moonwall ipc`: send one control command to a running zombie network
//! - `moonwall envs`: list the environments of a config file

mod runner;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use moonwall_core::{ContextOptions, EnvironmentConfig, IpcClient, MoonwallConfig, MoonwallContext, env};
use moonwall_proto::{IpcCommand, IpcRequest};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Moonwall - blockchain node test harness
#[derive(Parser, Debug)]
#[command(name = "moonwall", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (.json, .yml or .yaml)
    #[arg(short, long, default_value = "moonwall.config.json", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an environment and keep it running until interrupted
    Run(RunArgs),

    /// Start an environment, run its test files, then tear it down
    Test(TestArgs),

    /// Send a control command to a running zombie network
    Ipc(IpcArgs),

    /// List configured environments
    Envs,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Environment name
    env: String,

    /// Skip the greeting of each connected provider
    #[arg(long)]
    silent: bool,
}

#[derive(Parser, Debug)]
struct TestArgs {
    /// Environment name
    env: String,

    /// Extra arguments passed to the test runner
    #[arg(last = true)]
    runner_args: Vec<String>,
}

#[derive(Parser, Debug)]
struct IpcArgs {
    /// Command: restart, pause, resume, kill, isup or networkmap
    cmd: IpcCommand,

    /// Target node (required by every command except networkmap)
    node: Option<String>,

    /// Control socket path, defaults to $MOON_IPC_SOCKET
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Free-form note recorded in the server log
    #[arg(long)]
    text: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run(args) => run_command(&cli.config, args).await,
        Commands::Test(args) => {
            let code = test_command(&cli.config, args).await?;
            // Use explicit exit for non-zero codes to ensure proper exit status
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Ipc(args) => ipc_command(args).await,
        Commands::Envs => envs_command(&cli.config),
    }
}

fn load_environment(config_path: &Path, name: &str) -> Result<EnvironmentConfig> {
    let config = MoonwallConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let environment = config.environment(name)?.clone();
    env::set(env::MOON_CONFIG_PATH, config_path.to_string_lossy());
    Ok(environment)
}

/// The binary handles Ctrl-C itself so teardown runs before exit.
fn context_options() -> ContextOptions {
    ContextOptions {
        signal_guard: false,
        ..ContextOptions::default()
    }
}

async fn start(context: &mut MoonwallContext, silent: bool) -> Result<()> {
    context.setup_foundation()?;
    context.start_network().await?;
    context.connect_environment(silent).await?;
    Ok(())
}

async fn run_command(config_path: &Path, args: RunArgs) -> Result<()> {
    let environment = load_environment(config_path, &args.env)?;
    let mut context = MoonwallContext::new(environment, context_options())?;

    let started = tokio::select! {
        result = start(&mut context, args.silent) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted during startup")),
    };
    if let Err(e) = started {
        context.destroy(Some("startup failed")).await;
        return Err(e);
    }

    info!(env = %args.env, nodes = ?context.node_names(), "Environment running, press Ctrl-C to stop");
    if let Some(zombie) = context.zombie() {
        info!(socket = %zombie.socket_path().display(), "Node control socket ready");
    }

    tokio::signal::ctrl_c().await?;
    let report = context.destroy(Some("interrupted")).await;
    if !report.is_clean() {
        warn!(errors = report.errors().len(), "Teardown finished with errors");
    }
    Ok(())
}

async fn test_command(config_path: &Path, args: TestArgs) -> Result<i32> {
    let environment = load_environment(config_path, &args.env)?;
    let mut context = MoonwallContext::new(environment.clone(), context_options())?;

    let outcome = tokio::select! {
        result = async {
            start(&mut context, true).await?;
            runner::run_tests(&environment, config_path, &args.runner_args).await
        } => result,
        _ = tokio::signal::ctrl_c() => Ok(130),
    };

    let reason = match &outcome {
        Ok(0) => "tests passed",
        Ok(_) => "tests failed",
        Err(_) => "test run aborted",
    };
    context.destroy(Some(reason)).await;
    outcome
}

async fn ipc_command(args: IpcArgs) -> Result<()> {
    let socket = match args.socket {
        Some(path) => path,
        None => env::get(env::MOON_IPC_SOCKET)
            .map(PathBuf::from)
            .context("No --socket given and MOON_IPC_SOCKET is not set")?,
    };

    let mut request = IpcRequest::new(args.cmd, args.node.as_deref());
    if let Some(text) = args.text {
        request.text = text;
    }
    let response = IpcClient::new(&socket).send(&request).await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_success() {
        bail!("{}", response.message);
    }
    Ok(())
}

fn envs_command(config_path: &Path) -> Result<()> {
    let config = MoonwallConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("{}", config.label);
    for environment in &config.environments {
        println!(
            "  {:<24} {:<12} {}",
            environment.name,
            environment.foundation.kind().to_string(),
            environment.test_file_dir.join(", ")
        );
    }
    Ok(())
}
