//! Hands an environment's test files to the external test runner.

use moonwall_core::{EnvironmentConfig, RunnerConfig, env};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

const DEFAULT_RUNNER: &str = "npx";
const DEFAULT_RUNNER_ARGS: &[&str] = &["vitest", "run"];

/// Builds the runner invocation for `environment`.
///
/// Arguments are the runner's own, then every `testFileDir` entry, then
/// `extra`. The child inherits the `MOON_*` variables already published by
/// the context, plus `MOON_CONFIG_PATH` and `MOON_TEST_ENV`.
pub fn runner_command(environment: &EnvironmentConfig, config_path: &Path, extra: &[String]) -> Command {
    let (program, mut args) = match &environment.runner {
        Some(RunnerConfig { cmd, args }) => (cmd.clone(), args.clone()),
        None => (
            DEFAULT_RUNNER.to_string(),
            DEFAULT_RUNNER_ARGS.iter().map(ToString::to_string).collect(),
        ),
    };
    args.extend(environment.test_file_dir.iter().cloned());
    args.extend(extra.iter().cloned());

    debug!(program = %program, args = ?args, "Runner command");
    let mut command = Command::new(program);
    command
        .args(args)
        .env(env::MOON_CONFIG_PATH, config_path)
        .env(env::MOON_TEST_ENV, &environment.name)
        .kill_on_drop(true);
    command
}

/// Runs the test files and returns the runner's exit code.
///
/// A runner killed by a signal reports `128 + signal`.
pub async fn run_tests(environment: &EnvironmentConfig, config_path: &Path, extra: &[String]) -> anyhow::Result<i32> {
    let mut command = runner_command(environment, config_path, extra);
    info!(env = %environment.name, dirs = ?environment.test_file_dir, "Running tests");

    let status = command.status().await?;
    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
