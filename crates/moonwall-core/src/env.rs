//! Process environment variables shared with the external test runner.
//!
//! Values published here are read by test code running in the runner
//! process, which inherits this process's environment.

use std::path::PathBuf;

/// Name of the active environment.
pub const MOON_TEST_ENV: &str = "MOON_TEST_ENV";
/// Path of the loaded configuration file.
pub const MOON_CONFIG_PATH: &str = "MOON_CONFIG_PATH";
/// When set, infrastructure from a previous run is reused and nothing is launched.
pub const MOON_RECYCLE: &str = "MOON_RECYCLE";
/// Directory for node log files.
pub const MOON_LOG_LOCATION: &str = "MOON_LOG_LOCATION";
/// Temp directory of the running zombie network.
pub const MOON_ZOMBIE_DIR: &str = "MOON_ZOMBIE_DIR";
/// Pipe-delimited zombie node names.
pub const MOON_ZOMBIE_NODES: &str = "MOON_ZOMBIE_NODES";
/// Path of the IPC control socket.
pub const MOON_IPC_SOCKET: &str = "MOON_IPC_SOCKET";
/// Relay chain websocket URI.
pub const MOON_RELAY_WSS: &str = "MOON_RELAY_WSS";
/// Parachain websocket URI.
pub const MOON_PARA_WSS: &str = "MOON_PARA_WSS";
/// RPC port chosen for a dev node.
pub const MOONWALL_RPC_PORT: &str = "MOONWALL_RPC_PORT";
/// Test shard in `index/total` form.
pub const MOONWALL_TEST_SHARD: &str = "MOONWALL_TEST_SHARD";
/// Worker pool id assigned by the test runner.
pub const VITEST_POOL_ID: &str = "VITEST_POOL_ID";

const DEFAULT_LOG_LOCATION: &str = "tmp/node_logs";

/// Sets a variable in this process's environment.
#[allow(unsafe_code)]
pub fn set(key: &str, value: impl AsRef<str>) {
    // SAFETY: variables are published from the orchestrating task while no
    // other thread reads or writes the environment.
    unsafe { std::env::set_var(key, value.as_ref()) }
}

/// Removes a variable from this process's environment.
#[allow(unsafe_code)]
pub fn remove(key: &str) {
    // SAFETY: see `set`.
    unsafe { std::env::remove_var(key) }
}

/// Reads a variable, treating empty values as unset.
pub fn get(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

pub fn is_set(key: &str) -> bool {
    get(key).is_some()
}

/// True when `MOON_RECYCLE` asks to reuse running infrastructure.
pub fn recycle() -> bool {
    is_set(MOON_RECYCLE)
}

/// Directory for node logs, `tmp/node_logs` unless overridden.
pub fn log_location() -> PathBuf {
    get(MOON_LOG_LOCATION).map_or_else(|| PathBuf::from(DEFAULT_LOG_LOCATION), PathBuf::from)
}

/// Node names published by the zombie supervisor.
pub fn zombie_nodes() -> Vec<String> {
    get(MOON_ZOMBIE_NODES)
        .map(|v| split_node_list(&v))
        .unwrap_or_default()
}

/// Joins node names the way `MOON_ZOMBIE_NODES` stores them.
pub fn join_node_list(names: &[String]) -> String {
    names.join("|")
}

pub fn split_node_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_node_list_roundtrip() {
        let names = vec!["alice".to_string(), "bob".to_string(), "collator".to_string()];
        let joined = join_node_list(&names);
        assert_eq!(joined, "alice|bob|collator");
        assert_eq!(split_node_list(&joined), names);
        assert!(split_node_list("").is_empty());
        assert_eq!(split_node_list("a||b|"), vec!["a", "b"]);
    }

    #[test]
    #[serial]
    fn test_empty_value_counts_as_unset() {
        set(MOON_RECYCLE, "");
        assert!(!recycle());
        set(MOON_RECYCLE, "true");
        assert!(recycle());
        remove(MOON_RECYCLE);
        assert!(!recycle());
    }

    #[test]
    #[serial]
    fn test_log_location_default() {
        remove(MOON_LOG_LOCATION);
        assert_eq!(log_location(), PathBuf::from("tmp/node_logs"));
        set(MOON_LOG_LOCATION, "/var/tmp/logs");
        assert_eq!(log_location(), PathBuf::from("/var/tmp/logs"));
        remove(MOON_LOG_LOCATION);
    }
}
