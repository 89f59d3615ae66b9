//! Configuration types for Moonwall environments.
//!
//! A config file (`moonwall.config.json` or YAML) lists named environments.
//! Each environment carries a `foundation` whose `type` tag selects which
//! other fields are required. The foundation is decoded once, through
//! [`RawFoundation`], into the [`Foundation`] sum type; a field that belongs
//! to another variant, or a missing required field, fails decoding.

use moonwall_proto::{DockerConfig, ProviderSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level Moonwall configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoonwallConfig {
    /// Free-form label shown in logs.
    #[serde(default = "default_label")]
    pub label: String,

    /// Default per-test timeout in milliseconds, handed to the runner.
    #[serde(default = "default_test_timeout")]
    pub default_test_timeout: u64,

    pub environments: Vec<EnvironmentConfig>,
}

fn default_label() -> String {
    "moonwall".to_string()
}

fn default_test_timeout() -> u64 {
    30_000
}

impl MoonwallConfig {
    /// Loads a config file, choosing the parser from the extension
    /// (`.json`, `.yml`, `.yaml`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;

        let config = match path_ref.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            Some("yml" | "yaml") => Self::from_yaml(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(path_ref.to_path_buf())),
        };

        debug!(
            label = %config.label,
            environments = config.environments.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Looks up an environment by name.
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, ConfigError> {
        self.environments
            .iter()
            .find(|env| env.name == name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: name.to_string(),
                available: self
                    .environments
                    .iter()
                    .map(|env| env.name.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// One named test environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub name: String,

    /// Folders of test files handed to the runner.
    #[serde(default)]
    pub test_file_dir: Vec<String>,

    pub foundation: Foundation,

    /// Explicit provider connections. Required for `chopsticks` and `read_only`.
    #[serde(default)]
    pub connections: Vec<ProviderSpec>,

    /// External test-runner command.
    #[serde(default)]
    pub runner: Option<RunnerConfig>,

    /// Per-test timeout override in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Command used to run the test files of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Foundation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoundationKind {
    Dev,
    Chopsticks,
    Zombie,
    ReadOnly,
}

impl fmt::Display for FoundationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FoundationKind::Dev => "dev",
            FoundationKind::Chopsticks => "chopsticks",
            FoundationKind::Zombie => "zombie",
            FoundationKind::ReadOnly => "read_only",
        };
        f.write_str(tag)
    }
}

/// Decoded foundation: one variant per tag, each with its own required fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawFoundation")]
pub enum Foundation {
    Dev { launch_spec: Vec<DevLaunchSpec> },
    Chopsticks { launch_spec: Vec<ChopsticksLaunchSpec> },
    Zombie { zombie_spec: ZombieLaunchSpec },
    ReadOnly,
}

impl Foundation {
    pub fn kind(&self) -> FoundationKind {
        match self {
            Foundation::Dev { .. } => FoundationKind::Dev,
            Foundation::Chopsticks { .. } => FoundationKind::Chopsticks,
            Foundation::Zombie { .. } => FoundationKind::Zombie,
            Foundation::ReadOnly => FoundationKind::ReadOnly,
        }
    }
}

/// The foundation as written on disk, before variant validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFoundation {
    #[serde(rename = "type")]
    pub kind: FoundationKind,
    #[serde(default)]
    pub launch_spec: Option<Value>,
    #[serde(default)]
    pub zombie_spec: Option<Value>,
}

impl TryFrom<RawFoundation> for Foundation {
    type Error = ConfigError;

    fn try_from(raw: RawFoundation) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        match kind {
            FoundationKind::Dev => {
                forbid(kind, "zombieSpec", raw.zombie_spec.as_ref())?;
                let launch_spec = decode_launch_specs(kind, raw.launch_spec)?;
                Ok(Foundation::Dev { launch_spec })
            }
            FoundationKind::Chopsticks => {
                forbid(kind, "zombieSpec", raw.zombie_spec.as_ref())?;
                let launch_spec = decode_launch_specs(kind, raw.launch_spec)?;
                Ok(Foundation::Chopsticks { launch_spec })
            }
            FoundationKind::Zombie => {
                forbid(kind, "launchSpec", raw.launch_spec.as_ref())?;
                let value = raw.zombie_spec.ok_or(ConfigError::MissingField {
                    kind,
                    field: "zombieSpec",
                })?;
                let zombie_spec = serde_json::from_value(value).map_err(|e| ConfigError::InvalidField {
                    kind,
                    field: "zombieSpec",
                    reason: e.to_string(),
                })?;
                Ok(Foundation::Zombie { zombie_spec })
            }
            FoundationKind::ReadOnly => {
                forbid(kind, "launchSpec", raw.launch_spec.as_ref())?;
                forbid(kind, "zombieSpec", raw.zombie_spec.as_ref())?;
                Ok(Foundation::ReadOnly)
            }
        }
    }
}

fn forbid(kind: FoundationKind, field: &'static str, value: Option<&Value>) -> Result<(), ConfigError> {
    match value {
        Some(_) => Err(ConfigError::UnexpectedField { kind, field }),
        None => Ok(()),
    }
}

fn decode_launch_specs<T>(kind: FoundationKind, value: Option<Value>) -> Result<Vec<T>, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    let value = value.ok_or(ConfigError::MissingField {
        kind,
        field: "launchSpec",
    })?;
    let specs: Vec<T> = serde_json::from_value(value).map_err(|e| ConfigError::InvalidField {
        kind,
        field: "launchSpec",
        reason: e.to_string(),
    })?;
    if specs.is_empty() {
        return Err(ConfigError::InvalidField {
            kind,
            field: "launchSpec",
            reason: "at least one entry is required".to_string(),
        });
    }
    Ok(specs)
}

/// Launch settings for a dev node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevLaunchSpec {
    pub name: String,

    /// Binary path, or the image name when `useDocker` is set.
    pub bin_path: String,

    /// Full argument list replacing the per-binary defaults.
    #[serde(default)]
    pub options: Option<Vec<String>>,

    #[serde(default)]
    pub ports: Option<DevPorts>,

    /// The node is already running; track it without spawning.
    #[serde(default)]
    pub running: bool,

    #[serde(default)]
    pub use_docker: bool,

    #[serde(default)]
    pub docker_config: Option<DockerConfig>,

    #[serde(default)]
    pub disable_default_eth_providers: bool,

    /// Probe and connect Ethereum RPC too. Inferred from the binary name when absent.
    #[serde(default)]
    pub is_ethereum_chain: Option<bool>,
}

/// Fixed ports for a dev node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevPorts {
    #[serde(default)]
    pub p2p_port: Option<u16>,
    #[serde(default)]
    pub rpc_port: Option<u16>,
}

/// Block production mode of a forked chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildBlockMode {
    Batch,
    Instant,
    #[default]
    Manual,
}

impl fmt::Display for BuildBlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            BuildBlockMode::Batch => "Batch",
            BuildBlockMode::Instant => "Instant",
            BuildBlockMode::Manual => "Manual",
        };
        f.write_str(mode)
    }
}

/// Role of a forked chain in XCM mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    #[default]
    Parachain,
    Relaychain,
}

/// Launch settings for one chopsticks fork.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChopsticksLaunchSpec {
    pub name: String,
    pub config_path: String,
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub build_block_mode: Option<BuildBlockMode>,
    #[serde(default)]
    pub wasm_override: Option<String>,
    #[serde(default)]
    pub allow_unresolved_imports: bool,
    #[serde(default, rename = "type")]
    pub role: ChainRole,
    #[serde(default)]
    pub running: bool,
}

/// Settings for a zombie network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZombieLaunchSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Topology file handed to the network orchestrator as-is.
    pub config_path: String,
    #[serde(default)]
    pub skip_block_check: bool,
    #[serde(default)]
    pub disable_default_eth_providers: bool,
    #[serde(default)]
    pub disable_log_eavesdropping: bool,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0} (expected .json, .yml or .yaml)")]
    UnsupportedFormat(PathBuf),

    #[error("Environment '{name}' not found (available: {available})")]
    UnknownEnvironment { name: String, available: String },

    #[error("Foundation '{kind}' requires field '{field}'")]
    MissingField { kind: FoundationKind, field: &'static str },

    #[error("Field '{field}' is not valid for foundation '{kind}'")]
    UnexpectedField { kind: FoundationKind, field: &'static str },

    #[error("Invalid '{field}' for foundation '{kind}': {reason}")]
    InvalidField {
        kind: FoundationKind,
        field: &'static str,
        reason: String,
    },
}

impl From<ConfigError> for moonwall_proto::Error {
    fn from(err: ConfigError) -> Self {
        moonwall_proto::Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonwall_proto::ProviderKind;
    use std::io::Write;

    const JSON_CONFIG: &str = r#"{
        "label": "moonwall_config",
        "defaultTestTimeout": 40000,
        "environments": [
            {
                "name": "dev_moonbase",
                "testFileDir": ["suites/dev"],
                "foundation": {
                    "type": "dev",
                    "launchSpec": [
                        { "name": "moonbeam", "binPath": "./tmp/moonbeam", "isEthereumChain": true }
                    ]
                }
            },
            {
                "name": "zombie_moonbase",
                "testFileDir": ["suites/zombie"],
                "foundation": {
                    "type": "zombie",
                    "zombieSpec": { "configPath": "./configs/zombie.json", "skipBlockCheck": true }
                }
            },
            {
                "name": "mainnet",
                "foundation": { "type": "read_only" },
                "connections": [
                    { "name": "polka", "type": "polkadotJs", "endpoints": ["wss://rpc.example.org"] }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_json_config() {
        let config = MoonwallConfig::from_json(JSON_CONFIG).unwrap();
        assert_eq!(config.label, "moonwall_config");
        assert_eq!(config.default_test_timeout, 40_000);
        assert_eq!(config.environments.len(), 3);

        let dev = config.environment("dev_moonbase").unwrap();
        assert_eq!(dev.test_file_dir, vec!["suites/dev"]);
        match &dev.foundation {
            Foundation::Dev { launch_spec } => {
                assert_eq!(launch_spec[0].bin_path, "./tmp/moonbeam");
                assert_eq!(launch_spec[0].is_ethereum_chain, Some(true));
                assert!(!launch_spec[0].running);
            }
            other => panic!("expected dev foundation, got {other:?}"),
        }

        let zombie = config.environment("zombie_moonbase").unwrap();
        assert_eq!(zombie.foundation.kind(), FoundationKind::Zombie);

        let mainnet = config.environment("mainnet").unwrap();
        assert_eq!(mainnet.foundation.kind(), FoundationKind::ReadOnly);
        assert_eq!(mainnet.connections[0].kind, ProviderKind::PolkadotJs);
    }

    #[test]
    fn test_parse_yaml_chopsticks() {
        let yaml = r#"
environments:
  - name: fork
    testFileDir: ["suites/fork"]
    foundation:
      type: chopsticks
      launchSpec:
        - name: moonbeam
          configPath: ./configs/moonbeam.yml
          wsPort: 12000
          buildBlockMode: Instant
    connections:
      - name: para
        type: polkadotJs
        endpoints: ["ws://127.0.0.1:12000"]
"#;
        let config = MoonwallConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.label, "moonwall");
        assert_eq!(config.default_test_timeout, 30_000);

        let env = config.environment("fork").unwrap();
        match &env.foundation {
            Foundation::Chopsticks { launch_spec } => {
                assert_eq!(launch_spec[0].ws_port, Some(12000));
                assert_eq!(launch_spec[0].build_block_mode, Some(BuildBlockMode::Instant));
                assert_eq!(launch_spec[0].role, ChainRole::Parachain);
            }
            other => panic!("expected chopsticks foundation, got {other:?}"),
        }
    }

    #[test]
    fn test_foundation_field_from_other_variant_is_rejected() {
        let yaml = r#"
environments:
  - name: confused
    foundation:
      type: zombie
      launchSpec:
        - name: moonbeam
          binPath: ./moonbeam
"#;
        let err = MoonwallConfig::from_yaml(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("launchSpec"), "{message}");
        assert!(message.contains("zombie"), "{message}");
    }

    #[test]
    fn test_missing_required_foundation_field() {
        let json = r#"{"environments":[{"name":"bare","foundation":{"type":"dev"}}]}"#;
        let err = MoonwallConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("requires field 'launchSpec'"));

        let json = r#"{"environments":[{"name":"bare","foundation":{"type":"zombie"}}]}"#;
        let err = MoonwallConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("requires field 'zombieSpec'"));
    }

    #[test]
    fn test_empty_launch_spec_is_rejected() {
        let json = r#"{"environments":[{"name":"e","foundation":{"type":"dev","launchSpec":[]}}]}"#;
        let err = MoonwallConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("at least one entry"));
    }

    #[test]
    fn test_unknown_environment_lists_available() {
        let config = MoonwallConfig::from_json(JSON_CONFIG).unwrap();
        let err = config.environment("nope").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'nope'"));
        assert!(message.contains("dev_moonbase, zombie_moonbase, mainnet"));
    }

    #[test]
    fn test_from_file_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("moonwall.config.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(JSON_CONFIG.as_bytes())
            .unwrap();
        assert_eq!(MoonwallConfig::from_file(&json_path).unwrap().environments.len(), 3);

        let toml_path = dir.path().join("moonwall.toml");
        std::fs::write(&toml_path, "label = 'x'").unwrap();
        assert!(matches!(
            MoonwallConfig::from_file(&toml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_config_error_maps_to_configuration() {
        let err: moonwall_proto::Error = ConfigError::MissingField {
            kind: FoundationKind::Zombie,
            field: "zombieSpec",
        }
        .into();
        assert!(matches!(err, moonwall_proto::Error::Configuration(_)));
    }
}
