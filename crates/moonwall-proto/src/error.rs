//! Error types shared by every Moonwall crate.

use std::time::Duration;

/// Result alias using the Moonwall error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up, launching, connecting or tearing down an
/// environment.
///
/// Setup, launch and connect errors are fatal and propagate to the caller.
/// `IpcProtocol` is contained to one exchange, and `Teardown` is only ever
/// collected and logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Environment/foundation mismatch or a missing required field.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The node binary is missing, not executable, or built for another architecture.
    #[error("Binary unavailable at {path}: {reason}\n  hint: {hint}")]
    BinaryUnavailable {
        path: String,
        reason: String,
        hint: String,
    },

    /// A node or container failed to start, exited immediately, or never became ready.
    #[error("Failed to launch {name}: {reason}")]
    Launch { name: String, reason: String },

    /// A provider exhausted its connection attempts.
    #[error("Provider '{name}' failed to connect after {attempts} attempt(s): {reason}")]
    ProviderConnection {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// Malformed or unrecognized IPC request.
    #[error("IPC protocol error: {0}")]
    IpcProtocol(String),

    /// A teardown step failed. Never propagated out of teardown.
    #[error("Teardown of {entity} failed: {reason}")]
    Teardown { entity: String, reason: String },

    /// The external network orchestrator reported a failure.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// JSON-RPC transport or response error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A bounded wait elapsed.
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { elapsed: Duration, what: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Shorthand for a launch error on a named node.
    pub fn launch(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Launch {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a teardown error on a named entity.
    pub fn teardown(entity: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Teardown {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error is fatal to setup/launch/connect.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::IpcProtocol(_) | Error::Teardown { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_names_entity_and_attempts() {
        let err = Error::ProviderConnection {
            name: "eth".to_string(),
            attempts: 15,
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'eth'"));
        assert!(msg.contains("15 attempt"));
    }

    #[test]
    fn test_binary_error_carries_hint() {
        let err = Error::BinaryUnavailable {
            path: "./moonbeam".to_string(),
            reason: "not found".to_string(),
            hint: "download it first".to_string(),
        };
        assert!(err.to_string().contains("hint: download it first"));
    }

    #[test]
    fn test_fatality() {
        assert!(Error::config("bad").is_fatal());
        assert!(Error::launch("alice", "exited").is_fatal());
        assert!(!Error::IpcProtocol("bogus".to_string()).is_fatal());
        assert!(!Error::teardown("alice", "gone").is_fatal());
    }
}
