//! Wire messages for the node control socket.
//!
//! One JSON document per message, newline terminated. A connection carries
//! exactly one request and one response.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Commands understood by the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcCommand {
    /// Restart a node and reconnect providers.
    Restart,
    /// Pause (SIGSTOP) a node.
    Pause,
    /// Resume a paused node and reconnect providers.
    Resume,
    /// Terminate a node and drop it from the process table.
    Kill,
    /// Ask the orchestrator whether a node is up.
    IsUp,
    /// List the nodes of the running network.
    NetworkMap,
}

impl IpcCommand {
    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            IpcCommand::Restart => "restart",
            IpcCommand::Pause => "pause",
            IpcCommand::Resume => "resume",
            IpcCommand::Kill => "kill",
            IpcCommand::IsUp => "isup",
            IpcCommand::NetworkMap => "networkmap",
        }
    }

    /// Returns true if the command targets a single node and needs `nodeName`.
    pub fn needs_node(self) -> bool {
        !matches!(self, IpcCommand::NetworkMap)
    }
}

impl fmt::Display for IpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpcCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(IpcCommand::Restart),
            "pause" => Ok(IpcCommand::Pause),
            "resume" => Ok(IpcCommand::Resume),
            "kill" => Ok(IpcCommand::Kill),
            "isup" => Ok(IpcCommand::IsUp),
            "networkmap" => Ok(IpcCommand::NetworkMap),
            other => Err(Error::IpcProtocol(format!("Unknown command '{other}'"))),
        }
    }
}

/// Request sent by a control client.
///
/// `cmd` stays a raw string on the wire so unknown commands decode and can be
/// answered with a failure instead of a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcRequest {
    /// Free-form description, echoed into server logs.
    #[serde(default)]
    pub text: String,

    /// Command name.
    pub cmd: String,

    /// Target node for node-scoped commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl IpcRequest {
    /// Builds a request for a known command.
    pub fn new(cmd: IpcCommand, node_name: Option<&str>) -> Self {
        let text = match node_name {
            Some(node) => format!("{cmd} {node}"),
            None => cmd.to_string(),
        };
        Self {
            text,
            cmd: cmd.to_string(),
            node_name: node_name.map(str::to_string),
        }
    }

    /// Parses the command name.
    pub fn command(&self) -> Result<IpcCommand, Error> {
        self.cmd.parse()
    }

    /// Returns the target node, failing for node-scoped commands without one.
    pub fn require_node(&self) -> Result<&str, Error> {
        self.node_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::IpcProtocol(format!("Command '{}' requires a nodeName", self.cmd)))
    }
}

/// Outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcStatus {
    Success,
    Failure,
}

/// Response written by the control server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub status: IpcStatus,
    /// Boolean for node commands, object for `networkmap`.
    pub result: serde_json::Value,
    pub message: String,
}

impl IpcResponse {
    /// Successful response.
    pub fn success(result: impl Into<serde_json::Value>, message: impl Into<String>) -> Self {
        Self {
            status: IpcStatus::Success,
            result: result.into(),
            message: message.into(),
        }
    }

    /// Failed response. `result` is always `false`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: IpcStatus::Failure,
            result: serde_json::Value::Bool(false),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == IpcStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = IpcRequest::new(IpcCommand::Restart, Some("alice"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cmd"], "restart");
        assert_eq!(json["nodeName"], "alice");
        assert_eq!(json["text"], "restart alice");
    }

    #[test]
    fn test_unknown_command_decodes_but_does_not_parse() {
        let req: IpcRequest = serde_json::from_str(r#"{"cmd":"bogus"}"#).unwrap();
        assert!(req.text.is_empty());
        let err = req.command().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_node_required_for_node_commands() {
        let req: IpcRequest = serde_json::from_str(r#"{"cmd":"kill","text":"x"}"#).unwrap();
        assert!(IpcCommand::Kill.needs_node());
        assert!(req.require_node().is_err());
        assert!(!IpcCommand::NetworkMap.needs_node());
    }

    #[test]
    fn test_response_status_is_lowercase() {
        let resp = IpcResponse::failure("nope");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":"failure""#));
        assert!(json.contains(r#""result":false"#));
    }
}
