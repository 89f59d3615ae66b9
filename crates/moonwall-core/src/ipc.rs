//! IPC control server and client over a Unix domain socket.
//!
//! Framing is one newline-terminated JSON object each way: the client writes
//! one [`IpcRequest`], the server writes one [`IpcResponse`] and closes the
//! connection. Malformed or unknown requests are answered with a `failure`
//! response; the server keeps accepting connections.

use async_trait::async_trait;
use moonwall_proto::{Error, IpcCommand, IpcRequest, IpcResponse, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File name of the control socket inside the network's temp directory.
pub const SOCKET_FILE_NAME: &str = "node-ipc.sock";

const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Timings for IPC-driven node control.
#[derive(Debug, Clone, Copy)]
pub struct IpcTimings {
    /// Bound on one orchestrator call (restart, pause, resume).
    pub call_timeout: Duration,
    /// Fixed wait after a node operation before reconnecting.
    pub settle_delay: Duration,
    /// Client-side wait for the server to close after a success.
    pub close_poll_interval: Duration,
    pub close_poll_attempts: u32,
}

impl Default for IpcTimings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(5),
            close_poll_interval: Duration::from_millis(100),
            close_poll_attempts: 50,
        }
    }
}

/// Executes one decoded command.
///
/// Returns the `result` payload and a human-readable message.
#[async_trait]
pub trait IpcHandler: Send + Sync {
    async fn handle(&self, command: IpcCommand, node: Option<&str>) -> Result<(Value, String)>;
}

/// A bound control socket.
#[derive(Debug)]
pub struct IpcServer {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Binds `path` and starts serving.
    ///
    /// A stale file at `path` is removed first. The socket is made
    /// owner read/write only.
    pub async fn bind(path: impl Into<PathBuf>, handler: Arc<dyn IpcHandler>) -> Result<Self> {
        let path = path.into();

        if path.exists() {
            debug!(path = %path.display(), "Removing stale IPC socket");
            tokio::fs::remove_file(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        info!(path = %path.display(), "IPC server listening");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                debug!(error = %e, "IPC connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "IPC accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        Ok(Self {
            path,
            task: Some(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and removes the socket file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(path = %self.path.display(), "IPC server closed");
        }
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn serve_connection(stream: UnixStream, handler: Arc<dyn IpcHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = respond(&line, handler.as_ref()).await;
    let mut payload = serde_json::to_string(&response)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Decodes one request line and runs it. Every failure becomes a `failure` response.
pub async fn respond(line: &str, handler: &dyn IpcHandler) -> IpcResponse {
    let request: IpcRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed IPC request");
            return IpcResponse::failure(format!("Invalid request: {e}"));
        }
    };

    let command = match request.command() {
        Ok(command) => command,
        Err(e) => {
            warn!(cmd = %request.cmd, "Unknown IPC command");
            return IpcResponse::failure(e.to_string());
        }
    };

    if command.needs_node()
        && let Err(e) = request.require_node()
    {
        return IpcResponse::failure(e.to_string());
    }

    info!(cmd = %command, node = ?request.node_name, text = %request.text, "IPC request");
    match handler.handle(command, request.node_name.as_deref()).await {
        Ok((result, message)) => IpcResponse::success(result, message),
        Err(e) => {
            warn!(cmd = %command, node = ?request.node_name, error = %e, "IPC command failed");
            IpcResponse::failure(e.to_string())
        }
    }
}

/// Client side of the control socket.
#[derive(Debug, Clone)]
pub struct IpcClient {
    path: PathBuf,
    timings: IpcTimings,
}

impl IpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timings: IpcTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: IpcTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Sends one request and waits for its response.
    ///
    /// After a `success`, waits (bounded) for the server to close the
    /// connection so the node operation is fully finished server side.
    pub async fn send(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            Error::IpcProtocol(format!("cannot connect to {}: {e}", self.path.display()))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::IpcProtocol(
                "server closed the connection without a response".to_string(),
            ));
        }
        let response: IpcResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::IpcProtocol(format!("invalid response: {e}")))?;

        if response.is_success() {
            self.wait_for_close(&mut reader).await;
        }
        Ok(response)
    }

    async fn wait_for_close<R>(&self, reader: &mut R)
    where
        R: AsyncReadExt + Unpin,
    {
        let mut buf = [0u8; 256];
        for _ in 0..self.timings.close_poll_attempts {
            match tokio::time::timeout(self.timings.close_poll_interval, reader.read(&mut buf)).await {
                Ok(Ok(0) | Err(_)) => return,
                Ok(Ok(_)) | Err(_) => {}
            }
        }
        warn!(path = %self.path.display(), "IPC server did not close the connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonwall_proto::IpcStatus;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl IpcHandler for EchoHandler {
        async fn handle(&self, command: IpcCommand, node: Option<&str>) -> Result<(Value, String)> {
            match command {
                IpcCommand::NetworkMap => Ok((json!({ "alice": {}, "bob": {} }), "network map".to_string())),
                IpcCommand::Kill if node == Some("ghost") => {
                    Err(Error::IpcProtocol("Node 'ghost' not found".to_string()))
                }
                other => Ok((json!(true), format!("{other} {}", node.unwrap_or("-")))),
            }
        }
    }

    #[tokio::test]
    async fn test_respond_malformed_json() {
        let response = respond("{not json", &EchoHandler).await;
        assert_eq!(response.status, IpcStatus::Failure);
        assert!(response.message.starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_respond_missing_node() {
        let response = respond(r#"{"cmd":"restart","text":"x"}"#, &EchoHandler).await;
        assert_eq!(response.status, IpcStatus::Failure);
        assert!(response.message.contains("requires a nodeName"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let response = respond(r#"{"cmd":"kill","nodeName":"ghost","text":""}"#, &EchoHandler).await;
        assert_eq!(response.status, IpcStatus::Failure);
        assert!(response.message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_bind_over_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_FILE_NAME);
        std::fs::write(&path, b"left over from a crashed run").unwrap();

        let _server = IpcServer::bind(&path, Arc::new(EchoHandler)).await.unwrap();
        let response = IpcClient::new(&path)
            .send(&IpcRequest::new(IpcCommand::NetworkMap, None))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.result, json!({ "alice": {}, "bob": {} }));
    }

    #[tokio::test]
    async fn test_client_reports_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = IpcClient::new(dir.path().join("absent.sock"))
            .send(&IpcRequest::new(IpcCommand::IsUp, Some("alice")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpcProtocol(_)));
    }

    #[tokio::test]
    async fn test_server_roundtrip_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_FILE_NAME);
        let mut server = IpcServer::bind(&path, Arc::new(EchoHandler)).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let client = IpcClient::new(&path);
        let response = client
            .send(&IpcRequest::new(IpcCommand::Pause, Some("alice")))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.message, "pause alice");

        server.close().unwrap();
        assert!(!path.exists());
        server.close().unwrap();
    }
}
