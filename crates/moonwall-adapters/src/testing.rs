//! Testing utilities: an in-process JSON-RPC node double and a container
//! runtime double.
//!
//! `FakeRpcServer` answers WebSocket and HTTP JSON-RPC on one loopback port,
//! the way a dev node does. Methods without a configured reply never answer,
//! which lets tests exercise call timeouts. `FakeContainerRuntime` keeps
//! containers in memory and records every call.

use crate::docker::{ContainerOptions, ContainerRuntime};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use moonwall_proto::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

type Replies = Arc<Mutex<HashMap<String, Value>>>;

/// Loopback JSON-RPC server with mutable canned replies.
#[derive(Debug)]
pub struct FakeRpcServer {
    addr: SocketAddr,
    replies: Replies,
    calls: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeRpcServer {
    /// Starts a server answering only the given methods.
    pub async fn start(replies: HashMap<String, Value>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let replies: Replies = Arc::new(Mutex::new(replies));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let replies = Arc::clone(&replies);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&replies),
                        Arc::clone(&calls),
                    ));
                }
            })
        };

        Ok(Self {
            addr,
            replies,
            calls,
            task,
        })
    }

    /// A Substrate dev chain at block 0.
    pub async fn substrate() -> std::io::Result<Self> {
        Self::start(substrate_replies()).await
    }

    /// A Substrate chain that also answers the Ethereum RPC surface.
    pub async fn ethereum() -> std::io::Result<Self> {
        let mut replies = substrate_replies();
        replies.insert("eth_chainId".to_string(), json!("0x501"));
        replies.insert("eth_blockNumber".to_string(), json!("0x0"));
        Self::start(replies).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn ws_endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Replaces (or adds) the reply for `method`.
    pub fn set_reply(&self, method: &str, value: Value) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(method.to_string(), value);
        }
    }

    /// Makes `method` hang from now on.
    pub fn remove_reply(&self, method: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.remove(method);
        }
    }

    /// Sets the height reported by `chain_getHeader` and `eth_blockNumber`.
    pub fn set_block_height(&self, height: u64) {
        let hex = format!("0x{height:x}");
        self.set_reply("chain_getHeader", json!({ "number": hex }));
        self.set_reply("eth_blockNumber", json!(hex));
    }

    /// Methods received so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Drop for FakeRpcServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Container runtime whose containers run until stopped.
#[derive(Debug, Default)]
pub struct FakeContainerRuntime {
    calls: Mutex<Vec<String>>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, e.g. `create moonwall_alice_9944`, `stop c-1`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn stopped(&self, id: &str) -> bool {
        self.calls().iter().any(|c| *c == format!("stop {id}"))
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn pull_image(&self, image: &str, _platform: &str) -> Result<()> {
        self.record(format!("pull {image}"));
        Ok(())
    }

    async fn create(&self, options: &ContainerOptions) -> Result<String> {
        self.record(format!("create {}", options.name));
        Ok(format!("c-{}", options.name))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {id}"));
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(!self.stopped(id))
    }

    async fn follow_logs(&self, _id: &str, _log_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record(format!("stop {id}"));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(format!("remove {id}"));
        Ok(())
    }
}

fn substrate_replies() -> HashMap<String, Value> {
    HashMap::from([
        ("system_chain".to_string(), json!("Moonwall Dev")),
        (
            "state_getRuntimeVersion".to_string(),
            json!({ "specName": "moonbase", "specVersion": 3300 }),
        ),
        ("chain_getHeader".to_string(), json!({ "number": "0x0" })),
    ])
}

fn reply_for(replies: &Replies, calls: &Arc<Mutex<Vec<String>>>, request: &Value) -> Option<Value> {
    let method = request.get("method")?.as_str()?;
    if let Ok(mut calls) = calls.lock() {
        calls.push(method.to_string());
    }
    let result = replies.lock().ok()?.get(method).cloned()?;
    Some(json!({
        "jsonrpc": "2.0",
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "result": result,
    }))
}

async fn serve_connection(stream: TcpStream, replies: Replies, calls: Arc<Mutex<Vec<String>>>) {
    let mut buf = vec![0u8; 8192];
    let head = loop {
        let n = match stream.peek(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        if text.contains("\r\n\r\n") || n == buf.len() {
            break text;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    if head.contains("upgrade: websocket") {
        serve_websocket(stream, replies, calls).await;
    } else {
        serve_http(stream, replies, calls).await;
    }
}

async fn serve_websocket(stream: TcpStream, replies: Replies, calls: Arc<Mutex<Vec<String>>>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if let Some(response) = reply_for(&replies, &calls, &request)
            && ws.send(Message::Text(response.to_string())).await.is_err()
        {
            return;
        }
    }
}

async fn serve_http(stream: TcpStream, replies: Replies, calls: Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(stream);
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).await.is_err() {
        return;
    }
    let Ok(request) = serde_json::from_slice::<Value>(&body) else {
        return;
    };

    let Some(response) = reply_for(&replies, &calls, &request) else {
        // Unanswered method: hold the connection open until the client gives up.
        std::future::pending::<()>().await;
        return;
    };

    let payload = response.to_string();
    let raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(raw.as_bytes()).await;
    let _ = stream.shutdown().await;
}
