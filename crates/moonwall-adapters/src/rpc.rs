//! Minimal JSON-RPC 2.0 client over WebSocket and HTTP.
//!
//! Enough to run liveness checks and back the provider clients. Payloads are
//! returned as raw `serde_json::Value`; nothing beyond the envelope is parsed.

use futures::{SinkExt, StreamExt};
use moonwall_proto::{Error, Result};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport selected from the endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Http,
}

impl Transport {
    /// `ws://`/`wss://` → WebSocket, `http://`/`https://` → HTTP.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            Ok(Transport::WebSocket)
        } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Ok(Transport::Http)
        } else {
            Err(Error::config(format!(
                "Unsupported endpoint '{endpoint}': expected ws://, wss://, http:// or https://"
            )))
        }
    }
}

enum Connection {
    Ws(Mutex<Option<WsStream>>),
    Http(reqwest::Client),
}

/// A connected JSON-RPC client.
///
/// WebSocket clients keep one socket open and serialize calls on it; HTTP
/// clients issue one POST per call.
pub struct RpcClient {
    endpoint: String,
    connection: Connection,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Connects to `endpoint`. For HTTP no I/O happens until the first call.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let connection = match Transport::from_endpoint(endpoint)? {
            Transport::WebSocket => {
                let (stream, _response) = tokio_tungstenite::connect_async(endpoint)
                    .await
                    .map_err(|e| Error::Rpc(format!("WebSocket connect to {endpoint} failed: {e}")))?;
                debug!(endpoint = %endpoint, "WebSocket connected");
                Connection::Ws(Mutex::new(Some(stream)))
            }
            Transport::Http => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| Error::Rpc(format!("HTTP client for {endpoint}: {e}")))?;
                Connection::Http(client)
            }
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            connection,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Calls `method` and returns its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = match &self.connection {
            Connection::Ws(stream) => {
                let mut guard = stream.lock().await;
                let ws = guard
                    .as_mut()
                    .ok_or_else(|| Error::Rpc(format!("{} is disconnected", self.endpoint)))?;
                ws_roundtrip(ws, &request, id).await?
            }
            Connection::Http(client) => {
                let resp = client
                    .post(&self.endpoint)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| Error::Rpc(format!("POST {}: {e}", self.endpoint)))?;
                resp.json::<Value>()
                    .await
                    .map_err(|e| Error::Rpc(format!("Invalid response from {}: {e}", self.endpoint)))?
            }
        };

        into_result(method, response)
    }

    /// Calls `method`, failing with `Error::Timeout` after `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        tokio::time::timeout(timeout, self.call(method, params))
            .await
            .map_err(|_| Error::Timeout {
                elapsed: timeout,
                what: format!("{method} on {}", self.endpoint),
            })?
    }

    /// Closes the socket. Idempotent; a no-op for HTTP.
    pub async fn close(&self) -> Result<()> {
        if let Connection::Ws(stream) = &self.connection
            && let Some(mut ws) = stream.lock().await.take()
        {
            ws.close(None)
                .await
                .map_err(|e| Error::Rpc(format!("Closing {}: {e}", self.endpoint)))?;
        }
        Ok(())
    }
}

async fn ws_roundtrip(ws: &mut WsStream, request: &Value, id: u64) -> Result<Value> {
    ws.send(Message::Text(request.to_string()))
        .await
        .map_err(|e| Error::Rpc(format!("WebSocket send failed: {e}")))?;

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| Error::Rpc(format!("WebSocket read failed: {e}")))?;
        let payload: Value = match message {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Binary(bytes) => serde_json::from_slice(&bytes)?,
            Message::Close(_) => break,
            _ => continue,
        };
        // Subscription notifications carry no id.
        if payload.get("id").and_then(Value::as_u64) == Some(id) {
            return Ok(payload);
        }
    }

    Err(Error::Rpc("WebSocket closed before response".to_string()))
}

fn into_result(method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Rpc(format!("{method} returned error: {message}")));
    }
    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| Error::Rpc(format!("{method} response has no result")))
}

/// One-shot call on a fresh connection, bounded by `timeout` end to end.
pub async fn call_once(endpoint: &str, method: &str, timeout: Duration) -> Result<Value> {
    let attempt = async {
        let client = RpcClient::connect(endpoint).await?;
        let result = client.call(method, json!([])).await;
        let _ = client.close().await;
        result
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| Error::Timeout {
            elapsed: timeout,
            what: format!("{method} on {endpoint}"),
        })?
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(value: &Value) -> Option<u64> {
    let text = value.as_str()?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_scheme() {
        assert_eq!(Transport::from_endpoint("ws://127.0.0.1:9944").unwrap(), Transport::WebSocket);
        assert_eq!(Transport::from_endpoint("wss://rpc.example").unwrap(), Transport::WebSocket);
        assert_eq!(Transport::from_endpoint("http://127.0.0.1:9944").unwrap(), Transport::Http);
        assert!(Transport::from_endpoint("tcp://nope").is_err());
    }

    #[test]
    fn test_into_result_error_envelope() {
        let err = into_result(
            "eth_chainId",
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Method not found"));

        let ok = into_result("system_chain", json!({"jsonrpc":"2.0","id":1,"result":"Dev"})).unwrap();
        assert_eq!(ok, json!("Dev"));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u64(&json!("0x505")), Some(1285));
        assert_eq!(parse_hex_u64(&json!("0x0")), Some(0));
        assert_eq!(parse_hex_u64(&json!(12)), None);
    }
}
