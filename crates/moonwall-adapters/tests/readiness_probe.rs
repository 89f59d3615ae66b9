//! Readiness probing and provider clients against a loopback JSON-RPC node.

use moonwall_adapters::readiness::{ProbeConfig, check_port, wait_for_port_ready};
use moonwall_adapters::testing::FakeRpcServer;
use moonwall_adapters::{ProviderClient, connect_client};
use moonwall_proto::{ProviderKind, ProviderSpec};
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::test]
async fn test_substrate_node_is_ready() {
    let server = FakeRpcServer::substrate().await.unwrap();
    assert!(check_port(server.port(), false, CALL_TIMEOUT).await);

    let calls = server.calls();
    // One call per transport.
    assert_eq!(calls.iter().filter(|m| *m == "system_chain").count(), 2);
}

#[tokio::test]
async fn test_ethereum_probe_fails_when_chain_id_hangs() {
    // Answers system_chain but never eth_chainId.
    let server = FakeRpcServer::substrate().await.unwrap();

    assert!(!check_port(server.port(), true, CALL_TIMEOUT).await);
    assert!(check_port(server.port(), false, CALL_TIMEOUT).await);
}

#[tokio::test]
async fn test_ethereum_node_is_ready() {
    let server = FakeRpcServer::ethereum().await.unwrap();
    assert!(check_port(server.port(), true, CALL_TIMEOUT).await);
}

#[tokio::test]
async fn test_wait_for_port_ready_gives_up_after_iteration_cap() {
    let server = FakeRpcServer::substrate().await.unwrap();
    server.remove_reply("system_chain");

    let config = ProbeConfig {
        max_iterations: 3,
        interval: Duration::from_millis(10),
        call_timeout: Duration::from_millis(100),
    };
    let err = wait_for_port_ready("stuck", server.port(), false, config)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("3 probe iterations"));
}

#[tokio::test]
async fn test_substrate_client_reads_block_height() {
    let server = FakeRpcServer::substrate().await.unwrap();
    server.set_block_height(42);

    let spec = ProviderSpec::new("para", ProviderKind::PolkadotJs, server.ws_endpoint());
    let client = connect_client(&spec).await.unwrap();
    assert_eq!(client.block_height().await.unwrap(), 42);

    let greeting = client.greet().await.unwrap();
    assert_eq!(greeting.chain, "Moonwall Dev");
    assert_eq!(greeting.detail, "moonbase v3300");
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ethereum_client_over_http() {
    let server = FakeRpcServer::ethereum().await.unwrap();
    server.set_block_height(7);

    let spec = ProviderSpec::new("eth", ProviderKind::Viem, server.http_endpoint());
    let client = connect_client(&spec).await.unwrap();
    assert_eq!(client.block_height().await.unwrap(), 7);
    assert_eq!(client.greet().await.unwrap().chain, "chainId 1281");
}
