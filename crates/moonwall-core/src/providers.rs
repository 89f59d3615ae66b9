//! Provider connection management.
//!
//! Turns [`ProviderSpec`]s into connected clients. Providers connect
//! concurrently; each provider retries sequentially under a [`RetryPolicy`],
//! every attempt raced against a timeout. A provider is either absent from
//! the live list or fully connected.

use async_trait::async_trait;
use futures::future::join_all;
use moonwall_adapters::{Greeting, ProviderClient, RpcClient, connect_client};
use moonwall_proto::{Error, ProviderKind, ProviderSpec, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Retry tunables for one provider.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay between failed attempts.
    pub delay: Duration,
    /// Each attempt is abandoned after this long.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Creates clients from specs. Swappable for tests and embedders.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, spec: &ProviderSpec) -> Result<Box<dyn ProviderClient>>;
}

/// Connector dispatching on the provider kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl ProviderConnector for DefaultConnector {
    async fn connect(&self, spec: &ProviderSpec) -> Result<Box<dyn ProviderClient>> {
        connect_client(spec).await
    }
}

/// A live provider.
pub struct ConnectedProvider {
    name: String,
    kind: ProviderKind,
    client: Box<dyn ProviderClient>,
}

impl std::fmt::Debug for ConnectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedProvider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

impl ConnectedProvider {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    /// The underlying client.
    pub fn client(&self) -> &dyn ProviderClient {
        self.client.as_ref()
    }

    /// Raw JSON-RPC access, absent for stub providers.
    pub fn api(&self) -> Option<&RpcClient> {
        self.client.api()
    }

    pub async fn greet(&self) -> Result<Greeting> {
        self.client.greet().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }
}

/// Runs `connect` and wraps the resulting client.
///
/// Failures are logged here and returned to the caller.
pub async fn populate<F>(name: &str, kind: ProviderKind, connect: F) -> Result<ConnectedProvider>
where
    F: Future<Output = Result<Box<dyn ProviderClient>>>,
{
    match connect.await {
        Ok(client) => {
            debug!(name = %name, kind = %kind, "Provider connected");
            Ok(ConnectedProvider {
                name: name.to_string(),
                kind,
                client,
            })
        }
        Err(e) => {
            error!(name = %name, kind = %kind, error = %e, "Failed to populate provider");
            Err(e)
        }
    }
}

/// Owns the live provider list.
pub struct ProviderManager {
    connector: Arc<dyn ProviderConnector>,
    policy: RetryPolicy,
    providers: Mutex<Vec<Arc<ConnectedProvider>>>,
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ProviderManager {
    pub fn new(connector: Arc<dyn ProviderConnector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            providers: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Connects every spec. No-op when providers are already connected.
    ///
    /// If any provider exhausts its attempts, the ones that did connect are
    /// disconnected again and the list stays empty.
    pub async fn connect_all(&self, specs: &[ProviderSpec]) -> Result<()> {
        let mut providers = self.providers.lock().await;
        if !providers.is_empty() {
            debug!(count = providers.len(), "Providers already connected");
            return Ok(());
        }

        let results = join_all(specs.iter().map(|spec| self.connect_with_retry(spec))).await;

        let mut connected = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(provider) => connected.push(provider),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => warn!(error = %e, "Additional provider failure"),
            }
        }

        if let Some(e) = first_error {
            for provider in connected {
                if let Err(disconnect_err) = provider.disconnect().await {
                    debug!(name = %provider.name, error = %disconnect_err, "Disconnect after failed bulk connect");
                }
            }
            return Err(e);
        }

        info!(count = connected.len(), "Providers connected");
        providers.extend(connected.into_iter().map(Arc::new));
        Ok(())
    }

    /// Connects one provider, retrying sequentially.
    pub async fn connect_with_retry(&self, spec: &ProviderSpec) -> Result<ConnectedProvider> {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let attempt_future = populate(&spec.name, spec.kind.clone(), self.connector.connect(spec));
            match tokio::time::timeout(self.policy.attempt_timeout, attempt_future).await {
                Ok(Ok(provider)) => {
                    if attempt > 1 {
                        info!(name = %spec.name, attempt, "Provider connected after retry");
                    }
                    return Ok(provider);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("attempt timed out after {:?}", self.policy.attempt_timeout);
                }
            }

            warn!(
                name = %spec.name,
                attempt,
                max_attempts = self.policy.max_attempts,
                error = %last_error,
                "Provider connection attempt failed"
            );
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        Err(Error::ProviderConnection {
            name: spec.name.clone(),
            attempts: self.policy.max_attempts,
            reason: last_error,
        })
    }

    /// Disconnects one provider by name, or all of them.
    ///
    /// Providers leave the list even when their disconnect fails; failures
    /// come back as teardown errors.
    pub async fn disconnect(&self, name: Option<&str>) -> Vec<Error> {
        let removed: Vec<Arc<ConnectedProvider>> = {
            let mut providers = self.providers.lock().await;
            match name {
                Some(name) => {
                    let (matching, rest): (Vec<_>, Vec<_>) =
                        providers.drain(..).partition(|p| p.name == name);
                    *providers = rest;
                    if matching.is_empty() {
                        debug!(name = %name, "No connected provider with this name");
                    }
                    matching
                }
                None => providers.drain(..).collect(),
            }
        };

        let results = join_all(removed.iter().map(|p| p.disconnect())).await;
        removed
            .iter()
            .zip(results)
            .filter_map(|(provider, result)| {
                result
                    .err()
                    .map(|e| Error::teardown(format!("provider {}", provider.name), e))
            })
            .collect()
    }

    /// Snapshot of the live list.
    pub async fn providers(&self) -> Vec<Arc<ConnectedProvider>> {
        self.providers.lock().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ConnectedProvider>> {
        self.providers
            .lock()
            .await
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.providers
            .lock()
            .await
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn spec(name: &str) -> ProviderSpec {
        ProviderSpec::new(name, ProviderKind::PolkadotJs, "ws://fake")
    }

    #[tokio::test]
    async fn test_always_rejecting_fails_after_max_attempts() {
        let connector = Arc::new(FakeConnector::new().reject("broken"));
        let manager = ProviderManager::new(connector.clone(), fast_policy());

        let err = manager.connect_all(&[spec("broken")]).await.unwrap_err();
        match err {
            Error::ProviderConnection { name, attempts, reason } => {
                assert_eq!(name, "broken");
                assert_eq!(attempts, 4);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(connector.attempts("broken"), 4);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_flaky_provider_connects_on_retry() {
        let connector = Arc::new(FakeConnector::new().fail_first("flaky", 2));
        let manager = ProviderManager::new(connector.clone(), fast_policy());

        manager.connect_all(&[spec("flaky")]).await.unwrap();
        assert_eq!(connector.attempts("flaky"), 3);
        assert_eq!(manager.names().await, vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_hanging_attempts_time_out() {
        let connector = Arc::new(FakeConnector::new().hang("slow"));
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(50),
        };
        let manager = ProviderManager::new(connector.clone(), policy);

        let err = manager.connect_all(&[spec("slow")]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("2 attempt(s)"));
        assert_eq!(connector.attempts("slow"), 2);
    }

    #[tokio::test]
    async fn test_one_failure_leaves_list_empty() {
        let connector = Arc::new(FakeConnector::new().reject("broken"));
        let manager = ProviderManager::new(connector.clone(), fast_policy());

        let result = manager.connect_all(&[spec("good"), spec("broken")]).await;
        assert!(result.is_err());
        assert!(manager.is_empty().await);
        // The provider that did connect was released again.
        assert_eq!(connector.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_all_is_noop_when_connected() {
        let connector = Arc::new(FakeConnector::new());
        let manager = ProviderManager::new(connector.clone(), fast_policy());

        manager.connect_all(&[spec("a"), spec("b")]).await.unwrap();
        manager.connect_all(&[spec("c")]).await.unwrap();
        assert_eq!(connector.total_attempts(), 2);
        assert_eq!(manager.providers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_by_name_and_all() {
        let connector = Arc::new(FakeConnector::new().sticky("sticky"));
        let manager = ProviderManager::new(connector, fast_policy());
        manager
            .connect_all(&[spec("a"), spec("sticky"), spec("c")])
            .await
            .unwrap();

        assert!(manager.disconnect(Some("a")).await.is_empty());
        assert!(manager.get("a").await.is_none());
        assert_eq!(manager.names().await.len(), 2);

        let errors = manager.disconnect(None).await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::Teardown { entity, .. } if entity == "provider sticky"));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_populate_rethrows_failure() {
        let result = populate("viem", ProviderKind::Viem, async {
            Err::<Box<dyn ProviderClient>, _>(Error::Rpc("no route".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Rpc(_))));
    }

    #[tokio::test]
    async fn test_populate_wraps_client() {
        let connector = FakeConnector::new();
        let spec = ProviderSpec::new("viem", ProviderKind::Viem, "ws://fake");
        let provider = populate(&spec.name, spec.kind.clone(), connector.connect(&spec))
            .await
            .unwrap();
        assert_eq!(provider.name(), "viem");
        assert_eq!(provider.kind(), &ProviderKind::Viem);
        assert_eq!(provider.greet().await.unwrap().chain, "Fake Chain");
        assert!(provider.api().is_none());
    }
}
