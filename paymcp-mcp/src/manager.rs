//! Connection cache keyed by normalized server URL.
//!
//! [`ConnectionManager`] hands out one shared [`McpClient`] per server.
//! Reused connections are health-checked first; a stale one is evicted and
//! replaced. Calls for the same server are serialized by a per-server gate,
//! so concurrent callers share a single connection (and a single
//! authorization popup). Calls for different servers never wait on each
//! other.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use paymcp::identity::Identity;
use paymcp_http::RequestSigner;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::auth::{OAuthProvider, PopupBroker, TokenStore};
use crate::client::McpClient;
use crate::error::{ErrorKind, McpError};
use crate::transport::{HttpAuth, ServerEndpoint, TransportResolver, normalize_url};

/// Creates connections for the [`ConnectionManager`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Builds a new, not yet started, client for `endpoint`.
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<McpClient>, McpError>;
}

type OAuthFactory = Arc<dyn Fn(&str) -> Arc<OAuthProvider> + Send + Sync>;

/// The default [`Connector`]: resolves a transport, signs with an optional
/// identity and authorizes with an optional per-server OAuth provider.
#[derive(Clone)]
pub struct HttpConnector {
    resolver: Arc<TransportResolver>,
    identity: Option<Arc<dyn Identity>>,
    operation: Option<String>,
    oauth: Option<OAuthFactory>,
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("resolver", &self.resolver)
            .field("identity", &self.identity.as_ref().map(|i| i.did()))
            .field("oauth", &self.oauth.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpConnector {
    /// A connector that neither signs nor authorizes.
    #[must_use]
    pub const fn new(resolver: Arc<TransportResolver>) -> Self {
        Self {
            resolver,
            identity: None,
            operation: None,
            oauth: None,
        }
    }

    /// Signs every request with `identity`.
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Overrides the operation tag in DID signatures.
    #[must_use]
    pub fn with_signing_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Builds an OAuth provider per server with `factory`.
    #[must_use]
    pub fn with_oauth(
        mut self,
        factory: impl Fn(&str) -> Arc<OAuthProvider> + Send + Sync + 'static,
    ) -> Self {
        self.oauth = Some(Arc::new(factory));
        self
    }

    /// Authorizes through `broker`, persisting tokens in `store`.
    #[must_use]
    pub fn with_oauth_store(
        self,
        store: Arc<dyn TokenStore>,
        broker: PopupBroker,
        popup_timeout: Duration,
    ) -> Self {
        self.with_oauth(move |url| {
            Arc::new(OAuthProvider::new(
                url,
                Arc::clone(&store),
                broker.clone(),
                popup_timeout,
            ))
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<McpClient>, McpError> {
        let oauth = self.oauth.as_ref().map(|factory| factory(&endpoint.url));
        let signer = self.identity.as_ref().map(|identity| {
            let signer = RequestSigner::new(Arc::clone(identity), endpoint.url.clone());
            match &self.operation {
                Some(operation) => signer.with_operation(operation.clone()),
                None => signer,
            }
        });
        let transport = self
            .resolver
            .resolve(endpoint, HttpAuth::new(signer, oauth.clone()))
            .await?;
        let mut builder = McpClient::builder(transport).url(endpoint.url.clone());
        if let Some(oauth) = oauth {
            builder = builder.oauth(oauth);
        }
        Ok(Arc::new(builder.build()))
    }
}

/// How long a reused connection gets to answer its liveness ping by default.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Get-or-create cache of live connections.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    clients: DashMap<String, Arc<McpClient>>,
    gates: DashMap<String, Arc<Mutex<()>>>,
    liveness_timeout: Duration,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.clients.len())
            .field("liveness_timeout", &self.liveness_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates an empty cache that connects with `connector`.
    #[must_use]
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Arc::new(connector),
            clients: DashMap::new(),
            gates: DashMap::new(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }

    /// Overrides how long a reused connection gets to answer its ping.
    #[must_use]
    pub const fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Returns the live connection for `endpoint`, creating it if needed.
    ///
    /// A cached connection that fails its health check, or does not answer it
    /// in time, is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if a new connection cannot be created.
    #[instrument(name = "paymcp.connection", skip_all, fields(url = %endpoint.url), err)]
    pub async fn get(&self, endpoint: &ServerEndpoint) -> Result<Arc<McpClient>, McpError> {
        let key = endpoint.key();
        let gate = Arc::clone(self.gates.entry(key.clone()).or_default().value());
        let _serialized = gate.lock().await;

        let cached = self.clients.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(existing) = cached {
            match self.check_alive(&existing).await {
                Ok(()) => {
                    debug!("reusing connection");
                    return Ok(existing);
                }
                Err(error) => {
                    warn!(%error, "evicting stale connection");
                    self.clients.remove_if(&key, |_, client| Arc::ptr_eq(client, &existing));
                    if let Err(error) = existing.close().await {
                        debug!(%error, "closing stale connection failed");
                    }
                }
            }
        }
        let client = self.connector.connect(endpoint).await?;
        info!(transport = %client.transport_kind(), "connection created");
        self.clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    async fn check_alive(&self, client: &McpClient) -> Result<(), McpError> {
        tokio::time::timeout(self.liveness_timeout, client.check_alive())
            .await
            .unwrap_or_else(|_| {
                Err(McpError::new(
                    ErrorKind::Timeout,
                    format!("no ping answer within {:?}", self.liveness_timeout),
                ))
            })
    }

    /// Closes and forgets the connection for `url`, if there is one.
    ///
    /// # Errors
    ///
    /// Returns the close error; the entry is removed regardless.
    pub async fn close(&self, url: &str) -> Result<(), McpError> {
        let removed = self.clients.remove(&normalize_url(url));
        match removed {
            Some((_, client)) => client.close().await,
            None => Ok(()),
        }
    }

    /// Closes every connection concurrently. Individual failures are logged.
    pub async fn close_all(&self) {
        let urls: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        let clients: Vec<_> = urls
            .into_iter()
            .filter_map(|url| self.clients.remove(&url))
            .collect();
        let closes = clients.iter().map(|(url, client)| async move {
            if let Err(error) = client.close().await {
                warn!(url, %error, "closing connection failed");
            }
        });
        join_all(closes).await;
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no connection is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether a connection for `url` is cached.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.clients.contains_key(&normalize_url(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Transport, TransportKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::AbortHandle;
    use wiremock::matchers::{body_partial_json, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Connects to in-process servers and keeps a handle to each.
    #[derive(Default)]
    struct ChannelConnector {
        connects: AtomicUsize,
        servers: std::sync::Mutex<Vec<AbortHandle>>,
        transports: std::sync::Mutex<Vec<Arc<ChannelTransport>>>,
        /// Server whose connections never answer `ping`.
        unresponsive: Option<&'static str>,
    }

    #[async_trait]
    impl Connector for Arc<ChannelConnector> {
        async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<McpClient>, McpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let hangs = self.unresponsive == Some(endpoint.url.as_str());
            let (transport, peer) = ChannelTransport::pair();
            let server = tokio::spawn(peer.serve(move |method, _params| async move {
                if hangs && method == "ping" {
                    std::future::pending::<()>().await;
                }
                Ok(match method.as_str() {
                    "initialize" => json!({
                        "protocolVersion": "2025-06-18",
                        "serverInfo": { "name": "memory" }
                    }),
                    _ => json!({}),
                })
            }));
            self.servers.lock().unwrap().push(server.abort_handle());
            let transport = Arc::new(transport);
            self.transports.lock().unwrap().push(Arc::clone(&transport));
            Ok(Arc::new(
                McpClient::builder(transport)
                    .url(endpoint.url.clone())
                    .build(),
            ))
        }
    }

    #[tokio::test]
    async fn test_reuses_live_connection() {
        let connector = Arc::new(ChannelConnector::default());
        let manager = ConnectionManager::new(Arc::clone(&connector));
        let endpoint = ServerEndpoint::new("https://tools.example");

        let first = manager.get(&endpoint).await.unwrap();
        first.check_alive().await.unwrap();
        let second = manager.get(&ServerEndpoint::new("HTTPS://tools.example/")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_is_replaced() {
        let connector = Arc::new(ChannelConnector::default());
        let manager = ConnectionManager::new(Arc::clone(&connector));
        let endpoint = ServerEndpoint::new("https://tools.example");

        let first = manager.get(&endpoint).await.unwrap();
        first.check_alive().await.unwrap();
        connector.servers.lock().unwrap()[0].abort();
        tokio::task::yield_now().await;

        let second = manager.get(&endpoint).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        second.check_alive().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_connection() {
        let connector = Arc::new(ChannelConnector::default());
        let manager = ConnectionManager::new(Arc::clone(&connector));
        let endpoint = ServerEndpoint::new("https://tools.example");

        let (a, b) = tokio::join!(manager.get(&endpoint), manager.get(&endpoint));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_and_close_all() {
        let connector = Arc::new(ChannelConnector::default());
        let manager = ConnectionManager::new(Arc::clone(&connector));
        let a = manager.get(&ServerEndpoint::new("https://a.example")).await.unwrap();
        let b = manager.get(&ServerEndpoint::new("https://b.example")).await.unwrap();
        a.check_alive().await.unwrap();
        b.check_alive().await.unwrap();
        let transports = connector.transports.lock().unwrap().clone();
        assert!(transports.iter().all(|t| t.is_started()));

        manager.close("https://a.example").await.unwrap();
        assert!(!manager.contains("https://a.example"));
        assert!(manager.contains("https://b.example/"));
        assert!(!transports[0].is_started());
        assert!(transports[1].is_started());

        manager.close_all().await;
        assert!(manager.is_empty());
        assert!(!transports[1].is_started());
    }

    #[tokio::test]
    async fn test_unresponsive_server_does_not_block_other_servers() {
        let connector = Arc::new(ChannelConnector {
            unresponsive: Some("https://slow.example"),
            ..ChannelConnector::default()
        });
        let manager = Arc::new(
            ConnectionManager::new(Arc::clone(&connector))
                .with_liveness_timeout(Duration::from_secs(1)),
        );
        let slow = ServerEndpoint::new("https://slow.example");
        let first = manager.get(&slow).await.unwrap();

        let reconnect = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get(&slow).await }
        });
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            Duration::from_millis(500),
            manager.get(&ServerEndpoint::new("https://fast.example")),
        )
        .await
        .unwrap()
        .unwrap();
        fast.check_alive().await.unwrap();
        assert!(manager.contains("https://fast.example"));

        let replaced = reconnect.await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.len(), 2);
        assert!(!connector.transports.lock().unwrap()[0].is_started());
    }

    #[tokio::test]
    async fn test_http_connector_signs_and_lists_tools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists(paymcp_http::constants::DID_AUTHORIZATION_HEADER))
            .and(body_partial_json(json!({ "method": "initialize" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "remote" }
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "notifications/initialized" })))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "tools/list" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": { "tools": [{ "name": "search" }] }
            })))
            .mount(&server)
            .await;

        let identity = Arc::new(paymcp_evm::EvmIdentity::new(
            alloy_signer_local::PrivateKeySigner::random(),
            84532,
        ));
        let connector = HttpConnector::new(Arc::new(TransportResolver::default()))
            .with_identity(identity);
        let manager = ConnectionManager::new(connector);
        let endpoint = ServerEndpoint::new(server.uri()).with_transport(TransportKind::HttpStream);

        let client = manager.get(&endpoint).await.unwrap();
        let tools = client.tools().await.unwrap();
        assert_eq!(tools[0].name, "search");
    }
}
