//! OAuth support: the per-server provider, token persistence, the popup
//! broker and the unauthorized-recovery state machine.

pub mod flow;
pub mod popup;
pub mod recovery;

pub use popup::{
    AuthEvent, CALLBACK_MESSAGE_TYPE, CallbackMessage, DEFAULT_REDIRECT_URL, PopupBroker,
    PopupHandle,
};
pub use recovery::{AuthGate, with_auth_retry};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CLIENT_NAME;
use crate::error::McpError;
use flow::AuthorizationEndpoints;

/// Tokens issued by an authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Bearer token sent on every request.
    pub access_token: String,
    /// Usually `Bearer`.
    pub token_type: String,
    /// Refresh token, if issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, if given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Granted scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Client metadata sent during dynamic registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    /// Human-readable client name.
    pub client_name: String,
    /// Registered redirect URLs.
    pub redirect_uris: Vec<String>,
    /// `authorization_code` and `refresh_token`.
    pub grant_types: Vec<String>,
    /// `code`.
    pub response_types: Vec<String>,
    /// `none`: this is a public client.
    pub token_endpoint_auth_method: String,
}

impl OAuthClientMetadata {
    /// Metadata for a public client redirecting to `redirect_url`.
    #[must_use]
    pub fn public_client(redirect_url: &str) -> Self {
        Self {
            client_name: CLIENT_NAME.to_owned(),
            redirect_uris: vec![redirect_url.to_owned()],
            grant_types: vec!["authorization_code".to_owned(), "refresh_token".to_owned()],
            response_types: vec!["code".to_owned()],
            token_endpoint_auth_method: "none".to_owned(),
        }
    }
}

/// Credentials issued by dynamic registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    /// Client identifier.
    pub client_id: String,
    /// Client secret, for confidential registrations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Persists OAuth tokens keyed by server URL.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads the tokens stored for `server_url`.
    async fn load(&self, server_url: &str) -> Result<Option<OAuthTokens>, McpError>;

    /// Stores `tokens` for `server_url`, replacing any previous value.
    async fn save(&self, server_url: &str, tokens: &OAuthTokens) -> Result<(), McpError>;
}

/// A [`TokenStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<String, OAuthTokens>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, server_url: &str) -> Result<Option<OAuthTokens>, McpError> {
        Ok(self.tokens.get(server_url).map(|t| t.value().clone()))
    }

    async fn save(&self, server_url: &str, tokens: &OAuthTokens) -> Result<(), McpError> {
        self.tokens.insert(server_url.to_owned(), tokens.clone());
        Ok(())
    }
}

/// A [`TokenStore`] backed by one JSON file mapping server URL to tokens.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileTokenStore {
    /// Stores tokens in the JSON file at `path`, created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, OAuthTokens>, McpError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(McpError::transport(format!(
                "cannot read token file {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, server_url: &str) -> Result<Option<OAuthTokens>, McpError> {
        Ok(self.read_all().await?.remove(server_url))
    }

    async fn save(&self, server_url: &str, tokens: &OAuthTokens) -> Result<(), McpError> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(server_url.to_owned(), tokens.clone());
        let io_err = |e: std::io::Error| {
            McpError::transport(format!("cannot write token file {}: {e}", self.path.display()))
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(&all)?;
        tokio::fs::write(&self.path, json).await.map_err(io_err)
    }
}

/// OAuth client state for one server.
///
/// Client information and the PKCE verifier live only in memory. Tokens are
/// read from the [`TokenStore`] on first use and cached afterwards.
pub struct OAuthProvider {
    server_url: String,
    metadata: OAuthClientMetadata,
    store: Arc<dyn TokenStore>,
    broker: PopupBroker,
    popup_timeout: Duration,
    client_information: Mutex<Option<OAuthClientInformation>>,
    tokens: tokio::sync::Mutex<Option<Option<OAuthTokens>>>,
    code_verifier: Mutex<Option<String>>,
    endpoints: Mutex<Option<AuthorizationEndpoints>>,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server_url", &self.server_url)
            .field("popup_timeout", &self.popup_timeout)
            .finish_non_exhaustive()
    }
}

impl OAuthProvider {
    /// Creates a provider for `server_url`.
    ///
    /// `popup_timeout` bounds how long an authorization round trip may wait
    /// for the popup collaborator and the callback.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        store: Arc<dyn TokenStore>,
        broker: PopupBroker,
        popup_timeout: Duration,
    ) -> Self {
        let metadata = OAuthClientMetadata::public_client(broker.redirect_url());
        Self {
            server_url: server_url.into(),
            metadata,
            store,
            broker,
            popup_timeout,
            client_information: Mutex::new(None),
            tokens: tokio::sync::Mutex::new(None),
            code_verifier: Mutex::new(None),
            endpoints: Mutex::new(None),
        }
    }

    /// The server this provider authorizes against.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The redirect URL registered for this client.
    #[must_use]
    pub fn redirect_url(&self) -> &str {
        self.broker.redirect_url()
    }

    /// Fixed registration metadata.
    #[must_use]
    pub const fn client_metadata(&self) -> &OAuthClientMetadata {
        &self.metadata
    }

    /// Client credentials from a previous registration.
    #[must_use]
    pub fn client_information(&self) -> Option<OAuthClientInformation> {
        self.client_information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remembers client credentials for the lifetime of this provider.
    pub fn save_client_information(&self, info: OAuthClientInformation) {
        *self
            .client_information
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    /// Current tokens; the store is consulted once and the answer cached.
    ///
    /// A store failure is logged and treated as "no tokens".
    pub async fn tokens(&self) -> Option<OAuthTokens> {
        let mut cache = self.tokens.lock().await;
        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }
        let loaded = match self.store.load(&self.server_url).await {
            Ok(tokens) => tokens,
            Err(error) => {
                warn!(server = %self.server_url, %error, "failed to load stored tokens");
                None
            }
        };
        debug!(server = %self.server_url, found = loaded.is_some(), "tokens loaded");
        *cache = Some(loaded.clone());
        loaded
    }

    /// Persists `tokens` and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the cache is left untouched in that case.
    pub async fn save_tokens(&self, tokens: OAuthTokens) -> Result<(), McpError> {
        let mut cache = self.tokens.lock().await;
        self.store.save(&self.server_url, &tokens).await?;
        *cache = Some(Some(tokens));
        Ok(())
    }

    /// Asks the UI to open `authorization_url` and waits for the code.
    ///
    /// `id` is the request id and OAuth `state`.
    ///
    /// # Errors
    ///
    /// Returns an authorization or timeout error from the popup broker.
    pub async fn redirect_to_authorization(
        &self,
        id: &str,
        authorization_url: &str,
        resource_metadata: Option<String>,
    ) -> Result<String, McpError> {
        self.broker
            .request_authorization(
                id,
                &self.server_url,
                authorization_url,
                resource_metadata,
                self.popup_timeout,
            )
            .await
    }

    /// Stores the PKCE verifier for the pending authorization.
    pub fn save_code_verifier(&self, verifier: impl Into<String>) {
        *self
            .code_verifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(verifier.into());
    }

    /// The PKCE verifier saved for the pending authorization.
    ///
    /// # Errors
    ///
    /// Returns an authorization error if no verifier was saved.
    pub fn code_verifier(&self) -> Result<String, McpError> {
        self.code_verifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| McpError::authorization("code verifier read before it was saved"))
    }

    pub(crate) fn endpoints(&self) -> Option<AuthorizationEndpoints> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn save_endpoints(&self, endpoints: AuthorizationEndpoints) {
        *self.endpoints.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoints);
    }
}
