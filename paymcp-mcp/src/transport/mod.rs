//! Wire transports and transport resolution.
//!
//! Every transport implements [`Transport`]: a started/closed lifecycle, a
//! request/response exchange and optional OAuth hooks. Transports classify
//! failures where they happen; an HTTP 401 always surfaces as
//! [`ErrorKind::Unauthorized`](crate::ErrorKind::Unauthorized).
//!
//! - [`StreamableHttpTransport`] - POST per message, JSON or SSE responses
//! - [`SseTransport`] - long-lived event stream plus a POST endpoint
//! - [`ChannelTransport`] - in-process message channel
//!
//! [`TransportResolver`] picks one for a [`ServerEndpoint`].

mod channel;
mod http_stream;
mod resolver;
mod sse;
mod sse_parser;

pub use channel::{ChannelMessage, ChannelPeer, ChannelTransport};
pub use http_stream::StreamableHttpTransport;
pub use resolver::{DEFAULT_PROBE_TIMEOUT, TransportResolver};
pub use sse::SseTransport;
pub use sse_parser::{SseEvent, SseParser};

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use paymcp_http::RequestSigner;
use paymcp_http::constants::DID_AUTHORIZATION_HEADER;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::auth::{OAuthProvider, flow};
use crate::error::{ErrorKind, McpError};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// The wire transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Streamable HTTP: one POST per message.
    #[serde(rename = "httpStream")]
    HttpStream,
    /// Legacy HTTP+SSE: a GET event stream plus a POST endpoint.
    #[serde(rename = "sse")]
    Sse,
    /// In-process message channel.
    #[serde(rename = "channel")]
    Channel,
}

impl TransportKind {
    /// The wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HttpStream => "httpStream",
            Self::Sse => "sse",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "httpStream" | "http-stream" | "streamable-http" => Ok(Self::HttpStream),
            "sse" => Ok(Self::Sse),
            "channel" => Ok(Self::Channel),
            other => Err(McpError::transport(format!("unknown transport kind {other:?}"))),
        }
    }
}

/// A server URL plus an optional explicit transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Server URL.
    pub url: String,
    /// Transport to use; probed when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
}

impl ServerEndpoint {
    /// An endpoint whose transport will be probed.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: None,
        }
    }

    /// Pins the transport.
    #[must_use]
    pub const fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    /// The cache key: the URL in normalized form.
    ///
    /// URLs that fail to parse are used verbatim.
    #[must_use]
    pub fn key(&self) -> String {
        normalize_url(&self.url)
    }
}

/// Normalizes a URL string for use as a cache key.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    url::Url::parse(url).map_or_else(|_| url.to_owned(), |u| u.to_string())
}

/// A bidirectional JSON-RPC message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// Opens the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyStarted`] if the transport is already
    /// started, or a transport error if the connection cannot be opened.
    async fn start(&self) -> Result<(), McpError>;

    /// Whether [`start`](Self::start) has succeeded and the transport is not closed.
    fn is_started(&self) -> bool;

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Unauthorized`] on HTTP 401 and transport errors otherwise.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message cannot be delivered.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    /// Closes the transport and cancels in-flight work.
    ///
    /// # Errors
    ///
    /// Returns a transport error if session teardown fails; the transport is
    /// closed regardless.
    async fn close(&self) -> Result<(), McpError>;

    /// Clears the started state and installs a fresh cancellation token so
    /// the transport can be started again.
    fn reset(&self);

    /// Records the protocol revision negotiated during `initialize`.
    fn set_protocol_version(&self, _version: &str) {}

    /// Runs the OAuth authorization round trip and returns the code.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Authorization`] if the transport does not support
    /// OAuth or the round trip fails.
    async fn authorize(&self) -> Result<String, McpError> {
        Err(McpError::authorization(format!(
            "{} transport does not support authorization",
            self.kind()
        )))
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Authorization`] if the exchange fails.
    async fn finish_auth(&self, _code: &str) -> Result<(), McpError> {
        Err(McpError::authorization(format!(
            "{} transport does not support authorization",
            self.kind()
        )))
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport({})", self.kind())
    }
}

/// Started flag and cancellation token shared by all transports.
#[derive(Debug, Default)]
pub(crate) struct TransportState {
    started: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl TransportState {
    pub(crate) fn mark_started(&self) -> Result<(), McpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::new(
                ErrorKind::AlreadyStarted,
                "transport already started; close and reset it before starting again",
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_started(&self) -> Result<(), McpError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(McpError::new(ErrorKind::NotStarted, "transport not started"))
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Marks the transport stopped without touching the current token.
    pub(crate) fn mark_stopped(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Cancels in-flight work and marks the transport stopped.
    pub(crate) fn cancel(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.token().cancel();
    }

    pub(crate) fn reset(&self) {
        self.started.store(false, Ordering::SeqCst);
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }
}

/// Runs `fut` until it completes or `token` is cancelled.
pub(crate) async fn until_cancelled<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    tokio::select! {
        () = token.cancelled() => Err(McpError::closed()),
        res = fut => res,
    }
}

/// Credentials attached to every HTTP send: DID signature and OAuth bearer.
#[derive(Clone, Default)]
pub struct HttpAuth {
    signer: Option<RequestSigner>,
    oauth: Option<Arc<OAuthProvider>>,
    resource_metadata: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAuth")
            .field("signer", &self.signer)
            .field("oauth", &self.oauth.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpAuth {
    /// Combines an optional DID signer and an optional OAuth provider.
    #[must_use]
    pub fn new(signer: Option<RequestSigner>, oauth: Option<Arc<OAuthProvider>>) -> Self {
        Self {
            signer,
            oauth,
            resource_metadata: Arc::default(),
        }
    }

    /// The DID signer, if configured.
    #[must_use]
    pub const fn signer(&self) -> Option<&RequestSigner> {
        self.signer.as_ref()
    }

    /// Adds the bearer token and a fresh DID signature over `body`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the identity fails to sign.
    pub async fn apply(
        &self,
        mut request: reqwest::RequestBuilder,
        body: &str,
    ) -> Result<reqwest::RequestBuilder, McpError> {
        if let Some(oauth) = &self.oauth
            && let Some(tokens) = oauth.tokens().await
        {
            request = request.bearer_auth(&tokens.access_token);
        }
        if let Some(signer) = &self.signer {
            request = request.header(DID_AUTHORIZATION_HEADER, signer.sign(body).await?);
        }
        Ok(request)
    }

    /// Maps HTTP 401 to an unauthorized error and remembers the advertised
    /// protected-resource metadata URL.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Unauthorized`] for 401 responses.
    pub fn check_unauthorized(&self, response: &reqwest::Response) -> Result<(), McpError> {
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        let challenge = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok());
        if let Some(metadata) = challenge.and_then(resource_metadata_param) {
            *self
                .resource_metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(metadata);
        }
        Err(McpError::unauthorized(format!(
            "{} rejected the request credentials",
            response.url()
        )))
    }

    fn oauth(&self) -> Result<&Arc<OAuthProvider>, McpError> {
        self.oauth
            .as_ref()
            .ok_or_else(|| McpError::authorization("no OAuth provider configured for this server"))
    }

    /// Runs the OAuth authorization round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Authorization`] without a provider or if the flow fails.
    pub async fn authorize(&self, client: &reqwest::Client) -> Result<String, McpError> {
        let oauth = self.oauth()?;
        let metadata = self
            .resource_metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        flow::authorize(client, oauth, metadata).await
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Authorization`] without a provider or if the exchange fails.
    pub async fn finish_auth(&self, client: &reqwest::Client, code: &str) -> Result<(), McpError> {
        flow::exchange_code(client, self.oauth()?, code).await
    }
}

/// Extracts `resource_metadata="..."` from a `WWW-Authenticate` challenge.
fn resource_metadata_param(challenge: &str) -> Option<String> {
    let start = challenge.find("resource_metadata=")? + "resource_metadata=".len();
    let rest = challenge[start..].trim_start_matches('"');
    let end = rest.find(['"', ',', ' ']).unwrap_or(rest.len());
    Some(rest[..end].to_owned()).filter(|s| !s.is_empty())
}
