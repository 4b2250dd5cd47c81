//! Chooses and constructs the transport for a server endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, instrument};

use super::{
    ChannelTransport, HttpAuth, ServerEndpoint, SseTransport, StreamableHttpTransport, Transport,
    TransportKind, normalize_url,
};
use crate::error::McpError;
use crate::types::JsonRpcRequest;

/// How long the transport probe waits for any HTTP response.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a [`ServerEndpoint`] to a concrete transport.
///
/// An explicit [`TransportKind`] is honored as is. Without one, a single
/// signed `ping` POST decides: any HTTP response (even 4xx/5xx) means the
/// server speaks streamable HTTP, while a connect failure or timeout falls
/// back to SSE.
pub struct TransportResolver {
    client: reqwest::Client,
    probe_timeout: Duration,
    channels: DashMap<String, Arc<ChannelTransport>>,
}

impl fmt::Debug for TransportResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResolver")
            .field("probe_timeout", &self.probe_timeout)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl Default for TransportResolver {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl TransportResolver {
    /// Creates a resolver that builds HTTP transports on `client`.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            channels: DashMap::new(),
        }
    }

    /// Overrides the probe timeout.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// The HTTP client shared by every transport this resolver builds.
    #[must_use]
    pub const fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Makes an in-process channel reachable under `url`.
    pub fn register_channel(&self, url: &str, transport: Arc<ChannelTransport>) {
        self.channels.insert(normalize_url(url), transport);
    }

    /// Builds the transport for `endpoint`, probing when no kind is pinned.
    ///
    /// # Errors
    ///
    /// Returns a transport error for a channel endpoint with no registered
    /// channel, or if the probe cannot be signed.
    #[instrument(name = "paymcp.resolve", skip_all, fields(url = %endpoint.url), err)]
    pub async fn resolve(
        &self,
        endpoint: &ServerEndpoint,
        auth: HttpAuth,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let kind = match endpoint.transport {
            Some(kind) => kind,
            None => self.probe(&endpoint.url, &auth).await?,
        };
        debug!(%kind, "transport selected");
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::HttpStream => Arc::new(StreamableHttpTransport::new(
                endpoint.url.clone(),
                self.client.clone(),
                auth,
            )),
            TransportKind::Sse => Arc::new(SseTransport::new(
                endpoint.url.clone(),
                self.client.clone(),
                auth,
            )),
            TransportKind::Channel => self
                .channels
                .get(&endpoint.key())
                .map(|entry| Arc::clone(entry.value()) as Arc<dyn Transport>)
                .ok_or_else(|| {
                    McpError::transport(format!("no channel registered for {}", endpoint.url))
                })?,
        };
        Ok(transport)
    }

    async fn probe(&self, url: &str, auth: &HttpAuth) -> Result<TransportKind, McpError> {
        let body = serde_json::to_string(&JsonRpcRequest::new(0, "ping", None))?;
        let request = self
            .client
            .post(url)
            .timeout(self.probe_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream");
        let request = auth.apply(request, &body).await?.body(body);
        match request.send().await {
            Ok(response) => {
                debug!(status = %response.status(), "probe answered");
                Ok(TransportKind::HttpStream)
            }
            Err(error) => {
                debug!(%error, "probe failed, falling back to SSE");
                Ok(TransportKind::Sse)
            }
        }
    }
}
