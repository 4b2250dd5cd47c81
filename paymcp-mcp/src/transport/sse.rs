//! Legacy HTTP+SSE transport.
//!
//! `start` opens a GET event stream; the server's first `endpoint` event names
//! the URL that messages are POSTed to. Responses arrive on the stream as
//! `message` events and are routed to the waiting request by id.
//!
//! Each `start` opens a new session numbered by a generation counter. When
//! the stream of the current session ends, its reader stops the transport
//! and fails every waiting request; a reader from an older session does
//! nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use super::sse_parser::SseParser;
use super::{HttpAuth, Transport, TransportKind, TransportState, until_cancelled};
use crate::error::{ErrorKind, McpError};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// How long `start` waits for the `endpoint` event by default.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = DashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// HTTP+SSE transport.
#[derive(Debug)]
pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    auth: HttpAuth,
    endpoint: Mutex<Option<Url>>,
    pending: Arc<Pending>,
    endpoint_timeout: Duration,
    generation: Arc<AtomicU64>,
    state: Arc<TransportState>,
}

impl SseTransport {
    /// Creates a transport whose event stream lives at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, client: reqwest::Client, auth: HttpAuth) -> Self {
        Self {
            url: url.into(),
            client,
            auth,
            endpoint: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(TransportState::default()),
        }
    }

    /// Overrides how long `start` waits for the `endpoint` event.
    #[must_use]
    pub const fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    fn endpoint(&self) -> Result<Url, McpError> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| McpError::new(ErrorKind::NotStarted, "no message endpoint announced"))
    }

    /// A transport whose stream ended without `close` reports [`ErrorKind::Closed`].
    fn ensure_open(&self) -> Result<(), McpError> {
        if !self.state.is_started() && self.state.token().is_cancelled() {
            return Err(McpError::closed());
        }
        self.state.ensure_started()
    }

    async fn open(&self, session: u64) -> Result<(), McpError> {
        let base = Url::parse(&self.url).map_err(|e| McpError::transport(e.to_string()))?;
        let request = self
            .client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let response = self.auth.apply(request, "").await?.send().await?;
        self.auth.check_unauthorized(&response)?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::transport(format!("{} returned {status}", self.url))
                .with_code(i64::from(status.as_u16())));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = Session {
            id: session,
            generation: Arc::clone(&self.generation),
            state: Arc::clone(&self.state),
            pending: Arc::clone(&self.pending),
            token: self.state.token(),
        };
        tokio::spawn(read_events(response, reader, endpoint_tx, base));

        // The reader drops `endpoint_tx` when it stops, cancelled or not.
        let endpoint = match tokio::time::timeout(self.endpoint_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(McpError::transport(
                    "event stream ended before announcing an endpoint",
                ));
            }
            Err(_) => {
                return Err(McpError::new(
                    ErrorKind::Timeout,
                    "timed out waiting for the endpoint event",
                ));
            }
        };
        debug!(%endpoint, "SSE message endpoint announced");
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
        Ok(())
    }

    async fn post(&self, body: String) -> Result<(), McpError> {
        let request = self
            .client
            .post(self.endpoint()?)
            .header(CONTENT_TYPE, "application/json");
        let response = self.auth.apply(request, &body).await?.body(body).send().await?;
        self.auth.check_unauthorized(&response)?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::transport(format!("message endpoint returned {status}"))
                .with_code(i64::from(status.as_u16())));
        }
        Ok(())
    }
}

/// The state a reader shares with its transport.
struct Session {
    id: u64,
    generation: Arc<AtomicU64>,
    state: Arc<TransportState>,
    pending: Arc<Pending>,
    token: CancellationToken,
}

impl Session {
    /// Stops the transport if this is still its current session.
    fn end(self) {
        let current = self.generation.compare_exchange(
            self.id,
            self.id + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if current.is_err() {
            debug!(session = self.id, "SSE reader stopped");
            return;
        }
        self.pending.clear();
        self.token.cancel();
        self.state.mark_stopped();
        debug!(session = self.id, "SSE stream ended; transport stopped");
    }
}

async fn read_events(
    response: reqwest::Response,
    session: Session,
    endpoint_tx: oneshot::Sender<Url>,
    base: Url,
) {
    let token = session.token.clone();
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();
    loop {
        let chunk = tokio::select! {
            () = token.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(error)) => {
                warn!(%error, "SSE stream failed");
                break;
            }
            None => break,
        };
        for event in parser.feed_bytes(&bytes) {
            match event.event.as_str() {
                "endpoint" => match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url);
                        }
                    }
                    Err(error) => warn!(%error, data = %event.data, "bad endpoint event"),
                },
                "message" => {
                    let Ok(message) = serde_json::from_str(&event.data) else {
                        warn!("undecodable SSE message");
                        continue;
                    };
                    let Some(response) = JsonRpcResponse::from_message(&message) else {
                        trace!("ignoring server-initiated message");
                        continue;
                    };
                    match response.numeric_id().and_then(|id| session.pending.remove(&id)) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!(id = %response.id, "response for unknown request"),
                    }
                }
                other => trace!(event = other, "ignoring SSE event"),
            }
        }
    }
    drop(endpoint_tx);
    session.end();
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn start(&self) -> Result<(), McpError> {
        self.state.mark_started()?;
        let session = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self.open(session).await {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.state.cancel();
            self.state.reset();
            return Err(err);
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.state.is_started()
    }

    #[instrument(name = "paymcp.sse.request", skip_all, fields(method = %request.method), err)]
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        self.ensure_open()?;
        let id = request.id;
        let body = serde_json::to_string(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let token = self.state.token();
        let result = until_cancelled(&token, async {
            self.post(body).await?;
            rx.await.map_err(|_| McpError::closed())
        })
        .await;
        if result.is_err() {
            self.pending.remove(&id);
        }
        result
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.ensure_open()?;
        let body = serde_json::to_string(&notification)?;
        let token = self.state.token();
        until_cancelled(&token, self.post(body)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.cancel();
        self.pending.clear();
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn reset(&self) {
        self.state.reset();
    }

    async fn authorize(&self) -> Result<String, McpError> {
        self.auth.authorize(&self.client).await
    }

    async fn finish_auth(&self, code: &str) -> Result<(), McpError> {
        self.auth.finish_auth(&self.client, code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_start_reads_endpoint_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: endpoint\ndata: /messages?sessionId=abc\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let transport = SseTransport::new(
            format!("{}/sse", server.uri()),
            reqwest::Client::new(),
            HttpAuth::default(),
        );
        transport.start().await.unwrap();
        let endpoint = transport.endpoint().unwrap();
        assert_eq!(endpoint.path(), "/messages");
        assert_eq!(endpoint.query(), Some("sessionId=abc"));
        transport.close().await.unwrap();
        assert!(!transport.is_started());
    }

    #[tokio::test]
    async fn test_start_401_is_unauthorized_and_leaves_transport_restartable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport =
            SseTransport::new(server.uri(), reqwest::Client::new(), HttpAuth::default());
        let err = transport.start().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert!(!transport.is_started());
        assert_eq!(transport.start().await.unwrap_err().kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_ended_stream_stops_transport_and_fails_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: endpoint\ndata: /messages\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let transport = SseTransport::new(
            format!("{}/sse", server.uri()),
            reqwest::Client::new(),
            HttpAuth::default(),
        );
        transport.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.is_started() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            transport.request(JsonRpcRequest::new(1, "ping", None)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);

        transport.close().await.unwrap();
        transport.reset();
        transport.start().await.unwrap();
        assert_eq!(transport.endpoint().unwrap().path(), "/messages");
    }
}
