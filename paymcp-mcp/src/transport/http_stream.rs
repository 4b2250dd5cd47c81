//! Streamable HTTP transport.
//!
//! Each JSON-RPC message is POSTed to the server URL. The server answers with
//! either a JSON body or an event stream that eventually carries the
//! response. The `mcp-session-id` header returned by `initialize` is echoed on
//! every later request and the session is deleted on close.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use super::sse_parser::SseParser;
use super::{HttpAuth, Transport, TransportKind, TransportState, until_cancelled};
use crate::error::McpError;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header carrying the negotiated protocol revision.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Streamable HTTP transport.
#[derive(Debug)]
pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    auth: HttpAuth,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    state: TransportState,
}

impl StreamableHttpTransport {
    /// Creates a transport for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, client: reqwest::Client, auth: HttpAuth) -> Self {
        Self {
            url: url.into(),
            client,
            auth,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            state: TransportState::default(),
        }
    }

    /// The current session id, if the server assigned one.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_BOTH);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session);
        }
        if let Some(version) = self.protocol_version() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        let request = self.auth.apply(request, &body).await?;
        let response = request.body(body).send().await?;
        self.auth.check_unauthorized(&response)?;

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(session.to_owned());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::transport(format!("{} returned {status}", self.url))
                .with_code(i64::from(status.as_u16()))
                .with_detail(Value::String(body)));
        }
        Ok(response)
    }

    async fn read_event_stream(
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        while let Some(chunk) = stream.next().await {
            for event in parser.feed_bytes(&chunk?) {
                if event.event != "message" {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(message) => match JsonRpcResponse::from_message(&message) {
                        Some(response) if response.numeric_id() == Some(id) => return Ok(response),
                        _ => trace!("skipping unrelated stream message"),
                    },
                    Err(error) => warn!(%error, "undecodable event in response stream"),
                }
            }
        }
        Err(McpError::transport(
            "event stream ended before the response arrived",
        ))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStream
    }

    async fn start(&self) -> Result<(), McpError> {
        self.state.mark_started()?;
        debug!(url = %self.url, "streamable HTTP transport started");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.state.is_started()
    }

    #[instrument(name = "paymcp.http_stream.request", skip_all, fields(method = %request.method), err)]
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        self.state.ensure_started()?;
        let id = request.id;
        let body = serde_json::to_string(&request)?;
        let token = self.state.token();
        until_cancelled(&token, async {
            let response = self.post(body).await?;
            let is_stream = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/event-stream"));
            if is_stream {
                Self::read_event_stream(response, id).await
            } else {
                let bytes = response.bytes().await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        })
        .await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.state.ensure_started()?;
        let body = serde_json::to_string(&notification)?;
        let token = self.state.token();
        until_cancelled(&token, async { self.post(body).await.map(drop) }).await
    }

    async fn close(&self) -> Result<(), McpError> {
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.cancel();
        if let Some(session) = session {
            let request = self
                .client
                .delete(&self.url)
                .header(SESSION_ID_HEADER, session);
            let request = self.auth.apply(request, "").await?;
            if let Err(error) = request.send().await {
                debug!(%error, "session delete failed");
            }
        }
        Ok(())
    }

    fn reset(&self) {
        self.state.reset();
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.to_owned());
    }

    async fn authorize(&self) -> Result<String, McpError> {
        self.auth.authorize(&self.client).await
    }

    async fn finish_auth(&self, code: &str) -> Result<(), McpError> {
        self.auth.finish_auth(&self.client, code).await
    }
}
