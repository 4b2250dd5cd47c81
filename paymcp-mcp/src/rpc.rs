//! JSON-RPC session on top of a [`Transport`].
//!
//! [`RpcClient`] owns request ids and the `initialize` handshake. The
//! handshake runs lazily before the first request and again after
//! [`RpcClient::invalidate`], so a recovered connection re-detects what the
//! server offers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::McpError;
use crate::transport::Transport;
use crate::types::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, ServerCapabilities,
};
use crate::{CLIENT_NAME, CLIENT_VERSION, LATEST_PROTOCOL_VERSION};

/// Upper bound on pages fetched by [`RpcClient::list_all`].
const MAX_PAGES: usize = 100;

/// A JSON-RPC session bound to one transport.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    session: Mutex<Option<InitializeResult>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("transport", &self.transport.kind())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Creates a session over `transport`. Nothing is sent until the first request.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Starts the transport if needed and runs the `initialize` handshake once.
    ///
    /// # Errors
    ///
    /// Returns the transport or RPC error that stopped the handshake.
    #[instrument(name = "paymcp.rpc.initialize", skip_all, err)]
    pub async fn ensure_initialized(&self) -> Result<InitializeResult, McpError> {
        let mut session = self.session.lock().await;
        if let Some(result) = session.as_ref() {
            return Ok(result.clone());
        }
        if !self.transport.is_started() {
            self.transport.start().await?;
        }
        let params = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
        });
        let value = self.send("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::parse(format!("invalid initialize result: {e}")))?;
        self.transport.set_protocol_version(&result.protocol_version);
        self.transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;
        debug!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "session initialized"
        );
        *session = Some(result.clone());
        Ok(result)
    }

    /// Forgets the handshake so the next request initializes again.
    pub async fn invalidate(&self) {
        self.session.lock().await.take();
    }

    /// Capabilities announced by the server, if the session is initialized.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    /// Sends `method` and returns the raw `result` value.
    ///
    /// # Errors
    ///
    /// Returns an RPC error for a JSON-RPC error object and transport errors otherwise.
    pub async fn raw(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_initialized().await?;
        self.send(method, params).await
    }

    /// Sends `method` and deserializes the `result`.
    ///
    /// # Errors
    ///
    /// As [`raw`](Self::raw), plus a parse error if the result has the wrong shape.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        let value = self.raw(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::parse(format!("invalid {method} result: {e}")))
    }

    /// Fetches every page of a list method and returns the raw entries under `key`.
    ///
    /// # Errors
    ///
    /// Returns a parse error if a page does not carry an array under `key`.
    pub async fn list_all(&self, method: &str, key: &str) -> Result<Vec<Value>, McpError> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let mut page = self.raw(method, params).await?;
            match page.get_mut(key).map(Value::take) {
                Some(Value::Array(items)) => entries.extend(items),
                _ => return Err(McpError::parse(format!("{method} result has no {key} array"))),
            }
            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_owned);
            if cursor.is_none() {
                return Ok(entries);
            }
        }
        debug!(method, "stopped paginating after {MAX_PAGES} pages");
        Ok(entries)
    }

    /// Sends a `ping`.
    ///
    /// # Errors
    ///
    /// Returns whatever error the round trip produced.
    pub async fn ping(&self) -> Result<(), McpError> {
        self.raw("ping", None).await.map(drop)
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .transport
            .request(JsonRpcRequest::new(id, method, params))
            .await?;
        if let Some(error) = response.error {
            return Err(McpError::rpc(error.code, error.message, error.data));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}
