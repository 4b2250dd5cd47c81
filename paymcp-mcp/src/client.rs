//! The capability facade for one MCP server connection.
//!
//! [`McpClient`] discovers and invokes tools, prompts and resources. Every
//! capability call is wrapped in [`with_auth_retry`], so a 401 triggers at
//! most one authorization round trip followed by one replay.

use std::sync::{Arc, Mutex, PoisonError};

use paymcp::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{instrument, warn};

use crate::auth::{AuthGate, OAuthProvider, with_auth_retry};
use crate::error::McpError;
use crate::rpc::RpcClient;
use crate::transport::{Transport, TransportKind};
use crate::types::{
    CallToolParams, CallToolResult, GetPromptResult, PromptDefinition, ReadResourceResult,
    ResourceDefinition, ResourceTemplateDefinition, ServerCapabilities, ToolDefinition,
};

/// Anything that can invoke an MCP tool.
///
/// [`McpClient`] implements it; payment handling composes on top through
/// [`PaidToolCaller`](crate::PaidToolCaller).
pub trait ToolCaller: Send + Sync {
    /// Calls a tool.
    fn call_tool(&self, params: CallToolParams) -> BoxFuture<'_, Result<CallToolResult, McpError>>;
}

impl<T: ToolCaller + ?Sized> ToolCaller for Arc<T> {
    fn call_tool(&self, params: CallToolParams) -> BoxFuture<'_, Result<CallToolResult, McpError>> {
        (**self).call_tool(params)
    }
}

#[derive(Debug, Default)]
struct CapabilityCache {
    tools: Option<Vec<ToolDefinition>>,
    prompts: Option<Vec<PromptDefinition>>,
    resources: Option<Vec<ResourceDefinition>>,
    resource_templates: Option<Vec<ResourceTemplateDefinition>>,
}

/// A lazily connected client for one MCP server.
pub struct McpClient {
    url: String,
    rpc: RpcClient,
    oauth: Option<Arc<OAuthProvider>>,
    gate: AuthGate,
    cache: Mutex<CapabilityCache>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("url", &self.url)
            .field("transport", &self.rpc.transport().kind())
            .field("oauth", &self.oauth.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`McpClient`].
#[derive(Debug)]
pub struct McpClientBuilder {
    transport: Arc<dyn Transport>,
    url: Option<String>,
    oauth: Option<Arc<OAuthProvider>>,
}

impl McpClientBuilder {
    /// The server URL, used in logs and as the connection key.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The OAuth provider the transport authorizes with.
    #[must_use]
    pub fn oauth(mut self, provider: Arc<OAuthProvider>) -> Self {
        self.oauth = Some(provider);
        self
    }

    /// Builds the client. Nothing is sent until the first call.
    #[must_use]
    pub fn build(self) -> McpClient {
        McpClient {
            url: self.url.unwrap_or_default(),
            rpc: RpcClient::new(self.transport),
            oauth: self.oauth,
            gate: AuthGate::default(),
            cache: Mutex::new(CapabilityCache::default()),
        }
    }
}

/// Deserializes list entries one by one, skipping the malformed ones.
fn parse_entries<T: DeserializeOwned>(list: &str, entries: Vec<Value>) -> Vec<T> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!(list, index, %error, "skipping malformed entry");
                None
            }
        })
        .collect()
}

impl McpClient {
    /// Starts building a client over `transport`.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> McpClientBuilder {
        McpClientBuilder {
            transport,
            url: None,
            oauth: None,
        }
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Which transport the connection uses.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.rpc.transport().kind()
    }

    /// The OAuth provider, if one is configured.
    #[must_use]
    pub const fn oauth(&self) -> Option<&Arc<OAuthProvider>> {
        self.oauth.as_ref()
    }

    /// Capabilities announced by the server, once connected.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.rpc.server_capabilities().await
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut CapabilityCache) -> R) -> R {
        f(&mut self.cache.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        method: &'static str,
        key: &'static str,
    ) -> Result<Vec<T>, McpError> {
        let entries = with_auth_retry(&self.rpc, &self.gate, method, || {
            self.rpc.list_all(method, key)
        })
        .await?;
        Ok(parse_entries(method, entries))
    }

    /// Lists the server's tools.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the listing.
    #[instrument(name = "paymcp.tools", skip(self), fields(url = %self.url), err)]
    pub async fn tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let tools: Vec<ToolDefinition> = self.list("tools/list", "tools").await?;
        self.with_cache(|c| c.tools = Some(tools.clone()));
        Ok(tools)
    }

    /// Calls a tool.
    ///
    /// A tool-level failure comes back as a result with `is_error` set, not
    /// as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the call.
    #[instrument(name = "paymcp.call_tool", skip_all, fields(url = %self.url, tool = %params.name), err)]
    pub async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, McpError> {
        let value = serde_json::to_value(&params)?;
        with_auth_retry(&self.rpc, &self.gate, "tools/call", || {
            self.rpc.request("tools/call", Some(value.clone()))
        })
        .await
    }

    /// Lists the server's prompts.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the listing.
    #[instrument(name = "paymcp.prompts", skip(self), fields(url = %self.url), err)]
    pub async fn prompts(&self) -> Result<Vec<PromptDefinition>, McpError> {
        let prompts: Vec<PromptDefinition> = self.list("prompts/list", "prompts").await?;
        self.with_cache(|c| c.prompts = Some(prompts.clone()));
        Ok(prompts)
    }

    /// Finds a prompt definition by name, fetching the list if not cached.
    ///
    /// # Errors
    ///
    /// Returns the listing error when the list has to be fetched.
    pub async fn prompt(&self, name: &str) -> Result<Option<PromptDefinition>, McpError> {
        let prompts = match self.with_cache(|c| c.prompts.clone()) {
            Some(prompts) => prompts,
            None => self.prompts().await?,
        };
        Ok(prompts.into_iter().find(|p| p.name == name))
    }

    /// Renders a prompt.
    ///
    /// # Errors
    ///
    /// Returns the normalized error; a malformed result fails the call.
    #[instrument(name = "paymcp.get_prompt", skip(self, arguments), fields(url = %self.url), err)]
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, McpError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = Value::Object(arguments);
        }
        with_auth_retry(&self.rpc, &self.gate, "prompts/get", || {
            self.rpc.request("prompts/get", Some(params.clone()))
        })
        .await
    }

    /// Lists concrete resources.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the listing.
    #[instrument(name = "paymcp.resources", skip(self), fields(url = %self.url), err)]
    pub async fn resources(&self) -> Result<Vec<ResourceDefinition>, McpError> {
        let resources: Vec<ResourceDefinition> = self.list("resources/list", "resources").await?;
        self.with_cache(|c| c.resources = Some(resources.clone()));
        Ok(resources)
    }

    /// Lists resource templates.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the listing.
    #[instrument(name = "paymcp.resource_templates", skip(self), fields(url = %self.url), err)]
    pub async fn resource_templates(&self) -> Result<Vec<ResourceTemplateDefinition>, McpError> {
        let templates: Vec<ResourceTemplateDefinition> = self
            .list("resources/templates/list", "resourceTemplates")
            .await?;
        self.with_cache(|c| c.resource_templates = Some(templates.clone()));
        Ok(templates)
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns the normalized error of the read.
    #[instrument(name = "paymcp.read_resource", skip(self), fields(url = %self.url), err)]
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let params = json!({ "uri": uri });
        with_auth_retry(&self.rpc, &self.gate, "resources/read", || {
            self.rpc.request("resources/read", Some(params.clone()))
        })
        .await
    }

    /// Expands `uri_template` with `arguments` and reads the result.
    ///
    /// # Errors
    ///
    /// Returns a parse error if a variable is missing or the template is
    /// malformed, otherwise as [`read_resource`](Self::read_resource).
    pub async fn read_resource_template(
        &self,
        uri_template: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = expand_uri_template(uri_template, arguments)?;
        self.read_resource(&uri).await
    }

    /// Cached tool list from the last successful [`tools`](Self::tools).
    #[must_use]
    pub fn cached_tools(&self) -> Option<Vec<ToolDefinition>> {
        self.with_cache(|c| c.tools.clone())
    }

    /// Cached resource list from the last successful [`resources`](Self::resources).
    #[must_use]
    pub fn cached_resources(&self) -> Option<Vec<ResourceDefinition>> {
        self.with_cache(|c| c.resources.clone())
    }

    /// Cached template list from the last successful
    /// [`resource_templates`](Self::resource_templates).
    #[must_use]
    pub fn cached_resource_templates(&self) -> Option<Vec<ResourceTemplateDefinition>> {
        self.with_cache(|c| c.resource_templates.clone())
    }

    /// Pings the server without authorization recovery.
    ///
    /// # Errors
    ///
    /// Returns the error of the ping; the connection should be discarded.
    pub async fn check_alive(&self) -> Result<(), McpError> {
        self.rpc.ping().await.map_err(|e| e.context("ping"))
    }

    /// Closes the transport and clears its started state so the client can
    /// reconnect on the next call.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error; the state is cleared regardless.
    pub async fn close(&self) -> Result<(), McpError> {
        let transport = self.rpc.transport();
        let closed = transport.close().await;
        transport.reset();
        self.rpc.invalidate().await;
        self.with_cache(|c| *c = CapabilityCache::default());
        closed
    }
}

impl ToolCaller for McpClient {
    fn call_tool(&self, params: CallToolParams) -> BoxFuture<'_, Result<CallToolResult, McpError>> {
        Box::pin(Self::call_tool(self, params))
    }
}

/// Expands an RFC 6570 template: level-1 `{var}` plus reserved `{+var}`.
///
/// # Errors
///
/// Returns a parse error for a missing variable, a non-scalar value or an
/// unclosed expression.
pub fn expand_uri_template(
    template: &str,
    arguments: &Map<String, Value>,
) -> Result<String, McpError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| McpError::parse(format!("unclosed expression in {template:?}")))?;
        let expression = &after[..close];
        let (reserved, names) = match expression.strip_prefix('+') {
            Some(names) => (true, names),
            None => (false, expression),
        };
        let mut values = Vec::new();
        for name in names.split(',').map(str::trim) {
            let value = match arguments.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
                Some(_) => {
                    return Err(McpError::parse(format!(
                        "template variable {name:?} must be a string, number or boolean"
                    )));
                }
                None => {
                    return Err(McpError::parse(format!("missing template variable {name:?}")));
                }
            };
            values.push(percent_encode(&value, reserved));
        }
        out.push_str(&values.join(","));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn percent_encode(value: &str, reserved: bool) -> String {
    const RESERVED: &[u8] = b":/?#[]@!$&'()*+,;=";
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    for (i, &b) in bytes.iter().enumerate() {
        let unreserved = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~');
        let keep_escape = reserved
            && b == b'%'
            && bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
        if unreserved || keep_escape || (reserved && RESERVED.contains(&b)) {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::ChannelTransport;
    use crate::types::JsonRpcError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn not_found(method: &str) -> JsonRpcError {
        JsonRpcError {
            code: -32601,
            message: format!("unknown method {method}"),
            data: None,
        }
    }

    fn serve(initializations: Arc<AtomicUsize>) -> McpClient {
        let (transport, peer) = ChannelTransport::pair();
        tokio::spawn(peer.serve(move |method, params| {
            let initializations = Arc::clone(&initializations);
            async move {
                let params = params.unwrap_or(Value::Null);
                match method.as_str() {
                    "initialize" => {
                        initializations.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({
                            "protocolVersion": "2025-06-18",
                            "capabilities": { "tools": {}, "prompts": {}, "resources": {} },
                            "serverInfo": { "name": "demo", "version": "0.1.0" }
                        }))
                    }
                    "ping" => Ok(json!({})),
                    "tools/list" => Ok(json!({
                        "tools": [
                            { "name": "search", "inputSchema": { "type": "object" } },
                            { "description": "missing a name" },
                            { "name": "weather" }
                        ]
                    })),
                    "tools/call" => Ok(json!({
                        "content": [{
                            "type": "text",
                            "text": format!("called {}", params["name"])
                        }]
                    })),
                    "prompts/list" => Ok(json!({
                        "prompts": [{
                            "name": "summarize",
                            "arguments": [{ "name": "text", "required": true }]
                        }]
                    })),
                    "prompts/get" if params["name"] == "broken" => {
                        Ok(json!({ "messages": "nope" }))
                    }
                    "prompts/get" => Ok(json!({
                        "messages": [{
                            "role": "user",
                            "content": { "type": "text", "text": "hi" }
                        }]
                    })),
                    "resources/templates/list" => Ok(json!({
                        "resourceTemplates": [{ "uriTemplate": "file:///{path}", "name": "files" }]
                    })),
                    "resources/read" => Ok(json!({
                        "contents": [{ "uri": params["uri"], "text": "body" }]
                    })),
                    _ => Err(not_found(&method)),
                }
            }
        }));
        McpClient::builder(Arc::new(transport)).url("memory://demo").build()
    }

    #[tokio::test]
    async fn test_tool_listing_skips_malformed_entries() {
        let client = serve(Arc::default());
        let tools = client.tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["search", "weather"]);
        assert_eq!(client.cached_tools().unwrap().len(), 2);
        assert!(client.server_capabilities().await.unwrap().tools.is_some());
    }

    #[tokio::test]
    async fn test_call_tool_and_prompts() {
        let client = serve(Arc::default());
        let result = client.call_tool(CallToolParams::new("search")).await.unwrap();
        assert_eq!(result.text(), "called \"search\"");

        let prompt = client.prompt("summarize").await.unwrap().unwrap();
        assert!(prompt.arguments[0].required);
        assert!(client.prompt("absent").await.unwrap().is_none());

        let rendered = client
            .get_prompt("summarize", Some(args(json!({ "text": "x" }))))
            .await
            .unwrap();
        assert_eq!(rendered.messages[0].content.as_text(), Some("hi"));

        let err = client.get_prompt("broken", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_read_resource_template() {
        let client = serve(Arc::default());
        let templates = client.resource_templates().await.unwrap();
        let result = client
            .read_resource_template(&templates[0].uri_template, &args(json!({ "path": "a b.txt" })))
            .await
            .unwrap();
        assert_eq!(result.contents[0].uri, "file:///a%20b.txt");

        let err = client
            .read_resource_template("file:///{path}", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_close_allows_reconnect() {
        let initializations = Arc::new(AtomicUsize::new(0));
        let client = serve(Arc::clone(&initializations));
        client.check_alive().await.unwrap();
        client.close().await.unwrap();
        assert!(client.cached_tools().is_none());

        client.tools().await.unwrap();
        assert_eq!(initializations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rpc_errors_carry_context() {
        let client = serve(Arc::default());
        let err = client.resources().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rpc);
        assert_eq!(err.code, Some(-32601));
        assert!(err.message.starts_with("resources/list: "));
    }

    #[test]
    fn test_uri_template_expansion() {
        let vars = args(json!({ "id": 42, "path": "docs/a b", "q": "x&y" }));
        assert_eq!(expand_uri_template("item://{id}", &vars).unwrap(), "item://42");
        assert_eq!(expand_uri_template("file:///{path}", &vars).unwrap(), "file:///docs%2Fa%20b");
        assert_eq!(expand_uri_template("file:///{+path}", &vars).unwrap(), "file:///docs/a%20b");
        assert_eq!(expand_uri_template("s?q={q}", &vars).unwrap(), "s?q=x%26y");
        assert!(expand_uri_template("item://{id", &vars).is_err());
        assert!(expand_uri_template("item://{missing}", &vars).is_err());
    }
}
