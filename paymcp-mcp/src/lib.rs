#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! MCP (Model Context Protocol) client runtime with DID signing, OAuth
//! recovery and x402 payments.
//!
//! # Architecture
//!
//! A call flows through the layers below, outermost first:
//!
//! ```text
//! ConnectionManager ─ get-or-create by URL
//!   PaidToolCaller ─ one-shot x402 retry (tool calls)
//!     McpClient ─ capability facade, every method wrapped in with_auth_retry
//!       RpcClient ─ initialize handshake, ids, pagination
//!         Transport ─ streamable HTTP | SSE | in-process channel
//! ```
//!
//! Authorization recovery sits inside payment negotiation, so an authorized
//! replay that then demands payment gets its own independent retry.
//!
//! # Client Usage
//!
//! ```rust,ignore
//! use paymcp_mcp::{ConnectionManager, HttpConnector, PaidToolCaller, ServerEndpoint};
//!
//! let manager = ConnectionManager::new(HttpConnector::new(resolver));
//! let client = manager.get(&ServerEndpoint::new(url)).await?;
//! let paid = PaidToolCaller::new(client, negotiator);
//! let result = paid.call_tool(CallToolParams::new("search")).await?;
//! ```
//!
//! # Modules
//!
//! - [`transport`] - Wire transports and the transport resolver
//! - [`rpc`] - JSON-RPC session on top of a transport
//! - [`client`] - The capability facade
//! - [`auth`] - OAuth provider, popup broker and recovery state machine
//! - [`payment`] - x402 negotiation for tool calls
//! - [`manager`] - Connection cache
//! - [`extract`] - Payment data in MCP `_meta` and tool results

pub mod auth;
pub mod client;
pub mod error;
pub mod extract;
pub mod manager;
pub mod payment;
pub mod rpc;
pub mod transport;
pub mod types;

pub use client::{McpClient, McpClientBuilder, ToolCaller};
pub use error::{ErrorKind, McpError};
pub use manager::{ConnectionManager, Connector, DEFAULT_LIVENESS_TIMEOUT, HttpConnector};
pub use payment::{PaidToolCallResult, PaidToolCaller};
pub use transport::{ServerEndpoint, Transport, TransportKind, TransportResolver};

/// MCP `_meta` key for sending payment payloads (client → server).
pub const PAYMENT_META_KEY: &str = "x402/payment";

/// MCP `_meta` key for settlement responses (server → client).
pub const PAYMENT_RESPONSE_META_KEY: &str = "x402/payment-response";

/// MCP protocol revision requested during `initialize`.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Name reported in `clientInfo` and OAuth client registration.
pub const CLIENT_NAME: &str = "paymcp";

/// Version reported in `clientInfo`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
