//! The single structured error shape surfaced by the MCP client.
//!
//! Every failure, whatever its origin (HTTP status, JSON-RPC error object,
//! parse failure, payment policy), is normalized into [`McpError`]. Its
//! [`ErrorKind`] is assigned where the failure happens, so recovery layers
//! classify errors by variant and never by message text.

use std::fmt;

use paymcp::PaymentError;
use serde_json::Value;

/// Classification of an [`McpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The transport could not be constructed or the server is unreachable.
    Transport,
    /// The server rejected the request's credentials (HTTP 401).
    Unauthorized,
    /// The server answered with a JSON-RPC error object.
    Rpc,
    /// A response did not have the expected shape.
    Parse,
    /// Payment negotiation failed.
    Payment,
    /// The OAuth round trip failed or was rejected.
    Authorization,
    /// `start` was called on a transport that is already started.
    AlreadyStarted,
    /// A request was sent on a transport that was never started.
    NotStarted,
    /// The transport was closed while the request was in flight.
    Closed,
    /// An operation exceeded its deadline.
    Timeout,
}

impl ErrorKind {
    /// Returns a stable machine-readable name for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Unauthorized => "unauthorized",
            Self::Rpc => "rpc",
            Self::Parse => "parse",
            Self::Payment => "payment",
            Self::Authorization => "authorization",
            Self::AlreadyStarted => "already_started",
            Self::NotStarted => "not_started",
            Self::Closed => "closed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized MCP client error: message, optional code, optional detail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct McpError {
    /// What went wrong, structurally.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Machine code: the HTTP status or JSON-RPC error code, when there is one.
    pub code: Option<i64>,
    /// Diagnostic detail (JSON-RPC `data`, response body, ...).
    pub detail: Option<Value>,
}

impl McpError {
    /// Creates an error of `kind` with `message`.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            detail: None,
        }
    }

    /// Attaches a machine code.
    #[must_use]
    pub const fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches diagnostic detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Prefixes the message with the operation that failed.
    #[must_use]
    pub fn context(mut self, context: &str) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    /// A transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// An HTTP 401 from the server.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message).with_code(401)
    }

    /// A JSON-RPC error object.
    #[must_use]
    pub fn rpc(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: ErrorKind::Rpc,
            message: message.into(),
            code: Some(code),
            detail: data,
        }
    }

    /// A malformed response.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    /// A failed or rejected OAuth round trip.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    /// A closed transport.
    #[must_use]
    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "transport closed")
    }

    /// Returns `true` if this error should trigger authorization recovery.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }

    /// Returns the payment error code carried in `detail`, if this is a payment error.
    #[must_use]
    pub fn payment_code(&self) -> Option<&str> {
        if self.kind != ErrorKind::Payment {
            return None;
        }
        self.detail.as_ref()?.get("code")?.as_str()
    }
}

impl From<PaymentError> for McpError {
    fn from(err: PaymentError) -> Self {
        let code = err.code();
        Self::new(ErrorKind::Payment, err.to_string())
            .with_detail(serde_json::json!({ "code": code }))
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() {
            ErrorKind::Parse
        } else {
            ErrorKind::Transport
        };
        let mut mapped = Self::new(kind, err.to_string());
        if let Some(status) = err.status() {
            mapped.code = Some(i64::from(status.as_u16()));
        }
        mapped
    }
}

impl From<paymcp_http::HttpError> for McpError {
    fn from(err: paymcp_http::HttpError) -> Self {
        match err {
            paymcp_http::HttpError::Payment(payment) => payment.into(),
            other => Self::transport(other.to_string()),
        }
    }
}
