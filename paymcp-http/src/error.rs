//! Error types for the HTTP layer.

use paymcp::PaymentError;
use paymcp::signer::SignerError;

/// Errors that can occur while encoding headers, signing requests or paying.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Base64 decoding failed.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A computed value is not a legal header value.
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    /// Payment negotiation failed.
    #[error(transparent)]
    Payment(#[from] PaymentError),

    /// The identity failed to sign a request.
    #[error("request signing failed: {0}")]
    Signing(#[from] SignerError),

    /// A `DID-Authorization` value lacks the `DID` scheme prefix.
    #[error("malformed DID-Authorization header")]
    MalformedDidHeader,

    /// The request body is a stream and cannot be replayed with a payment.
    #[error("request cannot be cloned for a paid retry")]
    RequestNotCloneable,
}
