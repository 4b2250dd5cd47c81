//! HTTP-specific constants.

/// Header carrying a signed x402 v1 payment (client → server).
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";

/// Header carrying the settlement receipt (server → client).
pub const X_PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Header carrying the DID request signature.
///
/// Kept apart from `Authorization` so OAuth bearer tokens and DID signatures
/// can be sent together.
pub const DID_AUTHORIZATION_HEADER: &str = "DID-Authorization";

/// Auth scheme prefix of a [`DID_AUTHORIZATION_HEADER`] value.
pub const DID_AUTH_SCHEME: &str = "DID";

/// Operation tag signed when none is configured.
pub const DEFAULT_SIGNING_OPERATION: &str = "mcp";

/// HTTP 402 Payment Required status code.
pub const HTTP_STATUS_PAYMENT_REQUIRED: u16 = 402;
