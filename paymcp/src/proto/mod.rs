//! Protocol types for x402 payment messages.
//!
//! This module defines the wire format of the x402 version 1 messages a client
//! sees: the payment challenge a server returns, the signed authorization the
//! client sends back and the settlement receipt attached to the paid response.
//!
//! # Key Types
//!
//! - [`PaymentRequired`] - Challenge envelope (`{x402Version, error, accepts}`)
//! - [`PaymentRequirements`] - One acceptable way to pay
//! - [`PaymentPayload`] - Signed payment authorization
//! - [`SettleResponse`] - Settlement receipt
//!
//! # Wire Format
//!
//! All types serialize to JSON using camelCase field names. Amounts are
//! decimal strings in the asset's base units.

use serde::{Deserialize, Serialize};

mod encoding;
mod version;

pub use encoding::*;
pub use version::X402Version1;

/// Convenience constant for constructing V1 protocol messages.
pub const V1: X402Version1 = X402Version1;

/// A unit struct representing the string literal `"exact"`.
///
/// `exact` is the only scheme this client pays with: the server names a fixed
/// amount and the client authorizes a transfer of precisely that amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExactScheme;

impl ExactScheme {
    /// The string literal value: `"exact"`.
    pub const VALUE: &'static str = "exact";
}

impl std::fmt::Display for ExactScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(Self::VALUE)
    }
}

impl AsRef<str> for ExactScheme {
    fn as_ref(&self) -> &str {
        Self::VALUE
    }
}

/// Payment requirements set by the seller.
///
/// Defines the terms under which a payment will be accepted, including the
/// amount, recipient, asset and timing constraints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// The payment scheme (e.g., "exact").
    pub scheme: String,
    /// The network name (e.g., "base-sepolia").
    pub network: String,
    /// The maximum amount required, as a decimal integer string in base units.
    pub max_amount_required: String,
    /// The resource being paid for.
    pub resource: String,
    /// Human-readable description of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource.
    #[serde(default)]
    pub mime_type: String,
    /// Optional JSON schema for the resource output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// The recipient address for payment.
    pub pay_to: String,
    /// Maximum time in seconds for payment validity.
    pub max_timeout_seconds: u64,
    /// The token asset address.
    pub asset: String,
    /// Scheme-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl PaymentRequirements {
    /// Returns `true` if the requirement uses the `exact` scheme.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.scheme == ExactScheme::VALUE
    }

    /// Returns the asset decimal count from `extra.assetDecimals`, if present.
    #[must_use]
    pub fn asset_decimals(&self) -> Option<u8> {
        let value = self.extra.as_ref()?.get("assetDecimals")?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|d| u8::try_from(d).ok())
    }

    /// Returns the correlation id embedded in `extra.ctxId`, if present.
    #[must_use]
    pub fn ctx_id(&self) -> Option<&str> {
        self.extra.as_ref()?.get("ctxId")?.as_str()
    }

    /// Returns a string field of `extra` (e.g. the EIP-712 domain `name`).
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.as_ref()?.get(key)?.as_str()
    }
}

/// Payment challenge returned by a server that requires payment.
///
/// Serialized as `{ "x402Version": 1, "error": "...", "accepts": [...] }`.
/// The bare `version` key is accepted on input for servers that emit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version (always 1).
    #[serde(alias = "version")]
    pub x402_version: X402Version1,
    /// Error message explaining why payment is required.
    #[serde(default)]
    pub error: String,
    /// List of acceptable payment methods.
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentRequired {
    /// Parses a challenge envelope from a JSON value.
    ///
    /// Returns `None` unless the value is exactly the envelope shape with a
    /// non-empty `accepts` list.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let parsed = Self::deserialize(value).ok()?;
        (!parsed.accepts.is_empty()).then_some(parsed)
    }

    /// Parses a challenge envelope from raw JSON bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        Self::from_value(&value)
    }
}

/// A signed payment authorization from the buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The payment scheme (e.g., "exact").
    pub scheme: String,
    /// The network name (e.g., "base-sepolia").
    pub network: String,
    /// The scheme-specific signed payload.
    pub payload: serde_json::Value,
}

/// Settlement receipt returned alongside a paid response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    /// Whether the payment was settled.
    pub success: bool,
    /// Machine-readable failure reason, when settlement failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Settlement transaction hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Network the payment settled on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// The payer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}
