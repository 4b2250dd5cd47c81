//! Error types for x402 payment negotiation.

use crate::amount::{ParseAmountError, TokenAmount};

/// Errors that can occur while negotiating a payment.
///
/// Every variant is fatal for the call that produced it: a negotiation is
/// never retried after one of these is returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PaymentError {
    /// The selected requirement violates the configured payment policy.
    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    /// The requirement's amount is not a base-unit integer.
    #[error(transparent)]
    InvalidAmount(#[from] ParseAmountError),

    /// The payment signer failed to produce an authorization.
    #[error("Failed to sign payment: {0}")]
    Signing(String),

    /// The server demanded payment again after an authorized retry.
    #[error("Payment required again after paying: {0}")]
    RepeatedPaymentRequired(String),

    /// The authorization could not be encoded for the wire.
    #[error("Failed to encode payment: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PaymentError {
    /// Returns a stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Policy(violation) => violation.code(),
            Self::InvalidAmount(_) => "invalid_amount",
            Self::Signing(_) => "signing_failed",
            Self::RepeatedPaymentRequired(_) => "payment_required_after_retry",
            Self::Encoding(_) => "encoding_failed",
        }
    }
}

/// A requirement that the payment policy refuses to pay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyViolation {
    /// The requested amount is above the configured maximum.
    #[error("Payment amount {required} exceeds the configured maximum {maximum}")]
    AmountExceedsMaximum {
        /// Amount the server asked for, in base units.
        required: TokenAmount,
        /// Configured maximum, in base units.
        maximum: TokenAmount,
    },

    /// The requirement targets a different settlement network.
    #[error("Payment network {requested} does not match configured network {configured}")]
    NetworkMismatch {
        /// Network named by the requirement.
        requested: String,
        /// Network the client is configured for.
        configured: String,
    },

    /// The requirement uses a scheme other than `exact`.
    #[error("Unsupported payment scheme {0}")]
    UnsupportedScheme(String),
}

impl PolicyViolation {
    /// Returns a stable machine-readable code for this violation.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AmountExceedsMaximum { .. } => "amount_exceeds_maximum",
            Self::NetworkMismatch { .. } => "network_mismatch",
            Self::UnsupportedScheme(_) => "unsupported_scheme",
        }
    }
}
