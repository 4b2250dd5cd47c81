//! Payment authorization signing.
//!
//! A [`PaymentSigner`] turns one selected [`PaymentRequirements`] into a signed
//! [`PaymentPayload`]. Chain-specific implementations live in sibling crates
//! (`paymcp-evm` signs ERC-3009 transfers); tests use in-memory fakes.

use crate::BoxFuture;
use crate::proto::{PaymentPayload, PaymentRequirements};

/// Error produced by a [`PaymentSigner`] or an [`Identity`](crate::identity::Identity).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignerError {
    /// The requirement names a network the signer cannot sign for.
    #[error("Unsupported network {0}")]
    UnsupportedNetwork(String),
    /// A requirement field could not be interpreted (address, amount, ...).
    #[error("Invalid requirement field {field}: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The underlying key refused or failed to sign.
    #[error("Signing failed: {0}")]
    Signature(String),
}

/// Signs payment authorizations for selected requirements.
///
/// Implementations must be cheap to share behind an [`Arc`](std::sync::Arc):
/// a single signer serves every connection of a client.
pub trait PaymentSigner: Send + Sync {
    /// Returns the payer address the signer authorizes transfers from.
    fn payer(&self) -> String;

    /// Produces a signed authorization for `requirements`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] if the requirement cannot be signed.
    fn sign_payment<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<PaymentPayload, SignerError>>;
}

impl<T: PaymentSigner + ?Sized> PaymentSigner for std::sync::Arc<T> {
    fn payer(&self) -> String {
        (**self).payer()
    }

    fn sign_payment<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<PaymentPayload, SignerError>> {
        (**self).sign_payment(requirements)
    }
}
