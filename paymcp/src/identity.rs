//! Held identity used for DID request signing.

use crate::BoxFuture;
use crate::signer::SignerError;

/// An account able to prove control of a decentralized identifier.
///
/// Request signers call [`Identity::sign_message`] once per outgoing request,
/// so implementations should not cache signatures.
pub trait Identity: Send + Sync {
    /// Returns the DID this identity signs as (e.g. `did:pkh:eip155:8453:0x...`).
    fn did(&self) -> String;

    /// Signs `message` and returns the signature as a `0x`-prefixed hex string.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Signature`] if the key fails to sign.
    fn sign_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<String, SignerError>>;
}

impl<T: Identity + ?Sized> Identity for std::sync::Arc<T> {
    fn did(&self) -> String {
        (**self).did()
    }

    fn sign_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<String, SignerError>> {
        (**self).sign_message(message)
    }
}
