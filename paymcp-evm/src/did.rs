//! EIP-191 DID identity.
//!
//! An [`EvmIdentity`] proves control of a `did:pkh:eip155:<chain>:<address>`
//! identifier by `personal_sign`-ing request challenges.

use alloy_primitives::hex;
use paymcp::BoxFuture;
use paymcp::identity::Identity;
use paymcp::signer::SignerError;

use crate::exact::SignerLike;
use crate::networks::ChainId;

/// A DID identity backed by an EVM key.
#[derive(Debug, Clone)]
pub struct EvmIdentity<S> {
    signer: S,
    chain_id: ChainId,
}

impl<S: SignerLike> EvmIdentity<S> {
    /// Creates an identity for `signer` on `chain_id`.
    pub const fn new(signer: S, chain_id: ChainId) -> Self {
        Self { signer, chain_id }
    }
}

impl<S: SignerLike> Identity for EvmIdentity<S> {
    fn did(&self) -> String {
        format!("did:pkh:eip155:{}:{}", self.chain_id, self.signer.address())
    }

    fn sign_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<String, SignerError>> {
        Box::pin(async move {
            let signature = self
                .signer
                .sign_message(message)
                .await
                .map_err(|e| SignerError::Signature(format!("{e:?}")))?;
            Ok(hex::encode_prefixed(signature.as_bytes()))
        })
    }
}
