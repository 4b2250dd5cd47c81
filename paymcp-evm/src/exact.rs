//! Client-side payment signing for the EIP-155 `exact` scheme.
//!
//! [`Eip155ExactSigner`] implements [`PaymentSigner`] by signing an ERC-3009
//! `transferWithAuthorization` as EIP-712 typed data. The resulting payload is
//! what a facilitator needs to submit the transfer on chain.

use alloy_primitives::{Address, B256, Bytes, FixedBytes, Signature};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};
use paymcp::BoxFuture;
use paymcp::amount::TokenAmount;
use paymcp::proto::{PaymentPayload, PaymentRequirements, V1};
use paymcp::signer::{PaymentSigner, SignerError};
use paymcp::timestamp::UnixTimestamp;
use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::networks::{ChainId, DEFAULT_USDC_NAME, DEFAULT_USDC_VERSION, chain_id_for};

/// How far in the past `validAfter` is placed so the authorization is valid immediately.
const VALID_AFTER_SKEW_SECS: u64 = 10 * 60;

sol!(
    /// ERC-3009 `transferWithAuthorization` typed data.
    ///
    /// Field order is part of the EIP-712 type hash and must not change.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

/// A trait that abstracts signing operations, allowing both owned signers and Arc-wrapped signers.
///
/// Alloy's `Signer` trait is not implemented for `Arc<T>`, and
/// `PrivateKeySigner` is commonly shared between the payment signer and the
/// DID identity.
pub trait SignerLike: Send + Sync {
    /// Returns the address of the signer.
    fn address(&self) -> Address;

    /// Signs a 32-byte prehash.
    fn sign_hash(
        &self,
        hash: &B256,
    ) -> impl Future<Output = Result<Signature, alloy_signer::Error>> + Send;

    /// Signs `message` with the EIP-191 personal-message prefix.
    fn sign_message(
        &self,
        message: &[u8],
    ) -> impl Future<Output = Result<Signature, alloy_signer::Error>> + Send;
}

impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        Self::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_message(self, message).await
    }
}

impl<T: SignerLike> SignerLike for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_hash(hash).await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_message(message).await
    }
}

/// The authorization fields covered by the EIP-712 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009Authorization {
    /// The token owner authorizing the transfer.
    pub from: Address,
    /// The recipient.
    pub to: Address,
    /// Amount in base units.
    pub value: TokenAmount,
    /// Not valid before this timestamp (inclusive).
    pub valid_after: UnixTimestamp,
    /// Expires at this timestamp (exclusive).
    pub valid_before: UnixTimestamp,
    /// A unique 32-byte nonce.
    pub nonce: B256,
}

impl Eip3009Authorization {
    /// Returns the typed-data struct that is hashed and signed.
    #[must_use]
    pub fn typed_data(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value.inner(),
            validAfter: alloy_primitives::U256::from(self.valid_after.as_secs()),
            validBefore: alloy_primitives::U256::from(self.valid_before.as_secs()),
            nonce: self.nonce,
        }
    }
}

/// The scheme-specific `payload` of an EVM exact payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactEvmPayload {
    /// The 65-byte EIP-712 signature.
    pub signature: Bytes,
    /// The signed authorization.
    pub authorization: Eip3009Authorization,
}

/// Builds the EIP-712 domain of the token named by `requirements`.
///
/// The domain `name`/`version` come from `extra`, defaulting to USDC's.
///
/// # Errors
///
/// Returns [`SignerError`] for unknown networks or malformed asset addresses.
pub fn token_domain(requirements: &PaymentRequirements) -> Result<Eip712Domain, SignerError> {
    let chain_id: ChainId = chain_id_for(&requirements.network)
        .ok_or_else(|| SignerError::UnsupportedNetwork(requirements.network.clone()))?;
    let asset = parse_address("asset", &requirements.asset)?;
    let name = requirements
        .extra_str("name")
        .unwrap_or(DEFAULT_USDC_NAME)
        .to_owned();
    let version = requirements
        .extra_str("version")
        .unwrap_or(DEFAULT_USDC_VERSION)
        .to_owned();
    Ok(eip712_domain! {
        name: name,
        version: version,
        chain_id: chain_id,
        verifying_contract: asset,
    })
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, SignerError> {
    value.parse().map_err(|e| SignerError::InvalidField {
        field,
        reason: format!("{e}"),
    })
}

/// Signs x402 `exact` payments on EVM networks with ERC-3009.
#[derive(Debug, Clone)]
pub struct Eip155ExactSigner<S> {
    signer: S,
}

impl<S> Eip155ExactSigner<S> {
    /// Wraps `signer`.
    pub const fn new(signer: S) -> Self {
        Self { signer }
    }
}

impl<S: SignerLike> Eip155ExactSigner<S> {
    /// Signs an ERC-3009 authorization for `requirements`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] if a field cannot be parsed or the key fails to sign.
    pub async fn sign_authorization(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<ExactEvmPayload, SignerError> {
        let domain = token_domain(requirements)?;
        let value: TokenAmount = requirements
            .max_amount_required
            .parse()
            .map_err(|e| SignerError::InvalidField {
                field: "maxAmountRequired",
                reason: format!("{e}"),
            })?;

        let now = UnixTimestamp::now();
        let valid_after = now - VALID_AFTER_SKEW_SECS;
        let valid_before = now + requirements.max_timeout_seconds;
        let nonce: [u8; 32] = rng().random();

        let authorization = Eip3009Authorization {
            from: self.signer.address(),
            to: parse_address("payTo", &requirements.pay_to)?,
            value,
            valid_after,
            valid_before,
            nonce: FixedBytes(nonce),
        };

        tracing::debug!(
            network = %requirements.network,
            valid_for = ?now.until(valid_before),
            "signing ERC-3009 authorization"
        );
        let hash = authorization.typed_data().eip712_signing_hash(&domain);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| SignerError::Signature(format!("{e:?}")))?;

        Ok(ExactEvmPayload {
            signature: signature.as_bytes().into(),
            authorization,
        })
    }
}

impl<S: SignerLike> PaymentSigner for Eip155ExactSigner<S> {
    fn payer(&self) -> String {
        self.signer.address().to_string()
    }

    fn sign_payment<'a>(
        &'a self,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<PaymentPayload, SignerError>> {
        Box::pin(async move {
            let evm_payload = self.sign_authorization(requirements).await?;
            let payload = serde_json::to_value(&evm_payload)
                .map_err(|e| SignerError::Signature(e.to_string()))?;
            Ok(PaymentPayload {
                x402_version: V1,
                scheme: requirements.scheme.clone(),
                network: requirements.network.clone(),
                payload,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ANVIL_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ANVIL_ADDRESS: Address =
        alloy_primitives::address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    fn requirement(network: &str) -> PaymentRequirements {
        serde_json::from_value(json!({
            "scheme": "exact",
            "network": network,
            "maxAmountRequired": "1000",
            "resource": "mcp://tool/search",
            "mimeType": "application/json",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
            "maxTimeoutSeconds": 60,
            "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            "extra": { "name": "USDC", "version": "2" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_signature_recovers_to_payer() {
        let key: PrivateKeySigner = ANVIL_KEY.parse().unwrap();
        let signer = Eip155ExactSigner::new(key);
        assert_eq!(signer.payer(), ANVIL_ADDRESS.to_string());

        let req = requirement("base-sepolia");
        let payload = signer.sign_authorization(&req).await.unwrap();
        let auth = payload.authorization;
        assert_eq!(auth.from, ANVIL_ADDRESS);
        assert_eq!(auth.value, TokenAmount::from(1000));
        assert_eq!(auth.valid_before.as_secs() - auth.valid_after.as_secs(), 660);

        let hash = auth.typed_data().eip712_signing_hash(&token_domain(&req).unwrap());
        let signature = Signature::from_raw(&payload.signature).unwrap();
        assert_eq!(signature.recover_address_from_prehash(&hash).unwrap(), ANVIL_ADDRESS);
    }

    #[tokio::test]
    async fn test_payment_payload_wire_shape() {
        let key: PrivateKeySigner = ANVIL_KEY.parse().unwrap();
        let signer = Eip155ExactSigner::new(Arc::new(key));
        let payload = signer.sign_payment(&requirement("base-sepolia")).await.unwrap();
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["x402Version"], 1);
        assert_eq!(wire["scheme"], "exact");
        assert_eq!(wire["payload"]["authorization"]["value"], "1000");
        assert!(wire["payload"]["authorization"]["validAfter"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_network_is_rejected() {
        let key: PrivateKeySigner = ANVIL_KEY.parse().unwrap();
        let signer = Eip155ExactSigner::new(key);
        let err = signer.sign_authorization(&requirement("solana")).await.unwrap_err();
        assert!(matches!(err, SignerError::UnsupportedNetwork(_)));
    }
}
