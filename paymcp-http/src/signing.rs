//! Per-request DID signatures.
//!
//! A [`RequestSigner`] binds an [`Identity`] to one server URL. Each call to
//! [`RequestSigner::sign`] produces a fresh `DID-Authorization` value over the
//! operation tag, the URL, the current time and the request body, so values
//! must never be cached or reused across sends.
//!
//! ```text
//! DID-Authorization: DID <base64(json{did, op, url, ts, sig})>
//! sig = sign("<op>\n<url>\n<ts>\n<payload>")
//! ```

use std::sync::Arc;

use base64::prelude::*;
use http::HeaderValue;
use paymcp::identity::Identity;
use paymcp::timestamp::UnixTimestamp;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SIGNING_OPERATION, DID_AUTH_SCHEME};
use crate::error::HttpError;

/// The signed proof carried in a `DID-Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidProof {
    /// The signer's decentralized identifier.
    pub did: String,
    /// Operation tag.
    pub op: String,
    /// The URL the request is sent to.
    pub url: String,
    /// Seconds since the Unix epoch at signing time.
    pub ts: u64,
    /// Signature over [`DidProof::message`].
    pub sig: String,
}

impl DidProof {
    /// Builds the exact byte string that is signed.
    #[must_use]
    pub fn message(op: &str, url: &str, ts: u64, payload: &str) -> String {
        format!("{op}\n{url}\n{ts}\n{payload}")
    }

    /// Decodes a `DID-Authorization` header value.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] if the scheme prefix, base64 or JSON is invalid.
    pub fn from_header(value: &str) -> Result<Self, HttpError> {
        let encoded = value
            .strip_prefix(DID_AUTH_SCHEME)
            .map(str::trim_start)
            .ok_or(HttpError::MalformedDidHeader)?;
        let bytes = BASE64_STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Signs outgoing requests to one server with a held identity.
#[derive(Clone)]
pub struct RequestSigner {
    identity: Arc<dyn Identity>,
    url: String,
    operation: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("did", &self.identity.did())
            .field("url", &self.url)
            .field("operation", &self.operation)
            .finish()
    }
}

impl RequestSigner {
    /// Creates a signer for requests sent to `url`.
    #[must_use]
    pub fn new(identity: Arc<dyn Identity>, url: impl Into<String>) -> Self {
        Self {
            identity,
            url: url.into(),
            operation: DEFAULT_SIGNING_OPERATION.to_owned(),
        }
    }

    /// Overrides the operation tag (default `mcp`).
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// The URL this signer signs for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Produces a fresh `DID-Authorization` header value for `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Signing`] if the identity fails to sign.
    pub async fn sign(&self, payload: &str) -> Result<HeaderValue, HttpError> {
        let ts = UnixTimestamp::now().as_secs();
        let message = DidProof::message(&self.operation, &self.url, ts, payload);
        let sig = self.identity.sign_message(message.as_bytes()).await?;
        let proof = DidProof {
            did: self.identity.did(),
            op: self.operation.clone(),
            url: self.url.clone(),
            ts,
            sig,
        };
        let encoded = BASE64_STANDARD.encode(serde_json::to_vec(&proof)?);
        Ok(HeaderValue::from_str(&format!("{DID_AUTH_SCHEME} {encoded}"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Signature, hex};
    use alloy_signer_local::PrivateKeySigner;
    use paymcp_evm::EvmIdentity;

    fn signer() -> RequestSigner {
        let key: PrivateKeySigner =
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".parse().unwrap();
        RequestSigner::new(Arc::new(EvmIdentity::new(key, 8453)), "https://tools.example/mcp")
    }

    #[tokio::test]
    async fn test_header_carries_verifiable_proof() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let value = signer().sign(body).await.unwrap();
        let proof = DidProof::from_header(value.to_str().unwrap()).unwrap();
        assert_eq!(proof.op, "mcp");
        assert_eq!(proof.url, "https://tools.example/mcp");
        assert!(proof.did.starts_with("did:pkh:eip155:8453:0x"));

        let message = DidProof::message(&proof.op, &proof.url, proof.ts, body);
        let sig = Signature::from_raw(&hex::decode(&proof.sig).unwrap()).unwrap();
        let recovered = sig.recover_address_from_msg(message.as_bytes()).unwrap();
        assert!(proof.did.ends_with(&recovered.to_string()));
    }

    #[tokio::test]
    async fn test_custom_operation_tag() {
        let value = signer().with_operation("probe").sign("").await.unwrap();
        let proof = DidProof::from_header(value.to_str().unwrap()).unwrap();
        assert_eq!(proof.op, "probe");
    }
}
