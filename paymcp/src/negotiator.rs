//! The payment negotiation algorithm shared by every call site.
//!
//! A call site (an HTTP middleware, an MCP tool caller) issues the original
//! request and detects a payment challenge in its own wire format. Everything
//! after that is common and lives here:
//!
//! 1. [`PaymentNegotiator::select`] picks the requirement to pay
//! 2. [`PaymentNegotiator::authorize`] validates it against the policy, records
//!    the attempt and signs it
//! 3. the call site retries once with the [`PaymentAuthorization`] attached
//! 4. [`PaymentNegotiator::conclude`] writes the single result record
//!
//! A policy violation never produces an attempt record and is never retried.

use std::sync::Arc;

use crate::amount::DEFAULT_ASSET_DECIMALS;
use crate::error::PaymentError;
use crate::ledger::{PaymentAttemptRecord, PaymentLedger, PaymentResult};
use crate::policy::PaymentPolicy;
use crate::proto::{self, PaymentPayload, PaymentRequired, PaymentRequirements, SettleResponse};
use crate::signer::PaymentSigner;
use crate::timestamp::UnixTimestamp;

/// A signed payment ready to be attached to a retry.
#[derive(Debug, Clone)]
pub struct PaymentAuthorization {
    /// The signed payload.
    pub payload: PaymentPayload,
    /// The requirement that was authorized.
    pub requirements: PaymentRequirements,
    /// Correlation id of the recorded attempt, if one was known.
    pub ctx_id: Option<String>,
}

impl PaymentAuthorization {
    /// Encodes the payload as the base64 JSON value of an `X-PAYMENT` header.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Encoding`] if the payload cannot be serialized.
    pub fn header_value(&self) -> Result<String, PaymentError> {
        Ok(proto::encode_json(&self.payload)?)
    }

    /// Encodes the payload as the JSON value carried in MCP request `_meta`.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Encoding`] if the payload cannot be serialized.
    pub fn meta_value(&self) -> Result<serde_json::Value, PaymentError> {
        Ok(serde_json::to_value(&self.payload)?)
    }
}

/// Selects, validates and signs payments, and keeps the attempt/result ledger.
#[derive(Clone)]
pub struct PaymentNegotiator {
    policy: PaymentPolicy,
    signer: Arc<dyn PaymentSigner>,
    ledger: Arc<dyn PaymentLedger>,
}

impl std::fmt::Debug for PaymentNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentNegotiator")
            .field("policy", &self.policy)
            .field("payer", &self.signer.payer())
            .finish_non_exhaustive()
    }
}

impl PaymentNegotiator {
    /// Creates a negotiator from a policy, a signer and a ledger.
    #[must_use]
    pub fn new(
        policy: PaymentPolicy,
        signer: Arc<dyn PaymentSigner>,
        ledger: Arc<dyn PaymentLedger>,
    ) -> Self {
        Self {
            policy,
            signer,
            ledger,
        }
    }

    /// The policy payments are checked against.
    #[must_use]
    pub const fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Picks the requirement this client can pay from a challenge.
    #[must_use]
    pub fn select<'a>(&self, required: &'a PaymentRequired) -> Option<&'a PaymentRequirements> {
        let selected = self.policy.select(&required.accepts);
        if selected.is_none() {
            tracing::debug!(
                network = self.policy.network(),
                offered = required.accepts.len(),
                "no payable requirement offered"
            );
        }
        selected
    }

    /// Validates, records and signs a payment for `requirements`.
    ///
    /// The correlation id is `call_id` when given, otherwise `extra.ctxId` of
    /// the requirement. With a known id an attempt record is written before
    /// signing; if signing then fails, a failed result is written as well.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Policy`] / [`PaymentError::InvalidAmount`] if validation fails
    /// - [`PaymentError::Signing`] if the signer fails
    pub async fn authorize(
        &self,
        requirements: &PaymentRequirements,
        call_id: Option<&str>,
    ) -> Result<PaymentAuthorization, PaymentError> {
        let amount = self.policy.validate(requirements)?;
        let decimals = requirements
            .asset_decimals()
            .unwrap_or(DEFAULT_ASSET_DECIMALS);
        tracing::info!(
            network = %requirements.network,
            amount = %amount.with_decimals(decimals),
            pay_to = %requirements.pay_to,
            "authorizing payment"
        );

        let ctx_id = call_id
            .map(str::to_owned)
            .or_else(|| requirements.ctx_id().map(str::to_owned));
        if let Some(ctx_id) = &ctx_id {
            self.ledger.record_attempt(PaymentAttemptRecord {
                ctx_id: ctx_id.clone(),
                requirements: requirements.clone(),
                timestamp: UnixTimestamp::now(),
            });
        }

        match self.signer.sign_payment(requirements).await {
            Ok(payload) => Ok(PaymentAuthorization {
                payload,
                requirements: requirements.clone(),
                ctx_id,
            }),
            Err(err) => {
                tracing::warn!(error = %err, "payment signing failed");
                self.conclude(ctx_id.as_deref(), false, None);
                Err(PaymentError::Signing(err.to_string()))
            }
        }
    }

    /// Writes the result of a paid retry.
    ///
    /// Does nothing without a correlation id.
    pub fn conclude(&self, ctx_id: Option<&str>, success: bool, receipt: Option<SettleResponse>) {
        let Some(ctx_id) = ctx_id else {
            return;
        };
        if let Some(tx) = receipt.as_ref().and_then(|r| r.transaction.as_deref()) {
            tracing::info!(ctx_id, transaction = tx, success, "payment settled");
        }
        self.ledger.record_result(PaymentResult {
            ctx_id: ctx_id.to_owned(),
            success,
            receipt,
            timestamp: UnixTimestamp::now(),
        });
    }
}
