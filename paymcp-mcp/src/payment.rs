//! x402 payment negotiation for MCP tool calls.
//!
//! [`PaidToolCaller`] wraps any [`ToolCaller`]. A tool error result whose
//! `structuredContent` is a payment challenge is answered with one signed
//! retry carrying the authorization in `_meta["x402/payment"]`; the
//! settlement receipt comes back in `_meta["x402/payment-response"]`.
//!
//! Wrapping an [`McpClient`](crate::McpClient) puts this layer outside the
//! authorization recovery, so the retry gets its own auth budget.

use paymcp::proto::SettleResponse;
use paymcp::{BoxFuture, PaymentError, PaymentNegotiator};
use tracing::{debug, instrument, warn};

use crate::client::ToolCaller;
use crate::error::McpError;
use crate::extract::{
    attach_payment_to_meta, payment_required_from_result, payment_response_from_meta,
    strip_payment_response,
};
use crate::types::{CallToolParams, CallToolResult};

/// Result of a tool call that may have been paid for.
#[derive(Debug, Clone)]
pub struct PaidToolCallResult {
    /// The tool result, with the receipt stripped from `_meta` on success.
    pub result: CallToolResult,
    /// Whether a payment was sent.
    pub paid: bool,
    /// The settlement receipt, if the server returned a readable one.
    pub receipt: Option<SettleResponse>,
}

/// A [`ToolCaller`] that pays for tools on demand.
pub struct PaidToolCaller<C: ToolCaller> {
    caller: C,
    negotiator: PaymentNegotiator,
}

impl<C: ToolCaller> std::fmt::Debug for PaidToolCaller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaidToolCaller")
            .field("negotiator", &self.negotiator)
            .finish_non_exhaustive()
    }
}

impl<C: ToolCaller> PaidToolCaller<C> {
    /// Wraps `caller`, paying with `negotiator`.
    pub const fn new(caller: C, negotiator: PaymentNegotiator) -> Self {
        Self { caller, negotiator }
    }

    /// The wrapped caller.
    pub const fn caller(&self) -> &C {
        &self.caller
    }

    /// The negotiator payments go through.
    pub const fn negotiator(&self) -> &PaymentNegotiator {
        &self.negotiator
    }

    /// Calls a tool, paying once if the server asks for it.
    ///
    /// # Errors
    ///
    /// Returns the caller's error, or a payment error if the requirement
    /// violates the policy, signing fails, or the paid retry is challenged again.
    pub async fn call_tool(&self, params: CallToolParams) -> Result<PaidToolCallResult, McpError> {
        self.call_tool_with_id(params, None).await
    }

    /// Like [`call_tool`](Self::call_tool), recording the payment under `call_id`.
    ///
    /// # Errors
    ///
    /// As [`call_tool`](Self::call_tool).
    #[instrument(name = "paymcp.paid_call", skip_all, fields(tool = %params.name), err)]
    pub async fn call_tool_with_id(
        &self,
        params: CallToolParams,
        call_id: Option<&str>,
    ) -> Result<PaidToolCallResult, McpError> {
        let result = self.caller.call_tool(params.clone()).await?;
        let unpaid = |result| PaidToolCallResult {
            result,
            paid: false,
            receipt: None,
        };
        let Some(required) = payment_required_from_result(&result) else {
            return Ok(unpaid(result));
        };
        let Some(requirements) = self.negotiator.select(&required) else {
            return Ok(unpaid(result));
        };

        let authorization = self.negotiator.authorize(requirements, call_id).await?;
        let ctx_id = authorization.ctx_id.as_deref();
        let meta = match authorization.meta_value() {
            Ok(meta) => meta,
            Err(err) => {
                self.negotiator.conclude(ctx_id, false, None);
                return Err(err.into());
            }
        };
        let mut retry = params;
        attach_payment_to_meta(&mut retry.meta, meta);
        debug!(ctx_id, "retrying with payment");

        let mut paid = match self.caller.call_tool(retry).await {
            Ok(paid) => paid,
            Err(err) => {
                self.negotiator.conclude(ctx_id, false, None);
                return Err(err);
            }
        };
        if let Some(again) = payment_required_from_result(&paid) {
            self.negotiator.conclude(ctx_id, false, None);
            return Err(PaymentError::RepeatedPaymentRequired(again.error).into());
        }

        let receipt = match payment_response_from_meta(paid.meta.as_ref()) {
            Some(Ok(receipt)) => Some(receipt),
            Some(Err(error)) => {
                warn!(ctx_id, %error, "unreadable payment receipt");
                None
            }
            None => None,
        };
        let success = !paid.is_error && receipt.as_ref().is_none_or(|r| r.success);
        self.negotiator.conclude(ctx_id, success, receipt.clone());
        if !paid.is_error {
            strip_payment_response(&mut paid);
        }
        Ok(PaidToolCallResult {
            result: paid,
            paid: true,
            receipt,
        })
    }
}

impl<C: ToolCaller> ToolCaller for PaidToolCaller<C> {
    fn call_tool(&self, params: CallToolParams) -> BoxFuture<'_, Result<CallToolResult, McpError>> {
        Box::pin(async move { Ok(Self::call_tool(self, params).await?.result) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ContentItem;
    use crate::{PAYMENT_META_KEY, PAYMENT_RESPONSE_META_KEY};
    use paymcp::amount::TokenAmount;
    use paymcp::ledger::InMemoryLedger;
    use paymcp::policy::PaymentPolicy;
    use paymcp::proto::{PaymentPayload, PaymentRequirements, V1};
    use paymcp::signer::{PaymentSigner, SignerError};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeSigner {
        calls: AtomicUsize,
    }

    impl PaymentSigner for FakeSigner {
        fn payer(&self) -> String {
            "0xpayer".to_owned()
        }

        fn sign_payment<'a>(
            &'a self,
            requirements: &'a PaymentRequirements,
        ) -> BoxFuture<'a, Result<PaymentPayload, SignerError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(PaymentPayload {
                    x402_version: V1,
                    scheme: requirements.scheme.clone(),
                    network: requirements.network.clone(),
                    payload: json!({ "signature": "0xsig" }),
                })
            })
        }
    }

    /// Demands `amount` until paid; optionally demands it again after payment.
    struct PaywalledTool {
        amount: &'static str,
        network: &'static str,
        charge_twice: bool,
        fail_paid_call: bool,
        receipt: Value,
        calls: Mutex<Vec<CallToolParams>>,
    }

    impl PaywalledTool {
        fn new(amount: &'static str) -> Self {
            Self {
                amount,
                network: "base-sepolia",
                charge_twice: false,
                fail_paid_call: false,
                receipt: json!({
                    "success": true,
                    "transaction": "0xabc",
                    "network": "base-sepolia"
                }),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn challenge(&self) -> CallToolResult {
            CallToolResult {
                content: vec![ContentItem::text("payment required")],
                is_error: true,
                meta: None,
                structured_content: Some(json!({
                    "x402Version": 1,
                    "error": "payment required",
                    "accepts": [{
                        "scheme": "exact",
                        "network": self.network,
                        "maxAmountRequired": self.amount,
                        "resource": "mcp://tool/search",
                        "mimeType": "application/json",
                        "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                        "maxTimeoutSeconds": 60,
                        "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                        "extra": { "ctxId": "tx-42", "assetDecimals": 6 }
                    }]
                })),
            }
        }
    }

    impl ToolCaller for PaywalledTool {
        fn call_tool(
            &self,
            params: CallToolParams,
        ) -> BoxFuture<'_, Result<CallToolResult, McpError>> {
            Box::pin(async move {
                let has_payment = params
                    .meta
                    .as_ref()
                    .is_some_and(|m| m.contains_key(PAYMENT_META_KEY));
                self.calls.lock().unwrap().push(params);
                if !has_payment || self.charge_twice {
                    return Ok(self.challenge());
                }
                if self.fail_paid_call {
                    return Err(McpError::transport("connection reset"));
                }
                let mut meta = serde_json::Map::new();
                meta.insert(PAYMENT_RESPONSE_META_KEY.to_owned(), self.receipt.clone());
                Ok(CallToolResult {
                    content: vec![ContentItem::text("results")],
                    is_error: false,
                    meta: Some(meta),
                    structured_content: None,
                })
            })
        }
    }

    fn paid(
        tool: PaywalledTool,
    ) -> (
        PaidToolCaller<Arc<PaywalledTool>>,
        Arc<PaywalledTool>,
        Arc<InMemoryLedger>,
        Arc<FakeSigner>,
    ) {
        let tool = Arc::new(tool);
        let ledger = Arc::new(InMemoryLedger::new());
        let signer = Arc::new(FakeSigner {
            calls: AtomicUsize::new(0),
        });
        let negotiator = PaymentNegotiator::new(
            PaymentPolicy::new("base-sepolia", TokenAmount::from(100_000)),
            signer.clone(),
            ledger.clone(),
        );
        (PaidToolCaller::new(Arc::clone(&tool), negotiator), tool, ledger, signer)
    }

    #[tokio::test]
    async fn test_pays_once_and_records_receipt() {
        let (caller, tool, ledger, _) = paid(PaywalledTool::new("1000"));
        let outcome = caller.call_tool(CallToolParams::new("search")).await.unwrap();

        assert!(outcome.paid);
        assert_eq!(outcome.result.text(), "results");
        assert!(outcome.result.meta.is_none());
        assert_eq!(outcome.receipt.unwrap().transaction.as_deref(), Some("0xabc"));

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].meta.is_none());
        assert_eq!(calls[1].meta.as_ref().unwrap()[PAYMENT_META_KEY]["network"], "base-sepolia");

        assert!(ledger.attempt("tx-42").is_some());
        let result = ledger.result("tx-42").unwrap();
        assert!(result.success);
        assert_eq!(result.receipt.unwrap().transaction.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_over_maximum_fails_without_retry() {
        let (caller, tool, ledger, signer) = paid(PaywalledTool::new("200000"));
        let err = caller.call_tool(CallToolParams::new("search")).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Payment);
        assert_eq!(err.payment_code(), Some("amount_exceeds_maximum"));
        assert_eq!(tool.calls.lock().unwrap().len(), 1);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
        assert!(ledger.attempt("tx-42").is_none());
    }

    #[tokio::test]
    async fn test_second_challenge_is_fatal() {
        let mut tool = PaywalledTool::new("1000");
        tool.charge_twice = true;
        let (caller, tool, ledger, _) = paid(tool);
        let err = caller
            .call_tool_with_id(CallToolParams::new("search"), Some("call-1"))
            .await
            .unwrap_err();

        assert_eq!(err.payment_code(), Some("payment_required_after_retry"));
        assert_eq!(tool.calls.lock().unwrap().len(), 2);
        assert!(!ledger.result("call-1").unwrap().success);
    }

    #[tokio::test]
    async fn test_unreadable_receipt_still_records_one_result() {
        let mut tool = PaywalledTool::new("1000");
        tool.receipt = json!({ "success": "maybe", "transaction": 7 });
        let (caller, _, ledger, _) = paid(tool);
        let outcome = caller
            .call_tool_with_id(CallToolParams::new("search"), Some("call-2"))
            .await
            .unwrap();

        assert!(outcome.paid);
        assert!(outcome.receipt.is_none());
        assert_eq!(outcome.result.text(), "results");
        let results = ledger.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].receipt.is_none());
        assert!(ledger.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_paid_call_records_failure() {
        let mut tool = PaywalledTool::new("1000");
        tool.fail_paid_call = true;
        let (caller, tool, ledger, _) = paid(tool);
        let err = caller
            .call_tool_with_id(CallToolParams::new("search"), Some("call-3"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(tool.calls.lock().unwrap().len(), 2);
        let results = ledger.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].receipt.is_none());
        assert!(ledger.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unpayable_network_returns_original_result() {
        let mut tool = PaywalledTool::new("1000");
        tool.network = "polygon";
        let (caller, _, _, signer) = paid(tool);
        let outcome = caller.call_tool(CallToolParams::new("search")).await.unwrap();

        assert!(!outcome.paid);
        assert!(outcome.result.is_error);
        assert_eq!(
            outcome.result.structured_content.as_ref().map(|v| v["accepts"][0]["network"].clone()),
            Some(Value::from("polygon"))
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }
}
