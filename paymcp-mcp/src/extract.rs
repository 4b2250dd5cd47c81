//! Reading and writing x402 payment data in MCP messages.
//!
//! A payment challenge is recognized in exactly one place: the
//! `structuredContent` of a tool result flagged `isError`, which must be a v1
//! envelope with a non-empty `accepts`. Anything else is an ordinary error.

use paymcp::proto::{PaymentRequired, SettleResponse};
use serde_json::{Map, Value};

use crate::types::CallToolResult;
use crate::{PAYMENT_META_KEY, PAYMENT_RESPONSE_META_KEY};

/// Extracts a payment challenge from a tool error result.
///
/// Returns `None` if the result is not an error or carries no envelope.
#[must_use]
pub fn payment_required_from_result(result: &CallToolResult) -> Option<PaymentRequired> {
    if !result.is_error {
        return None;
    }
    PaymentRequired::from_value(result.structured_content.as_ref()?)
}

/// Attaches a payment payload to request `_meta`, creating it if needed.
///
/// Overwrites any existing value under [`PAYMENT_META_KEY`].
pub fn attach_payment_to_meta(meta: &mut Option<Map<String, Value>>, payment: Value) {
    meta.get_or_insert_with(Map::new)
        .insert(PAYMENT_META_KEY.to_owned(), payment);
}

/// Reads the settlement receipt from result `_meta`.
///
/// Returns `None` when no receipt is present and `Some(Err(_))` when one is
/// present but malformed.
#[must_use]
pub fn payment_response_from_meta(
    meta: Option<&Map<String, Value>>,
) -> Option<Result<SettleResponse, serde_json::Error>> {
    let value = meta?.get(PAYMENT_RESPONSE_META_KEY)?;
    Some(serde_json::from_value(value.clone()))
}

/// Removes the settlement receipt from result `_meta`.
///
/// Drops `_meta` entirely when the receipt was its only entry.
pub fn strip_payment_response(result: &mut CallToolResult) {
    if let Some(meta) = result.meta.as_mut() {
        meta.remove(PAYMENT_RESPONSE_META_KEY);
        if meta.is_empty() {
            result.meta = None;
        }
    }
}
