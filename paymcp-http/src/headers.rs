//! HTTP header encoding and decoding for x402 v1 messages.
//!
//! Handles the base64 JSON payloads in the `X-PAYMENT` and
//! `X-PAYMENT-RESPONSE` headers, and the JSON challenge body of a 402.

use base64::prelude::*;
use paymcp::proto::{PaymentPayload, PaymentRequired, SettleResponse};

use crate::error::HttpError;

/// Encodes a [`PaymentPayload`] as a base64 string for the `X-PAYMENT` header.
///
/// # Errors
///
/// Returns [`HttpError::Serialize`] if JSON serialization fails.
pub fn encode_x_payment(payload: &PaymentPayload) -> Result<String, HttpError> {
    let json = serde_json::to_vec(payload)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Decodes an `X-PAYMENT` header value.
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON decode failure.
pub fn decode_x_payment(header_value: &str) -> Result<PaymentPayload, HttpError> {
    let bytes = BASE64_STANDARD.decode(header_value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Encodes a [`SettleResponse`] as a base64 string for the
/// `X-PAYMENT-RESPONSE` header.
///
/// # Errors
///
/// Returns [`HttpError::Serialize`] if JSON serialization fails.
pub fn encode_payment_response(response: &SettleResponse) -> Result<String, HttpError> {
    let json = serde_json::to_vec(response)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Decodes an `X-PAYMENT-RESPONSE` header value into a [`SettleResponse`].
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON decode failure.
pub fn decode_payment_response(header_value: &str) -> Result<SettleResponse, HttpError> {
    let bytes = BASE64_STANDARD.decode(header_value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Parses the JSON body of a 402 response as a payment challenge.
///
/// Returns `None` for anything that is not a v1 envelope with at least one
/// requirement.
#[must_use]
pub fn parse_payment_required_body(body: &[u8]) -> Option<PaymentRequired> {
    PaymentRequired::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_response_tolerates_surrounding_whitespace() {
        let receipt = SettleResponse {
            success: true,
            error_reason: None,
            transaction: Some("0xabc".to_owned()),
            network: Some("base".to_owned()),
            payer: Some("0xpayer".to_owned()),
        };
        let encoded = format!(" {} ", encode_payment_response(&receipt).unwrap());
        assert_eq!(decode_payment_response(&encoded).unwrap(), receipt);
        assert!(matches!(
            decode_payment_response("%%%"),
            Err(HttpError::Base64(_))
        ));
    }
}
