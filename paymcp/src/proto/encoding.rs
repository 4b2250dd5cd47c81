//! Base64 JSON codec for header-borne payment data.
//!
//! `X-PAYMENT` and `X-PAYMENT-RESPONSE` carry JSON documents encoded with the
//! standard base64 alphabet (with padding).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error produced when a base64 JSON value cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not the expected JSON shape.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `value` as JSON and encodes it as a base64 string.
///
/// # Errors
///
/// Returns [`serde_json::Error`] if `value` cannot be serialized.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_vec(value).map(|json| STANDARD.encode(json))
}

/// Decodes a base64 string and parses the result as JSON.
///
/// Surrounding ASCII whitespace is ignored.
///
/// # Errors
///
/// Returns [`DecodeError`] on base64 or JSON failure.
pub fn decode_json<T: DeserializeOwned>(encoded: &[u8]) -> Result<T, DecodeError> {
    let bytes = STANDARD.decode(encoded.trim_ascii())?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_decode_tolerates_whitespace() {
        let encoded = format!("  {}\r\n", encode_json(&json!({ "ok": true })).unwrap());
        let value: Value = decode_json(encoded.as_bytes()).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_decode_errors_are_classified() {
        assert!(matches!(
            decode_json::<Value>(b"%%%"),
            Err(DecodeError::Base64(_))
        ));
        let not_json = STANDARD.encode("not json");
        assert!(matches!(
            decode_json::<Value>(not_json.as_bytes()),
            Err(DecodeError::Json(_))
        ));
    }
}
