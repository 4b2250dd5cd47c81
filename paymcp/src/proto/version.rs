//! The x402 protocol revision marker.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marks a message as x402 version 1, the only revision this client speaks.
///
/// Serializes as the integer `1`. Deserialization also accepts the string
/// `"1"` and rejects everything else, so an envelope from another revision
/// never parses as a challenge this client would try to pay.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct X402Version1;

impl X402Version1 {
    /// The numeric revision.
    pub const VALUE: u8 = 1;
}

impl std::fmt::Display for X402Version1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let matches = match RawVersion::deserialize(deserializer)? {
            RawVersion::Number(n) => n == u64::from(Self::VALUE),
            RawVersion::Text(s) => s.trim() == "1",
        };
        if matches {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom("unsupported x402 version, expected 1"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_only_version_one() {
        assert!(serde_json::from_str::<X402Version1>("1").is_ok());
        assert!(serde_json::from_str::<X402Version1>("\"1\"").is_ok());
        assert!(serde_json::from_str::<X402Version1>("2").is_err());
        assert!(serde_json::from_str::<X402Version1>("null").is_err());
        assert_eq!(serde_json::to_string(&X402Version1).unwrap(), "1");
    }
}
