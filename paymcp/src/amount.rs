//! Token amounts in base units.
//!
//! On-chain quantities are integers in the smallest denomination of the asset
//! (one millionth of a USDC for a 6-decimal token). [`TokenAmount`] keeps them
//! as [`U256`] end to end and never passes through floating point; the decimal
//! count only matters when an amount is rendered for humans via
//! [`AssetAmount`].

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Decimal count assumed when a requirement does not carry `extra.assetDecimals`.
pub const DEFAULT_ASSET_DECIMALS: u8 = 6;

/// An integer amount in an asset's base units.
///
/// Serializes as a decimal string (`"1000"`), matching the x402 wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    /// Returns the inner [`U256`] value.
    #[must_use]
    pub const fn inner(&self) -> U256 {
        self.0
    }

    /// Pairs this amount with a decimal count for display.
    #[must_use]
    pub const fn with_decimals(self, decimals: u8) -> AssetAmount {
        AssetAmount {
            value: self,
            decimals,
        }
    }
}

/// Error returned when a string is not a non-negative decimal integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid base-unit amount {0:?}: expected a non-negative decimal integer")]
pub struct ParseAmountError(pub String);

impl FromStr for TokenAmount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError(s.to_owned()));
        }
        U256::from_str_radix(trimmed, 10)
            .map(Self)
            .map_err(|_| ParseAmountError(s.to_owned()))
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A base-unit amount together with the asset's decimal count.
///
/// Displays as a fixed-point decimal with trailing zeros trimmed, e.g.
/// `1500` with 6 decimals renders as `0.0015`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetAmount {
    /// Amount in base units.
    pub value: TokenAmount,
    /// Number of decimals of the asset.
    pub decimals: u8,
}

impl fmt::Display for AssetAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Scales past 10^77 do not fit a U256; those amounts print in base units.
        let scale = match U256::from(10u64).checked_pow(U256::from(self.decimals)) {
            Some(scale) if self.decimals > 0 => scale,
            _ => return write!(f, "{}", self.value.0),
        };
        let whole = self.value.0 / scale;
        let frac = self.value.0 % scale;
        if frac.is_zero() {
            return write!(f, "{whole}");
        }
        let frac = format!(
            "{:0>width$}",
            frac.to_string(),
            width = usize::from(self.decimals)
        );
        write!(f, "{whole}.{}", frac.trim_end_matches('0'))
    }
}
