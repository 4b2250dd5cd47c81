//! Seconds since the Unix epoch.
//!
//! [`UnixTimestamp`] bounds ERC-3009 authorizations (`validAfter` /
//! `validBefore`), stamps ledger records and freshness-binds DID request
//! signatures. On the wire it is a decimal string.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Whole seconds since 1970-01-01T00:00:00Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    /// Wraps a raw seconds value.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// The current wall-clock time. A clock before the epoch reads as `0`.
    #[must_use]
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(Self(0), |elapsed| Self(elapsed.as_secs()))
    }

    /// Raw seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Time from `self` until `later`, zero if `later` is not later.
    #[must_use]
    pub const fn until(&self, later: Self) -> Duration {
        Duration::from_secs(later.0.saturating_sub(self.0))
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }
}

impl Sub<u64> for UnixTimestamp {
    type Output = Self;

    fn sub(self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<UnixTimestamp> for String {
    fn from(ts: UnixTimestamp) -> Self {
        ts.0.to_string()
    }
}

/// Error for a timestamp string that is not a non-negative integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timestamp must be a non-negative integer, got {0:?}")]
pub struct ParseTimestampError(String);

impl TryFrom<String> for UnixTimestamp {
    type Error = ParseTimestampError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map(Self).map_err(|_| ParseTimestampError(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_is_a_string() {
        let ts = UnixTimestamp::from_secs(1_699_999_999);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1699999999\"");
        let back: UnixTimestamp = serde_json::from_str("\"1699999999\"").unwrap();
        assert_eq!(back, ts);
        assert!(serde_json::from_str::<UnixTimestamp>("\"-1\"").is_err());
    }

    #[test]
    fn test_arithmetic_saturates() {
        let ts = UnixTimestamp::from_secs(10);
        assert_eq!((ts - 600).as_secs(), 0);
        assert_eq!((UnixTimestamp::from_secs(u64::MAX) + 1).as_secs(), u64::MAX);
        assert_eq!(ts.until(ts + 60), Duration::from_secs(60));
        assert_eq!((ts + 60).until(ts), Duration::ZERO);
    }
}
