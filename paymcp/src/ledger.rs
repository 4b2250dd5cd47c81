//! Payment attempt and result records.
//!
//! Before a paid retry is sent the negotiator writes a
//! [`PaymentAttemptRecord`]; once the retry concludes it writes exactly one
//! [`PaymentResult`] for the same correlation id. Host applications plug in
//! their own persistence through [`PaymentLedger`]; [`InMemoryLedger`] is the
//! default.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::proto::{PaymentRequirements, SettleResponse};
use crate::timestamp::UnixTimestamp;

/// Written before a payment retry is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttemptRecord {
    /// Correlation id linking the attempt to its result.
    pub ctx_id: String,
    /// The requirement the client agreed to pay.
    pub requirements: PaymentRequirements,
    /// When the attempt was recorded.
    pub timestamp: UnixTimestamp,
}

/// Outcome of a paid retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    /// Correlation id of the matching attempt.
    pub ctx_id: String,
    /// Whether the paid retry succeeded.
    pub success: bool,
    /// Settlement receipt, when the server returned a decodable one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettleResponse>,
    /// When the result was recorded.
    pub timestamp: UnixTimestamp,
}

/// Sink for payment attempts and results.
pub trait PaymentLedger: Send + Sync {
    /// Records an attempt. A second attempt for the same id replaces the first.
    fn record_attempt(&self, record: PaymentAttemptRecord);

    /// Records a result.
    ///
    /// Only the first result for a correlation id is kept; returns `false` if
    /// one was already present.
    fn record_result(&self, result: PaymentResult) -> bool;
}

/// A [`PaymentLedger`] backed by concurrent in-memory maps.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    attempts: DashMap<String, PaymentAttemptRecord>,
    results: DashMap<String, PaymentResult>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the attempt recorded for `ctx_id`.
    #[must_use]
    pub fn attempt(&self, ctx_id: &str) -> Option<PaymentAttemptRecord> {
        self.attempts.get(ctx_id).map(|entry| entry.value().clone())
    }

    /// Returns the result recorded for `ctx_id`.
    #[must_use]
    pub fn result(&self, ctx_id: &str) -> Option<PaymentResult> {
        self.results.get(ctx_id).map(|entry| entry.value().clone())
    }

    /// Returns every recorded result.
    #[must_use]
    pub fn results(&self) -> Vec<PaymentResult> {
        self.results.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns ids that have an attempt but no result yet.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|entry| !self.results.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl PaymentLedger for InMemoryLedger {
    fn record_attempt(&self, record: PaymentAttemptRecord) {
        tracing::debug!(ctx_id = %record.ctx_id, "payment attempt recorded");
        self.attempts.insert(record.ctx_id.clone(), record);
    }

    fn record_result(&self, result: PaymentResult) -> bool {
        match self.results.entry(result.ctx_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(ctx_id = %result.ctx_id, "duplicate payment result ignored");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(
                    ctx_id = %result.ctx_id,
                    success = result.success,
                    "payment result recorded"
                );
                slot.insert(result);
                true
            }
        }
    }
}

impl<T: PaymentLedger + ?Sized> PaymentLedger for std::sync::Arc<T> {
    fn record_attempt(&self, record: PaymentAttemptRecord) {
        (**self).record_attempt(record);
    }

    fn record_result(&self, result: PaymentResult) -> bool {
        (**self).record_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ctx_id: &str, success: bool) -> PaymentResult {
        PaymentResult {
            ctx_id: ctx_id.to_owned(),
            success,
            receipt: None,
            timestamp: UnixTimestamp::from_secs(1_700_000_000),
        }
    }

    #[test]
    fn test_first_result_wins() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.record_result(result("tx-1", true)));
        assert!(!ledger.record_result(result("tx-1", false)));
        assert!(ledger.result("tx-1").unwrap().success);
        assert_eq!(ledger.results().len(), 1);
    }
}
