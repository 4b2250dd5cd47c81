//! Network and maximum-amount payment policy.
//!
//! The policy is supplied by the host application. It decides which of the
//! requirements a server offers the client is willing to pay and rejects any
//! requirement outside its bounds before a signature is ever produced.

use crate::amount::TokenAmount;
use crate::error::{PaymentError, PolicyViolation};
use crate::proto::{ExactScheme, PaymentRequirements};

/// Settlement network and spending cap for automatic payments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentPolicy {
    network: String,
    max_amount: TokenAmount,
}

impl PaymentPolicy {
    /// Creates a policy that pays on `network` up to `max_amount` base units per call.
    #[must_use]
    pub fn new(network: impl Into<String>, max_amount: TokenAmount) -> Self {
        Self {
            network: network.into(),
            max_amount,
        }
    }

    /// The configured settlement network name.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The configured per-call maximum in base units.
    #[must_use]
    pub const fn max_amount(&self) -> TokenAmount {
        self.max_amount
    }

    /// Picks the first offered requirement on the configured network using
    /// the `exact` scheme.
    ///
    /// Returns `None` when nothing matches; callers then hand the original
    /// response back unchanged.
    #[must_use]
    pub fn select<'a>(
        &self,
        accepts: &'a [PaymentRequirements],
    ) -> Option<&'a PaymentRequirements> {
        accepts
            .iter()
            .find(|req| req.network == self.network && req.is_exact())
    }

    /// Checks a requirement against the policy.
    ///
    /// Returns the parsed amount on success.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidAmount`] if `maxAmountRequired` is not a base-unit integer
    /// - [`PaymentError::Policy`] if the amount, scheme or network is out of bounds
    pub fn validate(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<TokenAmount, PaymentError> {
        let required: TokenAmount = requirements.max_amount_required.parse()?;
        if required > self.max_amount {
            return Err(PolicyViolation::AmountExceedsMaximum {
                required,
                maximum: self.max_amount,
            }
            .into());
        }
        if requirements.scheme != ExactScheme::VALUE {
            return Err(PolicyViolation::UnsupportedScheme(requirements.scheme.clone()).into());
        }
        if requirements.network != self.network {
            return Err(PolicyViolation::NetworkMismatch {
                requested: requirements.network.clone(),
                configured: self.network.clone(),
            }
            .into());
        }
        Ok(required)
    }
}
