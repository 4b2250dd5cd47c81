//! Reqwest middleware for automatic x402 payment handling.
//!
//! [`PaymentMiddleware`] is the plain-HTTP call site of the shared
//! [`PaymentNegotiator`](paymcp::PaymentNegotiator). When a request receives a
//! `402 Payment Required` whose JSON body is a v1 challenge, the middleware
//! selects and signs a payment and retries the request once with an
//! `X-PAYMENT` header.
//!
//! ```rust,ignore
//! use paymcp_http::{PaymentMiddleware, ReqwestWithPayments, ReqwestWithPaymentsBuild};
//!
//! let client = reqwest::Client::new()
//!     .with_payments(PaymentMiddleware::new(negotiator))
//!     .build();
//! ```

mod middleware;

pub use middleware::*;

use reqwest::{Client, ClientBuilder};
use reqwest_middleware as rqm;

/// Trait for adding x402 payment handling to reqwest clients.
///
/// This trait is implemented on [`Client`] and [`ClientBuilder`].
pub trait ReqwestWithPayments<A> {
    /// Adds the payment middleware to the client or builder.
    fn with_payments(self, middleware: PaymentMiddleware) -> ReqwestWithPaymentsBuilder<A>;
}

impl ReqwestWithPayments<Self> for Client {
    fn with_payments(self, middleware: PaymentMiddleware) -> ReqwestWithPaymentsBuilder<Self> {
        ReqwestWithPaymentsBuilder {
            inner: self,
            middleware,
        }
    }
}

impl ReqwestWithPayments<Self> for ClientBuilder {
    fn with_payments(self, middleware: PaymentMiddleware) -> ReqwestWithPaymentsBuilder<Self> {
        ReqwestWithPaymentsBuilder {
            inner: self,
            middleware,
        }
    }
}

/// Builder for creating a reqwest client with the payment middleware.
#[allow(missing_debug_implementations)] // generic A may not implement Debug
pub struct ReqwestWithPaymentsBuilder<A> {
    inner: A,
    middleware: PaymentMiddleware,
}

/// Trait for building the final client from a [`ReqwestWithPaymentsBuilder`].
pub trait ReqwestWithPaymentsBuild {
    /// The type returned by [`build`](Self::build).
    type BuildResult;
    /// The type returned by [`builder`](Self::builder).
    type BuilderResult;

    /// Builds the client, consuming the builder.
    fn build(self) -> Self::BuildResult;

    /// Returns the underlying middleware client builder with payments added.
    fn builder(self) -> Self::BuilderResult;
}

impl ReqwestWithPaymentsBuild for ReqwestWithPaymentsBuilder<Client> {
    type BuildResult = rqm::ClientWithMiddleware;
    type BuilderResult = rqm::ClientBuilder;

    fn build(self) -> Self::BuildResult {
        self.builder().build()
    }

    fn builder(self) -> Self::BuilderResult {
        rqm::ClientBuilder::new(self.inner).with(self.middleware)
    }
}

impl ReqwestWithPaymentsBuild for ReqwestWithPaymentsBuilder<ClientBuilder> {
    type BuildResult = Result<rqm::ClientWithMiddleware, reqwest::Error>;
    type BuilderResult = Result<rqm::ClientBuilder, reqwest::Error>;

    fn build(self) -> Self::BuildResult {
        let builder = self.builder()?;
        Ok(builder.build())
    }

    fn builder(self) -> Self::BuilderResult {
        let client = self.inner.build()?;
        Ok(rqm::ClientBuilder::new(client).with(self.middleware))
    }
}
