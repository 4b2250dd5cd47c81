//! HTTP plumbing for the paymcp client runtime.
//!
//! Provides the x402 header codecs, the DID request signer used by every HTTP
//! transport, and a reqwest middleware that negotiates `402 Payment Required`
//! responses for plain HTTP calls.
//!
//! # Modules
//!
//! - [`constants`] - HTTP header names and status codes
//! - [`headers`] - Base64 encoding/decoding for x402 HTTP headers
//! - [`signing`] - Per-request DID signatures
//! - [`client`] - Reqwest payment middleware
//! - [`error`] - HTTP error types

pub mod client;
pub mod constants;
pub mod error;
pub mod headers;
pub mod signing;

pub use client::{PaymentCallId, PaymentMiddleware, ReqwestWithPayments, ReqwestWithPaymentsBuild};
pub use error::HttpError;
pub use signing::RequestSigner;
