#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the paymcp client runtime.
//!
//! This crate holds the x402 pieces that every call site shares: the wire
//! types carried in a `402 Payment Required` challenge, the payment policy a
//! client is configured with, the signer and identity abstractions, the
//! attempt/result ledger and the [`PaymentNegotiator`] that ties them together.
//!
//! Transport-specific call sites live in sibling crates:
//!
//! - `paymcp-http` negotiates payments for plain HTTP responses
//! - `paymcp-mcp` negotiates payments for MCP tool calls
//!
//! # Modules
//!
//! - [`amount`] - Base-unit token amounts and human-readable formatting
//! - [`error`] - Payment error taxonomy
//! - [`identity`] - Held identity used for DID request signing
//! - [`ledger`] - Payment attempt and result records
//! - [`negotiator`] - The shared selection/validation/signing algorithm
//! - [`policy`] - Network and maximum-amount policy
//! - [`proto`] - Wire format types and encoding
//! - [`signer`] - Payment authorization signing
//! - [`timestamp`] - Unix timestamps

pub mod amount;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod negotiator;
pub mod policy;
pub mod proto;
pub mod signer;
pub mod timestamp;

use std::future::Future;
use std::pin::Pin;

pub use error::{PaymentError, PolicyViolation};
pub use negotiator::{PaymentAuthorization, PaymentNegotiator};

/// A boxed, `Send` future used by object-safe async traits in this workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
