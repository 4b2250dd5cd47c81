#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EIP-155 (EVM) support for the paymcp client runtime.
//!
//! This crate supplies the two key-holding collaborators the runtime needs on
//! EVM chains:
//!
//! - [`Eip155ExactSigner`] signs ERC-3009 `transferWithAuthorization` payments
//!   for the x402 `exact` scheme
//! - [`EvmIdentity`] signs DID request challenges with EIP-191 `personal_sign`
//!   under a `did:pkh:eip155` identifier
//!
//! Both are generic over [`SignerLike`], so a [`PrivateKeySigner`] can be
//! shared behind an [`Arc`](std::sync::Arc) between them.
//!
//! [`PrivateKeySigner`]: alloy_signer_local::PrivateKeySigner

pub mod did;
pub mod exact;

mod networks;
pub use networks::*;

pub use did::EvmIdentity;
pub use exact::{Eip155ExactSigner, SignerLike};
