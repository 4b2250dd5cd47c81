//! Support code for the `paymcp` command-line client.
//!
//! - [`config`] - TOML configuration with environment expansion
//! - [`terminal`] - OAuth popup collaborator for terminals

pub mod config;
pub mod terminal;
