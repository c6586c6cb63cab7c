//! # signet-core
//! Scripts, compact difficulty and block templates for the signet block
//! producer. Consensus types and encoding come from the `bitcoin` crate.

pub mod constants;
pub mod difficulty;
pub mod error;
pub mod script;
pub mod template;
