//! # signet-miner
//! Produces signet blocks: builds the signature challenge for a candidate
//! block, moves it through an external signer, finalizes proof-of-work, and
//! decides when each block is due.

pub mod calibrate;
pub mod commitment;
pub mod config;
pub mod envelope;
pub mod error;
pub mod finalize;
pub mod generator;
pub mod rpc;
pub mod scheduler;
pub mod util;
