//! Integration test suite for the signet block producer.
//!
//! Tests drive the commitment, envelope, scheduler and control loop through
//! their public APIs, against an in-memory node.

pub mod helpers;
