//! Error types for block production.
use bitcoin::BlockHash;
use signet_core::error::{DifficultyError, TemplateError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrindError {
    #[error("empty grind command")] EmptyCommand,
    #[error("failed to run grinder {program}: {reason}")] Spawn { program: String, reason: String },
    #[error("grinder exited with {status}: {stderr}")] ExitStatus { status: String, stderr: String },
    #[error("unparsable grinder output: {0}")] InvalidOutput(String),
    #[error("nonce space exhausted")] NonceSpaceExhausted,
    #[error("grinding cancelled")] Cancelled,
    #[error("solver task failed: {0}")] Task(String),
    #[error(transparent)] Difficulty(#[from] DifficultyError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MinerError {
    #[error("malformed template: {0}")] MalformedTemplate(String),
    #[error("protocol violation: {0}")] ProtocolViolation(String),
    #[error("signer returned an incomplete signature")] SigningIncomplete,
    #[error("template built on {got}, expected tip {expected}")] TipMismatch { expected: BlockHash, got: BlockHash },
    #[error("template mintime {min_time} is {ahead}s in the future")] MinTimeInFuture { min_time: i64, ahead: i64 },
    #[error(transparent)] Grind(#[from] GrindError),
    #[error("block rejected: {0}")] SubmissionRejected(String),
    #[error("rpc: {0}")] Rpc(String),
    #[error("config: {0}")] Config(String),
}

impl From<TemplateError> for MinerError {
    fn from(e: TemplateError) -> Self {
        Self::MalformedTemplate(e.to_string())
    }
}

impl MinerError {
    /// Errors after which the control loop re-polls instead of stopping.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TipMismatch { .. }
                | Self::MinTimeInFuture { .. }
                | Self::SigningIncomplete
                | Self::SubmissionRejected(_)
        )
    }
}
