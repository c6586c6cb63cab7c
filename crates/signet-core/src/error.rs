//! Error types for difficulty and template handling.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DifficultyError {
    #[error("negative compact target: {0:08x}")] Negative(u32),
    #[error("compact target overflows 256 bits: {0:08x}")] Overflow(u32),
    #[error("zero target")] Zero,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template json: {0}")] Json(String),
    #[error("missing field: {0}")] MissingField(&'static str),
    #[error("invalid field {field}: {reason}")] InvalidField { field: &'static str, reason: String },
    #[error("invalid transaction {index}: {reason}")] InvalidTransaction { index: usize, reason: String },
    #[error("empty reward script")] EmptyRewardScript,
    #[error("empty signet challenge")] EmptyChallenge,
    #[error("script push of {0} bytes is too large")] OversizedPush(usize),
}
