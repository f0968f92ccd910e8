// fraudwatch/src/error.rs
//
// Error taxonomy. Only `SourceError` (and startup wiring via anyhow) can halt
// the daemon; everything else is absorbed by the pipeline:
//   StoreError   → default state on read, retried + state-loss log on write
//   ScoringError → fail-safe label 0
//   EventError   → event dropped and counted
//   NotifyError  → logged only

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt state document for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("scoring failed: {0}")]
    ScoringFailure(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("stream {addr} unreachable after {attempts} attempts")]
    Unreachable { addr: String, attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
