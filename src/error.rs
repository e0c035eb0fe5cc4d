//! Error types shared across the backfill engine.
//!
//! Store inconsistencies are always fatal: they mean the exactly-once-claim
//! invariant no longer holds. Fetch, detection and persistence failures only
//! interrupt the reservation being worked on.

use ethers::types::H256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("reservation {0} not found")]
    NotFound(i64),
    #[error("reservation {0} is already finished")]
    AlreadyFinished(i64),
    #[error("reservation {0} is not claimed")]
    NotClaimed(i64),
    #[error("reservation {0} was claimed concurrently by another worker")]
    DoubleClaim(i64),
    #[error(
        "cannot split reservation {id} [{from_block}, {to_block_exclusive}) at block {remaining_start}"
    )]
    InvalidSplit {
        id: i64,
        from_block: u64,
        to_block_exclusive: u64,
        remaining_start: u64,
    },
    #[error("invalid block range: {0}")]
    InvalidRange(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ReservationError {
    /// True when the error reports a broken reservation invariant rather than
    /// an unavailable database.
    pub fn is_inconsistency(&self) -> bool {
        !matches!(self, ReservationError::Database(_))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rpc error: {0}")]
    Rpc(#[from] ethers::providers::ProviderError),
    #[error("invalid rpc endpoint: {0}")]
    Endpoint(String),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log has no topics")]
    MissingTopic,
    #[error("unexpected event topic {0:?}")]
    UnexpectedTopic(H256),
    #[error("log is missing {0}")]
    MissingMetadata(&'static str),
    #[error("event field `{0}` missing or mistyped")]
    MissingField(&'static str),
    #[error("abi decode failed: {0}")]
    Abi(#[from] ethers::abi::Error),
    #[error("invalid event signature: {0}")]
    Signature(String),
}

#[derive(Debug, Error)]
#[error("detection failed for transaction {tx_hash:?}: {reason}")]
pub struct DetectionError {
    pub tx_hash: H256,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transaction {0:?} has the same log twice in one batch")]
    DuplicateTransaction(H256),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("reservation store: {0}")]
    Reservation(#[from] ReservationError),
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

impl WorkerError {
    /// Fatal errors stop the worker right after the in-flight reservation is resolved.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Reservation(_) => true,
            WorkerError::Pipeline(PipelineError::DuplicateTransaction(_)) => true,
            WorkerError::Pipeline(_) => false,
            WorkerError::Fetch(_) => false,
        }
    }
}
