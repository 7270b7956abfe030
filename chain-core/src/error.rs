//! Error types for the maintenance core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors
///
/// Unless documented otherwise, an error aborts the block being applied and
/// rolls the state back to the pre-block snapshot. The two recoverable
/// cases are `BlackSwanDuringSettleMatch` (the offending settle order is
/// cancelled and the sweep continues) and proposal execution failures
/// (logged, proposal removed).
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol arithmetic error
    #[error("Protocol error: {0}")]
    Protocol(#[from] chain_protocol::Error),

    /// The gap between head and last irreversible block exceeds the cap
    #[error(
        "Not enough undo history: head {head}, last irreversible {irreversible}, max {max}. \
         Add a checkpoint to continue applying blocks beyond this point"
    )]
    UndoHistoryExceeded {
        /// Head block number
        head: u64,
        /// Last irreversible block number
        irreversible: u64,
        /// Configured maximum undo history
        max: u32,
    },

    /// A margin update detected a black swan, which it must never trigger
    #[error("Black swan detected during a margin update which is not allowed to trigger one")]
    BlackSwanDuringMarginOp,

    /// Filling a settle order would trigger a black swan
    #[error("Filling this settle order would trigger a black swan")]
    BlackSwanDuringSettleMatch,

    /// Lookup of a required object failed
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// An expired proposal could not be executed
    #[error("Proposal execution failed: {0}")]
    ProposalExecutionFailed(String),

    /// A structural invariant of the store was violated
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
