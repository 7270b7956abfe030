//! Error types for the protocol kernel

use thiserror::Error;

/// Result type for protocol arithmetic
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors
///
/// Every variant is fatal for the operation that raised it; callers either
/// abort the surrounding block or reject the input outright.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A 128-bit intermediate exceeded the representable range
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Division by a zero amount
    #[error("Division by zero: {0}")]
    DivisionByZero(String),

    /// A structural invariant was violated (bad price, foreign asset, ...)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
