//! Chain protocol kernel
//!
//! Shared vocabulary and consensus-critical arithmetic for the ledger core:
//! typed object identifiers, fixed-point asset/price algebra, aggregated
//! price feeds with their derived margin-call prices, and block headers.
//!
//! # Invariants
//!
//! - All 64-bit amount products are computed in 128 bits
//! - Price comparison uses cross-multiplication, never fraction reduction
//! - A single rounding difference between nodes forks the chain: every
//!   operation here is deterministic and total

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod asset;
pub mod block;
pub mod constants;
pub mod error;
pub mod feed;
pub mod ids;

// Re-exports
pub use asset::{Asset, Price, Ratio};
pub use block::{Block, BlockId};
pub use error::{Error, Result};
pub use feed::PriceFeed;
pub use ids::{
    AccountId, AssetId, CallOrderId, DedupeId, HtlcId, LimitOrderId, ProposalId, SettlementId,
    TicketId, WithdrawPermissionId, WitnessId,
};
