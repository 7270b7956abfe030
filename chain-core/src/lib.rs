//! Chain maintenance core
//!
//! Deterministic per-block state updates and market maintenance for a
//! delegated-consensus ledger: dynamic global properties, price-feed
//! aggregation, margin calls and black swans, expiration sweepers, forced
//! settlement matching, and stake ticket processing.
//!
//! # Invariants
//!
//! - Strictly single-threaded: block application is serialized and no
//!   operation suspends
//! - Time is the head block timestamp; the wall clock is never observed
//! - Every mutation records an undo pre-image; a failed block rolls back
//!   to the pre-block snapshot
//! - Arithmetic is consensus-critical: one rounding difference between
//!   nodes forks the chain

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod database;
pub mod dynamic;
pub mod error;
pub mod feeds;
pub mod margin;
pub mod metrics;
pub mod objects;
pub mod orders;
pub mod store;
pub mod sweepers;
pub mod tickets;

// Re-exports
pub use config::{ChainParameters, Config};
pub use database::{Database, UndoSession};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use objects::{
    AccountStatistics, AssetObject, BitassetData, BitassetOptions, CallOrder,
    DynamicGlobalProperties, ForceSettlement, GlobalProperties, Htlc, LimitOrder, Proposal,
    VirtualOperation, WithdrawPermission, Witness,
};
pub use sweepers::{NullProposalExecutor, ProposalExecutor};
pub use tickets::{Ticket, TicketStatus, TicketSweepResult, TicketType};
