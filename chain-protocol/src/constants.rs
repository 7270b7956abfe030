//! Consensus-critical constants
//!
//! Fixed at genesis; changing any value is a hard fork.

/// Maximum share supply of any asset (fits in 63 bits)
pub const MAX_SHARE_SUPPLY: i64 = 1_000_000_000_000_000;

/// Fixed-point denominator for collateral ratios (1000 = 1.000x)
pub const COLLATERAL_RATIO_DENOM: u16 = 1000;

/// Smallest permitted collateral ratio (1.001x)
pub const MIN_COLLATERAL_RATIO: u16 = 1001;

/// Largest permitted collateral ratio (32x)
pub const MAX_COLLATERAL_RATIO: u16 = 32_000;

/// Default maintenance collateral ratio for a fresh feed (1.75x)
pub const DEFAULT_MAINTENANCE_COLLATERAL_RATIO: u16 = 1750;

/// Default maximum short squeeze ratio for a fresh feed (1.5x)
pub const DEFAULT_MAX_SHORT_SQUEEZE_RATIO: u16 = 1500;

/// 1% in fixed-point percent representation
pub const PERCENT_1: u16 = 100;

/// 100% in fixed-point percent representation
pub const PERCENT_100: u16 = 10_000;

/// Fraction of active witnesses that must confirm a block before it is
/// considered irreversible
pub const IRREVERSIBLE_THRESHOLD: u16 = 70 * PERCENT_1;

/// Hard cap on the distance between the head block and the last
/// irreversible block
pub const MAX_UNDO_HISTORY: u32 = 10_000;

/// Penalty added to the recently-missed counter per missed slot
pub const RECENTLY_MISSED_COUNT_INCREMENT: u32 = 4;

/// Reward subtracted from the recently-missed counter per filled slot
pub const RECENTLY_MISSED_COUNT_DECREMENT: u32 = 3;
