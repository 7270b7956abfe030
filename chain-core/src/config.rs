//! Configuration for the maintenance core

use chain_protocol::constants::{IRREVERSIBLE_THRESHOLD, MAX_UNDO_HISTORY};
use chain_protocol::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consensus parameters, immutable within a maintenance period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParameters {
    /// Seconds between block production slots
    pub block_interval_sec: u32,

    /// Seconds between maintenance intervals
    pub maintenance_interval_sec: u32,

    /// Pay deposited to the signing witness per block, capped by the budget
    pub witness_pay_per_block: i64,

    /// Fraction of witnesses that must confirm a block before it becomes
    /// irreversible, in hundredths of a percent
    pub irreversible_threshold: u16,

    /// Hard cap on the distance between head and last irreversible block
    pub max_undo_history: u32,
}

impl Default for ChainParameters {
    fn default() -> Self {
        Self {
            block_interval_sec: 5,
            maintenance_interval_sec: 86_400, // daily
            witness_pay_per_block: 1_000,
            irreversible_threshold: IRREVERSIBLE_THRESHOLD,
            max_undo_history: MAX_UNDO_HISTORY,
        }
    }
}

/// Node-local configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Genesis consensus parameters
    pub parameters: ChainParameters,

    /// Skip the undo-history depth check when applying blocks
    pub skip_undo_history_check: bool,

    /// Trusted checkpoints, block number to block id
    pub checkpoints: BTreeMap<u64, BlockId>,
}

impl Config {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(skip) = std::env::var("CHAIN_SKIP_UNDO_HISTORY_CHECK") {
            config.skip_undo_history_check = skip == "1" || skip.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }

    /// Most recent configured checkpoint, if any.
    pub fn last_checkpoint(&self) -> Option<u64> {
        self.checkpoints.keys().next_back().copied()
    }
}
