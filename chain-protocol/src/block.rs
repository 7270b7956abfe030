//! Block headers and block ids
//!
//! The core never validates transactions; it only consumes the header
//! fields of an already-accepted block. A block id is a SHA-256 digest of
//! the header with the block number stamped into the leading bytes, so the
//! number of any block can be recovered from its id alone.

use crate::ids::WitnessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a block; the first 8 bytes encode the block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    /// Block number recovered from the id.
    pub fn block_num(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An accepted block, reduced to the fields the maintenance core reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Height of this block
    pub number: u64,
    /// Id of the previous block
    pub previous: BlockId,
    /// Consensus timestamp
    pub timestamp: DateTime<Utc>,
    /// Witness that signed the block
    pub witness: WitnessId,
}

impl Block {
    /// Height of this block.
    pub fn block_num(&self) -> u64 {
        self.number
    }

    /// Deterministic id of this block.
    pub fn id(&self) -> BlockId {
        let mut hasher = Sha256::new();
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.previous.0);
        hasher.update(self.timestamp.timestamp().to_be_bytes());
        hasher.update(self.witness.0.to_be_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        id[..8].copy_from_slice(&self.number.to_be_bytes());
        BlockId(id)
    }
}
