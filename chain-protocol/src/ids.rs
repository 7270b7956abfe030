//! Typed object identifiers
//!
//! Every entity in the object store is addressed by a strongly-typed
//! instance number. Ids are dense and allocated in creation order, which
//! the secondary orderings rely on for deterministic tie-breaking.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Lowest id, usable as an index range bound.
            pub const MIN: Self = Self(0);

            /// Highest id, usable as an index range bound.
            pub const MAX: Self = Self(u64::MAX);

            /// Raw instance number.
            pub fn instance(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(instance: u64) -> Self {
                Self(instance)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, ".{}"), self.0)
            }
        }
    };
}

object_id!(
    /// Asset identifier; instance 0 is the core asset
    AssetId,
    "asset"
);
object_id!(
    /// Account identifier
    AccountId,
    "account"
);
object_id!(
    /// Block-signing witness identifier
    WitnessId,
    "witness"
);
object_id!(
    /// Limit order identifier
    LimitOrderId,
    "limit"
);
object_id!(
    /// Margin call order identifier
    CallOrderId,
    "call"
);
object_id!(
    /// Force settlement order identifier
    SettlementId,
    "settle"
);
object_id!(
    /// Proposal identifier
    ProposalId,
    "proposal"
);
object_id!(
    /// Included-transaction dedupe record identifier
    DedupeId,
    "dedupe"
);
object_id!(
    /// Withdraw permission identifier
    WithdrawPermissionId,
    "withdraw"
);
object_id!(
    /// Hash-time-locked contract identifier
    HtlcId,
    "htlc"
);
object_id!(
    /// Stake ticket identifier
    TicketId,
    "ticket"
);

impl AssetId {
    /// The core asset of the chain.
    pub const CORE: AssetId = AssetId(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_ordering() {
        assert_eq!(AssetId(3).to_string(), "asset.3");
        assert_eq!(TicketId(0).to_string(), "ticket.0");
        assert!(AssetId(1) < AssetId(2));
        assert_eq!(AssetId::CORE, AssetId::default());
    }

    #[test]
    fn test_serde_transparent() {
        let id = AccountId(17);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "17");
        let back: AccountId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
