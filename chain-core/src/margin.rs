//! Margin and black-swan engine
//!
//! A black swan occurs when even the market's best bid cannot cover the
//! least-collateralized debt position:
//!
//! let HB = the highest bid for the collateral, SP = the current median
//! feed's settlement price, LC = the least-collateralized call order's
//! swan price (debt/collateral). With no valid feed or no call orders
//! there is no black swan. A black swan occurs iff `MAX(HB, SP') <= LC`
//! where SP' is the max short squeeze price derived from SP.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::objects::VirtualOperation;
use chain_protocol::{Asset, AssetId, CallOrderId, LimitOrderId, Price};
use std::ops::Bound::{Included, Unbounded};

/// Outcome of black-swan detection for one asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwanCheck {
    /// Not market-issued, no feed, or no call orders: nothing to do
    NotApplicable,
    /// The asset is already globally settled
    AlreadySettled,
    /// Collateralization is still above the trigger
    NoSwan,
    /// A black swan holds; settle globally at the contained price
    Swan {
        /// Price to settle at, denominated debt / collateral
        settle_at: Price,
    },
}

impl Database {
    /// Read-only black-swan detection; never mutates state.
    pub(crate) fn detect_black_swan(&self, asset_id: AssetId) -> Result<SwanCheck> {
        let Some(bitasset) = self.find_bitasset(asset_id) else {
            return Ok(SwanCheck::NotApplicable);
        };
        if bitasset.has_settlement() {
            return Ok(SwanCheck::AlreadySettled);
        }
        let Some(feed) = bitasset.current_feed else {
            return Ok(SwanCheck::NotApplicable);
        };
        let settle_price = feed.settlement_price;
        if settle_price.is_null() {
            return Ok(SwanCheck::NotApplicable);
        }

        let backing = bitasset.options.short_backing_asset;

        // least-collateralized call order, front of by_collateral
        let call_min = Price::min(backing, asset_id);
        let Some((_, call_id)) = self
            .call_order_by_collateral
            .range((Included((call_min, CallOrderId::MIN)), Unbounded))
            .next()
            .copied()
        else {
            return Ok(SwanCheck::NotApplicable);
        };
        let call = self.call_order(call_id)?;
        if call.debt_type() != asset_id {
            return Ok(SwanCheck::NotApplicable);
        }

        let mut highest = feed.max_short_squeeze_price()?;

        // the best bid: the limit order selling the most debt asset for the
        // least collateral, scanned from the top of the price range down
        let highest_possible_bid = Price::max(asset_id, backing);
        let lowest_possible_bid = Price::min(asset_id, backing);
        if let Some((bid_price, _)) = self
            .limit_order_by_price
            .range((
                Included((lowest_possible_bid, LimitOrderId::MIN)),
                Included((highest_possible_bid, LimitOrderId::MAX)),
            ))
            .next_back()
        {
            highest = (*bid_price).max(highest);
        }

        let least_collateral = call.collateralization();
        if least_collateral.invert() >= highest {
            let swan_price = least_collateral.invert();
            let settle_at = if swan_price <= settle_price {
                // global settle at the feed price when possible
                settle_price
            } else {
                swan_price
            };
            return Ok(SwanCheck::Swan { settle_at });
        }
        Ok(SwanCheck::NoSwan)
    }

    /// Detect and, when permitted, execute a black swan on `asset_id`.
    ///
    /// Returns whether the asset is (now) globally settled. When a swan is
    /// detected with `enable_black_swan` false the call fails fatally: a
    /// margin update must never trigger a global settlement.
    pub fn check_for_blackswan(
        &mut self,
        asset_id: AssetId,
        enable_black_swan: bool,
    ) -> Result<bool> {
        match self.detect_black_swan(asset_id)? {
            SwanCheck::NotApplicable | SwanCheck::NoSwan => Ok(false),
            SwanCheck::AlreadySettled => Ok(true),
            SwanCheck::Swan { settle_at } => {
                tracing::error!(
                    "Black swan detected on asset {} at block {}",
                    asset_id,
                    self.head_block_num()
                );
                if !enable_black_swan {
                    return Err(Error::BlackSwanDuringMarginOp);
                }
                self.globally_settle_asset(asset_id, settle_at)?;
                if let Some(m) = &self.metrics {
                    m.black_swans_total.inc();
                }
                Ok(true)
            }
        }
    }

    /// Globally settle a market-issued asset at the given price.
    ///
    /// Every call order of the asset is collapsed: the settlement fund
    /// collects `debt * price` of its collateral (capped at the order's
    /// total) and the remainder returns to the borrower. Terminal for the
    /// bitasset until an out-of-core reversal.
    pub fn globally_settle_asset(&mut self, asset_id: AssetId, settle_price: Price) -> Result<()> {
        let bitasset = self.bitasset(asset_id)?;
        if bitasset.has_settlement() {
            return Err(Error::InvariantViolation(format!(
                "{asset_id} is already globally settled"
            )));
        }
        let backing = bitasset.options.short_backing_asset;

        let call_min = Price::min(backing, asset_id);
        let call_max = Price::max(backing, asset_id);
        let call_ids: Vec<CallOrderId> = self
            .call_order_by_collateral
            .range((
                Included((call_min, CallOrderId::MIN)),
                Included((call_max, CallOrderId::MAX)),
            ))
            .map(|(_, id)| *id)
            .collect();

        let mut collateral_gathered = 0i64;
        for call_id in call_ids {
            let call = self.call_order(call_id)?.clone();
            if call.debt_type() != asset_id {
                continue;
            }
            let owed = call.debt.multiply(settle_price)?;
            let pays = owed.amount.min(call.collateral.amount);
            collateral_gathered = collateral_gathered.checked_add(pays).ok_or_else(|| {
                chain_protocol::Error::Overflow("settlement fund accumulation".into())
            })?;

            let refund = call.collateral.amount - pays;
            if refund > 0 {
                self.adjust_balance(call.borrower, Asset::new(refund, backing))?;
            }
            self.remove_call_order(call_id)?;
        }

        self.modify_bitasset(asset_id, |b| {
            b.settlement_price = Some(settle_price);
            b.settlement_fund = collateral_gathered;
            b.force_settled_volume = 0;
        })?;
        self.push_applied_operation(VirtualOperation::AssetGloballySettled {
            asset: asset_id,
            settle_price,
            settlement_fund: Asset::new(collateral_gathered, backing),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::objects::{AssetObject, BitassetOptions, CallOrder, LimitOrder};
    use chain_protocol::{AccountId, PriceFeed};
    use chrono::{DateTime, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn setup_market(db: &mut Database) -> AssetId {
        let usd = db.create_asset(|id| AssetObject {
            id,
            symbol: "USD".to_string(),
            precision: 4,
            issuer: AccountId(0),
            options: Default::default(),
            dynamic: Default::default(),
        });
        db.create_bitasset(usd, BitassetOptions::default()).unwrap();
        usd
    }

    fn set_feed(db: &mut Database, usd: AssetId, base: i64, quote: i64, mssr: u16) {
        db.modify_bitasset(usd, |b| {
            b.current_feed = Some(PriceFeed {
                settlement_price: Price {
                    base: Asset::new(base, usd),
                    quote: Asset::new(quote, AssetId::CORE),
                },
                maximum_short_squeeze_ratio: mssr,
                ..PriceFeed::default()
            });
        })
        .unwrap();
    }

    fn add_call(db: &mut Database, usd: AssetId, debt: i64, collateral: i64) -> CallOrderId {
        let call_price = Price::call_price(
            Asset::new(debt, usd),
            Asset::new(collateral, AssetId::CORE),
            1750,
        )
        .unwrap();
        db.create_call_order(|id| CallOrder {
            id,
            borrower: AccountId(7),
            collateral: Asset::new(collateral, AssetId::CORE),
            debt: Asset::new(debt, usd),
            call_price,
        })
    }

    #[test]
    fn test_no_swan_without_feed_or_calls() {
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        assert!(!db.check_for_blackswan(usd, true).unwrap());

        set_feed(&mut db, usd, 1, 1, 1500);
        assert!(!db.check_for_blackswan(usd, true).unwrap());

        // a non-market asset is never a swan
        assert!(!db.check_for_blackswan(AssetId::CORE, true).unwrap());
    }

    #[test]
    fn test_blackswan_settles_at_feed_price() {
        // debt 100 USD against 150 CORE, feed 1 USD/CORE, MSSR 1.5:
        // ~LC = 100/150 equals the squeeze price, swan holds, and since
        // ~LC <= feed price the settlement happens at the feed price
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        add_call(&mut db, usd, 100, 150);

        assert!(db.check_for_blackswan(usd, true).unwrap());

        let b = db.bitasset(usd).unwrap();
        assert!(b.has_settlement());
        let settled_at = b.settlement_price.unwrap();
        assert_eq!(
            settled_at,
            Price {
                base: Asset::new(1, usd),
                quote: Asset::new(1, AssetId::CORE),
            }
        );
        // fund takes debt * price = 100 CORE, borrower keeps the rest
        assert_eq!(b.settlement_fund, 100);
        assert_eq!(db.get_balance(AccountId(7), AssetId::CORE).amount, 50);
        assert_eq!(db.call_orders().count(), 0);
    }

    #[test]
    fn test_blackswan_settles_at_swan_price_when_underwater() {
        // collateral cannot even cover the feed price: settle at ~LC
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        add_call(&mut db, usd, 100, 80);

        assert!(db.check_for_blackswan(usd, true).unwrap());

        let b = db.bitasset(usd).unwrap();
        let settled_at = b.settlement_price.unwrap();
        assert_eq!(
            settled_at,
            Price {
                base: Asset::new(100, usd),
                quote: Asset::new(80, AssetId::CORE),
            }
        );
        assert_eq!(b.settlement_fund, 80);
        assert_eq!(db.get_balance(AccountId(7), AssetId::CORE).amount, 0);
    }

    #[test]
    fn test_healthy_market_is_not_a_swan() {
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        add_call(&mut db, usd, 100, 300);
        assert!(!db.check_for_blackswan(usd, true).unwrap());
        assert!(!db.bitasset(usd).unwrap().has_settlement());
    }

    #[test]
    fn test_good_bid_prevents_swan() {
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        // ~LC = 100/150 equals the squeeze price, a swan without bids
        add_call(&mut db, usd, 100, 150);

        // a bid paying 1 USD per CORE sits above ~LC and absorbs the call
        let bid = db.create_limit_order(|id| LimitOrder {
            id,
            seller: AccountId(2),
            for_sale: 1_000,
            sell_price: Price {
                base: Asset::new(1, usd),
                quote: Asset::new(1, AssetId::CORE),
            },
            expiration: t(1_000_000),
        });
        assert!(!db.check_for_blackswan(usd, true).unwrap());

        // with the bid gone the swan fires
        db.remove_limit_order(bid).unwrap();
        assert!(db.check_for_blackswan(usd, true).unwrap());
    }

    #[test]
    fn test_swan_forbidden_during_margin_update() {
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        add_call(&mut db, usd, 100, 150);

        let result = db.check_for_blackswan(usd, false);
        assert!(matches!(result, Err(Error::BlackSwanDuringMarginOp)));
        // nothing settled
        assert!(!db.bitasset(usd).unwrap().has_settlement());
    }

    #[test]
    fn test_already_settled_reports_true() {
        let mut db = Database::new(Config::default());
        let usd = setup_market(&mut db);
        set_feed(&mut db, usd, 1, 1, 1500);
        add_call(&mut db, usd, 100, 150);
        assert!(db.check_for_blackswan(usd, true).unwrap());
        // a second check short-circuits on the settlement marker
        assert!(db.check_for_blackswan(usd, true).unwrap());
    }
}
