//! Order expiration and forced-settlement matching
//!
//! `clear_expired_orders` first cancels limit orders past their expiration,
//! then drains due force-settlement orders asset by asset against the
//! least-collateralized call orders, bounded by each asset's per-period
//! settlement volume. The sweep reseeks its ordering after every removal;
//! no iterator is held across a mutation.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::margin::SwanCheck;
use crate::objects::VirtualOperation;
use chain_protocol::constants::PERCENT_100;
use chain_protocol::{Asset, AssetId, CallOrderId, LimitOrderId, Price, Ratio, SettlementId};
use chrono::{DateTime, Utc};
use std::ops::Bound::{Excluded, Included, Unbounded};

impl Database {
    /// Cancel a limit order, returning the unsold balance to the seller.
    pub fn cancel_limit_order(&mut self, id: LimitOrderId) -> Result<()> {
        let order = self.limit_order(id)?.clone();
        let refund = order.amount_for_sale();
        self.adjust_balance(order.seller, refund)?;
        self.push_applied_operation(VirtualOperation::LimitOrderCancelled {
            order: id,
            seller: order.seller,
            refund,
        });
        self.remove_limit_order(id)?;
        if let Some(m) = &self.metrics {
            m.limit_orders_cancelled_total.inc();
        }
        Ok(())
    }

    /// Cancel a forced settlement, returning its balance to the owner.
    pub fn cancel_settle_order(&mut self, id: SettlementId) -> Result<()> {
        let order = self.settlement(id)?.clone();
        self.adjust_balance(order.owner, order.balance)?;
        self.push_applied_operation(VirtualOperation::SettleOrderCancelled {
            order: id,
            owner: order.owner,
            refund: order.balance,
        });
        self.remove_settlement(id)?;
        Ok(())
    }

    fn fill_call_order(
        &mut self,
        id: CallOrderId,
        pays: Asset,
        receives: Asset,
        fill_price: Price,
    ) -> Result<()> {
        let call = self.call_order(id)?.clone();
        let new_debt = call.debt.amount - receives.amount;
        let new_collateral = call.collateral.amount - pays.amount;
        if new_debt < 0 || new_collateral < 0 {
            return Err(Error::InvariantViolation(format!(
                "fill exceeds call order {id}"
            )));
        }

        if new_debt == 0 {
            // position closed; the leftover collateral goes home
            if new_collateral > 0 {
                self.adjust_balance(
                    call.borrower,
                    Asset::new(new_collateral, call.collateral_type()),
                )?;
            }
            self.remove_call_order(id)?;
        } else {
            let feed = self
                .bitasset(call.debt_type())?
                .current_feed
                .ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "call order {id} filled without a median feed"
                    ))
                })?;
            let call_price = Price::call_price(
                Asset::new(new_debt, call.debt_type()),
                Asset::new(new_collateral, call.collateral_type()),
                feed.maintenance_collateral_ratio,
            )?;
            self.modify_call_order(id, |c| {
                c.debt.amount = new_debt;
                c.collateral.amount = new_collateral;
                c.call_price = call_price;
            })?;
        }

        self.push_applied_operation(VirtualOperation::OrderFilled {
            account: call.borrower,
            pays,
            receives,
            fill_price,
        });
        Ok(())
    }

    fn fill_settle_order(
        &mut self,
        id: SettlementId,
        pays: Asset,
        receives: Asset,
        fill_price: Price,
    ) -> Result<()> {
        let settle = self.settlement(id)?.clone();
        let remaining = settle.balance.amount - pays.amount;
        if remaining < 0 {
            return Err(Error::InvariantViolation(format!(
                "fill exceeds settle order {id}"
            )));
        }

        self.adjust_balance(settle.owner, receives)?;
        self.push_applied_operation(VirtualOperation::OrderFilled {
            account: settle.owner,
            pays,
            receives,
            fill_price,
        });

        if remaining == 0 {
            self.remove_settlement(id)?;
        } else {
            self.modify_settlement(id, |s| s.balance.amount = remaining)?;
        }
        if let Some(m) = &self.metrics {
            m.force_settlements_filled_total.inc();
        }
        Ok(())
    }

    /// Match a settle order against a call order at `match_price`, capped
    /// by `max_settlement`. Returns the debt amount newly settled; zero
    /// means the order could not be filled further this cycle.
    ///
    /// The fill is probed inside a nested undo session: if the post-fill
    /// state would constitute a black swan the fill is rolled back and
    /// `BlackSwanDuringSettleMatch` is returned, which the sweep treats as
    /// an instruction to cancel the settle order.
    pub(crate) fn match_settle_order(
        &mut self,
        call_id: CallOrderId,
        settle_id: SettlementId,
        match_price: Price,
        max_settlement: Asset,
        fill_price: Price,
    ) -> Result<Asset> {
        let call = self.call_order(call_id)?.clone();
        let settle = self.settlement(settle_id)?.clone();
        let debt_asset = settle.balance.asset_id;
        if call.debt_type() != debt_asset {
            return Err(Error::InvariantViolation(format!(
                "call order {call_id} does not borrow {debt_asset}"
            )));
        }

        let to_fill = settle
            .balance
            .amount
            .min(max_settlement.amount)
            .min(call.debt.amount);
        let settle_pays = Asset::new(to_fill, debt_asset);
        let settle_receives = settle_pays.multiply(match_price)?;
        if settle_receives.amount == 0 {
            return Ok(Asset::new(0, debt_asset));
        }

        let session = self.start_undo_session();
        let fill = self
            .fill_call_order(call_id, settle_receives, settle_pays, fill_price)
            .and_then(|()| self.fill_settle_order(settle_id, settle_pays, settle_receives, fill_price));
        if let Err(e) = fill {
            self.undo_session(session);
            return Err(e);
        }
        match self.detect_black_swan(debt_asset) {
            Ok(SwanCheck::Swan { .. }) => {
                self.undo_session(session);
                Err(Error::BlackSwanDuringSettleMatch)
            }
            Ok(_) => {
                self.commit_undo_session(session);
                Ok(settle_pays)
            }
            Err(e) => {
                self.undo_session(session);
                Err(e)
            }
        }
    }

    /// Advance the sweep to the first settlement of the next asset.
    fn next_settlement_asset(&self, current_asset: &mut AssetId, finished: &mut bool) -> bool {
        let bound = self
            .settlement_by_expiration
            .range((
                Excluded((*current_asset, DateTime::<Utc>::MAX_UTC, SettlementId::MAX)),
                Unbounded,
            ))
            .next();
        match bound {
            Some(&(asset, _, _)) => {
                *current_asset = asset;
                *finished = false;
                true
            }
            None => false,
        }
    }

    /// Cancel expired limit orders, then drain due forced settlements.
    pub fn clear_expired_orders(&mut self) -> Result<()> {
        let head_time = self.head_block_time();

        loop {
            let front = self.limit_order_by_expiration.iter().next().copied();
            let Some((expiration, id)) = front else { break };
            if expiration > head_time {
                break;
            }
            self.cancel_limit_order(id)?;
        }

        let Some(&(first_asset, _, _)) = self.settlement_by_expiration.iter().next() else {
            return Ok(());
        };
        let mut current_asset = first_asset;
        let mut max_settlement_volume: Option<Asset> = None;
        let mut settlement_fill_price: Option<Price> = None;
        let mut settlement_price: Option<Price> = None;
        let mut current_asset_finished = false;

        // at each iteration we either consume the front order of the
        // current asset or move to the next asset
        loop {
            let Some(&(asset_of_order, _, order_id)) = self
                .settlement_by_expiration
                .range((
                    Included((current_asset, DateTime::<Utc>::MIN_UTC, SettlementId::MIN)),
                    Unbounded,
                ))
                .next()
            else {
                break;
            };
            current_asset = asset_of_order;
            let order = self.settlement(order_id)?.clone();
            let bitasset = self.bitasset(current_asset)?.clone();

            if bitasset.has_settlement() {
                tracing::info!("Canceling a force settlement because of black swan");
                self.cancel_settle_order(order_id)?;
                continue;
            }

            if order.settlement_date > head_time {
                if self.next_settlement_asset(&mut current_asset, &mut current_asset_finished) {
                    continue;
                }
                break;
            }

            let Some(feed) = bitasset.current_feed else {
                tracing::info!(
                    "Canceling a force settlement in asset {} because settlement price is null",
                    current_asset
                );
                self.cancel_settle_order(order_id)?;
                continue;
            };

            // settling for nothing
            if bitasset.options.force_settlement_offset_percent == PERCENT_100 {
                tracing::info!(
                    "Canceling a force settlement in asset {} because settlement offset is 100%",
                    current_asset
                );
                self.cancel_settle_order(order_id)?;
                continue;
            }

            if max_settlement_volume.map(|v| v.asset_id) != Some(current_asset) {
                let supply = self.asset(current_asset)?.dynamic.current_supply;
                max_settlement_volume = Some(Asset::new(
                    bitasset.max_force_settlement_volume(supply),
                    current_asset,
                ));
            }
            let max_volume = max_settlement_volume.unwrap_or(Asset::new(0, current_asset));

            // the second visit of the same order within one sweep means the
            // asset is done for this cycle
            if bitasset.force_settled_volume >= max_volume.amount || current_asset_finished {
                if self.next_settlement_asset(&mut current_asset, &mut current_asset_finished) {
                    continue;
                }
                break;
            }

            if settlement_fill_price.map(|p| p.base.asset_id) != Some(current_asset) {
                let offset = bitasset.options.force_settlement_offset_percent;
                settlement_fill_price = Some(feed.settlement_price.divide_by_ratio(Ratio::new(
                    (PERCENT_100 - offset) as i64,
                    PERCENT_100 as i64,
                ))?);
            }
            if settlement_price.map(|p| p.base.asset_id) != Some(current_asset) {
                settlement_price = settlement_fill_price;
            }
            let fill_price = settlement_fill_price.unwrap_or(feed.settlement_price);
            let match_price = settlement_price.unwrap_or(fill_price);

            let backing = bitasset.options.short_backing_asset;
            let mut settled = Asset::new(bitasset.force_settled_volume, current_asset);

            // match against the least-collateralized short until the volume
            // cap is reached or the order is gone
            while settled.amount < max_volume.amount && self.find_settlement(order_id).is_some() {
                let call_min = Price::min(backing, current_asset);
                let found = self
                    .call_order_by_collateral
                    .range((Included((call_min, CallOrderId::MIN)), Unbounded))
                    .next()
                    .copied();
                let Some((_, call_id)) = found else {
                    return Err(Error::InvariantViolation(format!(
                        "no call order exists for market-issued asset {current_asset}"
                    )));
                };
                if self.call_order(call_id)?.debt_type() != current_asset {
                    return Err(Error::InvariantViolation(format!(
                        "no call order exists for market-issued asset {current_asset}"
                    )));
                }

                if self.settlement(order_id)?.balance.amount == 0 {
                    tracing::warn!("0 settlement detected");
                    self.cancel_settle_order(order_id)?;
                    break;
                }

                let max_settlement = Asset::new(max_volume.amount - settled.amount, current_asset);
                match self.match_settle_order(
                    call_id,
                    order_id,
                    match_price,
                    max_settlement,
                    fill_price,
                ) {
                    Ok(new_settled) if new_settled.amount == 0 => {
                        // unable to fill this settle order further
                        if self.find_settlement(order_id).is_some() {
                            current_asset_finished = true;
                        }
                        break;
                    }
                    Ok(new_settled) => {
                        settled.amount += new_settled.amount;
                    }
                    Err(Error::BlackSwanDuringSettleMatch) => {
                        tracing::warn!(
                            "Cancelling a settle_order since it may trigger a black swan: {}",
                            order_id
                        );
                        self.cancel_settle_order(order_id)?;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.bitasset(current_asset)?.force_settled_volume != settled.amount {
                self.modify_bitasset(current_asset, |b| {
                    b.force_settled_volume = settled.amount;
                })?;
            }
        }
        Ok(())
    }
}
