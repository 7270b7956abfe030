//! Price feed maintenance
//!
//! Recomputes expired medians, re-runs margin checks when the margin-call
//! parameters of a median moved, and propagates changed core exchange
//! rates from the median into the asset options.

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Recompute the median feed of every asset whose feed expired.
    ///
    /// When the fresh median carries a settlement price and its margin-call
    /// parameters differ from the previous median, the margin engine runs
    /// for that asset with black swans enabled. Pending core-exchange-rate
    /// changes are folded into the asset options in the same pass.
    pub fn update_expired_feeds(&mut self) -> Result<()> {
        let head_time = self.head_block_time();

        // snapshot the expired prefix; processing reorders the index
        let expired: Vec<_> = self
            .bitasset_by_feed_expiration
            .iter()
            .take_while(|(expiration, _)| *expiration <= head_time)
            .map(|(_, asset_id)| *asset_id)
            .collect();

        for asset_id in expired {
            let Some(bitasset) = self.find_bitasset(asset_id) else {
                continue;
            };
            let old_median_feed = bitasset.current_feed;

            let mut update_cer = false;
            self.modify_bitasset(asset_id, |b| {
                b.update_median_feeds(head_time);
                if b.need_to_update_cer() {
                    update_cer = true;
                    b.asset_cer_updated = false;
                    b.feed_cer_updated = false;
                }
            })?;

            let new_median_feed = self.bitasset(asset_id)?.current_feed;
            if let Some(feed) = new_median_feed {
                let params_changed = match old_median_feed {
                    Some(old) => !feed.margin_call_params_equal(&old),
                    None => true,
                };
                if params_changed {
                    self.check_for_blackswan(asset_id, true)?;
                }
            }

            if update_cer {
                if let Some(feed) = new_median_feed {
                    let cer = feed.core_exchange_rate;
                    if self.asset(asset_id)?.options.core_exchange_rate != cer {
                        self.modify_asset(asset_id, |a| {
                            a.options.core_exchange_rate = cer;
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Propagate every pending median core exchange rate into its asset's
    /// options and clear the pending flags.
    pub fn update_core_exchange_rates(&mut self) -> Result<()> {
        loop {
            let pending = self.bitasset_cer_pending.iter().next_back().copied();
            let Some(asset_id) = pending else { break };
            let bitasset = self.bitasset(asset_id)?;
            let Some(feed) = bitasset.current_feed else {
                // clearing the flags also drops the pending entry
                self.modify_bitasset(asset_id, |b| {
                    b.asset_cer_updated = false;
                    b.feed_cer_updated = false;
                })?;
                continue;
            };

            let cer = feed.core_exchange_rate;
            if self.asset(asset_id)?.options.core_exchange_rate != cer {
                tracing::info!("Updating core exchange rate of asset {asset_id}");
                self.modify_asset(asset_id, |a| {
                    a.options.core_exchange_rate = cer;
                })?;
            }
            self.modify_bitasset(asset_id, |b| {
                b.asset_cer_updated = false;
                b.feed_cer_updated = false;
            })?;
        }
        Ok(())
    }
}
