//! Aggregated price feeds
//!
//! A [`PriceFeed`] is the per-field median of the feeds recently published
//! for a market-issued asset. The margin machinery derives all of its
//! trigger prices from it: the maximum short squeeze price, the margin call
//! order price, and the maintenance collateralization threshold.

use crate::asset::{Price, Ratio};
use crate::constants::{
    COLLATERAL_RATIO_DENOM, DEFAULT_MAINTENANCE_COLLATERAL_RATIO, DEFAULT_MAX_SHORT_SQUEEZE_RATIO,
    MAX_COLLATERAL_RATIO, MIN_COLLATERAL_RATIO,
};
use crate::error::{Error, Result};
use crate::ids::AssetId;
use serde::{Deserialize, Serialize};

/// A witness-published (or median-aggregated) price feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFeed {
    /// Feed price, denominated debt / collateral
    pub settlement_price: Price,
    /// Maintenance collateral ratio, in [`COLLATERAL_RATIO_DENOM`] units
    pub maintenance_collateral_ratio: u16,
    /// Maximum short squeeze ratio, in [`COLLATERAL_RATIO_DENOM`] units
    pub maximum_short_squeeze_ratio: u16,
    /// Price at which fees in this asset convert to the core asset
    pub core_exchange_rate: Price,
}

impl Default for PriceFeed {
    fn default() -> Self {
        Self {
            settlement_price: Price::default(),
            maintenance_collateral_ratio: DEFAULT_MAINTENANCE_COLLATERAL_RATIO,
            maximum_short_squeeze_ratio: DEFAULT_MAX_SHORT_SQUEEZE_RATIO,
            core_exchange_rate: Price::default(),
        }
    }
}

impl PriceFeed {
    /// Check structural validity.
    pub fn validate(&self) -> Result<()> {
        if !self.settlement_price.is_null() {
            self.settlement_price.validate()?;
        }
        for (name, ratio) in [
            ("maximum_short_squeeze_ratio", self.maximum_short_squeeze_ratio),
            (
                "maintenance_collateral_ratio",
                self.maintenance_collateral_ratio,
            ),
        ] {
            if !(MIN_COLLATERAL_RATIO..=MAX_COLLATERAL_RATIO).contains(&ratio) {
                return Err(Error::InvariantViolation(format!(
                    "{name} {ratio} outside [{MIN_COLLATERAL_RATIO}, {MAX_COLLATERAL_RATIO}]"
                )));
            }
        }
        Ok(())
    }

    /// Whether this feed prices the given asset.
    pub fn is_for(&self, asset_id: AssetId) -> bool {
        if !self.settlement_price.is_null() {
            return self.settlement_price.base.asset_id == asset_id;
        }
        if !self.core_exchange_rate.is_null() {
            return self.core_exchange_rate.base.asset_id == asset_id;
        }
        // an all-null feed is valid for any asset
        true
    }

    /// The worst price a margin call may be forced to accept:
    /// `settlement_price / MSSR`.
    pub fn max_short_squeeze_price(&self) -> Result<Price> {
        self.settlement_price.multiply_by_ratio(Ratio::new(
            COLLATERAL_RATIO_DENOM as i64,
            self.maximum_short_squeeze_ratio as i64,
        ))
    }

    /// The price margin calls offer on the order book:
    /// `settlement_price / (MSSR - MCFR)`, floored at 1.00.
    pub fn margin_call_order_price(&self, margin_call_fee_ratio: Option<u16>) -> Result<Price> {
        let numerator = self.margin_call_numerator(margin_call_fee_ratio);
        self.settlement_price
            .multiply_by_ratio(Ratio::new(COLLATERAL_RATIO_DENOM as i64, numerator as i64))
    }

    /// Fraction of the squeeze price a margin call actually pays out:
    /// `(MSSR - MCFR) / MSSR`, or 1/1 when no fee ratio is configured.
    pub fn margin_call_pays_ratio(&self, margin_call_fee_ratio: Option<u16>) -> Ratio {
        match margin_call_fee_ratio {
            None => Ratio::new(1, 1),
            Some(_) => Ratio::new(
                self.margin_call_numerator(margin_call_fee_ratio) as i64,
                self.maximum_short_squeeze_ratio as i64,
            ),
        }
    }

    fn margin_call_numerator(&self, margin_call_fee_ratio: Option<u16>) -> u16 {
        let mcfr = margin_call_fee_ratio.unwrap_or(0);
        let numerator = if mcfr < self.maximum_short_squeeze_ratio {
            self.maximum_short_squeeze_ratio - mcfr
        } else {
            COLLATERAL_RATIO_DENOM
        };
        numerator.max(COLLATERAL_RATIO_DENOM)
    }

    /// Collateralization below which a position is callable:
    /// `~settlement_price * MCR`, or the null price without a feed.
    pub fn maintenance_collateralization(&self) -> Result<Price> {
        if self.settlement_price.is_null() {
            return Ok(Price::default());
        }
        self.settlement_price.invert().multiply_by_ratio(Ratio::new(
            self.maintenance_collateral_ratio as i64,
            COLLATERAL_RATIO_DENOM as i64,
        ))
    }

    /// Whether the fields that drive margin calls match another feed.
    pub fn margin_call_params_equal(&self, other: &PriceFeed) -> bool {
        self.maintenance_collateral_ratio == other.maintenance_collateral_ratio
            && self.maximum_short_squeeze_ratio == other.maximum_short_squeeze_ratio
            && self.settlement_price == other.settlement_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;

    const CORE: AssetId = AssetId::CORE;
    const USD: AssetId = AssetId(1);

    fn feed(base: i64, quote: i64, mcr: u16, mssr: u16) -> PriceFeed {
        PriceFeed {
            settlement_price: Price {
                base: Asset::new(base, USD),
                quote: Asset::new(quote, CORE),
            },
            maintenance_collateral_ratio: mcr,
            maximum_short_squeeze_ratio: mssr,
            core_exchange_rate: Price::default(),
        }
    }

    #[test]
    fn test_max_short_squeeze_price() {
        // 1 USD / 1 CORE at MSSR 1.5 squeezes to 2/3
        let f = feed(1, 1, 1750, 1500);
        let mssp = f.max_short_squeeze_price().unwrap();
        assert_eq!(mssp.base.amount, 2);
        assert_eq!(mssp.quote.amount, 3);
    }

    #[test]
    fn test_margin_call_order_price_floors_at_one() {
        let f = feed(1, 1, 1750, 1200);
        // MCFR of 1500 exceeds MSSR, numerator falls back to the denominator
        let p = f.margin_call_order_price(Some(1500)).unwrap();
        assert_eq!(p, f.settlement_price);
        // MSSR - MCFR below 1.00 also floors
        let p = f.margin_call_order_price(Some(300)).unwrap();
        assert_eq!(p, f.settlement_price);
    }

    #[test]
    fn test_margin_call_pays_ratio() {
        let f = feed(1, 1, 1750, 1500);
        assert_eq!(f.margin_call_pays_ratio(None), Ratio::new(1, 1));
        assert_eq!(f.margin_call_pays_ratio(Some(100)), Ratio::new(1400, 1500));
        // floored numerator
        assert_eq!(f.margin_call_pays_ratio(Some(900)), Ratio::new(1000, 1500));
    }

    #[test]
    fn test_maintenance_collateralization() {
        let f = feed(1, 2, 1750, 1500);
        // ~(1/2) * 1.75 = 2/1 * 7/4 = 7/2 CORE / USD
        let mc = f.maintenance_collateralization().unwrap();
        assert_eq!(mc.base, Asset::new(7, CORE));
        assert_eq!(mc.quote, Asset::new(2, USD));

        let null_feed = PriceFeed::default();
        assert!(null_feed.maintenance_collateralization().unwrap().is_null());
    }

    #[test]
    fn test_validate_ratio_bounds() {
        assert!(feed(1, 1, 1750, 1500).validate().is_ok());
        assert!(feed(1, 1, 500, 1500).validate().is_err());
        assert!(feed(1, 1, 1750, 40_000).validate().is_err());
    }

    #[test]
    fn test_margin_call_params_equal_ignores_cer() {
        let a = feed(1, 1, 1750, 1500);
        let mut b = a;
        b.core_exchange_rate = Price {
            base: Asset::new(5, USD),
            quote: Asset::new(1, CORE),
        };
        assert!(a.margin_call_params_equal(&b));
        b.maintenance_collateral_ratio = 1760;
        assert!(!a.margin_call_params_equal(&b));
    }
}
