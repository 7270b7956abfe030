//! Fixed-point asset and price arithmetic
//!
//! An [`Asset`] is a signed 64-bit amount tagged with an asset id. A
//! [`Price`] is a ratio of two assets with distinct ids. All products of
//! amounts are taken in 128 bits, and prices are compared by
//! cross-multiplication so that equivalent fractions compare equal without
//! ever being reduced.
//!
//! The rescale in [`Price::multiply_by_ratio`] is the single most delicate
//! routine in the kernel: when the ideal rescaled rational does not fit in
//! the bounded amount range it is shrunk and then corrected against a
//! second candidate by exact absolute difference. Both the shrink sequence
//! and the tie-break are consensus-visible.

use crate::constants::{COLLATERAL_RATIO_DENOM, MAX_SHARE_SUPPLY};
use crate::error::{Error, Result};
use crate::ids::AssetId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An amount of a specific asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Asset {
    /// Amount in the asset's smallest unit
    pub amount: i64,
    /// The asset the amount is denominated in
    pub asset_id: AssetId,
}

impl Asset {
    /// Create an amount of the given asset.
    pub fn new(amount: i64, asset_id: AssetId) -> Self {
        Self { amount, asset_id }
    }

    /// Convert this amount to the opposite leg of `price`, rounding down.
    ///
    /// Fails if this asset matches neither leg, if the dividing leg is not
    /// positive, or if the result exceeds [`MAX_SHARE_SUPPLY`].
    pub fn multiply(self, price: Price) -> Result<Asset> {
        if self.asset_id == price.base.asset_id {
            if price.base.amount <= 0 {
                return Err(Error::DivisionByZero(format!(
                    "price base amount {} is not positive",
                    price.base.amount
                )));
            }
            let result =
                self.amount as i128 * price.quote.amount as i128 / price.base.amount as i128;
            if result > MAX_SHARE_SUPPLY as i128 {
                return Err(Error::Overflow(format!(
                    "{} * price exceeds max share supply",
                    self.amount
                )));
            }
            Ok(Asset::new(result as i64, price.quote.asset_id))
        } else if self.asset_id == price.quote.asset_id {
            if price.quote.amount <= 0 {
                return Err(Error::DivisionByZero(format!(
                    "price quote amount {} is not positive",
                    price.quote.amount
                )));
            }
            let result =
                self.amount as i128 * price.base.amount as i128 / price.quote.amount as i128;
            if result > MAX_SHARE_SUPPLY as i128 {
                return Err(Error::Overflow(format!(
                    "{} * price exceeds max share supply",
                    self.amount
                )));
            }
            Ok(Asset::new(result as i64, price.base.asset_id))
        } else {
            Err(Error::InvariantViolation(format!(
                "asset {} belongs to neither leg of the price",
                self.asset_id
            )))
        }
    }

    /// Convert this amount to the opposite leg of `price`, rounding up.
    pub fn multiply_and_round_up(self, price: Price) -> Result<Asset> {
        if self.asset_id == price.base.asset_id {
            if price.base.amount <= 0 {
                return Err(Error::DivisionByZero(format!(
                    "price base amount {} is not positive",
                    price.base.amount
                )));
            }
            let result = (self.amount as i128 * price.quote.amount as i128
                + price.base.amount as i128
                - 1)
                / price.base.amount as i128;
            if result > MAX_SHARE_SUPPLY as i128 {
                return Err(Error::Overflow(format!(
                    "{} * price exceeds max share supply",
                    self.amount
                )));
            }
            Ok(Asset::new(result as i64, price.quote.asset_id))
        } else if self.asset_id == price.quote.asset_id {
            if price.quote.amount <= 0 {
                return Err(Error::DivisionByZero(format!(
                    "price quote amount {} is not positive",
                    price.quote.amount
                )));
            }
            let result = (self.amount as i128 * price.base.amount as i128
                + price.quote.amount as i128
                - 1)
                / price.quote.amount as i128;
            if result > MAX_SHARE_SUPPLY as i128 {
                return Err(Error::Overflow(format!(
                    "{} * price exceeds max share supply",
                    self.amount
                )));
            }
            Ok(Asset::new(result as i64, price.base.asset_id))
        } else {
            Err(Error::InvariantViolation(format!(
                "asset {} belongs to neither leg of the price",
                self.asset_id
            )))
        }
    }
}

/// A positive rational scale factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    /// Numerator
    pub num: i64,
    /// Denominator
    pub den: i64,
}

impl Ratio {
    /// Create a ratio. Validity (both legs positive) is checked at the
    /// point of use.
    pub fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// The reciprocal ratio.
    pub fn inverse(self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }
}

/// The relative value of two assets, `base / quote`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Price {
    /// Base leg
    pub base: Asset,
    /// Quote leg
    pub quote: Asset,
}

impl Price {
    /// Create a price from two assets with distinct ids.
    pub fn new(base: Asset, quote: Asset) -> Result<Self> {
        if base.asset_id == quote.asset_id {
            return Err(Error::InvariantViolation(format!(
                "price legs share asset {}",
                base.asset_id
            )));
        }
        Ok(Self { base, quote })
    }

    /// Smallest representable price of `base` in terms of `quote`.
    pub fn min(base: AssetId, quote: AssetId) -> Self {
        Self {
            base: Asset::new(1, base),
            quote: Asset::new(MAX_SHARE_SUPPLY, quote),
        }
    }

    /// Largest representable price of `base` in terms of `quote`.
    pub fn max(base: AssetId, quote: AssetId) -> Self {
        Self {
            base: Asset::new(MAX_SHARE_SUPPLY, base),
            quote: Asset::new(1, quote),
        }
    }

    /// True for the all-zero null price.
    pub fn is_null(&self) -> bool {
        self.base.asset_id == AssetId::CORE && self.quote.asset_id == AssetId::CORE
    }

    /// Check structural validity: positive legs, distinct ids.
    pub fn validate(&self) -> Result<()> {
        if self.base.amount <= 0 {
            return Err(Error::InvariantViolation(format!(
                "price base amount {} is not positive",
                self.base.amount
            )));
        }
        if self.quote.amount <= 0 {
            return Err(Error::InvariantViolation(format!(
                "price quote amount {} is not positive",
                self.quote.amount
            )));
        }
        if self.base.asset_id == self.quote.asset_id {
            return Err(Error::InvariantViolation(format!(
                "price legs share asset {}",
                self.base.asset_id
            )));
        }
        Ok(())
    }

    /// Logical inverse: swap base and quote.
    pub fn invert(self) -> Self {
        Self {
            base: self.quote,
            quote: self.base,
        }
    }

    /// Rescale by a positive ratio, squeezing the result back into the
    /// bounded amount range.
    ///
    /// The ideal rescaled rational is computed exactly in 128 bits. If a
    /// leg exceeds [`MAX_SHARE_SUPPLY`] both legs are halved until they
    /// fit, or clamped to `(1, MAX)` / `(MAX, 1)` when one leg bottoms out
    /// at 1. A shrunk result is then compared against a divide-one-leg
    /// candidate by exact absolute difference from the ideal rational and
    /// the closer candidate wins. If the survivor crossed the original
    /// price against the ratio's direction, the original price is returned
    /// unchanged.
    pub fn multiply_by_ratio(self, r: Ratio) -> Result<Price> {
        self.validate()?;
        if r.num <= 0 || r.den <= 0 {
            return Err(Error::InvariantViolation(format!(
                "ratio {}/{} is not positive",
                r.num, r.den
            )));
        }
        if r.num == r.den {
            return Ok(self);
        }

        let p128 = Rational::new(self.base.amount as i128, self.quote.amount as i128)?;
        let r128 = Rational::new(r.num as i128, r.den as i128)?;
        let ocp = p128.mul(r128)?;
        let mut cp = ocp;

        let mut shrunk = false;
        let mut using_max = false;
        let max = MAX_SHARE_SUPPLY as i128;
        while cp.num > max || cp.den > max {
            if cp.num == 1 {
                cp = Rational::new(1, max)?;
                using_max = true;
                break;
            } else if cp.den == 1 {
                cp = Rational::new(max, 1)?;
                using_max = true;
                break;
            } else {
                cp = Rational::new(cp.num >> 1, cp.den >> 1)?;
                shrunk = true;
            }
        }
        if shrunk {
            // the halved result may not be accurate enough; derive a second
            // candidate by integer-dividing the larger leg of the exact
            // rational and keep whichever lands closer
            let mut num = ocp.num;
            let mut den = ocp.den;
            if num > den {
                num /= den;
                if num > max {
                    num = max;
                }
                den = 1;
            } else {
                den /= num;
                if den > max {
                    den = max;
                }
                num = 1;
            }
            let ncp = Rational::new(num, den)?;
            if num == max || den == max {
                cp = ncp;
            } else {
                let diff1 = ncp.sub(ocp)?.abs();
                let diff2 = cp.sub(ocp)?.abs();
                if diff1.lt(diff2) {
                    cp = ncp;
                }
            }
        }

        let mut np = Price {
            base: Asset::new(cp.num as i64, self.base.asset_id),
            quote: Asset::new(cp.den as i64, self.quote.asset_id),
        };

        if shrunk || using_max {
            // the squeezed price must not cross the original against the
            // ratio's direction
            if (r.num > r.den && np < self) || (r.num < r.den && np > self) {
                np = self;
            }
        }

        np.validate()?;
        Ok(np)
    }

    /// Rescale by the reciprocal of a ratio.
    pub fn divide_by_ratio(self, r: Ratio) -> Result<Price> {
        self.multiply_by_ratio(r.inverse())
    }

    /// The price at which a margin position becomes callable.
    ///
    /// `(debt * cr) / (collateral * CR_DENOM)`, with both legs shifted down
    /// until they fit the bounded range; each halving rounds the shifted
    /// halves up so the collateral leg can never reach zero. The result is
    /// denominated collateral / debt.
    pub fn call_price(debt: Asset, collateral: Asset, collateral_ratio: u16) -> Result<Price> {
        let swan = Rational::new(debt.amount as i128, collateral.amount as i128)?;
        let ratio = Rational::new(collateral_ratio as i128, COLLATERAL_RATIO_DENOM as i128)?;
        let mut cp = swan.mul(ratio)?;

        let max = MAX_SHARE_SUPPLY as i128;
        while cp.num > max || cp.den > max {
            cp = Rational::new((cp.num >> 1) + 1, (cp.den >> 1) + 1)?;
        }

        Ok(Price {
            base: Asset::new(cp.den as i64, collateral.asset_id),
            quote: Asset::new(cp.num as i64, debt.asset_id),
        })
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        if (self.base.asset_id, self.quote.asset_id) != (other.base.asset_id, other.quote.asset_id)
        {
            return false;
        }
        let amult = other.quote.amount as i128 * self.base.amount as i128;
        let bmult = self.quote.amount as i128 * other.base.amount as i128;
        amult == bmult
    }
}

impl Eq for Price {}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base
            .asset_id
            .cmp(&other.base.asset_id)
            .then_with(|| self.quote.asset_id.cmp(&other.quote.asset_id))
            .then_with(|| {
                let amult = other.quote.amount as i128 * self.base.amount as i128;
                let bmult = self.quote.amount as i128 * other.base.amount as i128;
                amult.cmp(&bmult)
            })
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Exact 128-bit rational, normalized to lowest terms with a positive
/// denominator on every construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rational {
    num: i128,
    den: i128,
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    fn new(num: i128, den: i128) -> Result<Self> {
        if den == 0 {
            return Err(Error::DivisionByZero("zero rational denominator".into()));
        }
        let (mut num, mut den) = if den < 0 {
            (
                num.checked_neg()
                    .ok_or_else(|| Error::Overflow("rational negation".into()))?,
                den.checked_neg()
                    .ok_or_else(|| Error::Overflow("rational negation".into()))?,
            )
        } else {
            (num, den)
        };
        let g = gcd(num.unsigned_abs(), den.unsigned_abs());
        if g > 1 {
            num /= g as i128;
            den /= g as i128;
        }
        if num == 0 {
            den = 1;
        }
        Ok(Self { num, den })
    }

    fn mul(self, other: Self) -> Result<Self> {
        // reduce across the diagonal first to keep intermediates small
        let g1 = gcd(self.num.unsigned_abs(), other.den.unsigned_abs()).max(1) as i128;
        let g2 = gcd(other.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i128;
        let num = (self.num / g1)
            .checked_mul(other.num / g2)
            .ok_or_else(|| Error::Overflow("rational multiplication".into()))?;
        let den = (self.den / g2)
            .checked_mul(other.den / g1)
            .ok_or_else(|| Error::Overflow("rational multiplication".into()))?;
        Rational::new(num, den)
    }

    fn sub(self, other: Self) -> Result<Self> {
        let g = gcd(self.den.unsigned_abs(), other.den.unsigned_abs()).max(1) as i128;
        let lhs = self
            .num
            .checked_mul(other.den / g)
            .ok_or_else(|| Error::Overflow("rational subtraction".into()))?;
        let rhs = other
            .num
            .checked_mul(self.den / g)
            .ok_or_else(|| Error::Overflow("rational subtraction".into()))?;
        let num = lhs
            .checked_sub(rhs)
            .ok_or_else(|| Error::Overflow("rational subtraction".into()))?;
        let den = (self.den / g)
            .checked_mul(other.den)
            .ok_or_else(|| Error::Overflow("rational subtraction".into()))?;
        Rational::new(num, den)
    }

    fn abs(self) -> Self {
        Self {
            num: self.num.abs(),
            den: self.den,
        }
    }

    /// Exact comparison by simple continued-fraction expansion.
    ///
    /// Cross-multiplying two already-large rationals can exceed 128 bits;
    /// expanding both sides with the Euclidean algorithm and comparing
    /// component-wise never grows past the inputs.
    fn lt(self, other: Self) -> bool {
        let (mut tn, mut td) = (self.num, self.den);
        let (mut rn, mut rd) = (other.num, other.den);
        let mut tq = tn.div_euclid(td);
        let mut tr = tn.rem_euclid(td);
        let mut rq = rn.div_euclid(rd);
        let mut rr = rn.rem_euclid(rd);
        // reciprocation at each level of the expansion flips the order
        let mut reverse = false;
        loop {
            if tq != rq {
                return if reverse { tq > rq } else { tq < rq };
            }
            reverse = !reverse;
            if tr == 0 || rr == 0 {
                break;
            }
            tn = td;
            td = tr;
            tq = tn / td;
            tr = tn % td;
            rn = rd;
            rd = rr;
            rq = rn / rd;
            rr = rn % rd;
        }
        if tr == rr {
            false
        } else {
            (tr != 0) != reverse
        }
    }
}
