//! GHO discount-rate strategy.

use super::math::{self, MathError, WAD};
use crate::domain::{DiscountPercent, U256};

/// Discount-rate strategy parameters. `Default` is the deployed mainnet strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhoDiscountRateStrategy {
    /// GHO debt discounted per whole discount token (wad).
    pub discounted_per_discount_token: U256,
    /// Maximum discount, in basis points.
    pub discount_rate: u16,
    pub min_discount_token_balance: U256,
    pub min_debt_token_balance: U256,
}

impl Default for GhoDiscountRateStrategy {
    fn default() -> Self {
        GhoDiscountRateStrategy {
            discounted_per_discount_token: WAD * U256::from(100u64),
            discount_rate: 3_000,
            min_discount_token_balance: U256::from(1_000_000_000_000_000u64),
            min_debt_token_balance: WAD,
        }
    }
}

impl GhoDiscountRateStrategy {
    /// Discount percent for a debt balance and a discount-token balance.
    ///
    /// The result never exceeds `discount_rate`, which is itself within 10000 bps.
    pub fn calculate_discount_rate(
        &self,
        debt_balance: U256,
        discount_token_balance: U256,
    ) -> Result<DiscountPercent, MathError> {
        let max_rate = DiscountPercent::from_bps(self.discount_rate)
            .ok_or(MathError::Overflow("discount_rate"))?;

        if discount_token_balance < self.min_discount_token_balance
            || debt_balance < self.min_debt_token_balance
        {
            return Ok(DiscountPercent::default());
        }

        let discounted_balance =
            math::wad_mul(discount_token_balance, self.discounted_per_discount_token)?;
        if discounted_balance >= debt_balance {
            return Ok(max_rate);
        }

        // discounted_balance < debt_balance, so the quotient stays below discount_rate
        let rate = discounted_balance
            .checked_mul(max_rate.as_u256())
            .ok_or(MathError::Overflow("calculate_discount_rate"))?
            .checked_div(debt_balance)
            .ok_or(MathError::DivisionByZero("calculate_discount_rate"))?;
        let bps = u16::try_from(rate).map_err(|_| MathError::Overflow("calculate_discount_rate"))?;
        DiscountPercent::from_bps(bps).ok_or(MathError::Overflow("calculate_discount_rate"))
    }
}
