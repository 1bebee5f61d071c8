//! Accrual Engine: pure scaled-balance accounting for one position.
//!
//! Functions take a read-only snapshot of the position and the event fields,
//! and return the delta to apply. They never touch the ledger.

use super::math::{self, MathError};
use super::revision::{AccrualRules, DiscountRules};
use crate::domain::{DiscountPercent, Position, ScaledDelta, TokenRole, U256};
use thiserror::Error;

/// Balance state of a position before an event is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionSnapshot {
    pub scaled_balance: U256,
    pub last_index: U256,
}

impl From<&Position> for PositionSnapshot {
    fn from(position: &Position) -> Self {
        PositionSnapshot {
            scaled_balance: position.scaled_balance,
            last_index: position.last_index,
        }
    }
}

/// What an event did to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Supply,
    Withdraw,
    Borrow,
    Repay,
    /// Interest only, no principal movement.
    Accrual,
    TransferIn,
    TransferOut,
    /// Discount burn triggered by a discount-token balance change.
    DiscountRebalance,
}

/// Interest credited between the position's snapshot and the event index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Accrual {
    /// Interest net of discount.
    pub balance_increase: U256,
    pub discount: U256,
    pub discount_scaled: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualOutcome {
    pub operation: Operation,
    pub delta: ScaledDelta,
    /// New index snapshot of the position.
    pub index: U256,
    pub accrual: Accrual,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccrualError {
    #[error(transparent)]
    Math(#[from] MathError),
    #[error("event index {index} is below the position snapshot {previous}")]
    IndexRegression { previous: U256, index: U256 },
}

/// Which side of a scaled transfer a position is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Sender,
    Recipient,
}

fn increase_operation(role: TokenRole) -> Operation {
    match role {
        TokenRole::Collateral => Operation::Supply,
        TokenRole::Debt | TokenRole::GhoDebt => Operation::Borrow,
    }
}

fn decrease_operation(role: TokenRole) -> Operation {
    match role {
        TokenRole::Collateral => Operation::Withdraw,
        TokenRole::Debt | TokenRole::GhoDebt => Operation::Repay,
    }
}

/// Interest since the snapshot, with the discount split off when the revision applies one.
pub fn accrue(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    index: U256,
    discount: DiscountPercent,
) -> Result<Accrual, AccrualError> {
    if index < snapshot.last_index {
        return Err(AccrualError::IndexRegression {
            previous: snapshot.last_index,
            index,
        });
    }

    let balance_increase =
        rules.balance_increase(snapshot.scaled_balance, snapshot.last_index, index)?;
    if !rules.applies_discount() || discount.is_zero() || balance_increase.is_zero() {
        return Ok(Accrual {
            balance_increase,
            ..Accrual::default()
        });
    }

    let discount_amount = math::percent_mul(balance_increase, discount.as_u256())?;
    let discount_scaled = math::ray_div(discount_amount, index)?;
    Ok(Accrual {
        balance_increase: math::checked_sub(balance_increase, discount_amount, "accrue")?,
        discount: discount_amount,
        discount_scaled,
    })
}

/// Actual balance of a position at `index`, after deducting the pending discount.
pub fn discounted_balance(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    index: U256,
    discount: DiscountPercent,
) -> Result<U256, MathError> {
    if snapshot.scaled_balance.is_zero() {
        return Ok(U256::ZERO);
    }
    let balance = (rules.balance_of)(snapshot.scaled_balance, index)?;
    if index == snapshot.last_index || discount.is_zero() || !rules.applies_discount() {
        return Ok(balance);
    }
    let previous = (rules.balance_of)(snapshot.scaled_balance, snapshot.last_index)?;
    let increase = math::checked_sub(balance, previous, "discounted_balance")?;
    let discount_amount = math::percent_mul(increase, discount.as_u256())?;
    math::checked_sub(balance, discount_amount, "discounted_balance")
}

/// Scaled amount removed for a decrease of `requested` actual units.
fn burned_scaled(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    requested: U256,
    index: U256,
    discount: DiscountPercent,
    accrual: &Accrual,
) -> Result<U256, AccrualError> {
    if rules.discount == DiscountRules::EnabledWithFullRepay {
        let balance_before = discounted_balance(rules, snapshot, index, discount)?;
        if requested == balance_before {
            return Ok(snapshot.scaled_balance);
        }
    }
    let amount_scaled = (rules.burn_scaled)(requested, index)?;
    amount_scaled
        .checked_add(accrual.discount_scaled)
        .ok_or(AccrualError::Math(MathError::Overflow("burned_scaled")))
}

/// Apply a `Mint(value, balance_increase, index)` log to the `on_behalf_of` position.
///
/// Scaled tokens emit `Mint` both for supply/borrow (`value > balance_increase`)
/// and for withdraw/repay smaller than the accrued interest
/// (`balance_increase > value`).
pub fn process_mint(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    value: U256,
    event_balance_increase: U256,
    index: U256,
    discount: DiscountPercent,
) -> Result<AccrualOutcome, AccrualError> {
    let accrual = accrue(rules, snapshot, index, discount)?;

    let (operation, delta) = if value > event_balance_increase {
        let amount_scaled = (rules.mint_scaled)(value - event_balance_increase, index)?;
        (
            increase_operation(rules.role),
            ScaledDelta::net(amount_scaled, accrual.discount_scaled),
        )
    } else if event_balance_increase > value {
        let requested = event_balance_increase - value;
        let burned = burned_scaled(rules, snapshot, requested, index, discount, &accrual)?;
        (decrease_operation(rules.role), ScaledDelta::Decrease(burned))
    } else {
        (
            Operation::Accrual,
            ScaledDelta::net(U256::ZERO, accrual.discount_scaled),
        )
    };

    Ok(AccrualOutcome {
        operation,
        delta,
        index,
        accrual,
    })
}

/// Apply a `Burn(value, balance_increase, index)` log to the `from` position.
pub fn process_burn(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    value: U256,
    event_balance_increase: U256,
    index: U256,
    discount: DiscountPercent,
) -> Result<AccrualOutcome, AccrualError> {
    let accrual = accrue(rules, snapshot, index, discount)?;
    let requested = value
        .checked_add(event_balance_increase)
        .ok_or(AccrualError::Math(MathError::Overflow("process_burn")))?;
    let burned = burned_scaled(rules, snapshot, requested, index, discount, &accrual)?;

    Ok(AccrualOutcome {
        operation: decrease_operation(rules.role),
        delta: ScaledDelta::Decrease(burned),
        index,
        accrual,
    })
}

/// One side of a `BalanceTransfer`; `scaled_amount` is already scaled.
pub fn process_transfer(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    scaled_amount: U256,
    index: U256,
    side: TransferSide,
) -> Result<AccrualOutcome, AccrualError> {
    let accrual = accrue(rules, snapshot, index, DiscountPercent::default())?;
    let (operation, delta) = match side {
        TransferSide::Sender => (Operation::TransferOut, ScaledDelta::Decrease(scaled_amount)),
        TransferSide::Recipient => (Operation::TransferIn, ScaledDelta::Increase(scaled_amount)),
    };
    Ok(AccrualOutcome {
        operation,
        delta,
        index,
        accrual,
    })
}

/// Accrue a debt position and burn its discount, with no principal movement.
pub fn process_discount_rebalance(
    rules: &AccrualRules,
    snapshot: &PositionSnapshot,
    index: U256,
    discount: DiscountPercent,
) -> Result<AccrualOutcome, AccrualError> {
    let accrual = accrue(rules, snapshot, index, discount)?;
    Ok(AccrualOutcome {
        operation: Operation::DiscountRebalance,
        delta: ScaledDelta::net(U256::ZERO, accrual.discount_scaled),
        index,
        accrual,
    })
}
