//! Checked fixed-point arithmetic on 256-bit words (wad, ray, percentage).
//!
//! Every operation replays the on-chain library it is named after. An
//! intermediate overflow or a zero divisor is an error, never a wrap or a clamp.

use alloy_primitives::U256;
use thiserror::Error;

/// 1e18
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);
pub const HALF_WAD: U256 = U256::from_limbs([500_000_000_000_000_000, 0, 0, 0]);
/// 1e27
pub const RAY: U256 = U256::from_limbs([11_515_845_246_265_065_472, 54_210_108, 0, 0]);
pub const HALF_RAY: U256 = U256::from_limbs([5_757_922_623_132_532_736, 27_105_054, 0, 0]);
/// 100.00% in basis points.
pub const PERCENTAGE_FACTOR: U256 = U256::from_limbs([10_000, 0, 0, 0]);
pub const HALF_PERCENTAGE_FACTOR: U256 = U256::from_limbs([5_000, 0, 0, 0]);

/// Failure of a fixed-point operation. Carries the name of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("overflow in {0}")]
    Overflow(&'static str),
    #[error("underflow in {0}")]
    Underflow(&'static str),
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
}

pub type MathResult = Result<U256, MathError>;

fn checked_mul(a: U256, b: U256, op: &'static str) -> MathResult {
    a.checked_mul(b).ok_or(MathError::Overflow(op))
}

fn checked_add(a: U256, b: U256, op: &'static str) -> MathResult {
    a.checked_add(b).ok_or(MathError::Overflow(op))
}

/// `a - b`, failing instead of wrapping when `b > a`.
pub fn checked_sub(a: U256, b: U256, op: &'static str) -> MathResult {
    a.checked_sub(b).ok_or(MathError::Underflow(op))
}

fn ceil_div(numerator: U256, denominator: U256, op: &'static str) -> MathResult {
    let quotient = numerator / denominator;
    if (numerator % denominator).is_zero() {
        Ok(quotient)
    } else {
        checked_add(quotient, U256::from(1u64), op)
    }
}

/// `(a * b + HALF_RAY) / RAY`
pub fn ray_mul(a: U256, b: U256) -> MathResult {
    let product = checked_mul(a, b, "ray_mul")?;
    Ok(checked_add(product, HALF_RAY, "ray_mul")? / RAY)
}

/// `a * b / RAY`, rounded down.
pub fn ray_mul_floor(a: U256, b: U256) -> MathResult {
    Ok(checked_mul(a, b, "ray_mul_floor")? / RAY)
}

/// `a * b / RAY`, rounded up.
pub fn ray_mul_ceil(a: U256, b: U256) -> MathResult {
    let product = checked_mul(a, b, "ray_mul_ceil")?;
    ceil_div(product, RAY, "ray_mul_ceil")
}

/// `(a * RAY + b / 2) / b`
pub fn ray_div(a: U256, b: U256) -> MathResult {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("ray_div"));
    }
    let scaled = checked_mul(a, RAY, "ray_div")?;
    Ok(checked_add(scaled, b >> 1, "ray_div")? / b)
}

/// `a * RAY / b`, rounded down.
pub fn ray_div_floor(a: U256, b: U256) -> MathResult {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("ray_div_floor"));
    }
    Ok(checked_mul(a, RAY, "ray_div_floor")? / b)
}

/// `a * RAY / b`, rounded up.
pub fn ray_div_ceil(a: U256, b: U256) -> MathResult {
    if b.is_zero() {
        return Err(MathError::DivisionByZero("ray_div_ceil"));
    }
    let scaled = checked_mul(a, RAY, "ray_div_ceil")?;
    ceil_div(scaled, b, "ray_div_ceil")
}

/// `(a * b + HALF_WAD) / WAD`
pub fn wad_mul(a: U256, b: U256) -> MathResult {
    let product = checked_mul(a, b, "wad_mul")?;
    Ok(checked_add(product, HALF_WAD, "wad_mul")? / WAD)
}

/// `(value * percentage + HALF_PERCENTAGE_FACTOR) / PERCENTAGE_FACTOR`
pub fn percent_mul(value: U256, percentage: U256) -> MathResult {
    let product = checked_mul(value, percentage, "percent_mul")?;
    Ok(checked_add(product, HALF_PERCENTAGE_FACTOR, "percent_mul")? / PERCENTAGE_FACTOR)
}
