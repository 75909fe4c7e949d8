//! Exact-integer constant-product swap math.
//!
//! All arithmetic is `U256` with the fee kept as a rational `n/d`, so every
//! result matches what the pair contract computes on-chain. Outputs round
//! down and required inputs round up: a plan built from these numbers never
//! expects more than a pool will pay out and never under-pays a repayment.

use alloy::primitives::U256;
use flash_data::types::Fee;
use thiserror::Error;

/// Reasons a quote cannot be produced.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MathError {
    #[error("pool has an empty reserve")]
    EmptyReserves,
    #[error("requested output {requested} is not below reserve {available}")]
    InsufficientLiquidity { requested: U256, available: U256 },
    #[error("fee {numerator}/{denominator} is not a proper fraction")]
    InvalidFee { numerator: u32, denominator: u32 },
    #[error("arithmetic overflow")]
    Overflow,
    #[error("token is not traded by the pool")]
    TokenNotInPool,
    #[error("no quoting model for this pool type")]
    UnsupportedPool,
}

fn check_inputs(reserve_in: U256, reserve_out: U256, fee: Fee) -> Result<(), MathError> {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(MathError::EmptyReserves);
    }
    if !fee.is_valid() {
        return Err(MathError::InvalidFee {
            numerator: fee.numerator,
            denominator: fee.denominator,
        });
    }
    Ok(())
}

/// Output received for selling `amount_in` into a pool.
///
/// `floor(reserve_out * amount_in * (d - n) / (reserve_in * d + amount_in * (d - n)))`
///
/// # Errors
/// Returns [`MathError::EmptyReserves`] for a zero reserve, and
/// [`MathError::Overflow`] if an intermediate product exceeds 256 bits.
pub fn amount_out(
    reserve_in: U256,
    reserve_out: U256,
    amount_in: U256,
    fee: Fee,
) -> Result<U256, MathError> {
    check_inputs(reserve_in, reserve_out, fee)?;
    if amount_in.is_zero() {
        return Ok(U256::ZERO);
    }

    let amount_in_with_fee = amount_in
        .checked_mul(U256::from(fee.retained()))
        .ok_or(MathError::Overflow)?;
    let numerator = amount_in_with_fee
        .checked_mul(reserve_out)
        .ok_or(MathError::Overflow)?;
    let denominator = reserve_in
        .checked_mul(U256::from(fee.denominator))
        .and_then(|scaled| scaled.checked_add(amount_in_with_fee))
        .ok_or(MathError::Overflow)?;

    Ok(numerator / denominator)
}

/// Minimum input that buys exactly `amount_out` from a pool.
///
/// `ceil(reserve_in * amount_out * d / ((reserve_out - amount_out) * (d - n)))`
///
/// # Errors
/// Returns [`MathError::InsufficientLiquidity`] when `amount_out >= reserve_out`
/// (the formula is undefined there), plus the errors of [`amount_out`].
pub fn amount_in_for_exact_out(
    reserve_in: U256,
    reserve_out: U256,
    amount_out: U256,
    fee: Fee,
) -> Result<U256, MathError> {
    check_inputs(reserve_in, reserve_out, fee)?;
    if amount_out >= reserve_out {
        return Err(MathError::InsufficientLiquidity {
            requested: amount_out,
            available: reserve_out,
        });
    }
    if amount_out.is_zero() {
        return Ok(U256::ZERO);
    }

    let numerator = reserve_in
        .checked_mul(amount_out)
        .and_then(|product| product.checked_mul(U256::from(fee.denominator)))
        .ok_or(MathError::Overflow)?;
    let denominator = (reserve_out - amount_out)
        .checked_mul(U256::from(fee.retained()))
        .ok_or(MathError::Overflow)?;

    Ok(div_ceil(numerator, denominator))
}

#[inline]
fn div_ceil(numerator: U256, denominator: U256) -> U256 {
    let quotient = numerator / denominator;
    if (numerator % denominator).is_zero() {
        quotient
    } else {
        quotient + U256::from(1u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(value: u128) -> U256 {
        U256::from(value)
    }

    #[test]
    fn matches_uniswap_v2_get_amount_out() {
        // 1 ETH into a 100 ETH / 200k USDC pool.
        let out = amount_out(
            u(100_000_000_000_000_000_000),
            u(200_000_000_000),
            u(1_000_000_000_000_000_000),
            Fee::STANDARD,
        )
        .expect("valid quote");
        // (1e18*997*2e11) / (1e20*1000 + 1e18*997)
        assert_eq!(out, u(1_974_316_068));
    }

    #[test]
    fn zero_input_yields_zero() {
        assert_eq!(
            amount_out(u(10), u(10), U256::ZERO, Fee::STANDARD).expect("valid quote"),
            U256::ZERO
        );
    }

    #[test]
    fn empty_reserves_are_rejected() {
        assert_eq!(
            amount_out(U256::ZERO, u(10), u(1), Fee::STANDARD),
            Err(MathError::EmptyReserves)
        );
        assert_eq!(
            amount_in_for_exact_out(u(10), U256::ZERO, u(1), Fee::STANDARD),
            Err(MathError::EmptyReserves)
        );
    }

    #[test]
    fn exact_out_at_or_above_reserve_is_rejected() {
        assert!(matches!(
            amount_in_for_exact_out(u(1_000), u(1_000), u(1_000), Fee::STANDARD),
            Err(MathError::InsufficientLiquidity { .. })
        ));
        assert!(matches!(
            amount_in_for_exact_out(u(1_000), u(1_000), u(5_000), Fee::STANDARD),
            Err(MathError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn required_input_rounds_up() {
        // 1000 * 10 * 1000 / (990 * 997) = 10.131..., so 11.
        assert_eq!(
            amount_in_for_exact_out(u(1_000), u(1_000), u(10), Fee::STANDARD).expect("valid quote"),
            u(11)
        );
    }

    #[test]
    fn inverse_never_underpays() {
        let reserves = [
            (1_000_000u128, 1_000_000u128),
            (1_030_000, 1_000_000),
            (7, 1_000_000_000_000),
            (5_000_000_000_000_000_000_000, 3_000_000_000_000),
        ];
        let fees = [Fee::STANDARD, Fee::new(25, 10_000), Fee::new(1, 100)];

        for (reserve_in, reserve_out) in reserves {
            for fee in fees {
                for amount in [1u128, 2, 17, 999, 123_456, 999_999] {
                    if amount < reserve_out {
                        let required =
                            amount_in_for_exact_out(u(reserve_in), u(reserve_out), u(amount), fee)
                                .expect("valid inverse quote");
                        let received = amount_out(u(reserve_in), u(reserve_out), required, fee)
                            .expect("valid forward quote");
                        assert!(received >= u(amount), "paying {required} must buy at least {amount}");
                    }

                    let out = amount_out(u(reserve_in), u(reserve_out), u(amount), fee)
                        .expect("valid forward quote");
                    let required = amount_in_for_exact_out(u(reserve_in), u(reserve_out), out, fee)
                        .expect("forward output is always below reserve");
                    assert!(required <= u(amount), "{out} must not cost more than {amount}");
                }
            }
        }
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(
            amount_out(U256::MAX, U256::MAX, U256::MAX, Fee::STANDARD),
            Err(MathError::Overflow)
        );
    }
}
