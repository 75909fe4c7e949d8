//! Pool-type dispatch for swap quotes.
//!
//! Constant-product pools are quoted with [`crate::math`]. Tick-indexed
//! pools have no built-in model; callers that need them install a
//! [`ConcentratedLiquidity`] implementation, otherwise quotes against those
//! pools fail with [`MathError::UnsupportedPool`] and the path is skipped.

use std::fmt::Debug;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use flash_data::types::{PoolKind, PoolSnapshot};

use crate::math::{self, MathError};

/// Quoting model for concentrated-liquidity pools.
pub trait ConcentratedLiquidity: Send + Sync + Debug {
    /// Output for selling `amount_in` of `token_in`.
    fn quote_out(
        &self,
        pool: &PoolSnapshot,
        token_in: Address,
        amount_in: U256,
    ) -> Result<U256, MathError>;

    /// Input of the counter token needed to buy exactly `amount_out` of `token_out`.
    fn quote_in(
        &self,
        pool: &PoolSnapshot,
        token_out: Address,
        amount_out: U256,
    ) -> Result<U256, MathError>;
}

/// Quotes swaps against any supported pool kind.
#[derive(Debug, Clone, Default)]
pub struct SwapQuoter {
    concentrated: Option<Arc<dyn ConcentratedLiquidity>>,
}

impl SwapQuoter {
    /// Quoter that only understands constant-product pools.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concentrated(model: Arc<dyn ConcentratedLiquidity>) -> Self {
        Self {
            concentrated: Some(model),
        }
    }

    /// Output for selling `amount_in` of `token_in` into `pool`.
    ///
    /// # Errors
    /// Propagates [`MathError`] from the pool model.
    pub fn quote_out(
        &self,
        pool: &PoolSnapshot,
        token_in: Address,
        amount_in: U256,
    ) -> Result<U256, MathError> {
        match pool.kind {
            PoolKind::ConstantProduct => {
                let (reserve_in, reserve_out) =
                    pool.reserves_for(token_in).ok_or(MathError::TokenNotInPool)?;
                math::amount_out(reserve_in, reserve_out, amount_in, pool.fee)
            }
            PoolKind::Concentrated => self
                .concentrated
                .as_ref()
                .ok_or(MathError::UnsupportedPool)?
                .quote_out(pool, token_in, amount_in),
        }
    }

    /// Input needed to buy exactly `amount_out` of `token_out` from `pool`.
    ///
    /// # Errors
    /// Propagates [`MathError`] from the pool model.
    pub fn quote_in(
        &self,
        pool: &PoolSnapshot,
        token_out: Address,
        amount_out: U256,
    ) -> Result<U256, MathError> {
        match pool.kind {
            PoolKind::ConstantProduct => {
                let token_in = pool.other_token(token_out).ok_or(MathError::TokenNotInPool)?;
                let (reserve_in, reserve_out) =
                    pool.reserves_for(token_in).ok_or(MathError::TokenNotInPool)?;
                math::amount_in_for_exact_out(reserve_in, reserve_out, amount_out, pool.fee)
            }
            PoolKind::Concentrated => self
                .concentrated
                .as_ref()
                .ok_or(MathError::UnsupportedPool)?
                .quote_in(pool, token_out, amount_out),
        }
    }
}

/// Reserves of `pool` after `amount_in` of `token_in` is swapped for `amount_out`.
///
/// # Errors
/// Returns [`MathError::TokenNotInPool`] for a foreign token and
/// [`MathError::InsufficientLiquidity`] if the output exceeds the reserve.
pub fn reserves_after_swap(
    pool: &PoolSnapshot,
    token_in: Address,
    amount_in: U256,
    amount_out: U256,
) -> Result<(U256, U256), MathError> {
    let (reserve_in, reserve_out) = pool.reserves_for(token_in).ok_or(MathError::TokenNotInPool)?;
    if amount_out >= reserve_out {
        return Err(MathError::InsufficientLiquidity {
            requested: amount_out,
            available: reserve_out,
        });
    }
    let new_in = reserve_in.checked_add(amount_in).ok_or(MathError::Overflow)?;
    let new_out = reserve_out - amount_out;
    if token_in == pool.token_a {
        Ok((new_in, new_out))
    } else {
        Ok((new_out, new_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    fn pool(kind: PoolKind) -> PoolSnapshot {
        let mut pool = PoolSnapshot::new(Address::ZERO, A, B)
            .with_reserves(U256::from(1_000_000u64), U256::from(2_000_000u64));
        pool.kind = kind;
        pool
    }

    #[derive(Debug)]
    struct FixedRate;

    impl ConcentratedLiquidity for FixedRate {
        fn quote_out(&self, _: &PoolSnapshot, _: Address, amount_in: U256) -> Result<U256, MathError> {
            Ok(amount_in * U256::from(2u8))
        }

        fn quote_in(&self, _: &PoolSnapshot, _: Address, amount_out: U256) -> Result<U256, MathError> {
            Ok(amount_out / U256::from(2u8))
        }
    }

    #[test]
    fn constant_product_respects_token_direction() {
        let quoter = SwapQuoter::new();
        let pool = pool(PoolKind::ConstantProduct);
        let a_to_b = quoter.quote_out(&pool, A, U256::from(1_000u64)).expect("quote");
        let b_to_a = quoter.quote_out(&pool, B, U256::from(1_000u64)).expect("quote");
        assert!(a_to_b > b_to_a);
        assert_eq!(
            quoter.quote_out(&pool, Address::ZERO, U256::from(1u8)),
            Err(MathError::TokenNotInPool)
        );
    }

    #[test]
    fn concentrated_requires_plugin() {
        let pool = pool(PoolKind::Concentrated);
        assert_eq!(
            SwapQuoter::new().quote_out(&pool, A, U256::from(10u8)),
            Err(MathError::UnsupportedPool)
        );

        let quoter = SwapQuoter::with_concentrated(Arc::new(FixedRate));
        assert_eq!(
            quoter.quote_out(&pool, A, U256::from(10u8)),
            Ok(U256::from(20u8))
        );
        assert_eq!(quoter.quote_in(&pool, B, U256::from(20u8)), Ok(U256::from(10u8)));
    }

    #[test]
    fn reserves_after_swap_moves_both_sides() {
        let pool = pool(PoolKind::ConstantProduct);
        let (a, b) = reserves_after_swap(&pool, B, U256::from(500u64), U256::from(200u64))
            .expect("swap fits in reserves");
        assert_eq!(a, U256::from(999_800u64));
        assert_eq!(b, U256::from(2_000_500u64));
    }
}
