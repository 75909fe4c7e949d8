//! Executor payload assembly.
//!
//! An accepted opportunity becomes an ordered list of calls the executor
//! contract replays inside the borrow pool's flash-swap callback:
//!
//! 1. `transfer` the borrowed token to the first swap pool;
//! 2. one `swap(amount0Out, amount1Out, to, "")` per swap pool, each sending
//!    its output to the next pool and the last one to the executor;
//! 3. `transfer` the repay amount back to the borrow pool.
//!
//! The steps are ABI-encoded as `(address,bytes,uint256)[]` and passed as
//! the `data` argument of the borrow pool's own `swap`, which the executor
//! calls through `execute_packed_payload`.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolValue};
use flash_data::registry::CycleDefinition;
use flash_sim::cycle::{HopAmounts, OpportunityResult};
use flash_sim::view::PathSnapshot;
use thiserror::Error;

sol! {
    interface IUniswapV2PairSwap {
        function swap(uint256 amount0Out, uint256 amount1Out, address to, bytes data) external;
    }

    interface IERC20Transfer {
        function transfer(address to, uint256 amount) external returns (bool);
    }

    struct Payload {
        address target;
        bytes data;
        uint256 value;
    }

    interface IFlashExecutor {
        function execute_packed_payload(address pool, bytes payload, uint256 bribe) external payable;
    }
}

/// One call the executor makes on behalf of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadStep {
    pub target: Address,
    pub calldata: Bytes,
    pub value: U256,
}

impl PayloadStep {
    fn call(target: Address, calldata: Vec<u8>) -> Self {
        Self {
            target,
            calldata: Bytes::from(calldata),
            value: U256::ZERO,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("opportunity has no hop amounts")]
    MissingHops,
    #[error("opportunity has {hops} hops but the path has {pools} pools")]
    HopCountMismatch { hops: usize, pools: usize },
    #[error("hop through {pool} does not match the cycle path")]
    PathMismatch { pool: Address },
}

/// Calldata for the borrow pool's flash swap plus the executor wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPayload {
    pub steps: Vec<PayloadStep>,
    pub borrow_pool: Address,
    /// Borrow pool `swap` calldata carrying the encoded steps.
    pub packed_swap: Bytes,
}

impl ExecutionPayload {
    /// Builds the step list for `opportunity` over `path`.
    ///
    /// # Errors
    /// Returns [`PayloadError`] if the recorded hops do not line up with
    /// the cycle's pools.
    pub fn build(
        cycle: &CycleDefinition,
        opportunity: &OpportunityResult,
        path: &PathSnapshot,
        executor: Address,
    ) -> Result<Self, PayloadError> {
        let Some(borrow_hop) = opportunity.hops.first() else {
            return Err(PayloadError::MissingHops);
        };
        if opportunity.hops.len() != path.pools().len() {
            return Err(PayloadError::HopCountMismatch {
                hops: opportunity.hops.len(),
                pools: path.pools().len(),
            });
        }
        for (hop, pool) in opportunity.hops.iter().zip(cycle.pools()) {
            if hop.pool != *pool {
                return Err(PayloadError::PathMismatch { pool: hop.pool });
            }
        }

        let swap_hops = opportunity.swap_hops();
        let swap_pools = path.swap_pools();
        let first_pool = swap_pools
            .first()
            .map(|pool| pool.address)
            .ok_or(PayloadError::MissingHops)?;

        let mut steps = Vec::with_capacity(swap_hops.len() + 2);
        steps.push(PayloadStep::call(
            cycle.borrow_token,
            IERC20Transfer::transferCall {
                to: first_pool,
                amount: opportunity.borrow_amount,
            }
            .abi_encode(),
        ));

        for (index, (hop, pool)) in swap_hops.iter().zip(swap_pools).enumerate() {
            let recipient = swap_pools
                .get(index + 1)
                .map_or(executor, |next| next.address);
            let (amount0_out, amount1_out) = split_output(hop, pool.token_a);
            steps.push(PayloadStep::call(
                pool.address,
                IUniswapV2PairSwap::swapCall {
                    amount0Out: amount0_out,
                    amount1Out: amount1_out,
                    to: recipient,
                    data: Bytes::new(),
                }
                .abi_encode(),
            ));
        }

        steps.push(PayloadStep::call(
            cycle.repay_token,
            IERC20Transfer::transferCall {
                to: cycle.borrow_pool,
                amount: opportunity.repay_amount,
            }
            .abi_encode(),
        ));

        let borrow_pool = path.borrow_pool().ok_or(PayloadError::MissingHops)?;
        let (amount0_out, amount1_out) = split_output(borrow_hop, borrow_pool.token_a);
        let packed_swap = IUniswapV2PairSwap::swapCall {
            amount0Out: amount0_out,
            amount1Out: amount1_out,
            to: executor,
            data: encode_steps(&steps),
        }
        .abi_encode();

        Ok(Self {
            steps,
            borrow_pool: borrow_pool.address,
            packed_swap: Bytes::from(packed_swap),
        })
    }

    /// Calldata for the executor contract.
    pub fn executor_calldata(&self, bribe: U256) -> Bytes {
        Bytes::from(
            IFlashExecutor::execute_packed_payloadCall {
                pool: self.borrow_pool,
                payload: self.packed_swap.clone(),
                bribe,
            }
            .abi_encode(),
        )
    }
}

/// `(amount0Out, amount1Out)` for a hop, by the pool's token ordering.
fn split_output(hop: &HopAmounts, token0: Address) -> (U256, U256) {
    if hop.token_out == token0 {
        (hop.amount_out, U256::ZERO)
    } else {
        (U256::ZERO, hop.amount_out)
    }
}

/// ABI-encodes steps as a single `(address,bytes,uint256)[]` value.
pub fn encode_steps(steps: &[PayloadStep]) -> Bytes {
    let payloads: Vec<Payload> = steps
        .iter()
        .map(|step| Payload {
            target: step.target,
            data: step.calldata.clone(),
            value: step.value,
        })
        .collect();
    Bytes::from(payloads.abi_encode())
}
