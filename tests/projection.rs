//! Pending router swaps projected over the live store into backrun results.

mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use common::*;
use flash_data::types::PendingTransaction;
use flash_sim::decoder::uniswap_v2::UniswapV2Router02 as Router;
use flash_sim::optimizer::{optimize_cycles, optimize_projection};
use flash_sim::projector::ProjectionError;
use flash_sim::{CycleBook, CycleOptimizer, MempoolProjector};

fn balanced() -> Vec<(Address, U256, U256)> {
    vec![
        (POOL_USDC_WETH, eth(1_000), eth(1_000)),
        (POOL_DAI_USDC, eth(1_000), eth(1_000)),
        (POOL_DAI_WETH, eth(1_000), eth(1_000)),
    ]
}

fn router_tx(hash: u8, input: Vec<u8>, value: U256) -> PendingTransaction {
    PendingTransaction {
        hash: B256::repeat_byte(hash),
        from: Address::repeat_byte(0x99),
        to: Some(ROUTER),
        input: Bytes::from(input),
        value,
        nonce: 7,
        gas_limit: 200_000,
        gas_price: None,
        max_fee_per_gas: Some(40 * GWEI),
        max_priority_fee_per_gas: Some(2 * GWEI),
        raw: Some(Bytes::from_static(&[0x02, 0xaa])),
        first_seen_ms: 0,
    }
}

fn buy_dai_with_eth(hash: u8, value: U256) -> PendingTransaction {
    let call = Router::swapExactETHForTokensCall {
        amountOutMin: U256::ZERO,
        path: vec![WETH, DAI],
        to: Address::repeat_byte(0x99),
        deadline: U256::MAX,
    };
    router_tx(hash, call.abi_encode(), value)
}

#[test]
fn victim_swap_opens_a_backrun_on_balanced_pools() {
    let registry = test_registry();
    let store = seeded_store(&registry, &balanced());
    let book = CycleBook::new(registry.cycles.clone());
    let optimizer = CycleOptimizer::default();
    assert!(optimize_cycles(&store, &book, &optimizer, &[0]).is_empty());

    let before = store.snapshot_all();
    let projector = MempoolProjector::new(&registry);
    let tx = buy_dai_with_eth(0x01, eth(100));
    let projection = projector.project(&tx, &store).expect("router swap should project");

    assert_eq!(projection.trigger, tx.hash);
    assert_eq!(projection.cycles, vec![0]);
    let (dai, weth) = projection.pools[&POOL_DAI_WETH];
    assert_eq!(weth, eth(1_100));
    assert!(dai < eth(1_000));

    assert_eq!(optimize_projection(&store, &book, &optimizer, &projection), vec![0]);
    assert!(!book.best_future(0).is_cleared());
    assert_eq!(book.future_trigger(0), Some(tx.hash));
    assert!(book.best(0).is_cleared());
    assert_eq!(store.snapshot_all(), before, "projection must not touch the store");
}

#[test]
fn resolved_trigger_clears_the_future_result() {
    let registry = test_registry();
    let store = seeded_store(&registry, &balanced());
    let book = CycleBook::new(registry.cycles.clone());
    let projector = MempoolProjector::new(&registry);
    let tx = buy_dai_with_eth(0x02, eth(100));
    let projection = projector.project(&tx, &store).expect("router swap should project");
    optimize_projection(&store, &book, &CycleOptimizer::default(), &projection);

    assert_eq!(book.clear_futures_for(&[B256::repeat_byte(0x77)]), 0);
    assert_eq!(book.clear_futures_for(&[tx.hash]), 1);
    assert!(book.best_future(0).is_cleared());
    assert_eq!(book.future_trigger(0), None);
}

#[test]
fn exact_output_beyond_reserve_is_rejected() {
    let registry = test_registry();
    let store = seeded_store(&registry, &balanced());
    let call = Router::swapETHForExactTokensCall {
        amountOut: eth(1_000),
        path: vec![WETH, DAI],
        to: Address::repeat_byte(0x99),
        deadline: U256::MAX,
    };
    let tx = router_tx(0x03, call.abi_encode(), eth(1_000_000));

    let err = MempoolProjector::new(&registry)
        .project(&tx, &store)
        .expect_err("output equal to the reserve cannot be bought");
    assert_eq!(
        err,
        ProjectionError::ExceedsReserve {
            pool: POOL_DAI_WETH,
            requested: eth(1_000),
            available: eth(1_000),
        }
    );
}

#[test]
fn exact_output_rejected_at_an_intermediate_hop() {
    let registry = test_registry();
    let store = seeded_store(&registry, &balanced());
    // Half the WETH reserve needs more DAI than the DAI/USDC pool holds.
    let call = Router::swapTokensForExactTokensCall {
        amountOut: eth(500),
        amountInMax: U256::MAX,
        path: vec![USDC, DAI, WETH],
        to: Address::repeat_byte(0x99),
        deadline: U256::MAX,
    };
    let tx = router_tx(0x05, call.abi_encode(), U256::ZERO);

    let err = MempoolProjector::new(&registry)
        .project(&tx, &store)
        .expect_err("first hop cannot deliver the DAI the second hop needs");
    let ProjectionError::ExceedsReserve {
        pool,
        requested,
        available,
    } = err
    else {
        panic!("expected a reserve rejection, got {err:?}");
    };
    assert_eq!(pool, POOL_DAI_USDC);
    assert_eq!(available, eth(1_000));
    assert!(requested > available);
}

#[test]
fn swaps_outside_monitored_routers_are_ignored() {
    let registry = test_registry();
    let store = seeded_store(&registry, &balanced());
    let mut tx = buy_dai_with_eth(0x04, eth(1));
    tx.to = Some(Address::repeat_byte(0x42));

    assert_eq!(
        MempoolProjector::new(&registry).project(&tx, &store),
        Err(ProjectionError::NotRouter)
    );
}
