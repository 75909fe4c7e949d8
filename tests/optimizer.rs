//! The borrow-size search against an exhaustive scan, and the shape of the
//! hop chain it hands to the payload builder.

mod common;

use alloy::primitives::{I256, U256};
use common::*;
use flash_sim::optimizer::optimize_cycles;
use flash_sim::view::PathSnapshot;
use flash_sim::{CycleBook, CycleOptimizer};

fn small_reserves() -> Vec<(alloy::primitives::Address, U256, U256)> {
    vec![
        (POOL_USDC_WETH, U256::from(20_000u64), U256::from(20_000u64)),
        (POOL_DAI_USDC, U256::from(20_000u64), U256::from(20_000u64)),
        (POOL_DAI_WETH, U256::from(20_000u64), U256::from(22_000u64)),
    ]
}

#[test]
fn search_lands_within_one_percent_of_exhaustive_scan() {
    let registry = test_registry();
    let store = seeded_store(&registry, &small_reserves());
    let cycle = &registry.cycles[0];
    let path = PathSnapshot::capture(&store, cycle).expect("all pools seeded");
    let optimizer = CycleOptimizer::default();

    let mut brute = I256::ZERO;
    for borrow in 1..20_000u64 {
        let Ok(evaluation) = optimizer.evaluate(cycle, &path, U256::from(borrow)) else {
            continue;
        };
        if evaluation.within_reserves(&path) && evaluation.profit > brute {
            brute = evaluation.profit;
        }
    }
    assert!(brute > I256::ZERO, "fixture should be profitable");

    let found = optimizer.optimize(cycle, &path).expect("search should find the edge");
    let found = I256::try_from(found.profit_amount).expect("profit fits");
    assert!(found <= brute);
    let tolerance = brute / I256::try_from(100).expect("small constant");
    assert!(
        brute - found <= tolerance,
        "search profit {found} strays from scan profit {brute}"
    );
}

#[test]
fn recorded_hops_form_a_closed_chain() {
    let registry = test_registry();
    let store = seeded_store(&registry, &profitable_reserves());
    let book = CycleBook::new(registry.cycles.clone());
    assert_eq!(
        optimize_cycles(&store, &book, &CycleOptimizer::default(), &[0]),
        vec![0]
    );

    let best = book.best(0);
    assert_eq!(best.hops.len(), 3);

    let borrow_hop = &best.hops[0];
    assert_eq!(borrow_hop.pool, POOL_USDC_WETH);
    assert_eq!(borrow_hop.token_out, USDC);
    assert_eq!(borrow_hop.token_in, WETH);
    assert_eq!(borrow_hop.amount_out, best.borrow_amount);
    assert_eq!(borrow_hop.amount_in, best.repay_amount);

    let swaps = best.swap_hops();
    assert_eq!(swaps[0].amount_in, best.borrow_amount);
    assert_eq!(swaps[0].token_in, USDC);
    for pair in swaps.windows(2) {
        assert_eq!(pair[0].amount_out, pair[1].amount_in);
        assert_eq!(pair[0].token_out, pair[1].token_in);
    }
    let last = swaps.last().expect("two swap hops");
    assert_eq!(last.pool, POOL_DAI_WETH);
    assert_eq!(last.token_out, WETH);
    assert_eq!(last.amount_out, best.repay_amount + best.profit_amount);
}
