//! Unit tests for the crucible engine: ledger semantics, the exact-value
//! health scenarios, gate accounting, and liquidation math.

use crucible::{VaultEngine, VaultError, VaultParams, PRECISION, U128};

// $200 and $1 in 1e8 price scale
const PRICE_200: u64 = 20_000_000_000;
const PRICE_100: u64 = 10_000_000_000;
const PRICE_10: u64 = 1_000_000_000;
const PRICE_1: u64 = 100_000_000;

fn params() -> VaultParams {
    VaultParams {
        ltv_ratio: 50,
        liquidation_threshold_pct: 80,
        liquidator_reward_pct: 5,
        penalty_rate_pct: 10,
        mint_fee_pct: 2,
        max_leverage: 10,
        _padding: 0,
        max_total_debt: U128::ZERO,
    }
}

fn engine() -> VaultEngine {
    VaultEngine::new(params())
}

fn owner(n: u8) -> [u8; 32] {
    [n; 32]
}

#[test]
fn params_validation() {
    assert!(params().validate().is_ok());

    let mut p = params();
    p.ltv_ratio = 0;
    assert_eq!(p.validate(), Err(VaultError::InvalidParams));
    p = params();
    p.ltv_ratio = 100;
    assert_eq!(p.validate(), Err(VaultError::InvalidParams));
    p = params();
    p.liquidator_reward_pct = 60;
    p.penalty_rate_pct = 50;
    assert_eq!(p.validate(), Err(VaultError::InvalidParams));
    p = params();
    p.max_leverage = 0;
    assert_eq!(p.validate(), Err(VaultError::InvalidParams));
}

#[test]
fn round_trip_zero_debt_position() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();
    assert_eq!(out.position_id, 1);
    assert_eq!(out.gate.fee, 0);

    let p = e.position(out.idx).unwrap();
    assert_eq!(p.collateral_amount.get(), 1000);
    assert_eq!(p.debt_amount.get(), 0);
    assert_eq!(p.leverage, 1);
    assert_eq!(p.effective_ltv, 50);

    assert_eq!(e.position_health(out.idx, PRICE_200, PRICE_1), Ok(u128::MAX));
    assert_eq!(e.is_liquidatable(out.idx, PRICE_200, PRICE_1), Ok(false));
    assert_eq!(e.collateral_balance(&owner(1)), 1000);
    assert_eq!(e.debt_balance(&owner(1)), 0);
    assert!(e.check_aggregates());
}

#[test]
fn health_is_two_at_two_hundred() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();

    // Stored capacity: 1000 * $200 * 50% = 100_000 loan units.
    assert_eq!(e.position(out.idx).unwrap().max_borrowable.get(), 100_000);

    // 2.0 in standard precision, exactly.
    assert_eq!(
        e.position_health(out.idx, PRICE_200, PRICE_1),
        Ok(2 * PRECISION)
    );
    assert_eq!(e.is_liquidatable(out.idx, PRICE_200, PRICE_1), Ok(false));
}

#[test]
fn price_drop_makes_position_liquidatable() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();

    // Collateral crashes to $1: health = 0.01, far below the 0.4 limit
    // (PRECISION * (50 * 80 / 100) / 100).
    assert_eq!(
        e.position_health(out.idx, PRICE_1, PRICE_1),
        Ok(PRECISION / 100)
    );
    assert_eq!(e.is_liquidatable(out.idx, PRICE_1, PRICE_1), Ok(true));
}

#[test]
fn liquidation_split_and_cleanup() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();

    // Not eligible at the open price.
    assert_eq!(
        e.liquidate(out.idx, PRICE_200, PRICE_1, 6),
        Err(VaultError::NotLiquidatable)
    );

    let res = e.liquidate(out.idx, PRICE_1, PRICE_1, 7).unwrap();
    assert_eq!(res.collateral_seized, 1000);
    assert_eq!(res.reward, 50); // 5%
    assert_eq!(res.penalty, 100); // 10%
    assert_eq!(res.remainder, 850);
    assert_eq!(res.reward + res.penalty + res.remainder, 1000);
    assert_eq!(res.debt_burned, 1000);
    assert_eq!(res.owner, owner(1));
    assert!(!res.receipt_burned); // gate was opted out

    // Position is gone, aggregates are zero, handle is stale.
    assert_eq!(e.position(out.idx), Err(VaultError::PositionNotFound));
    assert_eq!(e.collateral_balance(&owner(1)), 0);
    assert_eq!(e.debt_balance(&owner(1)), 0);
    assert_eq!(e.total_debt.get(), 0);
    assert_eq!(e.total_collateral.get(), 0);
    assert_eq!(e.positions_of(&owner(1)), &[] as &[u64]);
    assert_eq!(e.lifetime_liquidations, 1);
    assert!(e.check_aggregates());
}

#[test]
fn mint_gate_charges_fee_and_boosts_ltv() {
    let mut e = engine();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();

    assert_eq!(out.gate.fee, 20); // 2% of 1000
    assert!(out.gate.receipt_minted);
    assert_eq!(out.gate.effective_ltv, 66); // halfway blend from 50 toward 100

    let p = e.position(out.idx).unwrap();
    assert_eq!(p.collateral_amount.get(), 980);
    assert_eq!(p.effective_ltv, 66);
    assert!(p.effective_ltv > 50);
    assert!(e.has_receipt(out.idx as usize));
    assert_eq!(e.receipt_count, 1);

    // Stored capacity reflects post-fee collateral and the boosted ratio.
    assert_eq!(p.max_borrowable.get(), 129_360);
    assert!(e.check_aggregates());
}

#[test]
fn gate_boost_sequence_is_monotone() {
    let mut e = engine();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();
    assert_eq!(e.position(out.idx).unwrap().effective_ltv, 66);

    let g2 = e
        .add_collateral(out.idx, 100, PRICE_200, PRICE_1, 6)
        .unwrap();
    assert_eq!(g2.fee, 2);
    assert!(!g2.receipt_minted); // one receipt per position
    assert_eq!(g2.effective_ltv, 79);

    let g3 = e
        .add_collateral(out.idx, 100, PRICE_200, PRICE_1, 7)
        .unwrap();
    assert_eq!(g3.effective_ltv, 88);
    assert_eq!(e.receipt_count, 1);
}

#[test]
fn opted_out_owner_skips_gate_entirely() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 5)
        .unwrap();
    assert_eq!(out.gate.fee, 0);
    assert!(!out.gate.receipt_minted);
    assert_eq!(out.gate.effective_ltv, 50);
    assert!(!e.has_receipt(out.idx as usize));

    // Opting back in affects future inflows only; the stored ratio never
    // went up, so the next gate pass boosts from the base.
    e.set_do_not_mint(owner(1), false).unwrap();
    let g = e
        .add_collateral(out.idx, 100, PRICE_200, PRICE_1, 6)
        .unwrap();
    assert_eq!(g.fee, 2);
    assert!(g.receipt_minted);
    assert_eq!(g.effective_ltv, 66);
}

#[test]
fn owner_aggregates_track_multiple_positions() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    e.set_do_not_mint(owner(2), true).unwrap();

    let a = e
        .open_position(owner(1), 1000, 100, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    let b = e
        .open_position(owner(1), 2000, 200, 1, PRICE_200, PRICE_1, 0, 2)
        .unwrap();
    let c = e
        .open_position(owner(2), 500, 0, 1, PRICE_200, PRICE_1, 0, 3)
        .unwrap();

    assert_eq!(e.collateral_balance(&owner(1)), 3000);
    assert_eq!(e.debt_balance(&owner(1)), 300);
    assert_eq!(e.collateral_balance(&owner(2)), 500);
    assert_eq!(e.total_collateral.get(), 3500);
    assert_eq!(e.total_debt.get(), 300);
    assert_eq!(e.positions_of(&owner(1)), &[a.position_id, b.position_id]);
    assert_eq!(e.positions_of(&owner(2)), &[c.position_id]);
    assert!(e.check_aggregates());
}

#[test]
fn owner_index_uses_swap_with_last_removal() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();

    let a = e
        .open_position(owner(1), 100, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    let b = e
        .open_position(owner(1), 100, 0, 1, PRICE_200, PRICE_1, 0, 2)
        .unwrap();
    let c = e
        .open_position(owner(1), 100, 0, 1, PRICE_200, PRICE_1, 0, 3)
        .unwrap();
    assert_eq!(
        e.positions_of(&owner(1)),
        &[a.position_id, b.position_id, c.position_id]
    );

    // Deleting the first entry moves the last into its slot.
    let res = e
        .withdraw_collateral(a.idx, 100, PRICE_200, PRICE_1, 4)
        .unwrap();
    assert!(res.closed);
    assert_eq!(e.positions_of(&owner(1)), &[c.position_id, b.position_id]);
}

#[test]
fn slot_reuse_invalidates_stale_handles() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();

    let a = e
        .open_position(owner(1), 100, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    e.withdraw_collateral(a.idx, 100, PRICE_200, PRICE_1, 2)
        .unwrap();

    let b = e
        .open_position(owner(1), 100, 0, 1, PRICE_200, PRICE_1, 0, 3)
        .unwrap();
    // Freelist hands the slot back, but ids never repeat.
    assert_eq!(b.idx, a.idx);
    assert_ne!(b.position_id, a.position_id);
    assert_eq!(
        e.resolve(a.idx, a.position_id),
        Err(VaultError::PositionNotFound)
    );
    assert_eq!(e.resolve(b.idx, b.position_id), Ok(b.idx));
}

#[test]
fn withdraw_guard_holds_exact_boundary() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 40_000, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    // Required remaining value: 40_000 * $1 * 100 / 50 = $80_000, i.e. 400
    // collateral units at $200. Withdrawing down to exactly 400 passes.
    assert_eq!(
        e.withdraw_collateral(out.idx, 601, PRICE_200, PRICE_1, 2),
        Err(VaultError::InsufficientCollateralAfterWithdrawal)
    );
    let res = e
        .withdraw_collateral(out.idx, 600, PRICE_200, PRICE_1, 3)
        .unwrap();
    assert!(!res.closed);
    assert_eq!(e.position(out.idx).unwrap().collateral_amount.get(), 400);
    assert!(e.check_aggregates());
}

#[test]
fn withdraw_validation_errors() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(
        e.withdraw_collateral(out.idx, 0, PRICE_200, PRICE_1, 2),
        Err(VaultError::ZeroCollateralAmount)
    );
    assert_eq!(
        e.withdraw_collateral(out.idx, 1001, PRICE_200, PRICE_1, 2),
        Err(VaultError::InsufficientCollateral)
    );
}

#[test]
fn borrow_respects_ltv_cap() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(
        e.borrow(out.idx, 0, PRICE_200, PRICE_1, 2),
        Err(VaultError::ZeroLoanAmount)
    );
    // Capacity is 100_000 loan units.
    e.borrow(out.idx, 100_000, PRICE_200, PRICE_1, 2).unwrap();
    assert_eq!(
        e.borrow(out.idx, 1, PRICE_200, PRICE_1, 3),
        Err(VaultError::LoanExceedsLtvLimit)
    );
    assert_eq!(e.total_debt.get(), 100_000);
}

#[test]
fn boosted_ltv_raises_borrow_capacity() {
    let mut e = engine();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    // 980 collateral at 66%: capacity 129_360 > the base-ltv 98_000.
    e.borrow(out.idx, 129_360, PRICE_200, PRICE_1, 2).unwrap();
    assert_eq!(
        e.borrow(out.idx, 1, PRICE_200, PRICE_1, 3),
        Err(VaultError::LoanExceedsLtvLimit)
    );
}

#[test]
fn global_debt_ceiling() {
    let mut p = params();
    p.max_total_debt = U128::new(1500);
    let mut e = VaultEngine::new(p);
    e.set_do_not_mint(owner(1), true).unwrap();

    let a = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    assert_eq!(
        e.open_position(owner(1), 1000, 600, 1, PRICE_200, PRICE_1, 0, 2),
        Err(VaultError::MaxDebtReached)
    );
    assert_eq!(
        e.borrow(a.idx, 600, PRICE_200, PRICE_1, 3),
        Err(VaultError::MaxDebtReached)
    );
    e.borrow(a.idx, 500, PRICE_200, PRICE_1, 4).unwrap();
}

#[test]
fn repay_deletes_empty_position() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(
        e.repay_debt(out.idx, 0, 2),
        Err(VaultError::ZeroLoanAmount)
    );
    assert_eq!(
        e.repay_debt(out.idx, 1001, 2),
        Err(VaultError::AmountExceedsLoan)
    );

    assert!(!e.repay_debt(out.idx, 400, 3).unwrap());
    assert_eq!(e.position(out.idx).unwrap().debt_amount.get(), 600);
    assert_eq!(
        e.position_health(out.idx, PRICE_200, PRICE_1),
        Ok(2 * PRECISION)
    );

    // Clearing the debt with collateral still posted keeps the position.
    assert!(!e.repay_debt(out.idx, 600, 4).unwrap());
    assert_eq!(e.position_health(out.idx, PRICE_200, PRICE_1), Ok(u128::MAX));

    // Draining the collateral afterwards deletes it.
    let res = e
        .withdraw_collateral(out.idx, 1000, PRICE_200, PRICE_1, 5)
        .unwrap();
    assert!(res.closed);
    assert_eq!(e.position(out.idx), Err(VaultError::PositionNotFound));
    assert!(e.check_aggregates());
}

#[test]
fn interest_accrues_from_index_delta() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    // 5% of the 1e12-scale index.
    let accrued = e.collect_interest(out.idx, 50_000_000_000, 10).unwrap();
    assert_eq!(accrued, 50);
    assert_eq!(e.position(out.idx).unwrap().debt_amount.get(), 1050);
    assert_eq!(e.total_debt.get(), 1050);
    assert_eq!(e.lifetime_interest_accrued.get(), 50);

    // Same index again: the step was already applied.
    assert_eq!(e.collect_interest(out.idx, 50_000_000_000, 11), Ok(0));
    assert!(e.check_aggregates());
}

#[test]
fn interest_opt_out_snapshot_is_per_position() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    e.set_interest_opt_out(owner(1), true).unwrap();
    let opted_out = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    e.set_interest_opt_out(owner(1), false).unwrap();
    let accruing = e
        .open_position(owner(1), 1000, 1000, 1, PRICE_200, PRICE_1, 0, 2)
        .unwrap();

    assert_eq!(e.collect_interest(opted_out.idx, 50_000_000_000, 10), Ok(0));
    assert_eq!(
        e.collect_interest(accruing.idx, 50_000_000_000, 10),
        Ok(50)
    );
    // The flag at creation time sticks with the position.
    assert_eq!(e.position(opted_out.idx).unwrap().interest_opt_out, 1);
    assert_eq!(e.position(accruing.idx).unwrap().interest_opt_out, 0);
}

#[test]
fn zero_debt_interest_collection_advances_snapshot() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(e.collect_interest(out.idx, 70_000_000_000, 10), Ok(0));
    assert_eq!(
        e.position(out.idx).unwrap().last_interest_index.get(),
        70_000_000_000
    );

    // Borrowing after the idle period accrues nothing retroactively.
    e.borrow(out.idx, 1000, PRICE_200, PRICE_1, 11).unwrap();
    assert_eq!(e.collect_interest(out.idx, 70_000_000_000, 12), Ok(0));
}

#[test]
fn amplified_branch_for_fully_drawn_leverage() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    // Leverage 2, drawn to the full capacity of 100_000 loan units:
    // leverage_used = 2x the high-precision unit.
    let out = e
        .open_position(owner(1), 1000, 100_000, 2, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(
        e.position_health(out.idx, PRICE_200, PRICE_1),
        Ok(4 * PRECISION)
    );
    // Collateral halves: health halves with it.
    assert_eq!(
        e.position_health(out.idx, PRICE_100, PRICE_1),
        Ok(2 * PRECISION)
    );
    // At $10 health is 0.2, below the 0.4 limit.
    assert_eq!(
        e.position_health(out.idx, PRICE_10, PRICE_1),
        Ok(PRECISION / 5)
    );
    assert_eq!(e.is_liquidatable(out.idx, PRICE_10, PRICE_1), Ok(true));
}

#[test]
fn reduced_branch_for_lightly_drawn_leverage() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    // Leverage 2 with only 10% of capacity drawn: leverage_used = 0.2 of
    // the high-precision unit, so the favorable branch applies.
    let out = e
        .open_position(owner(1), 1000, 10_000, 2, PRICE_200, PRICE_1, 0, 1)
        .unwrap();

    assert_eq!(
        e.position_health(out.idx, PRICE_200, PRICE_1),
        Ok(100 * PRECISION)
    );
}

#[test]
fn open_validation_errors() {
    let mut e = engine();
    assert_eq!(
        e.open_position(owner(1), 0, 0, 1, PRICE_200, PRICE_1, 0, 1),
        Err(VaultError::ZeroCollateralAmount)
    );
    assert_eq!(
        e.open_position(owner(1), 1000, 0, 0, PRICE_200, PRICE_1, 0, 1),
        Err(VaultError::InvalidLeverage)
    );
    assert_eq!(
        e.open_position(owner(1), 1000, 0, 11, PRICE_200, PRICE_1, 0, 1),
        Err(VaultError::InvalidLeverage)
    );
    assert_eq!(
        e.open_position(owner(1), 1000, 100_001, 1, PRICE_200, PRICE_1, 0, 1),
        Err(VaultError::LoanExceedsLtvLimit)
    );
    assert_eq!(
        e.open_position(owner(1), 1000, 0, 1, 0, PRICE_1, 0, 1),
        Err(VaultError::InvalidPrice)
    );
}

#[test]
fn liquidation_requires_debt_and_collateral() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let no_debt = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    assert_eq!(e.is_liquidatable(no_debt.idx, PRICE_1, PRICE_1), Ok(false));
    assert_eq!(
        e.liquidate(no_debt.idx, PRICE_1, PRICE_1, 2),
        Err(VaultError::NotLiquidatable)
    );
    assert_eq!(
        e.liquidate(63, PRICE_1, PRICE_1, 2),
        Err(VaultError::PositionNotFound)
    );
}

#[test]
fn owner_check_gates_mutations() {
    let mut e = engine();
    e.set_do_not_mint(owner(1), true).unwrap();
    let out = e
        .open_position(owner(1), 1000, 0, 1, PRICE_200, PRICE_1, 0, 1)
        .unwrap();
    assert_eq!(e.check_owner(out.idx, &owner(1)), Ok(()));
    assert_eq!(
        e.check_owner(out.idx, &owner(2)),
        Err(VaultError::Unauthorized)
    );
}

#[test]
fn liquidation_conserves_collateral_across_ratios() {
    for (reward_pct, penalty_pct, collateral) in
        [(5u64, 10u64, 997u128), (3, 7, 12_345), (0, 15, 77), (9, 0, 1001)]
    {
        let mut p = params();
        p.liquidator_reward_pct = reward_pct;
        p.penalty_rate_pct = penalty_pct;
        let mut e = VaultEngine::new(p);
        e.set_do_not_mint(owner(1), true).unwrap();
        let debt = collateral; // 1:1 at $200 is deep inside the cap
        let out = e
            .open_position(owner(1), collateral, debt, 1, PRICE_200, PRICE_1, 0, 1)
            .unwrap();
        let res = e.liquidate(out.idx, PRICE_1, PRICE_1, 2).unwrap();
        assert_eq!(res.reward + res.penalty + res.remainder, collateral);
        assert!(e.check_aggregates());
    }
}
