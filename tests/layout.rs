//! Layout regression tests.
//!
//! The engine state is accessed zero-copy from raw account bytes, so struct
//! sizes and field offsets are contract surface: a silent layout change
//! corrupts every deployed slab. These assertions pin the layout on the host
//! target; the U128 wrapper keeps it identical on SBF.

use core::mem::{align_of, size_of};
use crucible_prog::constants::{
    CONFIG_LEN, ENGINE_LEN, ENGINE_OFF, HEADER_LEN, MAX_DELEGATES, SLAB_LEN,
};
use crucible_prog::engine::{Position, VaultEngine, VaultParams, U128};
use crucible_prog::state::{SlabHeader, VaultConfig};
use memoffset::offset_of;

#[test]
fn u128_wrapper_is_eight_byte_aligned() {
    // The whole point of the wrapper: no 16-byte alignment anywhere.
    assert_eq!(size_of::<U128>(), 16);
    assert_eq!(align_of::<U128>(), 8);

    let v = U128::new(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
    assert_eq!(v.get(), 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
    assert_eq!(U128::MAX.get(), u128::MAX);
    assert!(U128::ZERO.is_zero());
}

#[test]
fn position_layout_is_stable() {
    assert_eq!(size_of::<Position>(), 128);
    assert_eq!(align_of::<Position>(), 8);

    assert_eq!(offset_of!(Position, position_id), 0);
    assert_eq!(offset_of!(Position, owner), 8);
    assert_eq!(offset_of!(Position, collateral_amount), 40);
    assert_eq!(offset_of!(Position, debt_amount), 56);
    assert_eq!(offset_of!(Position, max_borrowable), 72);
    assert_eq!(offset_of!(Position, last_interest_index), 88);
    assert_eq!(offset_of!(Position, last_collection_slot), 104);
    assert_eq!(offset_of!(Position, effective_ltv), 112);
    assert_eq!(offset_of!(Position, leverage), 120);
    assert_eq!(offset_of!(Position, owner_idx), 124);
    assert_eq!(offset_of!(Position, interest_opt_out), 126);
}

#[test]
fn vault_params_layout_is_stable() {
    assert_eq!(size_of::<VaultParams>(), 64);
    assert_eq!(offset_of!(VaultParams, ltv_ratio), 0);
    assert_eq!(offset_of!(VaultParams, liquidation_threshold_pct), 8);
    assert_eq!(offset_of!(VaultParams, liquidator_reward_pct), 16);
    assert_eq!(offset_of!(VaultParams, penalty_rate_pct), 24);
    assert_eq!(offset_of!(VaultParams, mint_fee_pct), 32);
    assert_eq!(offset_of!(VaultParams, max_leverage), 40);
    assert_eq!(offset_of!(VaultParams, max_total_debt), 48);
}

#[test]
fn header_and_config_fit_their_reserved_regions() {
    assert_eq!(size_of::<SlabHeader>(), HEADER_LEN);
    assert_eq!(HEADER_LEN, 64);
    assert_eq!(offset_of!(SlabHeader, magic), 0);
    assert_eq!(offset_of!(SlabHeader, version), 8);
    assert_eq!(offset_of!(SlabHeader, bump), 12);
    assert_eq!(offset_of!(SlabHeader, admin), 16);

    assert_eq!(size_of::<VaultConfig>(), CONFIG_LEN);
    assert_eq!(offset_of!(VaultConfig, collateral_mint), 0);
    assert_eq!(offset_of!(VaultConfig, loan_mint), 32);
    assert_eq!(
        offset_of!(VaultConfig, delegates),
        9 * 32
    );
    assert_eq!(
        offset_of!(VaultConfig, max_staleness_slots),
        9 * 32 + MAX_DELEGATES * 32
    );
}

#[test]
fn engine_region_is_aligned_within_the_slab() {
    assert_eq!(align_of::<VaultEngine>(), 8);
    assert_eq!(ENGINE_OFF % align_of::<VaultEngine>(), 0);
    assert_eq!(ENGINE_OFF, HEADER_LEN + CONFIG_LEN);
    assert_eq!(ENGINE_LEN, size_of::<VaultEngine>());
    assert_eq!(SLAB_LEN, ENGINE_OFF + ENGINE_LEN);
}
