//! Crucible: collateralized-debt-position ledger with an embedded
//! health/liquidation engine.
//!
//! Users post a collateral asset and mint a pegged loan asset against it,
//! bounded by a loan-to-value cap. Positions accrue interest through an
//! externally published index, can boost their effective LTV through the
//! mint-fee gate, and are liquidated when their health ratio drops below the
//! configured threshold.
//!
//! The engine is a pure state machine: prices, slots, and interest indices
//! are passed in; token-movement amounts are returned out. It never touches
//! tokens, oracles, or other programs, which keeps every operation exactly
//! reproducible from its inputs.
//!
//! All data structures are laid out in a single contiguous memory chunk,
//! suitable for a single Solana account.

#![no_std]
#![forbid(unsafe_code)]

// ============================================================================
// Constants
// ============================================================================

// MAX_POSITIONS is feature-configured, not target-configured, so x86 and SBF
// builds agree on slab sizes for a given feature set.
#[cfg(feature = "test")]
pub const MAX_POSITIONS: usize = 64; // Small for tests

#[cfg(not(feature = "test"))]
pub const MAX_POSITIONS: usize = 1024; // Production

pub const BITMAP_WORDS: usize = (MAX_POSITIONS + 63) / 64;

/// Capacity of one owner's position-id index.
pub const MAX_POSITIONS_PER_OWNER: usize = 16;

/// Owner book capacity. Entries are never freed (per-owner flags persist),
/// so this bounds the number of distinct owners over the vault's lifetime.
pub const MAX_OWNERS: usize = MAX_POSITIONS;

/// Standard precision: health ratios are scaled by 1e18 ("2.0" == 2e18).
pub const PRECISION: u128 = 1_000_000_000_000_000_000;

/// High-precision scale for `leverage_used` (fraction of borrow capacity
/// drawn, times leverage).
pub const HIGH_PRECISION: u128 = 1_000_000_000_000;

/// Oracle prices are normalized to 1e8 per whole unit.
pub const PRICE_PRECISION: u128 = 100_000_000;

/// The interest collector publishes a cumulative per-unit-debt index scaled
/// by 1e12.
pub const INTEREST_INDEX_PRECISION: u128 = 1_000_000_000_000;

/// Maximum accepted oracle price (1e8 scale: $1M per unit). Keeps value
/// products inside u128 headroom for realistic amounts.
pub const MAX_ORACLE_PRICE: u64 = 100_000_000_000_000;

/// Freelist sentinel.
const NO_SLOT: u16 = u16::MAX;

// ============================================================================
// BPF-Safe 128-bit Type (see src/u128.rs)
// ============================================================================
pub mod u128;
pub use self::u128::U128;

// ============================================================================
// Core Data Structures
// ============================================================================

/// One collateral+debt record owned by a single account.
///
/// `position_id` is monotonically increasing and never recycled; slab slots
/// are recycled through the freelist, so (slot, id) together form a stable
/// handle that detects stale references.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    /// Unique position ID (monotonic, never recycled; 0 = empty slot)
    pub position_id: u64,

    /// Owner pubkey (signature checks done by the wrapper)
    pub owner: [u8; 32],

    /// Collateral held for this position, in the asset's native precision
    pub collateral_amount: U128,

    /// Outstanding loan-asset debt, in the asset's native precision
    pub debt_amount: U128,

    /// Borrow capacity in loan-asset units, recomputed from then-current
    /// prices on every price-aware mutation (open, add, withdraw, borrow).
    /// Health queries read this stored value rather than recomputing from
    /// spot, so a collateral price move shifts health.
    pub max_borrowable: U128,

    /// Interest-collector index snapshot at the last collection
    pub last_interest_index: U128,

    /// Slot of the last interest collection (baseline written at creation)
    pub last_collection_slot: u64,

    /// Effective loan-to-value cap, percent. Starts at the base ratio and is
    /// only ever raised by the mint-fee gate.
    pub effective_ltv: u64,

    /// Integer leverage multiplier chosen at creation (>= 1)
    pub leverage: u32,

    /// Back-reference into the owner book
    pub owner_idx: u16,

    /// Snapshot of the owner's interest opt-out flag at creation
    pub interest_opt_out: u8,

    pub _padding: u8,
}

/// Helper to create an empty position
fn empty_position() -> Position {
    Position {
        position_id: 0,
        owner: [0; 32],
        collateral_amount: U128::ZERO,
        debt_amount: U128::ZERO,
        max_borrowable: U128::ZERO,
        last_interest_index: U128::ZERO,
        last_collection_slot: 0,
        effective_ltv: 0,
        leverage: 0,
        owner_idx: 0,
        interest_opt_out: 0,
        _padding: 0,
    }
}

/// Per-owner book entry: secondary index plus cached aggregates and flags.
///
/// The position-id list uses swap-with-last removal: deletion is O(1) and
/// does not preserve the original relative order of the remaining ids.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerEntry {
    /// Owner pubkey
    pub owner: [u8; 32],

    /// Live position ids, first `num_positions` entries valid
    pub position_ids: [u64; MAX_POSITIONS_PER_OWNER],

    /// Cached sum of collateral over this owner's live positions
    pub collateral_balance: U128,

    /// Cached sum of debt over this owner's live positions
    pub debt_balance: U128,

    pub num_positions: u16,

    /// 1 = skip the mint-fee gate (no fee, no receipt, no LTV boost)
    pub do_not_mint: u8,

    /// 1 = positions created from now on do not accrue interest
    pub interest_opt_out: u8,

    pub _padding: [u8; 4],
}

fn empty_owner() -> OwnerEntry {
    OwnerEntry {
        owner: [0; 32],
        position_ids: [0; MAX_POSITIONS_PER_OWNER],
        collateral_balance: U128::ZERO,
        debt_balance: U128::ZERO,
        num_positions: 0,
        do_not_mint: 0,
        interest_opt_out: 0,
        _padding: [0; 4],
    }
}

/// Vault parameters
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaultParams {
    /// Base loan-to-value cap, percent (1..100)
    pub ltv_ratio: u64,

    /// Liquidation threshold as a percentage of the effective LTV
    pub liquidation_threshold_pct: u64,

    /// Share of seized collateral paid to the liquidation caller, percent
    pub liquidator_reward_pct: u64,

    /// Share of seized collateral paid to the treasury, percent
    pub penalty_rate_pct: u64,

    /// Fee on gated collateral inflows, percent of the newly added amount
    pub mint_fee_pct: u64,

    /// Maximum integer leverage multiplier accepted at creation
    pub max_leverage: u32,

    pub _padding: u32,

    /// Global debt ceiling in loan-asset units (0 = unlimited)
    pub max_total_debt: U128,
}

impl VaultParams {
    /// Reject parameter sets the engine cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.ltv_ratio == 0 || self.ltv_ratio >= 100 {
            return Err(VaultError::InvalidParams);
        }
        if self.liquidation_threshold_pct == 0 || self.liquidation_threshold_pct > 100 {
            return Err(VaultError::InvalidParams);
        }
        if self
            .liquidator_reward_pct
            .saturating_add(self.penalty_rate_pct)
            > 100
        {
            return Err(VaultError::InvalidParams);
        }
        if self.mint_fee_pct >= 100 {
            return Err(VaultError::InvalidParams);
        }
        if self.max_leverage == 0 {
            return Err(VaultError::InvalidParams);
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultError {
    /// Collateral amount of zero
    ZeroCollateralAmount,

    /// Loan amount of zero
    ZeroLoanAmount,

    /// Leverage outside 1..=max_leverage
    InvalidLeverage,

    /// Requested debt exceeds the position's borrow capacity
    LoanExceedsLtvLimit,

    /// Global debt ceiling reached
    MaxDebtReached,

    /// Withdrawal amount exceeds current collateral
    InsufficientCollateral,

    /// Remaining collateral would not cover the debt at the effective LTV
    InsufficientCollateralAfterWithdrawal,

    /// Repay amount exceeds outstanding debt
    AmountExceedsLoan,

    /// Unknown or stale position handle
    PositionNotFound,

    /// Position is not currently liquidatable
    NotLiquidatable,

    /// Owner's position index is full
    PositionLimitReached,

    /// Position slab is full
    LedgerFull,

    /// Owner book is full
    OwnerLimitReached,

    /// Caller is not the position owner
    Unauthorized,

    /// Oracle price is zero or out of accepted bounds
    InvalidPrice,

    /// Invalid vault parameters
    InvalidParams,

    /// Arithmetic overflow
    Overflow,
}

pub type Result<T> = core::result::Result<T, VaultError>;

// ============================================================================
// Operation Outcomes
// ============================================================================

/// What the mint-fee gate did on a collateral inflow. The wrapper routes
/// `fee` to the treasury; everything else is accounting already applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateOutcome {
    /// Fee charged on the newly added amount (0 when opted out)
    pub fee: u128,
    /// Whether this pass minted the position's receipt
    pub receipt_minted: bool,
    /// Effective LTV after the gate ran
    pub effective_ltv: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOutcome {
    pub idx: u16,
    pub position_id: u64,
    pub gate: GateOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WithdrawOutcome {
    /// Amount leaving custody toward the owner
    pub withdrawn: u128,
    /// Whether the position was deleted (both balances hit zero)
    pub closed: bool,
}

/// Result of a successful liquidation. The wrapper pays `reward` to the
/// caller, `penalty` to the treasury, and `remainder` to the original owner;
/// reward + penalty + remainder always equals `collateral_seized`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiquidationOutcome {
    pub position_id: u64,
    pub owner: [u8; 32],
    pub collateral_seized: u128,
    pub reward: u128,
    pub penalty: u128,
    pub remainder: u128,
    pub debt_burned: u128,
    pub receipt_burned: bool,
}

// ============================================================================
// Math Helpers
// ============================================================================

/// a * b / div with truncating division. Multiply-before-divide ordering is
/// load-bearing: the exact-value tests depend on it.
#[inline]
fn mul_div(a: u128, b: u128, div: u128) -> Result<u128> {
    if div == 0 {
        return Err(VaultError::Overflow);
    }
    a.checked_mul(b).map(|x| x / div).ok_or(VaultError::Overflow)
}

#[inline]
fn pct(amount: u128, percent: u128) -> Result<u128> {
    mul_div(amount, percent, 100)
}

#[inline]
fn check_price(price: u64) -> Result<()> {
    if price == 0 || price > MAX_ORACLE_PRICE {
        return Err(VaultError::InvalidPrice);
    }
    Ok(())
}

// ============================================================================
// Main Engine State
// ============================================================================

/// Position ledger and health/liquidation engine - fixed slab with bitmap.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaultEngine {
    /// Vault parameters
    pub params: VaultParams,

    /// Sum of collateral over all live positions
    pub total_collateral: U128,

    /// Sum of debt over all live positions. Incremented exactly once per
    /// unit borrowed/accrued, decremented exactly once per unit
    /// repaid/liquidated.
    pub total_debt: U128,

    /// Current slot (advanced by every mutating entry point)
    pub current_slot: u64,

    /// Next position ID to assign (monotonic, never recycled; starts at 1)
    pub next_position_id: u64,

    /// Number of live positions (O(1) counter)
    pub num_used_positions: u16,

    /// Number of allocated owner-book entries
    pub num_owners: u16,

    /// Freelist head (u16::MAX = none)
    pub free_head: u16,

    pub _padding: [u8; 2],

    /// Live receipts (one per gated position)
    pub receipt_count: u64,

    // ========================================
    // Lifetime Counters (telemetry)
    // ========================================
    /// Total number of liquidations performed (lifetime)
    pub lifetime_liquidations: u64,

    /// Total interest applied to debt (lifetime)
    pub lifetime_interest_accrued: U128,

    /// Occupancy bitmap
    pub used: [u64; BITMAP_WORDS],

    /// Receipt bitmap, parallel to the slab: bit set = the position holds
    /// its non-transferable receipt
    pub receipts: [u64; BITMAP_WORDS],

    /// Freelist next pointers
    pub next_free: [u16; MAX_POSITIONS],

    /// Position slab
    pub positions: [Position; MAX_POSITIONS],

    /// Owner book: secondary index + cached aggregates + flags
    pub owners: [OwnerEntry; MAX_OWNERS],
}

impl VaultEngine {
    /// Create a new engine (stack-allocates the full struct - avoid in BPF!)
    ///
    /// For Solana BPF programs, zero the backing memory and use
    /// `init_in_place` instead.
    pub fn new(params: VaultParams) -> Self {
        let mut engine = Self {
            params,
            total_collateral: U128::ZERO,
            total_debt: U128::ZERO,
            current_slot: 0,
            next_position_id: 1,
            num_used_positions: 0,
            num_owners: 0,
            free_head: 0,
            _padding: [0; 2],
            receipt_count: 0,
            lifetime_liquidations: 0,
            lifetime_interest_accrued: U128::ZERO,
            used: [0; BITMAP_WORDS],
            receipts: [0; BITMAP_WORDS],
            next_free: [0; MAX_POSITIONS],
            positions: [empty_position(); MAX_POSITIONS],
            owners: [empty_owner(); MAX_OWNERS],
        };

        // Initialize freelist: 0 -> 1 -> 2 -> ... -> MAX_POSITIONS-1 -> NONE
        for i in 0..MAX_POSITIONS - 1 {
            engine.next_free[i] = (i + 1) as u16;
        }
        engine.next_free[MAX_POSITIONS - 1] = NO_SLOT;

        engine
    }

    /// Initialize a VaultEngine in place (zero-copy friendly).
    ///
    /// PREREQUISITE: the memory backing `self` MUST be zeroed before calling.
    /// Only non-zero fields are touched so the full slab is never written.
    pub fn init_in_place(&mut self, params: VaultParams) {
        self.params = params;
        self.next_position_id = 1;

        // All other fields are zero which is correct for totals, counters,
        // bitmaps, and the zeroed slab (equivalent to empty_position()).
        for i in 0..MAX_POSITIONS - 1 {
            self.next_free[i] = (i + 1) as u16;
        }
        self.next_free[MAX_POSITIONS - 1] = NO_SLOT;
    }

    // ========================================
    // Bitmap Helpers
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= MAX_POSITIONS {
            return false;
        }
        (self.used[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn set_used(&mut self, idx: usize) {
        self.used[idx >> 6] |= 1u64 << (idx & 63);
    }

    fn clear_used(&mut self, idx: usize) {
        self.used[idx >> 6] &= !(1u64 << (idx & 63));
    }

    pub fn has_receipt(&self, idx: usize) -> bool {
        if idx >= MAX_POSITIONS {
            return false;
        }
        (self.receipts[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    /// Mint the position's receipt if it does not already hold one.
    /// Returns whether a receipt was actually minted (one per position).
    fn mint_receipt(&mut self, idx: usize) -> bool {
        if self.has_receipt(idx) {
            return false;
        }
        self.receipts[idx >> 6] |= 1u64 << (idx & 63);
        self.receipt_count = self.receipt_count.saturating_add(1);
        true
    }

    /// Burn the position's receipt if present. Returns whether one existed.
    fn burn_receipt(&mut self, idx: usize) -> bool {
        if !self.has_receipt(idx) {
            return false;
        }
        self.receipts[idx >> 6] &= !(1u64 << (idx & 63));
        self.receipt_count = self.receipt_count.saturating_sub(1);
        true
    }

    fn for_each_used<F: FnMut(usize, &Position)>(&self, mut f: F) {
        for (block, word) in self.used.iter().copied().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                let idx = block * 64 + bit;
                w &= w - 1; // Clear lowest bit
                if idx >= MAX_POSITIONS {
                    continue; // Guard against stray high bits in bitmap
                }
                f(idx, &self.positions[idx]);
            }
        }
    }

    // ========================================
    // Slab Management
    // ========================================

    fn alloc_slot(&mut self) -> Result<u16> {
        let idx = self.free_head;
        if idx == NO_SLOT {
            return Err(VaultError::LedgerFull);
        }
        self.free_head = self.next_free[idx as usize];
        self.next_free[idx as usize] = NO_SLOT;
        self.set_used(idx as usize);
        self.num_used_positions = self.num_used_positions.saturating_add(1);
        Ok(idx)
    }

    fn free_slot(&mut self, idx: u16) {
        self.next_free[idx as usize] = self.free_head;
        self.free_head = idx;
        self.clear_used(idx as usize);
        self.num_used_positions = self.num_used_positions.saturating_sub(1);
    }

    fn ensure_used(&self, idx: u16) -> Result<()> {
        if (idx as usize) >= MAX_POSITIONS || !self.is_used(idx as usize) {
            return Err(VaultError::PositionNotFound);
        }
        Ok(())
    }

    // ========================================
    // Owner Book
    // ========================================

    pub fn find_owner(&self, owner: &[u8; 32]) -> Option<u16> {
        (0..self.num_owners as usize).find(|&i| self.owners[i].owner == *owner).map(|i| i as u16)
    }

    fn ensure_owner(&mut self, owner: [u8; 32]) -> Result<u16> {
        if let Some(idx) = self.find_owner(&owner) {
            return Ok(idx);
        }
        let idx = self.num_owners;
        if (idx as usize) >= MAX_OWNERS {
            return Err(VaultError::OwnerLimitReached);
        }
        self.owners[idx as usize] = OwnerEntry {
            owner,
            ..empty_owner()
        };
        self.num_owners += 1;
        Ok(idx)
    }

    /// Cached collateral aggregate for an owner (0 if unknown).
    pub fn collateral_balance(&self, owner: &[u8; 32]) -> u128 {
        self.find_owner(owner)
            .map(|i| self.owners[i as usize].collateral_balance.get())
            .unwrap_or(0)
    }

    /// Cached debt aggregate for an owner (0 if unknown).
    pub fn debt_balance(&self, owner: &[u8; 32]) -> u128 {
        self.find_owner(owner)
            .map(|i| self.owners[i as usize].debt_balance.get())
            .unwrap_or(0)
    }

    /// Live position ids for an owner. Order is not insertion order once any
    /// deletion has occurred (swap-with-last removal).
    pub fn positions_of(&self, owner: &[u8; 32]) -> &[u64] {
        match self.find_owner(owner) {
            Some(i) => {
                let e = &self.owners[i as usize];
                &e.position_ids[..e.num_positions as usize]
            }
            None => &[],
        }
    }

    fn owner_index_push(&mut self, owner_idx: u16, position_id: u64) -> Result<()> {
        let e = &mut self.owners[owner_idx as usize];
        let n = e.num_positions as usize;
        if n >= MAX_POSITIONS_PER_OWNER {
            return Err(VaultError::PositionLimitReached);
        }
        e.position_ids[n] = position_id;
        e.num_positions += 1;
        Ok(())
    }

    /// Swap-with-last removal: O(1), does not preserve relative order.
    fn owner_index_remove(&mut self, owner_idx: u16, position_id: u64) {
        let e = &mut self.owners[owner_idx as usize];
        let n = e.num_positions as usize;
        for i in 0..n {
            if e.position_ids[i] == position_id {
                e.position_ids[i] = e.position_ids[n - 1];
                e.position_ids[n - 1] = 0;
                e.num_positions -= 1;
                return;
            }
        }
        debug_assert!(false, "position id missing from owner index");
    }

    // ========================================
    // Aggregate Helpers
    // ========================================
    //
    // All code paths that change a position's collateral or debt MUST go
    // through these, so the owner caches and global totals move in the same
    // atomic step as the position-level change.

    fn set_collateral(&mut self, idx: u16, new_amount: u128) {
        let i = idx as usize;
        let old = self.positions[i].collateral_amount.get();
        let oi = self.positions[i].owner_idx as usize;
        if new_amount >= old {
            let delta = new_amount - old;
            self.owners[oi].collateral_balance =
                self.owners[oi].collateral_balance.saturating_add(delta);
            self.total_collateral = self.total_collateral.saturating_add(delta);
        } else {
            let delta = old - new_amount;
            self.owners[oi].collateral_balance =
                self.owners[oi].collateral_balance.saturating_sub(delta);
            self.total_collateral = self.total_collateral.saturating_sub(delta);
        }
        self.positions[i].collateral_amount = U128::new(new_amount);
    }

    fn set_debt(&mut self, idx: u16, new_amount: u128) {
        let i = idx as usize;
        let old = self.positions[i].debt_amount.get();
        let oi = self.positions[i].owner_idx as usize;
        if new_amount >= old {
            let delta = new_amount - old;
            self.owners[oi].debt_balance = self.owners[oi].debt_balance.saturating_add(delta);
            self.total_debt = self.total_debt.saturating_add(delta);
        } else {
            let delta = old - new_amount;
            self.owners[oi].debt_balance = self.owners[oi].debt_balance.saturating_sub(delta);
            self.total_debt = self.total_debt.saturating_sub(delta);
        }
        self.positions[i].debt_amount = U128::new(new_amount);
    }

    /// Recompute owner caches and global totals from the slab. For test use
    /// after direct state mutation.
    pub fn recompute_aggregates(&mut self) {
        for i in 0..self.num_owners as usize {
            self.owners[i].collateral_balance = U128::ZERO;
            self.owners[i].debt_balance = U128::ZERO;
        }
        let mut total_collateral = 0u128;
        let mut total_debt = 0u128;
        for idx in 0..MAX_POSITIONS {
            if !self.is_used(idx) {
                continue;
            }
            let p = self.positions[idx];
            let oi = p.owner_idx as usize;
            let c = p.collateral_amount.get();
            let d = p.debt_amount.get();
            self.owners[oi].collateral_balance =
                self.owners[oi].collateral_balance.saturating_add(c);
            self.owners[oi].debt_balance = self.owners[oi].debt_balance.saturating_add(d);
            total_collateral = total_collateral.saturating_add(c);
            total_debt = total_debt.saturating_add(d);
        }
        self.total_collateral = U128::new(total_collateral);
        self.total_debt = U128::new(total_debt);
    }

    /// Verify that cached aggregates match per-position sums. Used by the
    /// fuzz harnesses after every step. Off-chain diagnostic: the per-owner
    /// scratch table does not fit an on-chain stack frame.
    pub fn check_aggregates(&self) -> bool {
        let mut sums = [(0u128, 0u128); MAX_OWNERS];
        let mut total_collateral = 0u128;
        let mut total_debt = 0u128;
        self.for_each_used(|_idx, p| {
            let oi = p.owner_idx as usize;
            sums[oi].0 = sums[oi].0.saturating_add(p.collateral_amount.get());
            sums[oi].1 = sums[oi].1.saturating_add(p.debt_amount.get());
            total_collateral = total_collateral.saturating_add(p.collateral_amount.get());
            total_debt = total_debt.saturating_add(p.debt_amount.get());
        });
        for oi in 0..self.num_owners as usize {
            if sums[oi].0 != self.owners[oi].collateral_balance.get()
                || sums[oi].1 != self.owners[oi].debt_balance.get()
            {
                return false;
            }
        }
        total_collateral == self.total_collateral.get() && total_debt == self.total_debt.get()
    }

    // ========================================
    // Handles & Lookup
    // ========================================

    /// Validate a (slot, id) handle and return the slot. Slots are recycled;
    /// the id check rejects stale handles.
    pub fn resolve(&self, idx: u16, position_id: u64) -> Result<u16> {
        self.ensure_used(idx)?;
        if self.positions[idx as usize].position_id != position_id {
            return Err(VaultError::PositionNotFound);
        }
        Ok(idx)
    }

    /// Linear scan for a position id. O(MAX_POSITIONS); intended for clients
    /// and tests, not for hot on-chain paths (those carry the slot handle).
    pub fn find_position(&self, position_id: u64) -> Option<u16> {
        let mut found = None;
        self.for_each_used(|idx, p| {
            if p.position_id == position_id {
                found = Some(idx as u16);
            }
        });
        found
    }

    pub fn position(&self, idx: u16) -> Result<&Position> {
        self.ensure_used(idx)?;
        Ok(&self.positions[idx as usize])
    }

    /// Caller-is-owner gate for position mutations.
    pub fn check_owner(&self, idx: u16, caller: &[u8; 32]) -> Result<()> {
        self.ensure_used(idx)?;
        if self.positions[idx as usize].owner != *caller {
            return Err(VaultError::Unauthorized);
        }
        Ok(())
    }

    // ========================================
    // Borrow Capacity
    // ========================================

    /// Borrow capacity in loan-asset units:
    /// collateral_value * effective_ltv / 100, converted at the loan price.
    fn max_borrowable_units(
        collateral_amount: u128,
        effective_ltv: u64,
        collateral_price: u64,
        loan_price: u64,
    ) -> Result<u128> {
        let collateral_value = collateral_amount
            .checked_mul(collateral_price as u128)
            .ok_or(VaultError::Overflow)?;
        let capped = mul_div(collateral_value, effective_ltv as u128, 100)?;
        Ok(capped / loan_price as u128)
    }

    /// Recompute and store the position's borrow capacity from current
    /// prices. Runs on every price-aware mutation.
    fn refresh_max_borrowable(
        &mut self,
        idx: u16,
        collateral_price: u64,
        loan_price: u64,
    ) -> Result<()> {
        let p = &self.positions[idx as usize];
        let cap = Self::max_borrowable_units(
            p.collateral_amount.get(),
            p.effective_ltv,
            collateral_price,
            loan_price,
        )?;
        self.positions[idx as usize].max_borrowable = U128::new(cap);
        Ok(())
    }

    fn check_debt_ceiling(&self, additional: u128) -> Result<()> {
        let ceiling = self.params.max_total_debt.get();
        if ceiling == 0 {
            return Ok(());
        }
        let new_total = self
            .total_debt
            .get()
            .checked_add(additional)
            .ok_or(VaultError::Overflow)?;
        if new_total > ceiling {
            return Err(VaultError::MaxDebtReached);
        }
        Ok(())
    }

    // ========================================
    // Mint-Fee Gate
    // ========================================

    /// Blend the effective LTV halfway toward maximum leverage:
    /// cr' = cr - (cr - target_cr) / 2, all truncating integer math.
    fn boost_effective_ltv(effective_ltv: u64) -> Result<u64> {
        if effective_ltv >= 100 {
            return Ok(effective_ltv);
        }
        let current_cr = mul_div(100, PRECISION, effective_ltv as u128)?;
        let target_cr = mul_div(100, PRECISION, 100)?;
        let new_cr = current_cr - (current_cr - target_cr) / 2;
        let boosted = mul_div(100, PRECISION, new_cr)? as u64;
        // Truncation can only lose ground; the stored ratio never goes down.
        Ok(boosted.max(effective_ltv))
    }

    /// Run the fee/receipt/boost gate on a collateral inflow of `added`
    /// units. The fee stays deducted from the position's collateral; the
    /// wrapper moves the matching tokens to the treasury.
    fn run_mint_gate(&mut self, idx: u16, added: u128) -> Result<GateOutcome> {
        let oi = self.positions[idx as usize].owner_idx as usize;
        if self.owners[oi].do_not_mint == 1 {
            return Ok(GateOutcome {
                fee: 0,
                receipt_minted: false,
                effective_ltv: self.positions[idx as usize].effective_ltv,
            });
        }

        let fee = pct(added, self.params.mint_fee_pct as u128)?;
        if fee > 0 {
            let collateral = self.positions[idx as usize].collateral_amount.get();
            let remaining = collateral.checked_sub(fee).ok_or(VaultError::Overflow)?;
            self.set_collateral(idx, remaining);
        }

        let receipt_minted = self.mint_receipt(idx as usize);

        let boosted = Self::boost_effective_ltv(self.positions[idx as usize].effective_ltv)?;
        self.positions[idx as usize].effective_ltv = boosted;

        Ok(GateOutcome {
            fee,
            receipt_minted,
            effective_ltv: boosted,
        })
    }

    // ========================================
    // Ledger Operations
    // ========================================

    /// Open a new position. The debt cap is checked against the base LTV and
    /// the full pre-fee collateral; the gate then charges its fee, boosts
    /// the LTV, and the post-gate borrow capacity is stored.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        owner: [u8; 32],
        collateral_amount: u128,
        debt_amount: u128,
        leverage: u32,
        collateral_price: u64,
        loan_price: u64,
        interest_index: u128,
        now_slot: u64,
    ) -> Result<OpenOutcome> {
        self.current_slot = now_slot;
        check_price(collateral_price)?;
        check_price(loan_price)?;

        if collateral_amount == 0 {
            return Err(VaultError::ZeroCollateralAmount);
        }
        if leverage == 0 || leverage > self.params.max_leverage {
            return Err(VaultError::InvalidLeverage);
        }

        if debt_amount > 0 {
            let cap = Self::max_borrowable_units(
                collateral_amount,
                self.params.ltv_ratio,
                collateral_price,
                loan_price,
            )?;
            if debt_amount > cap {
                return Err(VaultError::LoanExceedsLtvLimit);
            }
            self.check_debt_ceiling(debt_amount)?;
        }

        let owner_idx = self.ensure_owner(owner)?;
        if self.owners[owner_idx as usize].num_positions as usize >= MAX_POSITIONS_PER_OWNER {
            return Err(VaultError::PositionLimitReached);
        }

        let idx = self.alloc_slot()?;
        let position_id = self.next_position_id;
        self.next_position_id = self.next_position_id.saturating_add(1);

        self.positions[idx as usize] = Position {
            position_id,
            owner,
            collateral_amount: U128::ZERO,
            debt_amount: U128::ZERO,
            max_borrowable: U128::ZERO,
            last_interest_index: U128::new(interest_index),
            last_collection_slot: now_slot,
            effective_ltv: self.params.ltv_ratio,
            leverage,
            owner_idx,
            interest_opt_out: self.owners[owner_idx as usize].interest_opt_out,
            _padding: 0,
        };
        self.owner_index_push(owner_idx, position_id)?;

        self.set_collateral(idx, collateral_amount);
        self.set_debt(idx, debt_amount);

        let gate = self.run_mint_gate(idx, collateral_amount)?;
        self.refresh_max_borrowable(idx, collateral_price, loan_price)?;

        Ok(OpenOutcome {
            idx,
            position_id,
            gate,
        })
    }

    /// Add collateral to a live position and re-run the gate.
    pub fn add_collateral(
        &mut self,
        idx: u16,
        amount: u128,
        collateral_price: u64,
        loan_price: u64,
        now_slot: u64,
    ) -> Result<GateOutcome> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;
        check_price(collateral_price)?;
        check_price(loan_price)?;
        if amount == 0 {
            return Err(VaultError::ZeroCollateralAmount);
        }

        let new_amount = self.positions[idx as usize]
            .collateral_amount
            .get()
            .checked_add(amount)
            .ok_or(VaultError::Overflow)?;
        self.set_collateral(idx, new_amount);

        let gate = self.run_mint_gate(idx, amount)?;
        self.refresh_max_borrowable(idx, collateral_price, loan_price)?;
        Ok(gate)
    }

    /// Withdraw collateral. The remaining collateral must still cover the
    /// outstanding debt at the effective LTV:
    /// remaining_value >= debt_value * 100 / effective_ltv.
    pub fn withdraw_collateral(
        &mut self,
        idx: u16,
        amount: u128,
        collateral_price: u64,
        loan_price: u64,
        now_slot: u64,
    ) -> Result<WithdrawOutcome> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;
        check_price(collateral_price)?;
        check_price(loan_price)?;
        if amount == 0 {
            return Err(VaultError::ZeroCollateralAmount);
        }

        let p = &self.positions[idx as usize];
        let collateral = p.collateral_amount.get();
        let debt = p.debt_amount.get();
        let effective_ltv = p.effective_ltv;
        if amount > collateral {
            return Err(VaultError::InsufficientCollateral);
        }
        let remaining = collateral - amount;

        if debt > 0 {
            let remaining_value = remaining
                .checked_mul(collateral_price as u128)
                .ok_or(VaultError::Overflow)?;
            let debt_value = debt
                .checked_mul(loan_price as u128)
                .ok_or(VaultError::Overflow)?;
            let required_value = mul_div(debt_value, 100, effective_ltv as u128)?;
            if remaining_value < required_value {
                return Err(VaultError::InsufficientCollateralAfterWithdrawal);
            }
        }

        self.set_collateral(idx, remaining);

        let closed = remaining == 0 && debt == 0;
        if closed {
            self.close_position(idx);
        } else {
            self.refresh_max_borrowable(idx, collateral_price, loan_price)?;
        }

        Ok(WithdrawOutcome {
            withdrawn: amount,
            closed,
        })
    }

    /// Borrow more loan asset against a live position. Capacity is evaluated
    /// at current prices and the stored capacity is refreshed to it.
    pub fn borrow(
        &mut self,
        idx: u16,
        amount: u128,
        collateral_price: u64,
        loan_price: u64,
        now_slot: u64,
    ) -> Result<()> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;
        check_price(collateral_price)?;
        check_price(loan_price)?;
        if amount == 0 {
            return Err(VaultError::ZeroLoanAmount);
        }

        let p = &self.positions[idx as usize];
        let new_debt = p
            .debt_amount
            .get()
            .checked_add(amount)
            .ok_or(VaultError::Overflow)?;
        let cap = Self::max_borrowable_units(
            p.collateral_amount.get(),
            p.effective_ltv,
            collateral_price,
            loan_price,
        )?;
        if new_debt > cap {
            return Err(VaultError::LoanExceedsLtvLimit);
        }
        self.check_debt_ceiling(amount)?;

        self.set_debt(idx, new_debt);
        self.positions[idx as usize].max_borrowable = U128::new(cap);
        Ok(())
    }

    /// Repay outstanding debt. Returns whether the position was deleted
    /// (both balances at zero).
    pub fn repay_debt(&mut self, idx: u16, amount: u128, now_slot: u64) -> Result<bool> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;
        if amount == 0 {
            return Err(VaultError::ZeroLoanAmount);
        }

        let p = &self.positions[idx as usize];
        let debt = p.debt_amount.get();
        let collateral = p.collateral_amount.get();
        if amount > debt {
            return Err(VaultError::AmountExceedsLoan);
        }

        self.set_debt(idx, debt - amount);

        let closed = debt - amount == 0 && collateral == 0;
        if closed {
            self.close_position(idx);
        }
        Ok(closed)
    }

    // ========================================
    // Interest
    // ========================================

    /// Apply the externally published cumulative interest index. The accrued
    /// amount is debt * (index - snapshot) / 1e12; the snapshot advances so
    /// each index step is applied exactly once.
    pub fn collect_interest(
        &mut self,
        idx: u16,
        interest_index: u128,
        now_slot: u64,
    ) -> Result<u128> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;

        let p = &self.positions[idx as usize];
        if p.interest_opt_out == 1 {
            return Ok(0);
        }
        let debt = p.debt_amount.get();
        if debt == 0 {
            // Keep the snapshot moving so a later borrow does not pay
            // retroactive interest for the idle period.
            self.positions[idx as usize].last_interest_index = U128::new(interest_index);
            self.positions[idx as usize].last_collection_slot = now_slot;
            return Ok(0);
        }

        let delta = interest_index.saturating_sub(p.last_interest_index.get());
        let accrued = mul_div(debt, delta, INTEREST_INDEX_PRECISION)?;
        if accrued > 0 {
            let new_debt = debt.checked_add(accrued).ok_or(VaultError::Overflow)?;
            self.set_debt(idx, new_debt);
            self.lifetime_interest_accrued = self.lifetime_interest_accrued.saturating_add(accrued);
        }
        self.positions[idx as usize].last_interest_index = U128::new(interest_index);
        self.positions[idx as usize].last_collection_slot = now_slot;
        Ok(accrued)
    }

    // ========================================
    // Health & Liquidation
    // ========================================

    /// Leverage-adjusted health ratio in PRECISION scale. u128::MAX when the
    /// position carries no debt.
    ///
    /// The multiply-before-divide ordering and truncating division below are
    /// exact contract surface; reordering changes rounding outcomes the
    /// tests assert on.
    pub fn position_health(
        &self,
        idx: u16,
        collateral_price: u64,
        loan_price: u64,
    ) -> Result<u128> {
        self.ensure_used(idx)?;
        check_price(collateral_price)?;
        check_price(loan_price)?;

        let p = &self.positions[idx as usize];
        let debt = p.debt_amount.get();
        if debt == 0 {
            return Ok(u128::MAX);
        }

        let collateral_value = p
            .collateral_amount
            .get()
            .checked_mul(collateral_price as u128)
            .ok_or(VaultError::Overflow)?;
        let debt_value = debt
            .checked_mul(loan_price as u128)
            .ok_or(VaultError::Overflow)?;

        let max_borrowable = p.max_borrowable.get();
        if max_borrowable == 0 {
            // Capacity collapsed at the last mutation; any debt is maximal risk.
            return Ok(0);
        }

        // Fraction of borrow capacity drawn, times leverage, in HIGH_PRECISION.
        let leverage_used = mul_div(
            debt.checked_mul(p.leverage as u128)
                .ok_or(VaultError::Overflow)?,
            HIGH_PRECISION,
            max_borrowable,
        )?;
        if leverage_used == 0 {
            return Ok(u128::MAX);
        }

        let baseline_den = mul_div(debt_value, HIGH_PRECISION, leverage_used)?;
        if baseline_den == 0 {
            return Ok(u128::MAX);
        }

        // Leveraged positions that have actually drawn more than their
        // baseline share of capacity carry amplified risk; ones that drew
        // less get the reduced-utilization form. Leverage-1 positions always
        // take the baseline path.
        if collateral_value >= baseline_den && p.leverage > 1 {
            if leverage_used > HIGH_PRECISION {
                let num = mul_div(
                    collateral_value
                        .checked_mul(leverage_used)
                        .ok_or(VaultError::Overflow)?,
                    p.effective_ltv as u128,
                    100 * HIGH_PRECISION,
                )?;
                let drawdown = 1000 - 1000 * HIGH_PRECISION / leverage_used;
                let den = mul_div(debt_value, drawdown, 1000)?;
                if den == 0 {
                    return Ok(u128::MAX);
                }
                return mul_div(num, PRECISION, den);
            } else if leverage_used < HIGH_PRECISION {
                let den = mul_div(debt_value, leverage_used, HIGH_PRECISION)?;
                if den == 0 {
                    return Ok(u128::MAX);
                }
                return mul_div(collateral_value, PRECISION, den);
            }
        }

        mul_div(collateral_value, PRECISION, baseline_den)
    }

    /// Liquidation eligibility:
    /// health < PRECISION * (effective_ltv * liquidation_threshold_pct / 100) / 100.
    pub fn is_liquidatable(
        &self,
        idx: u16,
        collateral_price: u64,
        loan_price: u64,
    ) -> Result<bool> {
        self.ensure_used(idx)?;
        let p = &self.positions[idx as usize];
        if p.debt_amount.is_zero() || p.collateral_amount.is_zero() {
            return Ok(false);
        }
        let health = self.position_health(idx, collateral_price, loan_price)?;
        let threshold_pct = mul_div(
            p.effective_ltv as u128,
            self.params.liquidation_threshold_pct as u128,
            100,
        )?;
        let limit = mul_div(PRECISION, threshold_pct, 100)?;
        Ok(health < limit)
    }

    /// Liquidate an eligible position: split its collateral into
    /// reward/penalty/remainder, burn its debt from the global total, and
    /// delete it. The wrapper performs the three payouts; ledger state is
    /// committed first so any later transfer failure aborts the whole
    /// transaction with no partial ledger change surviving.
    pub fn liquidate(
        &mut self,
        idx: u16,
        collateral_price: u64,
        loan_price: u64,
        now_slot: u64,
    ) -> Result<LiquidationOutcome> {
        self.current_slot = now_slot;
        self.ensure_used(idx)?;
        if !self.is_liquidatable(idx, collateral_price, loan_price)? {
            return Err(VaultError::NotLiquidatable);
        }

        let p = &self.positions[idx as usize];
        let position_id = p.position_id;
        let owner = p.owner;
        let collateral = p.collateral_amount.get();
        let debt = p.debt_amount.get();

        let reward = pct(collateral, self.params.liquidator_reward_pct as u128)?;
        let penalty = pct(collateral, self.params.penalty_rate_pct as u128)?;
        let remainder = collateral
            .checked_sub(reward)
            .and_then(|r| r.checked_sub(penalty))
            .ok_or(VaultError::Overflow)?;

        self.set_debt(idx, 0);
        self.set_collateral(idx, 0);
        let receipt_burned = self.close_position(idx);
        self.lifetime_liquidations = self.lifetime_liquidations.saturating_add(1);

        Ok(LiquidationOutcome {
            position_id,
            owner,
            collateral_seized: collateral,
            reward,
            penalty,
            remainder,
            debt_burned: debt,
            receipt_burned,
        })
    }

    /// Delete a position whose balances have reached zero: remove it from
    /// the owner index, burn any receipt, zero the slab entry, and return
    /// the slot to the freelist.
    fn close_position(&mut self, idx: u16) -> bool {
        let p = self.positions[idx as usize];
        debug_assert!(p.collateral_amount.is_zero() && p.debt_amount.is_zero());
        self.owner_index_remove(p.owner_idx, p.position_id);
        let receipt_burned = self.burn_receipt(idx as usize);
        self.positions[idx as usize] = empty_position();
        self.free_slot(idx);
        receipt_burned
    }

    // ========================================
    // Owner Flags
    // ========================================

    /// Opt the owner in or out of the mint-fee gate. Existing positions keep
    /// their boosted LTV; only future gate passes are affected.
    pub fn set_do_not_mint(&mut self, owner: [u8; 32], flag: bool) -> Result<()> {
        let oi = self.ensure_owner(owner)?;
        self.owners[oi as usize].do_not_mint = flag as u8;
        Ok(())
    }

    /// Toggle whether positions this owner creates from now on participate
    /// in interest accrual. Existing positions keep their creation-time
    /// snapshot.
    pub fn set_interest_opt_out(&mut self, owner: [u8; 32], flag: bool) -> Result<()> {
        let oi = self.ensure_owner(owner)?;
        self.owners[oi as usize].interest_opt_out = flag as u8;
        Ok(())
    }
}
