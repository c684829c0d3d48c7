//! Crucible: single-file Solana program wrapping the CDP ledger engine.
//!
//! The wrapper owns everything the pure engine refuses to know about:
//! account validation, signer/role checks, oracle and interest-collector
//! reads, SPL collateral transfers, loan-asset mint/burn, strategy CPIs, and
//! the slab account the engine state lives in. Ledger state is committed
//! before token movement on every mutating path; a failed transfer aborts
//! the transaction, so no partial ledger change can survive.

#![deny(unsafe_code)]

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "Crucible CDP Vault",
    project_url: "https://crucible.trade",
    contacts: "email:security@crucible.trade",
    policy: "https://crucible.trade/security-policy"
}

// 1. mod constants
pub mod constants {
    use crate::state::{SlabHeader, VaultConfig};
    use core::mem::{align_of, size_of};
    use crucible::VaultEngine;

    pub const MAGIC: u64 = 0x4352554349424c45; // "CRUCIBLE"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<VaultConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<VaultEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<VaultEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Marker the interest collector account must lead with.
    pub const COLLECTOR_MAGIC: u64 = 0x43525543494e5458; // "CRUCINTX"

    /// Delegate table capacity (leverage-capability holders for *_for calls).
    pub const MAX_DELEGATES: usize = 4;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crucible::VaultEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a VaultEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const VaultEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut VaultEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut VaultEngine) })
    }
}

// 3. mod error
pub mod error {
    use crucible::VaultError;
    use num_derive::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, Error, FromPrimitive, PartialEq)]
    pub enum CrucibleError {
        // Wrapper / account validation
        #[error("Slab magic mismatch")]
        InvalidMagic,
        #[error("Slab version mismatch")]
        InvalidVersion,
        #[error("Vault already initialized")]
        AlreadyInitialized,
        #[error("Vault not initialized")]
        NotInitialized,
        #[error("Slab account has wrong length")]
        InvalidSlabLen,
        #[error("Expected signer")]
        ExpectedSigner,
        #[error("Expected writable account")]
        ExpectedWritable,
        #[error("Oracle account key mismatch")]
        InvalidOracleKey,
        #[error("Collateral vault token account invalid")]
        InvalidVaultAta,
        #[error("Token mint mismatch")]
        InvalidMint,
        #[error("Treasury token account invalid")]
        InvalidTreasury,
        #[error("Payout token account owner mismatch")]
        InvalidOwnerAccount,

        // Oracle failures
        #[error("Oracle price is zero or out of bounds")]
        InvalidPrice,
        #[error("Oracle price is stale")]
        StalePrice,
        #[error("Oracle confidence interval too wide")]
        PriceConfidenceTooWide,

        // Validation
        #[error("Funding token account is not the configured collateral")]
        InvalidCollateralToken,
        #[error("Collateral amount of zero")]
        ZeroCollateralAmount,
        #[error("Loan amount of zero")]
        ZeroLoanAmount,
        #[error("Leverage outside the accepted range")]
        InvalidLeverage,
        #[error("Unknown or stale position")]
        InvalidPosition,
        #[error("Invalid vault parameters")]
        InvalidVaultParams,
        #[error("No positions to liquidate")]
        NoPositionsToLiquidate,

        // Authorization
        #[error("Caller is not authorized")]
        Unauthorized,
        #[error("Delegate table is full")]
        DelegateLimitReached,

        // Economic limits
        #[error("Loan would exceed the LTV limit")]
        LoanExceedsLtvLimit,
        #[error("Global debt ceiling reached")]
        MaxDebtReached,
        #[error("Withdrawal exceeds current collateral")]
        InsufficientCollateral,
        #[error("Remaining collateral would not cover the loan")]
        InsufficientCollateralAfterWithdrawal,
        #[error("Repay amount exceeds outstanding loan")]
        AmountExceedsLoan,
        #[error("Position is not liquidatable")]
        PositionNotLiquidatable,
        #[error("Owner position limit reached")]
        PositionLimitReached,
        #[error("Position ledger is full")]
        LedgerFull,
        #[error("Owner book is full")]
        OwnerLimitReached,

        // Integration failures
        #[error("Collateral transfer failed")]
        CollateralTransferFailed,
        #[error("Liquidation transfer failed")]
        LiquidationFailed,
        #[error("Interest collector unavailable")]
        InterestCollectorUnavailable,
        #[error("Invalid strategy configuration")]
        InvalidStrategyConfig,
        #[error("Strategy call failed")]
        StrategyFailed,

        #[error("Arithmetic overflow")]
        Overflow,
    }

    impl From<CrucibleError> for ProgramError {
        fn from(e: CrucibleError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for CrucibleError {
        fn type_of() -> &'static str {
            "CrucibleError"
        }
    }

    impl PrintProgramError for CrucibleError {
        fn print<E>(&self)
        where
            E: 'static
                + std::error::Error
                + DecodeError<E>
                + PrintProgramError
                + num_traits::FromPrimitive,
        {
            msg!("{}", self);
        }
    }

    pub fn map_vault_error(e: VaultError) -> ProgramError {
        let err = match e {
            VaultError::ZeroCollateralAmount => CrucibleError::ZeroCollateralAmount,
            VaultError::ZeroLoanAmount => CrucibleError::ZeroLoanAmount,
            VaultError::InvalidLeverage => CrucibleError::InvalidLeverage,
            VaultError::LoanExceedsLtvLimit => CrucibleError::LoanExceedsLtvLimit,
            VaultError::MaxDebtReached => CrucibleError::MaxDebtReached,
            VaultError::InsufficientCollateral => CrucibleError::InsufficientCollateral,
            VaultError::InsufficientCollateralAfterWithdrawal => {
                CrucibleError::InsufficientCollateralAfterWithdrawal
            }
            VaultError::AmountExceedsLoan => CrucibleError::AmountExceedsLoan,
            VaultError::PositionNotFound => CrucibleError::InvalidPosition,
            VaultError::NotLiquidatable => CrucibleError::PositionNotLiquidatable,
            VaultError::PositionLimitReached => CrucibleError::PositionLimitReached,
            VaultError::LedgerFull => CrucibleError::LedgerFull,
            VaultError::OwnerLimitReached => CrucibleError::OwnerLimitReached,
            VaultError::Unauthorized => CrucibleError::Unauthorized,
            VaultError::InvalidPrice => CrucibleError::InvalidPrice,
            VaultError::InvalidParams => CrucibleError::InvalidVaultParams,
            VaultError::Overflow => CrucibleError::Overflow,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use crucible::{VaultParams, U128};
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    #[derive(Debug)]
    pub enum Instruction {
        /// Accounts: [admin(s), slab(w), collateral_mint, loan_mint,
        /// vault_ata, treasury_ata, token_program]
        InitVault {
            admin: Pubkey,
            collateral_mint: Pubkey,
            loan_mint: Pubkey,
            oracle_collateral: Pubkey,
            oracle_loan: Pubkey,
            interest_collector: Pubkey,
            max_staleness_slots: u64,
            conf_filter_bps: u16,
            params: VaultParams,
        },
        /// Accounts: [owner(s), slab(w), owner_collateral_ata(w),
        /// vault_ata(w), treasury_ata(w), loan_mint(w), owner_loan_ata(w),
        /// vault_pda, token_program, clock, oracle_collateral, oracle_loan,
        /// interest_collector, [strategy_program, strategy_vault(w)]]
        OpenPosition {
            collateral_amount: u64,
            debt_amount: u64,
            leverage: u32,
        },
        /// Accounts: [owner(s), slab(w), owner_collateral_ata(w),
        /// vault_ata(w), treasury_ata(w), vault_pda, token_program, clock,
        /// oracle_collateral, oracle_loan, [strategy_program, strategy_vault(w)]]
        AddCollateral {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Same accounts as AddCollateral, but account 0 is a registered
        /// delegate funding someone else's position.
        AddCollateralFor {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Accounts: [owner(s), slab(w), vault_ata(w), owner_collateral_ata(w),
        /// vault_pda, token_program, clock, oracle_collateral, oracle_loan,
        /// [strategy_program, strategy_vault(w)]]
        WithdrawCollateral {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Accounts: [owner(s), slab(w), loan_mint(w), owner_loan_ata(w),
        /// vault_pda, token_program, clock, oracle_collateral, oracle_loan,
        /// interest_collector]
        Borrow {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Same accounts as Borrow; account 0 is a registered delegate and
        /// the loan ata must belong to the position owner.
        BorrowFor {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Accounts: [owner(s), slab(w), loan_mint(w), owner_loan_ata(w),
        /// token_program, clock, interest_collector]
        RepayDebt {
            pos_idx: u16,
            position_id: u64,
            amount: u64,
        },
        /// Accounts: [liquidator(s), slab(w), vault_ata(w),
        /// liquidator_ata(w), treasury_ata(w), owner_ata(w), vault_pda,
        /// token_program, clock, oracle_collateral, oracle_loan,
        /// interest_collector, [strategy_program, strategy_vault(w)]]
        LiquidatePosition { pos_idx: u16, position_id: u64 },
        /// Accounts: [liquidator(s), slab(w), vault_ata(w),
        /// liquidator_ata(w), treasury_ata(w), vault_pda, token_program,
        /// clock, oracle_collateral, oracle_loan, interest_collector,
        /// [strategy_program, strategy_vault(w)], then one owner_ata(w) per
        /// target, in target order.
        BatchLiquidate { targets: Vec<(u16, u64)> },
        /// Accounts: [owner(s), slab(w)]
        SetDoNotMint { flag: bool },
        /// Accounts: [owner(s), slab(w)]
        SetInterestOptOut { flag: bool },
        /// Accounts: [admin(s), slab(w)]
        SetStrategy {
            strategy_program: Pubkey,
            strategy_vault: Pubkey,
        },
        /// Accounts: [admin(s), slab(w)]
        SetDelegate { delegate: Pubkey, enabled: bool },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let admin = read_pubkey(&mut rest)?;
                    let collateral_mint = read_pubkey(&mut rest)?;
                    let loan_mint = read_pubkey(&mut rest)?;
                    let oracle_collateral = read_pubkey(&mut rest)?;
                    let oracle_loan = read_pubkey(&mut rest)?;
                    let interest_collector = read_pubkey(&mut rest)?;
                    let max_staleness_slots = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    let params = read_vault_params(&mut rest)?;
                    Ok(Instruction::InitVault {
                        admin,
                        collateral_mint,
                        loan_mint,
                        oracle_collateral,
                        oracle_loan,
                        interest_collector,
                        max_staleness_slots,
                        conf_filter_bps,
                        params,
                    })
                }
                1 => {
                    let collateral_amount = read_u64(&mut rest)?;
                    let debt_amount = read_u64(&mut rest)?;
                    let leverage = read_u32(&mut rest)?;
                    Ok(Instruction::OpenPosition {
                        collateral_amount,
                        debt_amount,
                        leverage,
                    })
                }
                2 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::AddCollateral {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                3 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::AddCollateralFor {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                4 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::WithdrawCollateral {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                5 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::Borrow {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                6 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::BorrowFor {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                7 => {
                    let (pos_idx, position_id, amount) = read_position_op(&mut rest)?;
                    Ok(Instruction::RepayDebt {
                        pos_idx,
                        position_id,
                        amount,
                    })
                }
                8 => {
                    let pos_idx = read_u16(&mut rest)?;
                    let position_id = read_u64(&mut rest)?;
                    Ok(Instruction::LiquidatePosition {
                        pos_idx,
                        position_id,
                    })
                }
                9 => {
                    let count = read_u16(&mut rest)? as usize;
                    let mut targets = Vec::with_capacity(count);
                    for _ in 0..count {
                        let pos_idx = read_u16(&mut rest)?;
                        let position_id = read_u64(&mut rest)?;
                        targets.push((pos_idx, position_id));
                    }
                    Ok(Instruction::BatchLiquidate { targets })
                }
                10 => {
                    let flag = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetDoNotMint { flag })
                }
                11 => {
                    let flag = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetInterestOptOut { flag })
                }
                12 => {
                    let strategy_program = read_pubkey(&mut rest)?;
                    let strategy_vault = read_pubkey(&mut rest)?;
                    Ok(Instruction::SetStrategy {
                        strategy_program,
                        strategy_vault,
                    })
                }
                13 => {
                    let delegate = read_pubkey(&mut rest)?;
                    let enabled = read_u8(&mut rest)? != 0;
                    Ok(Instruction::SetDelegate { delegate, enabled })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_position_op(input: &mut &[u8]) -> Result<(u16, u64, u64), ProgramError> {
        let pos_idx = read_u16(input)?;
        let position_id = read_u64(input)?;
        let amount = read_u64(input)?;
        Ok((pos_idx, position_id, amount))
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input
            .split_first()
            .ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        if input.len() < 4 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(4);
        *input = rest;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        if input.len() < 16 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(u128::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(bytes.try_into().unwrap()))
    }

    fn read_vault_params(input: &mut &[u8]) -> Result<VaultParams, ProgramError> {
        Ok(VaultParams {
            ltv_ratio: read_u64(input)?,
            liquidation_threshold_pct: read_u64(input)?,
            liquidator_reward_pct: read_u64(input)?,
            penalty_rate_pct: read_u64(input)?,
            mint_fee_pct: read_u64(input)?,
            max_leverage: read_u32(input)?,
            _padding: 0,
            max_total_debt: U128::new(read_u128(input)?),
        })
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::error::CrucibleError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(CrucibleError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(CrucibleError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN, MAX_DELEGATES};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct VaultConfig {
        pub collateral_mint: [u8; 32],
        pub loan_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub treasury_pubkey: [u8; 32],
        pub collateral_oracle: [u8; 32],
        pub loan_oracle: [u8; 32],
        /// All-zero = interest accrual disabled.
        pub interest_collector: [u8; 32],
        /// All-zero = collateral held directly in the vault ata.
        pub strategy_program: [u8; 32],
        pub strategy_vault: [u8; 32],
        pub delegates: [[u8; 32]; MAX_DELEGATES],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub delegate_count: u8,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 4],
    }

    impl VaultConfig {
        pub fn strategy_configured(&self) -> bool {
            self.strategy_program != [0u8; 32]
        }

        pub fn collector_configured(&self) -> bool {
            self.interest_collector != [0u8; 32]
        }

        pub fn is_delegate(&self, key: &[u8; 32]) -> bool {
            self.delegates[..self.delegate_count as usize].contains(key)
        }
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        bytemuck::bytes_of_mut(&mut h).copy_from_slice(&data[..HEADER_LEN]);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        data[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
    }

    pub fn read_config(data: &[u8]) -> VaultConfig {
        let mut c = VaultConfig::zeroed();
        bytemuck::bytes_of_mut(&mut c).copy_from_slice(&data[HEADER_LEN..HEADER_LEN + CONFIG_LEN]);
        c
    }

    pub fn write_config(data: &mut [u8], c: &VaultConfig) {
        data[HEADER_LEN..HEADER_LEN + CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(c));
    }
}

// 7. mod oracle
pub mod oracle {
    use crate::error::CrucibleError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    /// Read a Pyth-layout price account and normalize to 1e8 scale.
    /// Refuses non-positive, stale, and wide-confidence prices.
    pub fn read_price_e8(
        price_ai: &AccountInfo,
        now_slot: u64,
        max_staleness: u64,
        conf_bps: u16,
    ) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < 208 {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(*array_ref![data, 20, 4]);
        let price = i64::from_le_bytes(*array_ref![data, 176, 8]);
        let conf = u64::from_le_bytes(*array_ref![data, 184, 8]);
        let pub_slot = u64::from_le_bytes(*array_ref![data, 200, 8]);

        if price <= 0 {
            return Err(CrucibleError::InvalidPrice.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(CrucibleError::StalePrice.into());
        }

        let price_u = price as u128;
        if (conf as u128) * 10_000 > price_u * (conf_bps as u128) {
            return Err(CrucibleError::PriceConfidenceTooWide.into());
        }

        let scale = expo + 8;
        let final_price = if scale >= 0 {
            let mul = 10u128.pow(scale as u32);
            price_u.checked_mul(mul).ok_or(CrucibleError::Overflow)?
        } else {
            let div = 10u128.pow((-scale) as u32);
            price_u / div
        };

        if final_price == 0 {
            return Err(CrucibleError::InvalidPrice.into());
        }
        if final_price > u64::MAX as u128 {
            return Err(CrucibleError::Overflow.into());
        }

        Ok(final_price as u64)
    }
}

// 8. mod interest
pub mod interest {
    use crate::constants::COLLECTOR_MAGIC;
    use crate::error::CrucibleError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    /// Read the interest collector's published state:
    /// { magic: u64, cumulative index (1e12 scale): u128, last_update_slot: u64 }.
    pub fn read_index(collector_ai: &AccountInfo) -> Result<(u128, u64), ProgramError> {
        let data = collector_ai.try_borrow_data()?;
        if data.len() < 32 {
            return Err(CrucibleError::InterestCollectorUnavailable.into());
        }
        let magic = u64::from_le_bytes(*array_ref![data, 0, 8]);
        if magic != COLLECTOR_MAGIC {
            return Err(CrucibleError::InterestCollectorUnavailable.into());
        }
        let index = u128::from_le_bytes(*array_ref![data, 8, 16]);
        let last_update_slot = u64::from_le_bytes(*array_ref![data, 24, 8]);
        Ok((index, last_update_slot))
    }
}

// 9. mod collateral
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            move_tokens(source, dest, amount)
        }
    }

    #[cfg(test)]
    pub fn move_tokens(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut src_data = source.try_borrow_mut_data()?;
        let mut src_state = TokenAccount::unpack(&src_data)?;
        src_state.amount = src_state
            .amount
            .checked_sub(amount)
            .ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(src_state, &mut src_data)?;

        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount = dst_state
            .amount
            .checked_add(amount)
            .ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }
}

// 10. mod loan_asset
pub mod loan_asset {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::{Account as TokenAccount, Mint};

    /// Mint loan asset to a recipient, signed by the vault authority PDA
    /// (the loan mint's authority). Succeeds or reverts.
    pub fn mint_to<'a>(
        _token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::mint_to(
                _token_program.key,
                mint.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    mint.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state
                .supply
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            Mint::pack(mint_state, &mut mint_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    /// Burn loan asset from the caller's account (caller is the authority).
    pub fn burn<'a>(
        _token_program: &AccountInfo<'a>,
        account: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(
                _token_program.key,
                account.key,
                mint.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    account.clone(),
                    mint.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            let mut acc_data = account.try_borrow_mut_data()?;
            let mut acc_state = TokenAccount::unpack(&acc_data)?;
            acc_state.amount = acc_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(acc_state, &mut acc_data)?;

            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state
                .supply
                .checked_sub(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            Mint::pack(mint_state, &mut mint_data)?;
            Ok(())
        }
    }
}

// 11. mod strategy
pub mod strategy {
    use crate::error::CrucibleError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::{
        instruction::{AccountMeta, Instruction as SolInstruction},
        program::invoke_signed,
        program_pack::Pack,
    };
    #[cfg(not(test))]
    use spl_token::state::Account as TokenAccount;

    /// Notify the custodian that `amount` of collateral for `position_id`
    /// has landed in its vault. The token transfer itself happens before
    /// this call.
    pub fn deposit<'a>(
        _strategy_program: &AccountInfo<'a>,
        _strategy_vault: &AccountInfo<'a>,
        _vault_authority: &AccountInfo<'a>,
        _position_id: u64,
        _amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let mut data = Vec::with_capacity(17);
            data.push(0u8);
            data.extend_from_slice(&_position_id.to_le_bytes());
            data.extend_from_slice(&_amount.to_le_bytes());

            let ix = SolInstruction {
                program_id: *_strategy_program.key,
                accounts: vec![
                    AccountMeta::new(*_strategy_vault.key, false),
                    AccountMeta::new_readonly(*_vault_authority.key, true),
                ],
                data,
            };
            invoke_signed(
                &ix,
                &[_strategy_vault.clone(), _vault_authority.clone()],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            // The custodian's bookkeeping is external state; the emulated
            // path has nothing to record.
            Ok(())
        }
    }

    /// Ask the custodian to return `amount` of collateral for `position_id`
    /// into the vault ata. The amount actually returned is observed from the
    /// vault balance delta and must match the request.
    pub fn withdraw<'a>(
        _strategy_program: &AccountInfo<'a>,
        strategy_vault: &AccountInfo<'a>,
        vault: &AccountInfo<'a>,
        _vault_authority: &AccountInfo<'a>,
        _position_id: u64,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<u64, ProgramError> {
        #[cfg(not(test))]
        {
            let before = TokenAccount::unpack(&vault.try_borrow_data()?)?.amount;

            let mut data = Vec::with_capacity(17);
            data.push(1u8);
            data.extend_from_slice(&_position_id.to_le_bytes());
            data.extend_from_slice(&amount.to_le_bytes());

            let ix = SolInstruction {
                program_id: *_strategy_program.key,
                accounts: vec![
                    AccountMeta::new(*strategy_vault.key, false),
                    AccountMeta::new(*vault.key, false),
                    AccountMeta::new_readonly(*_vault_authority.key, true),
                ],
                data,
            };
            invoke_signed(
                &ix,
                &[
                    strategy_vault.clone(),
                    vault.clone(),
                    _vault_authority.clone(),
                ],
                _signer_seeds,
            )?;

            let after = TokenAccount::unpack(&vault.try_borrow_data()?)?.amount;
            let actual = after.saturating_sub(before);
            if actual != amount {
                return Err(CrucibleError::StrategyFailed.into());
            }
            Ok(actual)
        }
        #[cfg(test)]
        {
            crate::collateral::move_tokens(strategy_vault, vault, amount)
                .map_err(|_| ProgramError::from(CrucibleError::StrategyFailed))?;
            Ok(amount)
        }
    }
}

// 12. mod processor
pub mod processor {
    use crate::{
        accounts, collateral,
        constants::{MAGIC, SLAB_LEN, VERSION},
        error::{map_vault_error, CrucibleError},
        interest,
        ix::Instruction,
        loan_asset, oracle,
        state::{self, SlabHeader, VaultConfig},
        strategy, zc,
    };
    use crucible::VaultEngine;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };
    use spl_token::state::Account as TokenAccount;

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(CrucibleError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(CrucibleError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(CrucibleError::InvalidVersion.into());
        }
        Ok(())
    }

    fn require_admin(data: &[u8], caller: &Pubkey) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.admin != caller.to_bytes() {
            return Err(CrucibleError::Unauthorized.into());
        }
        Ok(())
    }

    /// Validate oracle keys against the config and read both prices plus the
    /// current slot.
    fn read_prices(
        config: &VaultConfig,
        a_clock: &AccountInfo,
        a_oracle_collateral: &AccountInfo,
        a_oracle_loan: &AccountInfo,
    ) -> Result<(u64, u64, u64), ProgramError> {
        if a_oracle_collateral.key.to_bytes() != config.collateral_oracle
            || a_oracle_loan.key.to_bytes() != config.loan_oracle
        {
            return Err(CrucibleError::InvalidOracleKey.into());
        }
        let clock = Clock::from_account_info(a_clock)?;
        let collateral_price = oracle::read_price_e8(
            a_oracle_collateral,
            clock.slot,
            config.max_staleness_slots,
            config.conf_filter_bps,
        )?;
        let loan_price = oracle::read_price_e8(
            a_oracle_loan,
            clock.slot,
            config.max_staleness_slots,
            config.conf_filter_bps,
        )?;
        Ok((collateral_price, loan_price, clock.slot))
    }

    fn verify_token_account(
        ai: &AccountInfo,
        expected_mint: &[u8; 32],
        err: CrucibleError,
    ) -> Result<TokenAccount, ProgramError> {
        if ai.owner != &spl_token::ID || ai.data_len() != TokenAccount::LEN {
            return Err(err.into());
        }
        let state = TokenAccount::unpack(&ai.try_borrow_data()?).map_err(|_| ProgramError::from(err))?;
        if state.mint.to_bytes() != *expected_mint {
            return Err(err.into());
        }
        Ok(state)
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        config: &VaultConfig,
    ) -> Result<(), ProgramError> {
        if a_vault.key.to_bytes() != config.vault_pubkey {
            return Err(CrucibleError::InvalidVaultAta.into());
        }
        verify_token_account(a_vault, &config.collateral_mint, CrucibleError::InvalidVaultAta)?;
        Ok(())
    }

    fn verify_treasury(
        a_treasury: &AccountInfo,
        config: &VaultConfig,
    ) -> Result<(), ProgramError> {
        if a_treasury.key.to_bytes() != config.treasury_pubkey {
            return Err(CrucibleError::InvalidTreasury.into());
        }
        verify_token_account(a_treasury, &config.collateral_mint, CrucibleError::InvalidTreasury)?;
        Ok(())
    }

    fn to_u64(x: u128) -> Result<u64, ProgramError> {
        x.try_into()
            .map_err(|_| ProgramError::from(CrucibleError::Overflow))
    }

    /// Strategy accounts, when a custodian is configured, follow the fixed
    /// account list at `base`. Keys are validated against the config.
    fn strategy_tail<'b, 'a>(
        config: &VaultConfig,
        all: &'b [AccountInfo<'a>],
        base: usize,
    ) -> Result<Option<(&'b AccountInfo<'a>, &'b AccountInfo<'a>)>, ProgramError> {
        if !config.strategy_configured() {
            return Ok(None);
        }
        accounts::expect_len(all, base + 2)?;
        let a_program = &all[base];
        let a_vault = &all[base + 1];
        if a_program.key.to_bytes() != config.strategy_program
            || a_vault.key.to_bytes() != config.strategy_vault
        {
            return Err(CrucibleError::InvalidStrategyConfig.into());
        }
        Ok(Some((a_program, a_vault)))
    }

    /// Opportunistic interest collection: reads the collector index and
    /// applies it to the position. Never blocks the carrying operation -
    /// collector or arithmetic failure is logged and discarded.
    fn try_collect_interest(
        engine: &mut VaultEngine,
        config: &VaultConfig,
        a_collector: &AccountInfo,
        idx: u16,
        now_slot: u64,
    ) {
        if !config.collector_configured() {
            return;
        }
        if a_collector.key.to_bytes() != config.interest_collector {
            msg!("interest collection skipped: collector account mismatch");
            return;
        }
        match interest::read_index(a_collector) {
            Ok((index, _)) => {
                if engine.collect_interest(idx, index, now_slot).is_err() {
                    msg!("interest collection skipped: accrual failed");
                }
            }
            Err(_) => {
                msg!("interest collection skipped: collector unavailable");
            }
        }
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts_list: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitVault {
                admin,
                collateral_mint,
                loan_mint,
                oracle_collateral,
                oracle_loan,
                interest_collector,
                max_staleness_slots,
                conf_filter_bps,
                params,
            } => {
                accounts::expect_len(accounts_list, 7)?;
                let a_admin = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_collateral_mint = &accounts_list[2];
                let a_loan_mint = &accounts_list[3];
                let a_vault = &accounts_list[4];
                let a_treasury = &accounts_list[5];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_collateral_mint, &collateral_mint)?;
                accounts::expect_key(a_loan_mint, &loan_mint)?;

                params.validate().map_err(map_vault_error)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(CrucibleError::AlreadyInitialized.into());
                }

                let (authority, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                let vault_state = verify_token_account(
                    a_vault,
                    &collateral_mint.to_bytes(),
                    CrucibleError::InvalidVaultAta,
                )?;
                if vault_state.owner != authority {
                    return Err(CrucibleError::InvalidVaultAta.into());
                }
                verify_token_account(
                    a_treasury,
                    &collateral_mint.to_bytes(),
                    CrucibleError::InvalidTreasury,
                )?;

                for b in data.iter_mut() {
                    *b = 0;
                }

                let engine = zc::engine_mut(&mut data)?;
                engine.init_in_place(params);

                let config = VaultConfig {
                    collateral_mint: collateral_mint.to_bytes(),
                    loan_mint: loan_mint.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    treasury_pubkey: a_treasury.key.to_bytes(),
                    collateral_oracle: oracle_collateral.to_bytes(),
                    loan_oracle: oracle_loan.to_bytes(),
                    interest_collector: interest_collector.to_bytes(),
                    strategy_program: [0; 32],
                    strategy_vault: [0; 32],
                    delegates: [[0; 32]; crate::constants::MAX_DELEGATES],
                    max_staleness_slots,
                    conf_filter_bps,
                    delegate_count: 0,
                    vault_authority_bump: bump,
                    _padding: [0; 4],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: admin.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::OpenPosition {
                collateral_amount,
                debt_amount,
                leverage,
            } => {
                accounts::expect_len(accounts_list, 13)?;
                let a_owner = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_owner_collateral = &accounts_list[2];
                let a_vault = &accounts_list[3];
                let a_treasury = &accounts_list[4];
                let a_loan_mint = &accounts_list[5];
                let a_owner_loan = &accounts_list[6];
                let a_vault_pda = &accounts_list[7];
                let a_token = &accounts_list[8];
                let a_clock = &accounts_list[9];
                let a_oracle_collateral = &accounts_list[10];
                let a_oracle_loan = &accounts_list[11];
                let a_collector = &accounts_list[12];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                // The funding account decides which asset is being posted.
                verify_token_account(
                    a_owner_collateral,
                    &config.collateral_mint,
                    CrucibleError::InvalidCollateralToken,
                )?;
                verify_vault(a_vault, &config)?;
                verify_treasury(a_treasury, &config)?;
                if a_loan_mint.key.to_bytes() != config.loan_mint {
                    return Err(CrucibleError::InvalidMint.into());
                }
                let owner_loan_state =
                    verify_token_account(a_owner_loan, &config.loan_mint, CrucibleError::InvalidMint)?;
                if owner_loan_state.owner != *a_owner.key {
                    return Err(CrucibleError::InvalidOwnerAccount.into());
                }

                let strategy_accounts = strategy_tail(&config, accounts_list, 13)?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                // The interest baseline is part of creation; unlike the
                // opportunistic collections it must succeed when a collector
                // is configured.
                let interest_index = if config.collector_configured() {
                    if a_collector.key.to_bytes() != config.interest_collector {
                        return Err(CrucibleError::InterestCollectorUnavailable.into());
                    }
                    interest::read_index(a_collector)?.0
                } else {
                    0
                };

                let engine = zc::engine_mut(&mut data)?;
                let outcome = engine
                    .open_position(
                        a_owner.key.to_bytes(),
                        collateral_amount as u128,
                        debt_amount as u128,
                        leverage,
                        collateral_price,
                        loan_price,
                        interest_index,
                        now_slot,
                    )
                    .map_err(map_vault_error)?;

                // Ledger state is committed; move the tokens. Any failure
                // below aborts the transaction.
                let fee = to_u64(outcome.gate.fee)?;
                if fee > 0 {
                    collateral::deposit(a_token, a_owner_collateral, a_treasury, a_owner, fee)
                        .map_err(|_| ProgramError::from(CrucibleError::CollateralTransferFailed))?;
                }
                let net = collateral_amount
                    .checked_sub(fee)
                    .ok_or(CrucibleError::Overflow)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                match strategy_accounts {
                    Some((a_strategy_program, a_strategy_vault)) => {
                        collateral::deposit(a_token, a_owner_collateral, a_strategy_vault, a_owner, net)
                            .map_err(|_| {
                                ProgramError::from(CrucibleError::CollateralTransferFailed)
                            })?;
                        strategy::deposit(
                            a_strategy_program,
                            a_strategy_vault,
                            a_vault_pda,
                            outcome.position_id,
                            net,
                            &signer_seeds,
                        )?;
                    }
                    None => {
                        collateral::deposit(a_token, a_owner_collateral, a_vault, a_owner, net)
                            .map_err(|_| {
                                ProgramError::from(CrucibleError::CollateralTransferFailed)
                            })?;
                    }
                }

                if debt_amount > 0 {
                    loan_asset::mint_to(
                        a_token,
                        a_loan_mint,
                        a_owner_loan,
                        a_vault_pda,
                        debt_amount,
                        &signer_seeds,
                    )?;
                }

                msg!(
                    "position {} opened: collateral {}, debt {}, leverage {}",
                    outcome.position_id,
                    collateral_amount,
                    debt_amount,
                    leverage
                );
            }
            Instruction::AddCollateral {
                pos_idx,
                position_id,
                amount,
            }
            | Instruction::AddCollateralFor {
                pos_idx,
                position_id,
                amount,
            } => {
                let delegated = instruction_data[0] == 3;

                accounts::expect_len(accounts_list, 10)?;
                let a_caller = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_funding = &accounts_list[2];
                let a_vault = &accounts_list[3];
                let a_treasury = &accounts_list[4];
                let a_vault_pda = &accounts_list[5];
                let a_token = &accounts_list[6];
                let a_clock = &accounts_list[7];
                let a_oracle_collateral = &accounts_list[8];
                let a_oracle_loan = &accounts_list[9];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                verify_token_account(
                    a_funding,
                    &config.collateral_mint,
                    CrucibleError::InvalidCollateralToken,
                )?;
                verify_vault(a_vault, &config)?;
                verify_treasury(a_treasury, &config)?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let strategy_accounts = strategy_tail(&config, accounts_list, 10)?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .resolve(pos_idx, position_id)
                    .map_err(map_vault_error)?;
                if delegated {
                    if !config.is_delegate(&a_caller.key.to_bytes()) {
                        return Err(CrucibleError::Unauthorized.into());
                    }
                } else {
                    engine
                        .check_owner(idx, &a_caller.key.to_bytes())
                        .map_err(map_vault_error)?;
                }

                let position_id = engine.positions[idx as usize].position_id;
                let gate = engine
                    .add_collateral(idx, amount as u128, collateral_price, loan_price, now_slot)
                    .map_err(map_vault_error)?;

                let fee = to_u64(gate.fee)?;
                if fee > 0 {
                    collateral::deposit(a_token, a_funding, a_treasury, a_caller, fee)
                        .map_err(|_| ProgramError::from(CrucibleError::CollateralTransferFailed))?;
                }
                let net = amount.checked_sub(fee).ok_or(CrucibleError::Overflow)?;

                match strategy_accounts {
                    Some((a_strategy_program, a_strategy_vault)) => {
                        collateral::deposit(a_token, a_funding, a_strategy_vault, a_caller, net)
                            .map_err(|_| {
                                ProgramError::from(CrucibleError::CollateralTransferFailed)
                            })?;
                        let seed1: &[u8] = b"vault";
                        let seed2: &[u8] = a_slab.key.as_ref();
                        let bump_arr: [u8; 1] = [config.vault_authority_bump];
                        let seed3: &[u8] = &bump_arr;
                        let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                        strategy::deposit(
                            a_strategy_program,
                            a_strategy_vault,
                            a_vault_pda,
                            position_id,
                            net,
                            &signer_seeds,
                        )?;
                    }
                    None => {
                        collateral::deposit(a_token, a_funding, a_vault, a_caller, net).map_err(
                            |_| ProgramError::from(CrucibleError::CollateralTransferFailed),
                        )?;
                    }
                }
            }
            Instruction::WithdrawCollateral {
                pos_idx,
                position_id,
                amount,
            } => {
                accounts::expect_len(accounts_list, 9)?;
                let a_owner = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_vault = &accounts_list[2];
                let a_recipient = &accounts_list[3];
                let a_vault_pda = &accounts_list[4];
                let a_token = &accounts_list[5];
                let a_clock = &accounts_list[6];
                let a_oracle_collateral = &accounts_list[7];
                let a_oracle_loan = &accounts_list[8];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                verify_vault(a_vault, &config)?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let strategy_accounts = strategy_tail(&config, accounts_list, 9)?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .resolve(pos_idx, position_id)
                    .map_err(map_vault_error)?;
                engine
                    .check_owner(idx, &a_owner.key.to_bytes())
                    .map_err(map_vault_error)?;

                let outcome = engine
                    .withdraw_collateral(
                        idx,
                        amount as u128,
                        collateral_price,
                        loan_price,
                        now_slot,
                    )
                    .map_err(map_vault_error)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                let withdrawn = to_u64(outcome.withdrawn)?;
                if let Some((a_strategy_program, a_strategy_vault)) = strategy_accounts {
                    strategy::withdraw(
                        a_strategy_program,
                        a_strategy_vault,
                        a_vault,
                        a_vault_pda,
                        position_id,
                        withdrawn,
                        &signer_seeds,
                    )?;
                }
                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_recipient,
                    a_vault_pda,
                    withdrawn,
                    &signer_seeds,
                )?;

                if outcome.closed {
                    msg!("position {} closed", position_id);
                }
            }
            Instruction::Borrow {
                pos_idx,
                position_id,
                amount,
            }
            | Instruction::BorrowFor {
                pos_idx,
                position_id,
                amount,
            } => {
                let delegated = instruction_data[0] == 6;

                accounts::expect_len(accounts_list, 10)?;
                let a_caller = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_loan_mint = &accounts_list[2];
                let a_recipient = &accounts_list[3];
                let a_vault_pda = &accounts_list[4];
                let a_token = &accounts_list[5];
                let a_clock = &accounts_list[6];
                let a_oracle_collateral = &accounts_list[7];
                let a_oracle_loan = &accounts_list[8];
                let a_collector = &accounts_list[9];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                if a_loan_mint.key.to_bytes() != config.loan_mint {
                    return Err(CrucibleError::InvalidMint.into());
                }
                let recipient_state =
                    verify_token_account(a_recipient, &config.loan_mint, CrucibleError::InvalidMint)?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .resolve(pos_idx, position_id)
                    .map_err(map_vault_error)?;
                let position_owner = engine.positions[idx as usize].owner;
                if delegated {
                    if !config.is_delegate(&a_caller.key.to_bytes()) {
                        return Err(CrucibleError::Unauthorized.into());
                    }
                } else {
                    engine
                        .check_owner(idx, &a_caller.key.to_bytes())
                        .map_err(map_vault_error)?;
                }
                // Loan asset is always minted to the position owner.
                if recipient_state.owner.to_bytes() != position_owner {
                    return Err(CrucibleError::InvalidOwnerAccount.into());
                }

                try_collect_interest(engine, &config, a_collector, idx, now_slot);

                engine
                    .borrow(idx, amount as u128, collateral_price, loan_price, now_slot)
                    .map_err(map_vault_error)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                loan_asset::mint_to(
                    a_token,
                    a_loan_mint,
                    a_recipient,
                    a_vault_pda,
                    amount,
                    &signer_seeds,
                )?;
            }
            Instruction::RepayDebt {
                pos_idx,
                position_id,
                amount,
            } => {
                accounts::expect_len(accounts_list, 7)?;
                let a_owner = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_loan_mint = &accounts_list[2];
                let a_owner_loan = &accounts_list[3];
                let a_token = &accounts_list[4];
                let a_clock = &accounts_list[5];
                let a_collector = &accounts_list[6];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                if a_loan_mint.key.to_bytes() != config.loan_mint {
                    return Err(CrucibleError::InvalidMint.into());
                }
                verify_token_account(a_owner_loan, &config.loan_mint, CrucibleError::InvalidMint)?;

                let clock = Clock::from_account_info(a_clock)?;
                let now_slot = clock.slot;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .resolve(pos_idx, position_id)
                    .map_err(map_vault_error)?;
                engine
                    .check_owner(idx, &a_owner.key.to_bytes())
                    .map_err(map_vault_error)?;

                try_collect_interest(engine, &config, a_collector, idx, now_slot);

                let closed = engine
                    .repay_debt(idx, amount as u128, now_slot)
                    .map_err(map_vault_error)?;

                loan_asset::burn(a_token, a_owner_loan, a_loan_mint, a_owner, amount)?;

                if closed {
                    msg!("position {} closed", position_id);
                }
            }
            Instruction::LiquidatePosition {
                pos_idx,
                position_id,
            } => {
                accounts::expect_len(accounts_list, 12)?;
                let a_liquidator = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_vault = &accounts_list[2];
                let a_liquidator_ata = &accounts_list[3];
                let a_treasury = &accounts_list[4];
                let a_owner_ata = &accounts_list[5];
                let a_vault_pda = &accounts_list[6];
                let a_token = &accounts_list[7];
                let a_clock = &accounts_list[8];
                let a_oracle_collateral = &accounts_list[9];
                let a_oracle_loan = &accounts_list[10];
                let a_collector = &accounts_list[11];

                accounts::expect_signer(a_liquidator)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                verify_vault(a_vault, &config)?;
                verify_treasury(a_treasury, &config)?;
                verify_token_account(
                    a_liquidator_ata,
                    &config.collateral_mint,
                    CrucibleError::InvalidMint,
                )?;
                let owner_ata_state = verify_token_account(
                    a_owner_ata,
                    &config.collateral_mint,
                    CrucibleError::LiquidationFailed,
                )?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let strategy_accounts = strategy_tail(&config, accounts_list, 12)?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .resolve(pos_idx, position_id)
                    .map_err(map_vault_error)?;
                // The remainder goes back to the original owner.
                if owner_ata_state.owner.to_bytes() != engine.positions[idx as usize].owner {
                    return Err(CrucibleError::InvalidOwnerAccount.into());
                }

                try_collect_interest(engine, &config, a_collector, idx, now_slot);

                let outcome = engine
                    .liquidate(idx, collateral_price, loan_price, now_slot)
                    .map_err(map_vault_error)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                if let Some((a_strategy_program, a_strategy_vault)) = strategy_accounts {
                    strategy::withdraw(
                        a_strategy_program,
                        a_strategy_vault,
                        a_vault,
                        a_vault_pda,
                        outcome.position_id,
                        to_u64(outcome.collateral_seized)?,
                        &signer_seeds,
                    )
                    .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                }

                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_liquidator_ata,
                    a_vault_pda,
                    to_u64(outcome.reward)?,
                    &signer_seeds,
                )
                .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_treasury,
                    a_vault_pda,
                    to_u64(outcome.penalty)?,
                    &signer_seeds,
                )
                .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                collateral::withdraw(
                    a_token,
                    a_vault,
                    a_owner_ata,
                    a_vault_pda,
                    to_u64(outcome.remainder)?,
                    &signer_seeds,
                )
                .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;

                msg!(
                    "position {} liquidated: reward {}, penalty {}, remainder {}, debt burned {}",
                    outcome.position_id,
                    outcome.reward,
                    outcome.penalty,
                    outcome.remainder,
                    outcome.debt_burned
                );
            }
            Instruction::BatchLiquidate { targets } => {
                if targets.is_empty() {
                    return Err(CrucibleError::NoPositionsToLiquidate.into());
                }

                accounts::expect_len(accounts_list, 11)?;
                let a_liquidator = &accounts_list[0];
                let a_slab = &accounts_list[1];
                let a_vault = &accounts_list[2];
                let a_liquidator_ata = &accounts_list[3];
                let a_treasury = &accounts_list[4];
                let a_vault_pda = &accounts_list[5];
                let a_token = &accounts_list[6];
                let a_clock = &accounts_list[7];
                let a_oracle_collateral = &accounts_list[8];
                let a_oracle_loan = &accounts_list[9];
                let a_collector = &accounts_list[10];

                accounts::expect_signer(a_liquidator)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                verify_vault(a_vault, &config)?;
                verify_treasury(a_treasury, &config)?;
                verify_token_account(
                    a_liquidator_ata,
                    &config.collateral_mint,
                    CrucibleError::InvalidMint,
                )?;
                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;

                let strategy_accounts = strategy_tail(&config, accounts_list, 11)?;
                let owner_ata_base = if strategy_accounts.is_some() { 13 } else { 11 };
                accounts::expect_len(accounts_list, owner_ata_base + targets.len())?;

                let (collateral_price, loan_price, now_slot) =
                    read_prices(&config, a_clock, a_oracle_collateral, a_oracle_loan)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                let engine = zc::engine_mut(&mut data)?;

                let mut liquidated: Vec<u64> = Vec::with_capacity(targets.len());
                for (i, &(pos_idx, position_id)) in targets.iter().enumerate() {
                    // Partial success: unknown, stale, or healthy targets
                    // are skipped, never aborted on.
                    let idx = match engine.resolve(pos_idx, position_id) {
                        Ok(idx) => idx,
                        Err(_) => continue,
                    };

                    try_collect_interest(engine, &config, a_collector, idx, now_slot);

                    match engine.is_liquidatable(idx, collateral_price, loan_price) {
                        Ok(true) => {}
                        _ => continue,
                    }

                    let a_owner_ata = &accounts_list[owner_ata_base + i];
                    let owner_ata_state = verify_token_account(
                        a_owner_ata,
                        &config.collateral_mint,
                        CrucibleError::LiquidationFailed,
                    )?;
                    if owner_ata_state.owner.to_bytes() != engine.positions[idx as usize].owner {
                        return Err(CrucibleError::InvalidOwnerAccount.into());
                    }

                    let outcome = engine
                        .liquidate(idx, collateral_price, loan_price, now_slot)
                        .map_err(map_vault_error)?;

                    if let Some((a_strategy_program, a_strategy_vault)) = strategy_accounts {
                        strategy::withdraw(
                            a_strategy_program,
                            a_strategy_vault,
                            a_vault,
                            a_vault_pda,
                            outcome.position_id,
                            to_u64(outcome.collateral_seized)?,
                            &signer_seeds,
                        )
                        .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                    }

                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_liquidator_ata,
                        a_vault_pda,
                        to_u64(outcome.reward)?,
                        &signer_seeds,
                    )
                    .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_treasury,
                        a_vault_pda,
                        to_u64(outcome.penalty)?,
                        &signer_seeds,
                    )
                    .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;
                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_owner_ata,
                        a_vault_pda,
                        to_u64(outcome.remainder)?,
                        &signer_seeds,
                    )
                    .map_err(|_| ProgramError::from(CrucibleError::LiquidationFailed))?;

                    liquidated.push(outcome.position_id);
                }

                msg!(
                    "batch liquidation: {} of {} targets liquidated: {:?}",
                    liquidated.len(),
                    targets.len(),
                    liquidated
                );
            }
            Instruction::SetDoNotMint { flag } => {
                accounts::expect_len(accounts_list, 2)?;
                let a_owner = &accounts_list[0];
                let a_slab = &accounts_list[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_do_not_mint(a_owner.key.to_bytes(), flag)
                    .map_err(map_vault_error)?;
            }
            Instruction::SetInterestOptOut { flag } => {
                accounts::expect_len(accounts_list, 2)?;
                let a_owner = &accounts_list[0];
                let a_slab = &accounts_list[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_interest_opt_out(a_owner.key.to_bytes(), flag)
                    .map_err(map_vault_error)?;
            }
            Instruction::SetStrategy {
                strategy_program,
                strategy_vault,
            } => {
                accounts::expect_len(accounts_list, 2)?;
                let a_admin = &accounts_list[0];
                let a_slab = &accounts_list[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin.key)?;

                let program_bytes = strategy_program.to_bytes();
                let vault_bytes = strategy_vault.to_bytes();
                // Either both set (enable) or both zero (disable).
                if (program_bytes == [0; 32]) != (vault_bytes == [0; 32]) {
                    return Err(CrucibleError::InvalidStrategyConfig.into());
                }

                let mut config = state::read_config(&data);
                config.strategy_program = program_bytes;
                config.strategy_vault = vault_bytes;
                state::write_config(&mut data, &config);
            }
            Instruction::SetDelegate { delegate, enabled } => {
                accounts::expect_len(accounts_list, 2)?;
                let a_admin = &accounts_list[0];
                let a_slab = &accounts_list[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin.key)?;

                let mut config = state::read_config(&data);
                let key = delegate.to_bytes();
                let count = config.delegate_count as usize;
                if enabled {
                    if !config.delegates[..count].contains(&key) {
                        if count >= crate::constants::MAX_DELEGATES {
                            return Err(CrucibleError::DelegateLimitReached.into());
                        }
                        config.delegates[count] = key;
                        config.delegate_count += 1;
                    }
                } else if let Some(pos) = config.delegates[..count].iter().position(|d| *d == key) {
                    config.delegates[pos] = config.delegates[count - 1];
                    config.delegates[count - 1] = [0; 32];
                    config.delegate_count -= 1;
                }
                state::write_config(&mut data, &config);
            }
        }
        Ok(())
    }
}

// 13. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

// 14. mod engine (glue)
pub mod engine {
    pub use crucible::{
        GateOutcome, LiquidationOutcome, OpenOutcome, Position, VaultEngine, VaultError,
        VaultParams, WithdrawOutcome, HIGH_PRECISION, INTEREST_INDEX_PRECISION, MAX_POSITIONS,
        MAX_POSITIONS_PER_OWNER, PRECISION, PRICE_PRECISION, U128,
    };
}
