//! Fair Vault: single-file Solana program wrapping the vault accounting engine.

#![deny(unsafe_code)]

pub mod engine;

// 1. mod constants
pub mod constants {
    use core::mem::size_of;
    use crate::engine::VaultEngine;
    use crate::state::{PositionAccount, VaultConfig};

    pub const MAGIC: u64 = 0x4641_4952_5641_4c54; // "FAIRVALT"
    pub const POSITION_MAGIC: u64 = 0x4656_504f_5349_544e; // "FVPOSITN"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<VaultConfig>();
    // Fixed so host and SBF builds agree on the layout.
    pub const ENGINE_ALIGN: usize = 16;

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<VaultEngine>();
    pub const VAULT_LEN: usize = ENGINE_OFF + ENGINE_LEN;
    pub const POSITION_LEN: usize = size_of::<PositionAccount>();

    pub const VAULT_SEED: &[u8] = b"vault";
    pub const POSITION_SEED: &[u8] = b"position";
}

// 2. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;
    use crate::engine::VaultEngineError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum FairVaultError {
        #[error("Vault account is not initialized")]
        NotInitialized,
        #[error("Vault account has an unsupported version")]
        InvalidVersion,
        #[error("Vault account is already initialized")]
        AlreadyInitialized,
        #[error("Vault account has the wrong length")]
        InvalidVaultLen,
        #[error("Custody account does not belong to the vault")]
        InvalidCustodyAccount,
        #[error("Token account has the wrong mint")]
        InvalidMint,
        #[error("Share mint must be empty and controlled by the vault authority")]
        InvalidShareMint,
        #[error("Share account does not belong to the depositor")]
        InvalidShareAccount,
        #[error("Position account does not match the depositor")]
        InvalidPositionAccount,
        #[error("Distribution address is invalid")]
        InvalidDistributionAddress,
        #[error("Destination is not an administrator asset account")]
        InvalidAdminAccount,
        #[error("Asset and share mints have different decimals")]
        DecimalsMismatch,
        #[error("Account must sign")]
        ExpectedSigner,
        #[error("Account must be writable")]
        ExpectedWritable,
        #[error("Caller is not the vault administrator")]
        Unauthorized,
        #[error("Caller does not own the position")]
        NotPositionOwner,
        // Engine errors mapped:
        #[error("Performance rate exceeds the maximum")]
        InvalidPerformanceRate,
        #[error("Vesting schedule is invalid")]
        InvalidVestingSchedule,
        #[error("Mint decimals are too large")]
        InvalidDecimals,
        #[error("Amount must be non-zero")]
        ZeroAmount,
        #[error("Redeem exceeds the share balance")]
        ExceedsMaxRedeem,
        #[error("Withdraw exceeds the redeemable value")]
        ExceedsMaxWithdraw,
        #[error("Shares are still vesting")]
        VestingLocked,
        #[error("Not enough idle assets in custody")]
        InsufficientLiquidity,
        #[error("Reported value is below the idle balance")]
        InvalidReportedAssets,
        #[error("Redemption at NAV is already enabled")]
        AlreadyRedeemsAtNav,
        #[error("Arithmetic overflow")]
        Overflow,
        #[error("Division by zero")]
        DivisionByZero,
    }

    impl From<FairVaultError> for ProgramError {
        fn from(e: FairVaultError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for FairVaultError {
        fn type_of() -> &'static str {
            "FairVaultError"
        }
    }

    impl PrintProgramError for FairVaultError {
        fn print<E>(&self)
        where
            E: 'static + std::error::Error + DecodeError<E> + PrintProgramError + FromPrimitive,
        {
            msg!("Error: {}", self);
        }
    }

    pub fn map_engine_error(e: VaultEngineError) -> ProgramError {
        let err = match e {
            VaultEngineError::InvalidPerformanceRate => FairVaultError::InvalidPerformanceRate,
            VaultEngineError::InvalidVestingSchedule => FairVaultError::InvalidVestingSchedule,
            VaultEngineError::InvalidDecimals => FairVaultError::InvalidDecimals,
            VaultEngineError::ZeroAmount => FairVaultError::ZeroAmount,
            VaultEngineError::ExceedsMaxRedeem { requested, max } => {
                msg!("Redeem of {} shares exceeds max {}", requested, max);
                FairVaultError::ExceedsMaxRedeem
            }
            VaultEngineError::ExceedsMaxWithdraw { requested, max } => {
                msg!("Withdraw of {} assets exceeds max {}", requested, max);
                FairVaultError::ExceedsMaxWithdraw
            }
            VaultEngineError::VestingLocked { requested, available } => {
                msg!("Vesting: requested {} shares, {} redeemable", requested, available);
                FairVaultError::VestingLocked
            }
            VaultEngineError::InsufficientLiquidity => FairVaultError::InsufficientLiquidity,
            VaultEngineError::InvalidReportedAssets => FairVaultError::InvalidReportedAssets,
            VaultEngineError::AlreadyRedeemsAtNav => FairVaultError::AlreadyRedeemsAtNav,
            VaultEngineError::Overflow => FairVaultError::Overflow,
            VaultEngineError::DivisionByZero => FairVaultError::DivisionByZero,
        };
        err.into()
    }
}

// 3. mod ix
pub mod ix {
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    /// Read-only conversion served by `Instruction::Convert`.
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Conversion {
        ToShares = 0,
        ToAssets = 1,
        PreviewDeposit = 2,
        PreviewMint = 3,
        PreviewWithdraw = 4,
        PreviewRedeem = 5,
    }

    impl Conversion {
        pub fn from_u8(v: u8) -> Result<Self, ProgramError> {
            match v {
                0 => Ok(Conversion::ToShares),
                1 => Ok(Conversion::ToAssets),
                2 => Ok(Conversion::PreviewDeposit),
                3 => Ok(Conversion::PreviewMint),
                4 => Ok(Conversion::PreviewWithdraw),
                5 => Ok(Conversion::PreviewRedeem),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        InitVault {
            distribution: Pubkey,
            performance_rate_bps: u16,
            vesting_start: i64,
            vesting_end: i64,
            name: [u8; 32],
            symbol: [u8; 16],
        },
        Deposit { assets: u64 },
        Mint { shares: u64 },
        Redeem { shares: u64, depositor: Pubkey },
        Withdraw { assets: u64, depositor: Pubkey },
        TakeAssets { amount: u64 },
        UpdateInvestedAssets { value: u64 },
        UpdateTotalAssets { value: u64 },
        EnableRedeemsAtNav,
        QueryVault { depositor: Pubkey },
        Convert { amount: u64, depositor: Pubkey, direction: Conversion },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => { // InitVault
                    let distribution = read_pubkey(&mut rest)?;
                    let performance_rate_bps = read_u16(&mut rest)?;
                    let vesting_start = read_i64(&mut rest)?;
                    let vesting_end = read_i64(&mut rest)?;
                    let name = read_array::<32>(&mut rest)?;
                    let symbol = read_array::<16>(&mut rest)?;
                    Ok(Instruction::InitVault {
                        distribution, performance_rate_bps, vesting_start, vesting_end, name, symbol,
                    })
                },
                1 => Ok(Instruction::Deposit { assets: read_u64(&mut rest)? }),
                2 => Ok(Instruction::Mint { shares: read_u64(&mut rest)? }),
                3 => {
                    let shares = read_u64(&mut rest)?;
                    let depositor = read_pubkey(&mut rest)?;
                    Ok(Instruction::Redeem { shares, depositor })
                },
                4 => {
                    let assets = read_u64(&mut rest)?;
                    let depositor = read_pubkey(&mut rest)?;
                    Ok(Instruction::Withdraw { assets, depositor })
                },
                5 => Ok(Instruction::TakeAssets { amount: read_u64(&mut rest)? }),
                6 => Ok(Instruction::UpdateInvestedAssets { value: read_u64(&mut rest)? }),
                7 => Ok(Instruction::UpdateTotalAssets { value: read_u64(&mut rest)? }),
                8 => Ok(Instruction::EnableRedeemsAtNav),
                9 => Ok(Instruction::QueryVault { depositor: read_pubkey(&mut rest)? }),
                10 => {
                    let amount = read_u64(&mut rest)?;
                    let depositor = read_pubkey(&mut rest)?;
                    let direction = Conversion::from_u8(read_u8(&mut rest)?)?;
                    Ok(Instruction::Convert { amount, depositor, direction })
                },
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], ProgramError> {
        if input.len() < N {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(N);
        *input = rest;
        bytes.try_into().map_err(|_| ProgramError::InvalidInstructionData)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        Ok(u16::from_le_bytes(read_array(input)?))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        Ok(u64::from_le_bytes(read_array(input)?))
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        Ok(i64::from_le_bytes(read_array(input)?))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::new_from_array(read_array(input)?))
    }
}

// 4. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::{POSITION_SEED, VAULT_SEED};
    use crate::error::FairVaultError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(FairVaultError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(FairVaultError::ExpectedWritable.into());
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

    /// Owns the custody account and is the share mint authority.
    pub fn derive_vault_authority(program_id: &Pubkey, vault_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, vault_key.as_ref()], program_id)
    }

    pub fn derive_position(program_id: &Pubkey, vault_key: &Pubkey, depositor: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[POSITION_SEED, vault_key.as_ref(), depositor.as_ref()],
            program_id,
        )
    }
}

// 5. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use crate::constants::{CONFIG_LEN, ENGINE_LEN, ENGINE_OFF, HEADER_LEN, POSITION_LEN};
    use crate::engine::{Position, VaultEngine};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct VaultHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct VaultConfig {
        pub asset_mint: [u8; 32],
        pub share_mint: [u8; 32],
        /// Token account holding idle assets, owned by the vault authority
        pub custody: [u8; 32],
        /// Asset token account receiving performance fees
        pub distribution: [u8; 32],
        pub name: [u8; 32],
        pub symbol: [u8; 16],
        pub decimals: u8,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 6],
    }

    /// Ledger entry stored in the position PDA.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct PositionAccount {
        pub magic: u64,
        pub depositor: [u8; 32],
        pub position: Position,
    }

    pub fn vault_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    fn read_pod<T: Pod>(src: &[u8]) -> T {
        let mut value = T::zeroed();
        bytemuck::bytes_of_mut(&mut value).copy_from_slice(src);
        value
    }

    pub fn read_header(data: &[u8]) -> VaultHeader {
        read_pod(&data[..HEADER_LEN])
    }

    pub fn write_header(data: &mut [u8], h: &VaultHeader) {
        data[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
    }

    pub fn read_config(data: &[u8]) -> VaultConfig {
        read_pod(&data[HEADER_LEN..HEADER_LEN + CONFIG_LEN])
    }

    pub fn write_config(data: &mut [u8], c: &VaultConfig) {
        data[HEADER_LEN..HEADER_LEN + CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(c));
    }

    pub fn read_engine(data: &[u8]) -> VaultEngine {
        read_pod(&data[ENGINE_OFF..ENGINE_OFF + ENGINE_LEN])
    }

    pub fn write_engine(data: &mut [u8], e: &VaultEngine) {
        data[ENGINE_OFF..ENGINE_OFF + ENGINE_LEN].copy_from_slice(bytemuck::bytes_of(e));
    }

    pub fn read_position(data: &[u8]) -> PositionAccount {
        read_pod(&data[..POSITION_LEN])
    }

    pub fn write_position(data: &mut [u8], p: &PositionAccount) {
        data[..POSITION_LEN].copy_from_slice(bytemuck::bytes_of(p));
    }
}

// 6. mod token
pub mod token {
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError, program_pack::Pack,
    };
    use spl_token::state::{Account as TokenAccount, Mint};

    #[cfg(not(any(test, feature = "test")))]
    use solana_program::program::{invoke, invoke_signed};

    pub fn read_account(ai: &AccountInfo) -> Result<TokenAccount, ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(ProgramError::IllegalOwner);
        }
        let data = ai.try_borrow_data()?;
        TokenAccount::unpack(&data)
    }

    pub fn read_mint(ai: &AccountInfo) -> Result<Mint, ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(ProgramError::IllegalOwner);
        }
        let data = ai.try_borrow_data()?;
        Mint::unpack(&data)
    }

    /// Move assets into custody; `authority` is the signing depositor.
    #[allow(unused_variables)]
    pub fn transfer_in<'a>(
        token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                token_program.key,
                source.key,
                dest.key,
                authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), authority.clone(), token_program.clone()])
        }
        #[cfg(any(test, feature = "test"))]
        {
            debit(source, amount)?;
            credit(dest, amount)
        }
    }

    /// Move assets out of custody, signed by the vault authority.
    #[allow(unused_variables)]
    pub fn transfer_out<'a>(
        token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        authority: &AccountInfo<'a>,
        amount: u64,
        signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                token_program.key,
                source.key,
                dest.key,
                authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), dest.clone(), authority.clone(), token_program.clone()], signer_seeds)
        }
        #[cfg(any(test, feature = "test"))]
        {
            debit(source, amount)?;
            credit(dest, amount)
        }
    }

    #[allow(unused_variables)]
    pub fn mint_to<'a>(
        token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        authority: &AccountInfo<'a>,
        amount: u64,
        signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::mint_to(
                token_program.key,
                mint.key,
                dest.key,
                authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[mint.clone(), dest.clone(), authority.clone(), token_program.clone()], signer_seeds)
        }
        #[cfg(any(test, feature = "test"))]
        {
            adjust_supply(mint, amount, true)?;
            credit(dest, amount)
        }
    }

    /// Burn shares; `authority` is the signing share owner.
    #[allow(unused_variables)]
    pub fn burn<'a>(
        token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::burn(
                token_program.key,
                source.key,
                mint.key,
                authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), mint.clone(), authority.clone(), token_program.clone()])
        }
        #[cfg(any(test, feature = "test"))]
        {
            adjust_supply(mint, amount, false)?;
            debit(source, amount)
        }
    }

    #[cfg(any(test, feature = "test"))]
    fn debit(ai: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut data = ai.try_borrow_mut_data()?;
        let mut state = TokenAccount::unpack(&data)?;
        state.amount = state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(state, &mut data)
    }

    #[cfg(any(test, feature = "test"))]
    fn credit(ai: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut data = ai.try_borrow_mut_data()?;
        let mut state = TokenAccount::unpack(&data)?;
        state.amount = state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(state, &mut data)
    }

    #[cfg(any(test, feature = "test"))]
    fn adjust_supply(mint: &AccountInfo, amount: u64, increase: bool) -> Result<(), ProgramError> {
        let mut data = mint.try_borrow_mut_data()?;
        let mut state = Mint::unpack(&data)?;
        state.supply = if increase {
            state.supply.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?
        } else {
            state.supply.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?
        };
        Mint::pack(state, &mut data)
    }
}

// 7. mod ledger
pub mod ledger {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::{
        accounts,
        constants::{POSITION_LEN, POSITION_MAGIC},
        engine::Position,
        error::FairVaultError,
        state::{self, PositionAccount},
    };

    #[cfg(not(any(test, feature = "test")))]
    use solana_program::{
        program::{invoke, invoke_signed},
        rent::Rent,
        system_instruction,
        sysvar::Sysvar,
    };

    /// How an unallocated position PDA gets funded.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Funding {
        /// No lamports yet: `create_account` for the full rent.
        Create { lamports: u64 },
        /// Already holds lamports: top up, then `allocate` and `assign`.
        Adopt { top_up: u64 },
    }

    pub fn funding(current_lamports: u64, rent_exempt: u64) -> Funding {
        if current_lamports == 0 {
            Funding::Create { lamports: rent_exempt }
        } else {
            Funding::Adopt { top_up: rent_exempt.saturating_sub(current_lamports) }
        }
    }

    /// Read a depositor's position. Unallocated and freshly allocated
    /// accounts read as the zero position.
    pub fn load(program_id: &Pubkey, ai: &AccountInfo, depositor: &Pubkey) -> Result<Position, ProgramError> {
        if ai.data_is_empty() {
            return Ok(Position::default());
        }
        accounts::expect_owner(ai, program_id)?;
        let data = ai.try_borrow_data()?;
        if data.len() != POSITION_LEN {
            return Err(FairVaultError::InvalidPositionAccount.into());
        }
        let account = state::read_position(&data);
        if account.magic == 0 {
            return Ok(Position::default());
        }
        if account.magic != POSITION_MAGIC || account.depositor != depositor.to_bytes() {
            return Err(FairVaultError::InvalidPositionAccount.into());
        }
        Ok(account.position)
    }

    /// Create the position PDA on first use, funded by `payer`.
    #[allow(unused_variables)]
    pub fn allocate<'a>(
        program_id: &Pubkey,
        payer: &AccountInfo<'a>,
        position: &AccountInfo<'a>,
        system_program: &AccountInfo<'a>,
        seeds: &[&[u8]],
    ) -> Result<(), ProgramError> {
        if !position.data_is_empty() {
            return Ok(());
        }
        #[cfg(not(any(test, feature = "test")))]
        {
            let rent = Rent::get()?;
            match funding(position.lamports(), rent.minimum_balance(POSITION_LEN)) {
                Funding::Create { lamports } => {
                    let ix = system_instruction::create_account(
                        payer.key,
                        position.key,
                        lamports,
                        POSITION_LEN as u64,
                        program_id,
                    );
                    invoke_signed(&ix, &[payer.clone(), position.clone(), system_program.clone()], &[seeds])
                }
                // create_account rejects an address that already holds lamports.
                Funding::Adopt { top_up } => {
                    if top_up > 0 {
                        let ix = system_instruction::transfer(payer.key, position.key, top_up);
                        invoke(&ix, &[payer.clone(), position.clone(), system_program.clone()])?;
                    }
                    let ix = system_instruction::allocate(position.key, POSITION_LEN as u64);
                    invoke_signed(&ix, &[position.clone(), system_program.clone()], &[seeds])?;
                    let ix = system_instruction::assign(position.key, program_id);
                    invoke_signed(&ix, &[position.clone(), system_program.clone()], &[seeds])
                }
            }
        }
        #[cfg(any(test, feature = "test"))]
        {
            // Harness accounts cannot grow; they are handed in pre-sized.
            Err(FairVaultError::InvalidPositionAccount.into())
        }
    }

    pub fn store(ai: &AccountInfo, depositor: &Pubkey, position: &Position) -> Result<(), ProgramError> {
        let mut data = ai.try_borrow_mut_data()?;
        if data.len() != POSITION_LEN {
            return Err(FairVaultError::InvalidPositionAccount.into());
        }
        let account = PositionAccount {
            magic: POSITION_MAGIC,
            depositor: depositor.to_bytes(),
            position: *position,
        };
        state::write_position(&mut data, &account);
        Ok(())
    }
}

// 8. mod views
pub mod views {
    use bytemuck::{Pod, Zeroable};
    use crate::engine::{self, PoolState, Position, Rounding, VaultEngine};
    use crate::ix::Conversion;

    /// Snapshot returned by `QueryVault` through program return data.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct VaultQuote {
        pub high_water_mark: u128,
        /// Pool-wide price of one share unit, rounded up
        pub price_per_share: u128,
        pub total_assets: u64,
        pub idle_assets: u64,
        pub invested_assets: u64,
        pub total_supply: u64,
        pub utilization_rate_bps: u64,
        pub vesting_rate_bps: u64,
        pub position: Position,
        pub redeemable_shares: u64,
        pub max_redeem: u64,
        pub max_withdraw: u64,
        pub redeems_at_nav: u8,
        pub _padding: [u8; 15],
    }

    pub fn quote(
        engine: &VaultEngine,
        pool: PoolState,
        position: &Position,
        share_balance: u64,
        now: i64,
    ) -> engine::Result<VaultQuote> {
        Ok(VaultQuote {
            high_water_mark: engine.high_water_mark,
            price_per_share: engine.price_per_share(pool, Rounding::Up)?,
            total_assets: engine.total_assets(pool)?,
            idle_assets: pool.idle_assets,
            invested_assets: engine.invested_assets,
            total_supply: pool.total_supply,
            utilization_rate_bps: engine.utilization_rate_bps(pool)?,
            vesting_rate_bps: engine.vesting_rate_bps(now),
            position: *position,
            redeemable_shares: engine.redeemable_shares(position, now),
            max_redeem: engine.max_redeem(share_balance),
            max_withdraw: engine.max_withdraw(share_balance, pool, position)?,
            redeems_at_nav: engine.redeems_at_nav() as u8,
            _padding: [0; 15],
        })
    }

    pub fn convert(
        engine: &VaultEngine,
        pool: PoolState,
        position: &Position,
        amount: u64,
        direction: Conversion,
    ) -> engine::Result<u64> {
        match direction {
            Conversion::ToShares => engine.convert_to_shares(amount, pool, position, Rounding::Down),
            Conversion::ToAssets => engine.convert_to_assets(amount, pool, position, Rounding::Down),
            Conversion::PreviewDeposit => engine.preview_deposit(amount, pool),
            Conversion::PreviewMint => engine.preview_mint(amount, pool),
            Conversion::PreviewWithdraw => engine.preview_withdraw(amount, pool, position),
            Conversion::PreviewRedeem => engine.preview_redeem(amount, pool, position),
        }
    }
}

// 9. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg,
        program::set_return_data,
        program_error::ProgramError,
        program_option::COption,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };
    use crate::{
        accounts,
        constants::{MAGIC, POSITION_SEED, VAULT_LEN, VAULT_SEED, VERSION},
        engine::{PoolState, Position, VaultEngine, VaultParams},
        error::{map_engine_error, FairVaultError},
        ix::Instruction,
        ledger,
        state::{self, VaultConfig, VaultHeader},
        token, views,
    };

    enum IssueRequest {
        Deposit(u64),
        Mint(u64),
    }

    enum SettleRequest {
        Redeem(u64),
        Withdraw(u64),
    }

    enum ValueReport {
        Invested(u64),
        Total(u64),
    }

    struct Vault {
        header: VaultHeader,
        config: VaultConfig,
        engine: VaultEngine,
    }

    fn vault_guard(program_id: &Pubkey, vault: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(vault, program_id)?;
        if data.len() != VAULT_LEN { return Err(FairVaultError::InvalidVaultLen.into()); }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC { return Err(FairVaultError::NotInitialized.into()); }
        if h.version != VERSION { return Err(FairVaultError::InvalidVersion.into()); }
        Ok(())
    }

    fn load_vault(program_id: &Pubkey, a_vault: &AccountInfo) -> Result<Vault, ProgramError> {
        let data = a_vault.try_borrow_data()?;
        vault_guard(program_id, a_vault, &data)?;
        require_initialized(&data)?;
        Ok(Vault {
            header: state::read_header(&data),
            config: state::read_config(&data),
            engine: state::read_engine(&data),
        })
    }

    fn store_engine(a_vault: &AccountInfo, engine: &VaultEngine) -> Result<(), ProgramError> {
        let mut data = state::vault_data_mut(a_vault)?;
        state::write_engine(&mut data, engine);
        Ok(())
    }

    fn require_admin(header: &VaultHeader, a_admin: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(a_admin)?;
        if a_admin.key.to_bytes() != header.admin {
            return Err(FairVaultError::Unauthorized.into());
        }
        Ok(())
    }

    /// Checks the custody account and returns its idle balance.
    fn verify_custody(a_custody: &AccountInfo, authority: &Pubkey, config: &VaultConfig) -> Result<u64, ProgramError> {
        if a_custody.key.to_bytes() != config.custody { return Err(FairVaultError::InvalidCustodyAccount.into()); }
        let tok = token::read_account(a_custody)?;
        if tok.mint.to_bytes() != config.asset_mint { return Err(FairVaultError::InvalidMint.into()); }
        if tok.owner != *authority { return Err(FairVaultError::InvalidCustodyAccount.into()); }
        Ok(tok.amount)
    }

    /// Checks the share mint and returns its supply.
    fn verify_share_mint(a_mint: &AccountInfo, config: &VaultConfig) -> Result<u64, ProgramError> {
        if a_mint.key.to_bytes() != config.share_mint { return Err(FairVaultError::InvalidShareMint.into()); }
        Ok(token::read_mint(a_mint)?.supply)
    }

    /// Checks a depositor's share token account and returns its balance.
    fn verify_share_account(a_shares: &AccountInfo, depositor: &Pubkey, config: &VaultConfig) -> Result<u64, ProgramError> {
        let tok = token::read_account(a_shares)?;
        if tok.mint.to_bytes() != config.share_mint || tok.owner != *depositor {
            return Err(FairVaultError::InvalidShareAccount.into());
        }
        Ok(tok.amount)
    }

    /// Checks that an asset token account belongs to the administrator.
    fn verify_admin_account(a_dest: &AccountInfo, header: &VaultHeader, config: &VaultConfig) -> Result<(), ProgramError> {
        let tok = token::read_account(a_dest)?;
        if tok.mint.to_bytes() != config.asset_mint || tok.owner.to_bytes() != header.admin {
            return Err(FairVaultError::InvalidAdminAccount.into());
        }
        Ok(())
    }

    fn verify_position(program_id: &Pubkey, a_vault: &AccountInfo, a_position: &AccountInfo, depositor: &Pubkey) -> Result<u8, ProgramError> {
        let (expected, bump) = accounts::derive_position(program_id, a_vault.key, depositor);
        if *a_position.key != expected { return Err(FairVaultError::InvalidPositionAccount.into()); }
        Ok(bump)
    }

    fn pool_state(
        program_id: &Pubkey,
        a_vault: &AccountInfo,
        a_custody: &AccountInfo,
        a_share_mint: &AccountInfo,
        config: &VaultConfig,
    ) -> Result<PoolState, ProgramError> {
        let (auth, _) = accounts::derive_vault_authority(program_id, a_vault.key);
        Ok(PoolState {
            idle_assets: verify_custody(a_custody, &auth, config)?,
            total_supply: verify_share_mint(a_share_mint, config)?,
        })
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitVault {
                distribution, performance_rate_bps, vesting_start, vesting_end, name, symbol,
            } => {
                accounts::expect_len(accounts, 7)?;
                let a_admin = &accounts[0];
                let a_vault = &accounts[1];
                let a_asset_mint = &accounts[2];
                let a_share_mint = &accounts[3];
                let a_custody = &accounts[4];
                let a_distribution = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_vault)?;

                let mut data = state::vault_data_mut(a_vault)?;
                vault_guard(program_id, a_vault, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(FairVaultError::AlreadyInitialized.into()); }

                if distribution == Pubkey::default() || *a_distribution.key != distribution {
                    return Err(FairVaultError::InvalidDistributionAddress.into());
                }
                let dist = token::read_account(a_distribution)?;
                if dist.mint != *a_asset_mint.key {
                    return Err(FairVaultError::InvalidDistributionAddress.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_vault.key);
                let custody = token::read_account(a_custody)?;
                if custody.mint != *a_asset_mint.key { return Err(FairVaultError::InvalidMint.into()); }
                if custody.owner != auth { return Err(FairVaultError::InvalidCustodyAccount.into()); }

                let asset_mint = token::read_mint(a_asset_mint)?;
                let share_mint = token::read_mint(a_share_mint)?;
                if share_mint.supply != 0 || share_mint.mint_authority != COption::Some(auth) {
                    return Err(FairVaultError::InvalidShareMint.into());
                }
                if asset_mint.decimals != share_mint.decimals {
                    return Err(FairVaultError::DecimalsMismatch.into());
                }

                let clock = Clock::from_account_info(a_clock)?;
                let engine = VaultEngine::new(
                    VaultParams {
                        decimals: asset_mint.decimals,
                        performance_rate_bps,
                        vesting_start,
                        vesting_end,
                    },
                    clock.unix_timestamp,
                ).map_err(map_engine_error)?;

                data.fill(0);

                let config = VaultConfig {
                    asset_mint: a_asset_mint.key.to_bytes(),
                    share_mint: a_share_mint.key.to_bytes(),
                    custody: a_custody.key.to_bytes(),
                    distribution: distribution.to_bytes(),
                    name,
                    symbol,
                    decimals: asset_mint.decimals,
                    vault_authority_bump: bump,
                    _padding: [0; 6],
                };
                state::write_config(&mut data, &config);
                state::write_engine(&mut data, &engine);

                let new_header = VaultHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);

                msg!(
                    "Vault initialized: fee {} bps, vesting {}..{}",
                    performance_rate_bps, vesting_start, vesting_end
                );
            },
            Instruction::Deposit { assets } => {
                process_issue(program_id, accounts, IssueRequest::Deposit(assets))?;
            },
            Instruction::Mint { shares } => {
                process_issue(program_id, accounts, IssueRequest::Mint(shares))?;
            },
            Instruction::Redeem { shares, depositor } => {
                process_settle(program_id, accounts, SettleRequest::Redeem(shares), &depositor)?;
            },
            Instruction::Withdraw { assets, depositor } => {
                process_settle(program_id, accounts, SettleRequest::Withdraw(assets), &depositor)?;
            },
            Instruction::TakeAssets { amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_vault = &accounts[1];
                let a_custody = &accounts[2];
                let a_dest = &accounts[3];
                let a_authority = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_writable(a_vault)?;
                let Vault { header, config, mut engine } = load_vault(program_id, a_vault)?;
                require_admin(&header, a_admin)?;

                let (auth, _) = accounts::derive_vault_authority(program_id, a_vault.key);
                accounts::expect_key(a_authority, &auth)?;
                let idle = verify_custody(a_custody, &auth, &config)?;
                verify_admin_account(a_dest, &header, &config)?;

                engine.take_assets(amount, idle).map_err(map_engine_error)?;
                store_engine(a_vault, &engine)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_vault.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                token::transfer_out(a_token, a_custody, a_dest, a_authority, amount, &signer_seeds)?;

                msg!("Assets taken: {}, invested now {}", amount, engine.invested_assets);
            },
            Instruction::UpdateInvestedAssets { value } => {
                process_report(program_id, accounts, ValueReport::Invested(value))?;
            },
            Instruction::UpdateTotalAssets { value } => {
                process_report(program_id, accounts, ValueReport::Total(value))?;
            },
            Instruction::EnableRedeemsAtNav => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_vault = &accounts[1];

                accounts::expect_writable(a_vault)?;
                let Vault { header, mut engine, .. } = load_vault(program_id, a_vault)?;
                require_admin(&header, a_admin)?;

                engine.enable_redeems_at_nav().map_err(map_engine_error)?;
                store_engine(a_vault, &engine)?;

                msg!("Redemption at NAV enabled");
            },
            Instruction::QueryVault { depositor } => {
                accounts::expect_len(accounts, 6)?;
                let a_vault = &accounts[0];
                let a_custody = &accounts[1];
                let a_share_mint = &accounts[2];
                let a_position = &accounts[3];
                let a_shares = &accounts[4];
                let a_clock = &accounts[5];

                let Vault { config, engine, .. } = load_vault(program_id, a_vault)?;
                let pool = pool_state(program_id, a_vault, a_custody, a_share_mint, &config)?;
                verify_position(program_id, a_vault, a_position, &depositor)?;
                let position = ledger::load(program_id, a_position, &depositor)?;
                let share_balance = verify_share_account(a_shares, &depositor, &config)?;
                let clock = Clock::from_account_info(a_clock)?;

                let quote = views::quote(&engine, pool, &position, share_balance, clock.unix_timestamp)
                    .map_err(map_engine_error)?;
                set_return_data(bytemuck::bytes_of(&quote));
            },
            Instruction::Convert { amount, depositor, direction } => {
                accounts::expect_len(accounts, 4)?;
                let a_vault = &accounts[0];
                let a_custody = &accounts[1];
                let a_share_mint = &accounts[2];
                let a_position = &accounts[3];

                let Vault { config, engine, .. } = load_vault(program_id, a_vault)?;
                let pool = pool_state(program_id, a_vault, a_custody, a_share_mint, &config)?;
                verify_position(program_id, a_vault, a_position, &depositor)?;
                let position = ledger::load(program_id, a_position, &depositor)?;

                let value = views::convert(&engine, pool, &position, amount, direction)
                    .map_err(map_engine_error)?;
                set_return_data(&value.to_le_bytes());
            },
        }
        Ok(())
    }

    fn process_issue<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        request: IssueRequest,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 10)?;
        let a_caller = &accounts[0];
        let a_vault = &accounts[1];
        let a_position = &accounts[2];
        let a_source = &accounts[3];
        let a_receiver = &accounts[4];
        let a_custody = &accounts[5];
        let a_share_mint = &accounts[6];
        let a_authority = &accounts[7];
        let a_token = &accounts[8];
        let a_system = &accounts[9];

        accounts::expect_signer(a_caller)?;
        accounts::expect_writable(a_position)?;

        let Vault { config, engine, .. } = load_vault(program_id, a_vault)?;
        let (auth, _) = accounts::derive_vault_authority(program_id, a_vault.key);
        accounts::expect_key(a_authority, &auth)?;
        let pool = pool_state(program_id, a_vault, a_custody, a_share_mint, &config)?;

        let position_bump = verify_position(program_id, a_vault, a_position, a_caller.key)?;
        let mut position = ledger::load(program_id, a_position, a_caller.key)?;

        let (assets, shares) = match request {
            IssueRequest::Deposit(assets) => {
                let shares = engine.deposit(&mut position, assets, pool).map_err(map_engine_error)?;
                (assets, shares)
            }
            IssueRequest::Mint(shares) => {
                let assets = engine.mint(&mut position, shares, pool).map_err(map_engine_error)?;
                (assets, shares)
            }
        };

        if !engine.redeems_at_nav() {
            let bump_arr: [u8; 1] = [position_bump];
            let seeds: [&[u8]; 4] = [POSITION_SEED, a_vault.key.as_ref(), a_caller.key.as_ref(), &bump_arr];
            ledger::allocate(program_id, a_caller, a_position, a_system, &seeds)?;
            ledger::store(a_position, a_caller.key, &position)?;
        }

        token::transfer_in(a_token, a_source, a_custody, a_caller, assets)?;

        let bump_arr: [u8; 1] = [config.vault_authority_bump];
        let seeds: [&[u8]; 3] = [VAULT_SEED, a_vault.key.as_ref(), &bump_arr];
        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
        token::mint_to(a_token, a_share_mint, a_receiver, a_authority, shares, &signer_seeds)?;

        msg!("Deposit: {} assets for {} shares", assets, shares);
        Ok(())
    }

    fn process_settle<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        request: SettleRequest,
        depositor: &Pubkey,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 10)?;
        let a_caller = &accounts[0];
        let a_vault = &accounts[1];
        let a_position = &accounts[2];
        let a_shares = &accounts[3];
        let a_receiver = &accounts[4];
        let a_custody = &accounts[5];
        let a_share_mint = &accounts[6];
        let a_authority = &accounts[7];
        let a_token = &accounts[8];
        let a_clock = &accounts[9];

        accounts::expect_signer(a_caller)?;
        if a_caller.key != depositor {
            return Err(FairVaultError::NotPositionOwner.into());
        }

        let Vault { config, engine, .. } = load_vault(program_id, a_vault)?;
        let (auth, _) = accounts::derive_vault_authority(program_id, a_vault.key);
        accounts::expect_key(a_authority, &auth)?;
        let pool = pool_state(program_id, a_vault, a_custody, a_share_mint, &config)?;
        let share_balance = verify_share_account(a_shares, depositor, &config)?;

        verify_position(program_id, a_vault, a_position, depositor)?;
        let mut position: Position = ledger::load(program_id, a_position, depositor)?;
        let clock = Clock::from_account_info(a_clock)?;
        let now = clock.unix_timestamp;

        let (assets, shares) = match request {
            SettleRequest::Redeem(shares) => {
                let assets = engine
                    .redeem(&mut position, shares, share_balance, pool, now)
                    .map_err(map_engine_error)?;
                (assets, shares)
            }
            SettleRequest::Withdraw(assets) => {
                let shares = engine
                    .withdraw(&mut position, assets, share_balance, pool, now)
                    .map_err(map_engine_error)?;
                (assets, shares)
            }
        };

        if !engine.redeems_at_nav() {
            accounts::expect_writable(a_position)?;
            ledger::store(a_position, depositor, &position)?;
        }

        token::burn(a_token, a_share_mint, a_shares, a_caller, shares)?;

        let bump_arr: [u8; 1] = [config.vault_authority_bump];
        let seeds: [&[u8]; 3] = [VAULT_SEED, a_vault.key.as_ref(), &bump_arr];
        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
        token::transfer_out(a_token, a_custody, a_receiver, a_authority, assets, &signer_seeds)?;

        msg!("Redeem: {} shares for {} assets", shares, assets);
        Ok(())
    }

    fn process_report<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        report: ValueReport,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 7)?;
        let a_admin = &accounts[0];
        let a_vault = &accounts[1];
        let a_custody = &accounts[2];
        let a_distribution = &accounts[3];
        let a_share_mint = &accounts[4];
        let a_authority = &accounts[5];
        let a_token = &accounts[6];

        accounts::expect_writable(a_vault)?;
        let Vault { header, config, mut engine } = load_vault(program_id, a_vault)?;
        require_admin(&header, a_admin)?;

        let (auth, _) = accounts::derive_vault_authority(program_id, a_vault.key);
        accounts::expect_key(a_authority, &auth)?;
        if a_distribution.key.to_bytes() != config.distribution {
            return Err(FairVaultError::InvalidDistributionAddress.into());
        }
        let pool = pool_state(program_id, a_vault, a_custody, a_share_mint, &config)?;

        let accrual = match report {
            ValueReport::Invested(value) => engine.report_invested_assets(value, pool),
            ValueReport::Total(value) => engine.report_total_assets(value, pool),
        }
        .map_err(map_engine_error)?;
        store_engine(a_vault, &engine)?;

        if accrual.fee > 0 {
            let bump_arr: [u8; 1] = [config.vault_authority_bump];
            let seeds: [&[u8]; 3] = [VAULT_SEED, a_vault.key.as_ref(), &bump_arr];
            let signer_seeds: [&[&[u8]]; 1] = [&seeds];
            token::transfer_out(a_token, a_custody, a_distribution, a_authority, accrual.fee, &signer_seeds)?;
        }

        msg!(
            "Value report: invested {}, price {}, fee {}, watermark {}",
            engine.invested_assets, accrual.price_per_share, accrual.fee, engine.high_water_mark
        );
        Ok(())
    }
}

// 10. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
#[allow(unsafe_code)]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult,
        program_error::PrintProgramError, pubkey::Pubkey,
    };
    use crate::{error::FairVaultError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            error.print::<FairVaultError>();
            return Err(error);
        }
        Ok(())
    }
}
