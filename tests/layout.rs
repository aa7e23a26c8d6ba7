//! On-chain account layout checks.
//!
//! Offsets are part of the account format read by clients, so any change
//! here is a breaking change to stored vaults.

use core::mem::size_of;
use memoffset::offset_of;
use fair_vault_prog::constants::{
    CONFIG_LEN, ENGINE_LEN, ENGINE_OFF, HEADER_LEN, POSITION_LEN, VAULT_LEN,
};
use fair_vault_prog::engine::{Position, VaultEngine};
use fair_vault_prog::state::{PositionAccount, VaultConfig, VaultHeader};
use fair_vault_prog::views::VaultQuote;

#[test]
fn header_layout() {
    assert_eq!(size_of::<VaultHeader>(), HEADER_LEN);
    assert_eq!(offset_of!(VaultHeader, version), 8);
    assert_eq!(offset_of!(VaultHeader, bump), 12);
    assert_eq!(offset_of!(VaultHeader, admin), 16);
}

#[test]
fn config_layout() {
    assert_eq!(CONFIG_LEN, 184);
    assert_eq!(offset_of!(VaultConfig, share_mint), 32);
    assert_eq!(offset_of!(VaultConfig, custody), 64);
    assert_eq!(offset_of!(VaultConfig, distribution), 96);
    assert_eq!(offset_of!(VaultConfig, name), 128);
    assert_eq!(offset_of!(VaultConfig, symbol), 160);
    assert_eq!(offset_of!(VaultConfig, decimals), 176);
    assert_eq!(offset_of!(VaultConfig, vault_authority_bump), 177);
}

#[test]
fn engine_layout() {
    assert_eq!(ENGINE_LEN, 64);
    assert_eq!(ENGINE_OFF, 256);
    assert_eq!(VAULT_LEN, 320);
    assert_eq!(offset_of!(VaultEngine, vesting_start), 16);
    assert_eq!(offset_of!(VaultEngine, vesting_end), 24);
    assert_eq!(offset_of!(VaultEngine, invested_assets), 32);
    assert_eq!(offset_of!(VaultEngine, share_unit), 40);
    assert_eq!(offset_of!(VaultEngine, performance_rate_bps), 48);
    assert_eq!(offset_of!(VaultEngine, mode), 50);
}

#[test]
fn position_layout() {
    assert_eq!(size_of::<Position>(), 24);
    assert_eq!(POSITION_LEN, 64);
    assert_eq!(offset_of!(PositionAccount, depositor), 8);
    assert_eq!(offset_of!(PositionAccount, position), 40);
}

#[test]
fn quote_layout() {
    assert_eq!(size_of::<VaultQuote>(), 144);
    assert_eq!(offset_of!(VaultQuote, total_assets), 32);
    assert_eq!(offset_of!(VaultQuote, position), 80);
    assert_eq!(offset_of!(VaultQuote, redeems_at_nav), 128);
}
