//! Fair-value accounting engine for a pooled asset vault.
//!
//! The engine is host-independent: it never touches accounts or performs
//! transfers. The program wrapper feeds it a [`PoolState`] snapshot (idle
//! custody balance and share supply) plus the depositor's [`Position`], and
//! applies the returned amounts through token CPIs afterwards.
//!
//! Guarantees:
//! 1. Rounding always favours the pool over the depositor.
//! 2. `vesting_amount <= share_amount` for every position.
//! 3. The high-water mark never decreases; fees are charged once per unit of
//!    price appreciation.
//! 4. The redemption mode moves from `Vesting` to `Nav` exactly once.
//! 5. Every mutating call is all-or-nothing: on `Err` nothing was written.

use bytemuck::{Pod, Zeroable};

// ============================================================================
// Constants
// ============================================================================

/// 100% in basis points.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Upper bound for the performance fee (50%).
pub const MAX_PERFORMANCE_RATE_BPS: u16 = 5_000;

/// Largest decimals value whose share unit still fits in a u64.
pub const MAX_DECIMALS: u8 = 19;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultEngineError {
    /// Performance rate above `MAX_PERFORMANCE_RATE_BPS`
    InvalidPerformanceRate,

    /// Vesting window starts in the past or ends before it starts
    InvalidVestingSchedule,

    /// Mint decimals too large to express one share unit
    InvalidDecimals,

    /// Zero-value deposit, mint, redeem or withdraw
    ZeroAmount,

    /// Redeem above the depositor's share balance
    ExceedsMaxRedeem { requested: u64, max: u64 },

    /// Withdraw above what the depositor's shares are worth
    ExceedsMaxWithdraw { requested: u64, max: u64 },

    /// Shares requested exceed the currently redeemable (vested) amount
    VestingLocked { requested: u64, available: u64 },

    /// Not enough idle assets in custody to settle
    InsufficientLiquidity,

    /// Reported total value is below the idle balance
    InvalidReportedAssets,

    /// Redemption at NAV is already enabled
    AlreadyRedeemsAtNav,

    /// Arithmetic overflow
    Overflow,

    /// Conversion against a pool with shares but no assets
    DivisionByZero,
}

pub type Result<T> = core::result::Result<T, VaultEngineError>;

// ============================================================================
// Math Helpers
// ============================================================================

/// Rounding direction for a conversion. Call sites pick the direction that
/// favours the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// `x * y / denominator` in u128 with explicit rounding.
#[inline]
pub fn mul_div(x: u128, y: u128, denominator: u128, rounding: Rounding) -> Result<u128> {
    if denominator == 0 {
        return Err(VaultEngineError::DivisionByZero);
    }
    let product = x.checked_mul(y).ok_or(VaultEngineError::Overflow)?;
    let quotient = product / denominator;
    match rounding {
        Rounding::Up if product % denominator != 0 => {
            quotient.checked_add(1).ok_or(VaultEngineError::Overflow)
        }
        _ => Ok(quotient),
    }
}

#[inline]
fn to_u64(x: u128) -> Result<u64> {
    u64::try_from(x).map_err(|_| VaultEngineError::Overflow)
}

/// One whole share expressed in base units (`10^decimals`).
pub fn share_unit(decimals: u8) -> Result<u64> {
    if decimals > MAX_DECIMALS {
        return Err(VaultEngineError::InvalidDecimals);
    }
    10u64
        .checked_pow(decimals as u32)
        .ok_or(VaultEngineError::InvalidDecimals)
}

// ============================================================================
// Ledger
// ============================================================================

/// Per-depositor ledger entry.
///
/// An absent entry is the all-zero position; entries are never deleted.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Position {
    /// Underlying contributed, net of withdrawals
    pub asset_amount: u64,
    /// Shares issued through this ledger and not yet settled
    pub share_amount: u64,
    /// Shares still subject to the vesting schedule (<= share_amount)
    pub vesting_amount: u64,
}

impl Position {
    /// True when the position cannot price its own conversions.
    pub fn is_empty_ledger(&self) -> bool {
        self.asset_amount == 0 || self.vesting_amount == 0
    }

    fn record_contribution(&mut self, assets: u64, shares: u64) -> Result<()> {
        let next = Position {
            asset_amount: self
                .asset_amount
                .checked_add(assets)
                .ok_or(VaultEngineError::Overflow)?,
            share_amount: self
                .share_amount
                .checked_add(shares)
                .ok_or(VaultEngineError::Overflow)?,
            vesting_amount: self
                .vesting_amount
                .checked_add(shares)
                .ok_or(VaultEngineError::Overflow)?,
        };
        *self = next;
        Ok(())
    }

    /// Debit `shares` together with their ledger value.
    ///
    /// The asset debit rounds down, so a position that keeps vesting shares
    /// keeps a non-zero asset amount and its own price.
    fn settle(&mut self, shares: u64) -> Result<()> {
        // Settled shares are bounded by the redeemable amount, which is
        // bounded by vesting_amount.
        let ledger_value = if shares == self.vesting_amount {
            self.asset_amount
        } else {
            to_u64(mul_div(
                shares as u128,
                self.asset_amount as u128,
                self.vesting_amount as u128,
                Rounding::Down,
            )?)?
        };
        let next = Position {
            asset_amount: self
                .asset_amount
                .checked_sub(ledger_value)
                .ok_or(VaultEngineError::Overflow)?,
            share_amount: self
                .share_amount
                .checked_sub(shares)
                .ok_or(VaultEngineError::Overflow)?,
            vesting_amount: self
                .vesting_amount
                .checked_sub(shares)
                .ok_or(VaultEngineError::Overflow)?,
        };
        *self = next;
        Ok(())
    }
}

// ============================================================================
// Vesting
// ============================================================================

/// Linear schedule over `[start, end]` (unix seconds).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VestingSchedule {
    pub start: i64,
    pub end: i64,
}

impl VestingSchedule {
    /// Validate a schedule at construction time `now`.
    pub fn new(start: i64, end: i64, now: i64) -> Result<Self> {
        if start < now || end < start {
            return Err(VaultEngineError::InvalidVestingSchedule);
        }
        Ok(Self { start, end })
    }

    /// Fraction of vesting shares currently redeemable, in bps.
    ///
    /// Full before the window opens, zero once it has closed, linear decay in
    /// between (rounded down).
    pub fn rate_bps(&self, now: i64) -> u64 {
        if now < self.start {
            return BPS_DENOMINATOR;
        }
        if now >= self.end {
            return 0;
        }
        let remaining = (self.end - now) as u128;
        let window = (self.end - self.start) as u128;
        (BPS_DENOMINATOR as u128 * remaining / window) as u64
    }

    pub fn redeemable_shares(&self, position: &Position, now: i64) -> u64 {
        let rate = self.rate_bps(now) as u128;
        (rate * position.vesting_amount as u128 / BPS_DENOMINATOR as u128) as u64
    }
}

// ============================================================================
// Mode
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedemptionMode {
    /// Fair-price redemption gated by the vesting schedule
    Vesting = 0,
    /// Pool-wide NAV redemption, terminal
    Nav = 1,
}

// ============================================================================
// Pool Snapshot
// ============================================================================

/// Aggregate pool state read from the token accounts for one operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Asset balance held by the custody account
    pub idle_assets: u64,
    /// Outstanding share supply
    pub total_supply: u64,
}

/// Result of a value report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeAccrual {
    /// Price of one share unit after the report, rounded up
    pub price_per_share: u128,
    /// Asset amount owed to the distribution address (0 when no new high)
    pub fee: u64,
}

// ============================================================================
// Engine State
// ============================================================================

/// Singleton vault accounting state.
///
/// Field order keeps the struct free of implicit padding so it can be stored
/// verbatim in the vault account.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct VaultEngine {
    /// Highest observed price of one share unit (asset base units)
    pub high_water_mark: u128,
    pub vesting_start: i64,
    pub vesting_end: i64,
    /// Administrator-reported value of capital deployed outside custody
    pub invested_assets: u64,
    /// `10^decimals`, shared by asset and share mints
    pub share_unit: u64,
    pub performance_rate_bps: u16,
    /// `RedemptionMode` discriminant
    pub mode: u8,
    pub _padding: [u8; 13],
}

/// Construction parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaultParams {
    pub decimals: u8,
    pub performance_rate_bps: u16,
    pub vesting_start: i64,
    pub vesting_end: i64,
}

impl VaultEngine {
    pub fn new(params: VaultParams, now: i64) -> Result<Self> {
        if params.performance_rate_bps > MAX_PERFORMANCE_RATE_BPS {
            return Err(VaultEngineError::InvalidPerformanceRate);
        }
        let schedule = VestingSchedule::new(params.vesting_start, params.vesting_end, now)?;
        let unit = share_unit(params.decimals)?;
        Ok(Self {
            high_water_mark: unit as u128,
            vesting_start: schedule.start,
            vesting_end: schedule.end,
            invested_assets: 0,
            share_unit: unit,
            performance_rate_bps: params.performance_rate_bps,
            mode: RedemptionMode::Vesting as u8,
            _padding: [0; 13],
        })
    }

    pub fn mode(&self) -> RedemptionMode {
        if self.mode == RedemptionMode::Nav as u8 {
            RedemptionMode::Nav
        } else {
            RedemptionMode::Vesting
        }
    }

    pub fn redeems_at_nav(&self) -> bool {
        self.mode() == RedemptionMode::Nav
    }

    pub fn schedule(&self) -> VestingSchedule {
        VestingSchedule {
            start: self.vesting_start,
            end: self.vesting_end,
        }
    }

    // ========================================
    // Queries
    // ========================================

    pub fn total_assets(&self, pool: PoolState) -> Result<u64> {
        pool.idle_assets
            .checked_add(self.invested_assets)
            .ok_or(VaultEngineError::Overflow)
    }

    /// Share of total assets deployed outside custody, in bps.
    pub fn utilization_rate_bps(&self, pool: PoolState) -> Result<u64> {
        let total = self.total_assets(pool)?;
        if total == 0 {
            return Ok(0);
        }
        to_u64(mul_div(
            self.invested_assets as u128,
            BPS_DENOMINATOR as u128,
            total as u128,
            Rounding::Down,
        )?)
    }

    pub fn vesting_rate_bps(&self, now: i64) -> u64 {
        self.schedule().rate_bps(now)
    }

    pub fn redeemable_shares(&self, position: &Position, now: i64) -> u64 {
        self.schedule().redeemable_shares(position, now)
    }

    /// Price of one share unit at the pool-wide rate.
    pub fn price_per_share(&self, pool: PoolState, rounding: Rounding) -> Result<u128> {
        if pool.total_supply == 0 {
            return Ok(self.share_unit as u128);
        }
        mul_div(
            self.share_unit as u128,
            self.total_assets(pool)? as u128,
            pool.total_supply as u128,
            rounding,
        )
    }

    // ========================================
    // Conversions
    // ========================================

    fn pool_to_shares(&self, assets: u64, pool: PoolState, rounding: Rounding) -> Result<u64> {
        if pool.total_supply == 0 {
            return Ok(assets);
        }
        to_u64(mul_div(
            assets as u128,
            pool.total_supply as u128,
            self.total_assets(pool)? as u128,
            rounding,
        )?)
    }

    fn pool_to_assets(&self, shares: u64, pool: PoolState, rounding: Rounding) -> Result<u64> {
        if pool.total_supply == 0 {
            return Ok(shares);
        }
        to_u64(mul_div(
            shares as u128,
            self.total_assets(pool)? as u128,
            pool.total_supply as u128,
            rounding,
        )?)
    }

    fn ledger_to_shares(position: &Position, assets: u64, rounding: Rounding) -> Result<u64> {
        to_u64(mul_div(
            assets as u128,
            position.vesting_amount as u128,
            position.asset_amount as u128,
            rounding,
        )?)
    }

    fn ledger_to_assets(position: &Position, shares: u64, rounding: Rounding) -> Result<u64> {
        to_u64(mul_div(
            shares as u128,
            position.asset_amount as u128,
            position.vesting_amount as u128,
            rounding,
        )?)
    }

    /// True when this depositor is priced from their own ledger.
    fn prices_from_ledger(&self, position: &Position) -> bool {
        !self.redeems_at_nav() && !position.is_empty_ledger()
    }

    /// Mode-dependent asset -> share conversion.
    pub fn convert_to_shares(
        &self,
        assets: u64,
        pool: PoolState,
        position: &Position,
        rounding: Rounding,
    ) -> Result<u64> {
        if self.prices_from_ledger(position) {
            Self::ledger_to_shares(position, assets, rounding)
        } else {
            self.pool_to_shares(assets, pool, rounding)
        }
    }

    /// Mode-dependent share -> asset conversion.
    pub fn convert_to_assets(
        &self,
        shares: u64,
        pool: PoolState,
        position: &Position,
        rounding: Rounding,
    ) -> Result<u64> {
        if self.prices_from_ledger(position) {
            Self::ledger_to_assets(position, shares, rounding)
        } else {
            self.pool_to_assets(shares, pool, rounding)
        }
    }

    pub fn preview_deposit(&self, assets: u64, pool: PoolState) -> Result<u64> {
        self.pool_to_shares(assets, pool, Rounding::Down)
    }

    pub fn preview_mint(&self, shares: u64, pool: PoolState) -> Result<u64> {
        self.pool_to_assets(shares, pool, Rounding::Up)
    }

    /// Shares burned to withdraw `assets`. Outside NAV mode the larger of the
    /// pool-wide and own-ledger quotes, matching the price `preview_redeem`
    /// pays.
    pub fn preview_withdraw(&self, assets: u64, pool: PoolState, position: &Position) -> Result<u64> {
        let pool_shares = self.pool_to_shares(assets, pool, Rounding::Up)?;
        if !self.prices_from_ledger(position) {
            return Ok(pool_shares);
        }
        let ledger_shares = Self::ledger_to_shares(position, assets, Rounding::Up)?;
        Ok(pool_shares.max(ledger_shares))
    }

    /// Assets paid for `shares`: pool-wide quote, tightened to the
    /// depositor's own ledger outside NAV mode.
    pub fn preview_redeem(&self, shares: u64, pool: PoolState, position: &Position) -> Result<u64> {
        let pool_assets = self.pool_to_assets(shares, pool, Rounding::Down)?;
        if !self.prices_from_ledger(position) {
            return Ok(pool_assets);
        }
        let ledger_assets = Self::ledger_to_assets(position, shares, Rounding::Down)?;
        Ok(pool_assets.min(ledger_assets))
    }

    pub fn max_redeem(&self, share_balance: u64) -> u64 {
        share_balance
    }

    pub fn max_withdraw(&self, share_balance: u64, pool: PoolState, position: &Position) -> Result<u64> {
        self.preview_redeem(share_balance, pool, position)
    }

    // ========================================
    // Depositor Flows
    // ========================================

    /// Shares issued for `assets`. Records the contribution while vesting.
    pub fn deposit(&self, position: &mut Position, assets: u64, pool: PoolState) -> Result<u64> {
        if assets == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        let shares = self.preview_deposit(assets, pool)?;
        if shares == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        if !self.redeems_at_nav() {
            position.record_contribution(assets, shares)?;
        }
        Ok(shares)
    }

    /// Assets owed for exactly `shares`. Records the contribution while vesting.
    pub fn mint(&self, position: &mut Position, shares: u64, pool: PoolState) -> Result<u64> {
        if shares == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        let assets = self.preview_mint(shares, pool)?;
        if assets == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        if !self.redeems_at_nav() {
            position.record_contribution(assets, shares)?;
        }
        Ok(assets)
    }

    /// Assets paid for burning `shares`.
    pub fn redeem(
        &self,
        position: &mut Position,
        shares: u64,
        share_balance: u64,
        pool: PoolState,
        now: i64,
    ) -> Result<u64> {
        if shares == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        let max = self.max_redeem(share_balance);
        if shares > max {
            return Err(VaultEngineError::ExceedsMaxRedeem { requested: shares, max });
        }
        let assets = self.preview_redeem(shares, pool, position)?;
        self.settle(position, assets, shares, pool.idle_assets, now)?;
        Ok(assets)
    }

    /// Shares burned to pay out exactly `assets`.
    pub fn withdraw(
        &self,
        position: &mut Position,
        assets: u64,
        share_balance: u64,
        pool: PoolState,
        now: i64,
    ) -> Result<u64> {
        if assets == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        let max = self.max_withdraw(share_balance, pool, position)?;
        if assets > max {
            return Err(VaultEngineError::ExceedsMaxWithdraw { requested: assets, max });
        }
        let shares = self.preview_withdraw(assets, pool, position)?;
        if shares > share_balance {
            return Err(VaultEngineError::ExceedsMaxRedeem {
                requested: shares,
                max: share_balance,
            });
        }
        self.settle(position, assets, shares, pool.idle_assets, now)?;
        Ok(shares)
    }

    fn settle(
        &self,
        position: &mut Position,
        assets: u64,
        shares: u64,
        idle_assets: u64,
        now: i64,
    ) -> Result<()> {
        let mut next = *position;
        if !self.redeems_at_nav() {
            let available = self.redeemable_shares(position, now);
            if shares > available {
                return Err(VaultEngineError::VestingLocked {
                    requested: shares,
                    available,
                });
            }
            next.settle(shares)?;
        }
        if assets > idle_assets {
            return Err(VaultEngineError::InsufficientLiquidity);
        }
        *position = next;
        Ok(())
    }

    // ========================================
    // Administrator Flows
    // ========================================

    /// Move `amount` of idle assets into the invested bucket.
    pub fn take_assets(&mut self, amount: u64, idle_assets: u64) -> Result<()> {
        if amount == 0 {
            return Err(VaultEngineError::ZeroAmount);
        }
        if amount > idle_assets {
            return Err(VaultEngineError::InsufficientLiquidity);
        }
        self.invested_assets = self
            .invested_assets
            .checked_add(amount)
            .ok_or(VaultEngineError::Overflow)?;
        Ok(())
    }

    /// Set the value of deployed capital, then accrue the performance fee.
    pub fn report_invested_assets(&mut self, value: u64, pool: PoolState) -> Result<FeeAccrual> {
        let mut next = *self;
        next.invested_assets = value;
        let accrual = next.accrue_performance_fee(pool)?;
        *self = next;
        Ok(accrual)
    }

    /// Set the total pool value (idle + invested), then accrue the fee.
    pub fn report_total_assets(&mut self, value: u64, pool: PoolState) -> Result<FeeAccrual> {
        let invested = value
            .checked_sub(pool.idle_assets)
            .ok_or(VaultEngineError::InvalidReportedAssets)?;
        self.report_invested_assets(invested, pool)
    }

    /// Skim the configured fraction of any price gain above the watermark.
    ///
    /// Advances the watermark to the pre-fee price. The caller transfers
    /// `fee` out of custody.
    pub fn accrue_performance_fee(&mut self, pool: PoolState) -> Result<FeeAccrual> {
        let price = self.price_per_share(pool, Rounding::Up)?;
        if price <= self.high_water_mark {
            return Ok(FeeAccrual {
                price_per_share: price,
                fee: 0,
            });
        }
        let profit_per_share = price - self.high_water_mark;
        let total_profit = mul_div(
            profit_per_share,
            pool.total_supply as u128,
            self.share_unit as u128,
            Rounding::Up,
        )?;
        let fee = to_u64(mul_div(
            total_profit,
            self.performance_rate_bps as u128,
            BPS_DENOMINATOR as u128,
            Rounding::Up,
        )?)?;
        if fee > pool.idle_assets {
            return Err(VaultEngineError::InsufficientLiquidity);
        }
        self.high_water_mark = price;
        Ok(FeeAccrual {
            price_per_share: price,
            fee,
        })
    }

    pub fn enable_redeems_at_nav(&mut self) -> Result<()> {
        if self.redeems_at_nav() {
            return Err(VaultEngineError::AlreadyRedeemsAtNav);
        }
        self.mode = RedemptionMode::Nav as u8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000;

    fn engine(rate: u16, decimals: u8) -> VaultEngine {
        VaultEngine::new(
            VaultParams {
                decimals,
                performance_rate_bps: rate,
                vesting_start: T,
                vesting_end: T + 1_000,
            },
            T,
        )
        .unwrap()
    }

    fn pool(idle: u64, supply: u64) -> PoolState {
        PoolState {
            idle_assets: idle,
            total_supply: supply,
        }
    }

    #[test]
    fn test_mul_div_rounding() {
        assert_eq!(mul_div(10, 1, 3, Rounding::Down).unwrap(), 3);
        assert_eq!(mul_div(10, 1, 3, Rounding::Up).unwrap(), 4);
        assert_eq!(mul_div(9, 1, 3, Rounding::Up).unwrap(), 3);
        assert_eq!(mul_div(1, 1, 0, Rounding::Down), Err(VaultEngineError::DivisionByZero));
        assert_eq!(mul_div(u128::MAX, 2, 1, Rounding::Down), Err(VaultEngineError::Overflow));
    }

    #[test]
    fn test_vesting_rate_curve() {
        let s = VestingSchedule::new(T, T + 1_000, T).unwrap();
        assert_eq!(s.rate_bps(T - 1), BPS_DENOMINATOR);
        assert_eq!(s.rate_bps(T), BPS_DENOMINATOR);
        assert_eq!(s.rate_bps(T + 500), 5_000);
        assert_eq!(s.rate_bps(T + 999), 10);
        assert_eq!(s.rate_bps(T + 1_000), 0);
        assert_eq!(s.rate_bps(T + 1_001), 0);
    }

    #[test]
    fn test_vesting_rate_rounds_down() {
        let s = VestingSchedule::new(T, T + 3, T).unwrap();
        // 10_000 * 2 / 3 = 6666.67
        assert_eq!(s.rate_bps(T + 1), 6_666);
    }

    #[test]
    fn test_degenerate_window_is_closed() {
        let s = VestingSchedule::new(T, T, T).unwrap();
        assert_eq!(s.rate_bps(T - 1), BPS_DENOMINATOR);
        assert_eq!(s.rate_bps(T), 0);
    }

    #[test]
    fn test_redeemable_shares_example() {
        let s = VestingSchedule::new(T, T + 1_000, T).unwrap();
        let p = Position {
            asset_amount: 1_000,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        assert_eq!(s.redeemable_shares(&p, T + 500), 500);
        assert_eq!(s.redeemable_shares(&p, T + 1_001), 0);
    }

    #[test]
    fn test_construction_rejects_bad_params() {
        let base = VaultParams {
            decimals: 6,
            performance_rate_bps: MAX_PERFORMANCE_RATE_BPS,
            vesting_start: T,
            vesting_end: T + 10,
        };
        assert!(VaultEngine::new(base, T).is_ok());

        let past = VaultParams { vesting_start: T - 1, ..base };
        assert_eq!(VaultEngine::new(past, T), Err(VaultEngineError::InvalidVestingSchedule));

        let inverted = VaultParams { vesting_end: T - 1, ..base };
        assert_eq!(VaultEngine::new(inverted, T), Err(VaultEngineError::InvalidVestingSchedule));

        let rate = VaultParams { performance_rate_bps: MAX_PERFORMANCE_RATE_BPS + 1, ..base };
        assert_eq!(VaultEngine::new(rate, T), Err(VaultEngineError::InvalidPerformanceRate));

        let decimals = VaultParams { decimals: 20, ..base };
        assert_eq!(VaultEngine::new(decimals, T), Err(VaultEngineError::InvalidDecimals));
    }

    #[test]
    fn test_initial_watermark_is_one_unit() {
        let e = engine(1_000, 6);
        assert_eq!(e.high_water_mark, 1_000_000);
        assert_eq!(e.mode(), RedemptionMode::Vesting);
    }

    #[test]
    fn test_deposit_records_ledger_while_vesting() {
        let e = engine(0, 6);
        let mut p = Position::default();
        let shares = e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        assert_eq!(shares, 1_000);
        assert_eq!(
            p,
            Position {
                asset_amount: 1_000,
                share_amount: 1_000,
                vesting_amount: 1_000
            }
        );
    }

    #[test]
    fn test_deposit_zero_rejected() {
        let e = engine(0, 6);
        let mut p = Position::default();
        assert_eq!(e.deposit(&mut p, 0, pool(0, 0)), Err(VaultEngineError::ZeroAmount));
        // 1 asset at 3 assets per share rounds to zero shares
        assert_eq!(e.deposit(&mut p, 1, pool(300, 100)), Err(VaultEngineError::ZeroAmount));
        assert_eq!(p, Position::default());
    }

    #[test]
    fn test_deposit_after_nav_skips_ledger() {
        let mut e = engine(0, 6);
        e.enable_redeems_at_nav().unwrap();
        let mut p = Position::default();
        assert_eq!(e.deposit(&mut p, 500, pool(1_000, 1_000)).unwrap(), 500);
        assert_eq!(p, Position::default());
    }

    #[test]
    fn test_mint_rounds_assets_up() {
        let e = engine(0, 6);
        let mut p = Position::default();
        // 3 assets per 2 shares: 1 share costs 1.5 -> 2
        let assets = e.mint(&mut p, 1, pool(3, 2)).unwrap();
        assert_eq!(assets, 2);
        assert_eq!(p.vesting_amount, 1);
        assert_eq!(p.asset_amount, 2);
    }

    #[test]
    fn test_redeem_vesting_lock_reports_available() {
        let e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        let before = p;
        let err = e.redeem(&mut p, 600, 1_000, pool(1_000, 1_000), T + 500);
        assert_eq!(
            err,
            Err(VaultEngineError::VestingLocked {
                requested: 600,
                available: 500
            })
        );
        assert_eq!(p, before);

        let assets = e.redeem(&mut p, 500, 1_000, pool(1_000, 1_000), T + 500).unwrap();
        assert_eq!(assets, 500);
        assert_eq!(
            p,
            Position {
                asset_amount: 500,
                share_amount: 500,
                vesting_amount: 500
            }
        );
    }

    #[test]
    fn test_redeem_after_window_locked_until_nav() {
        let mut e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        assert_eq!(
            e.redeem(&mut p, 1, 1_000, pool(1_000, 1_000), T + 1_001),
            Err(VaultEngineError::VestingLocked {
                requested: 1,
                available: 0
            })
        );
        e.enable_redeems_at_nav().unwrap();
        assert_eq!(e.redeem(&mut p, 1_000, 1_000, pool(1_000, 1_000), T + 1_001).unwrap(), 1_000);
        // NAV redemptions leave the ledger untouched
        assert_eq!(p.vesting_amount, 1_000);
    }

    #[test]
    fn test_redeem_capacity_checked_before_vesting() {
        let e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        assert_eq!(
            e.redeem(&mut p, 101, 100, pool(1_000, 1_000), T - 1),
            Err(VaultEngineError::ExceedsMaxRedeem {
                requested: 101,
                max: 100
            })
        );
    }

    #[test]
    fn test_redeem_needs_idle_liquidity() {
        let mut e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        e.take_assets(900, 1_000).unwrap();
        assert_eq!(
            e.redeem(&mut p, 500, 1_000, pool(100, 1_000), T - 1),
            Err(VaultEngineError::InsufficientLiquidity)
        );
    }

    #[test]
    fn test_vesting_lock_reported_before_liquidity() {
        let mut e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        e.take_assets(900, 1_000).unwrap();
        let before = p;
        assert_eq!(
            e.redeem(&mut p, 600, 1_000, pool(100, 1_000), T + 500),
            Err(VaultEngineError::VestingLocked {
                requested: 600,
                available: 500
            })
        );
        assert_eq!(p, before);
    }

    #[test]
    fn test_fair_price_uses_own_ledger() {
        let e = engine(0, 6);
        // Entered at 2 assets per share; pool now at 1:1
        let p = Position {
            asset_amount: 2_000,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        let pl = pool(4_000, 4_000);
        assert_eq!(e.convert_to_assets(100, pl, &p, Rounding::Down).unwrap(), 200);
        assert_eq!(e.convert_to_shares(200, pl, &p, Rounding::Down).unwrap(), 100);
        // Empty ledger falls back to the pool-wide rate
        let empty = Position::default();
        assert_eq!(e.convert_to_assets(100, pl, &empty, Rounding::Down).unwrap(), 100);
    }

    #[test]
    fn test_previews_take_value_safe_side() {
        let e = engine(0, 6);
        let pl = pool(4_000, 4_000);

        // Ledger richer than the pool: both sides use the pool price.
        let rich = Position {
            asset_amount: 2_000,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        assert_eq!(e.preview_redeem(100, pl, &rich).unwrap(), 100);
        assert_eq!(e.preview_withdraw(100, pl, &rich).unwrap(), 100);

        // Ledger poorer than the pool: both sides use the ledger price.
        let poor = Position {
            asset_amount: 500,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        assert_eq!(e.preview_redeem(100, pl, &poor).unwrap(), 50);
        assert_eq!(e.preview_withdraw(100, pl, &poor).unwrap(), 200);

        // The withdraw cap follows the conservative redeem quote.
        assert_eq!(e.max_withdraw(1_000, pl, &poor).unwrap(), 500);
        assert_eq!(e.max_withdraw(1_000, pl, &rich).unwrap(), 1_000);
    }

    #[test]
    fn test_withdraw_in_steps_pays_same_as_redeem() {
        let e = engine(0, 6);
        let pl = pool(4_000, 4_000);
        let start = Position {
            asset_amount: 500,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };

        let mut redeemed = start;
        let redeem_all = e.redeem(&mut redeemed, 1_000, 1_000, pl, T - 1).unwrap();
        assert_eq!(redeem_all, 500);
        assert_eq!(redeemed, Position::default());

        let mut p = start;
        let mut balance = 1_000u64;
        let mut current = pl;
        let mut withdrawn = 0u64;
        loop {
            let max = e.max_withdraw(balance, current, &p).unwrap();
            if max == 0 {
                break;
            }
            let assets = max.min(150);
            let shares = e.withdraw(&mut p, assets, balance, current, T - 1).unwrap();
            balance -= shares;
            withdrawn += assets;
            current = pool(current.idle_assets - assets, current.total_supply - shares);
            // Shares left always keep a priced ledger
            assert_eq!(p.share_amount == 0, p.asset_amount == 0);
        }
        assert_eq!(balance, 0);
        assert_eq!(withdrawn, redeem_all);
        assert_eq!(p, Position::default());
    }

    #[test]
    fn test_partial_settle_keeps_ledger_ratio() {
        let e = engine(0, 6);
        let mut p = Position {
            asset_amount: 1,
            share_amount: 10,
            vesting_amount: 10,
        };
        // Ledger value of 1 share is 0.1, rounded down to 0
        let assets = e.redeem(&mut p, 1, 10, pool(1_000, 1_000), T - 1);
        assert_eq!(assets, Ok(0));
        assert_eq!(
            p,
            Position {
                asset_amount: 1,
                share_amount: 9,
                vesting_amount: 9
            }
        );
        assert!(!p.is_empty_ledger());
    }

    #[test]
    fn test_withdraw_rounds_shares_up() {
        let e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 3_000, pool(0, 0)).unwrap();
        // Ledger is 1:1; pool is 3 assets per 2 shares
        let pl = pool(4_500, 3_000);
        // pool: ceil(1 * 3000 / 4500) = 1; ledger: 1
        let shares = e.withdraw(&mut p, 1, 3_000, pl, T - 1).unwrap();
        assert_eq!(shares, 1);
        assert_eq!(p.asset_amount, 2_999);
        assert_eq!(p.vesting_amount, 2_999);
    }

    #[test]
    fn test_withdraw_above_max_rejected() {
        let e = engine(0, 6);
        let mut p = Position::default();
        e.deposit(&mut p, 1_000, pool(0, 0)).unwrap();
        assert_eq!(
            e.withdraw(&mut p, 1_001, 1_000, pool(1_000, 1_000), T - 1),
            Err(VaultEngineError::ExceedsMaxWithdraw {
                requested: 1_001,
                max: 1_000
            })
        );
    }

    #[test]
    fn test_fee_accrual_example() {
        let unit = 1_000_000_000_000_000_000u64;
        let mut e = engine(1_000, 18);
        assert_eq!(e.high_water_mark, unit as u128);
        // supply 1000, total 1100 -> price 1.1e18
        let accrual = e.report_invested_assets(1_100, pool(0, 1_000));
        // idle is zero so the fee cannot be paid
        assert_eq!(accrual, Err(VaultEngineError::InsufficientLiquidity));
        assert_eq!(e.invested_assets, 0);
        assert_eq!(e.high_water_mark, unit as u128);

        let accrual = e.report_invested_assets(1_000, pool(100, 1_000)).unwrap();
        assert_eq!(accrual.price_per_share, 1_100_000_000_000_000_000);
        assert_eq!(accrual.fee, 10);
        assert_eq!(e.high_water_mark, 1_100_000_000_000_000_000);
    }

    #[test]
    fn test_fee_not_charged_twice_or_on_decline() {
        let mut e = engine(1_000, 6);
        let first = e.report_invested_assets(1_000, pool(1_000, 1_000)).unwrap();
        // price 2.0 -> profit 1_000 -> fee 100
        assert_eq!(first.fee, 100);
        let hwm = e.high_water_mark;
        assert_eq!(hwm, 2_000_000);

        // Same value again: no fee
        let again = e.report_invested_assets(1_000, pool(900, 1_000)).unwrap();
        assert_eq!(again.fee, 0);
        // Decline: no fee, watermark holds
        let down = e.report_invested_assets(500, pool(900, 1_000)).unwrap();
        assert_eq!(down.fee, 0);
        assert_eq!(e.high_water_mark, hwm);
        assert_eq!(e.invested_assets, 500);
    }

    #[test]
    fn test_report_total_assets() {
        let mut e = engine(0, 6);
        assert_eq!(
            e.report_total_assets(99, pool(100, 100)),
            Err(VaultEngineError::InvalidReportedAssets)
        );
        e.report_total_assets(150, pool(100, 100)).unwrap();
        assert_eq!(e.invested_assets, 50);
        assert_eq!(e.total_assets(pool(100, 100)).unwrap(), 150);
    }

    #[test]
    fn test_take_assets_and_utilization() {
        let mut e = engine(0, 6);
        assert_eq!(e.utilization_rate_bps(pool(0, 0)).unwrap(), 0);
        e.take_assets(250, 1_000).unwrap();
        assert_eq!(e.invested_assets, 250);
        // custody now holds 750
        assert_eq!(e.utilization_rate_bps(pool(750, 1_000)).unwrap(), 2_500);
        assert_eq!(e.take_assets(751, 750), Err(VaultEngineError::InsufficientLiquidity));
        assert_eq!(e.take_assets(0, 750), Err(VaultEngineError::ZeroAmount));
    }

    #[test]
    fn test_mode_switch_is_one_way() {
        let mut e = engine(0, 6);
        e.enable_redeems_at_nav().unwrap();
        assert!(e.redeems_at_nav());
        assert_eq!(e.enable_redeems_at_nav(), Err(VaultEngineError::AlreadyRedeemsAtNav));
        assert!(e.redeems_at_nav());
    }

    #[test]
    fn test_nav_pricing_uniform_across_depositors() {
        let mut e = engine(0, 6);
        let a = Position {
            asset_amount: 2_000,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        let b = Position {
            asset_amount: 500,
            share_amount: 1_000,
            vesting_amount: 1_000,
        };
        let pl = pool(3_000, 2_000);
        assert_ne!(
            e.preview_redeem(100, pl, &a).unwrap(),
            e.preview_redeem(100, pl, &b).unwrap()
        );
        e.enable_redeems_at_nav().unwrap();
        assert_eq!(e.preview_redeem(100, pl, &a).unwrap(), 150);
        assert_eq!(e.preview_redeem(100, pl, &b).unwrap(), 150);
    }

    #[test]
    fn test_empty_pool_with_supply_cannot_issue() {
        let e = engine(0, 6);
        let mut p = Position::default();
        assert_eq!(e.deposit(&mut p, 10, pool(0, 10)), Err(VaultEngineError::DivisionByZero));
    }
}
