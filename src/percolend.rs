//! Percolend: client-side risk engine for an over-collateralized lending protocol.
//!
//! This crate mirrors the subset of the on-chain lending program's math that a
//! client needs to preview state locally before submitting a transaction:
//!
//! 1. Confidence-biased oracle valuation (assets marked down, debts marked up)
//! 2. Pooled-share <-> token conversion with debt-favoring rounding
//! 3. The utilization-based interest rate curve and its fee layers
//! 4. Risk-weighted collateral / liability valuation
//! 5. Health factor, free collateral and closed-form liquidation price
//! 6. Hypothetical-action simulation (deposit / withdraw / borrow / repay / loop)
//!
//! Everything here is pure, synchronous computation over explicitly passed
//! snapshots. Fetching accounts, signing, building and broadcasting
//! transactions are the caller's problem. All money math is `I80F48`
//! fixed-point; the engine never touches native floats.
//!
//! Validation failures that a user can act on (paused bank, capacity, missing
//! collateral) are returned as [`ActionMessage`] values next to the preview,
//! never as errors. Only conditions that make the numbers unsafe to show at
//! all (stale oracle, balance referencing an unknown bank) surface as
//! [`RiskError`].

#![deny(unsafe_code)]

use fixed::types::I80F48;

// 1. mod constants
pub mod constants {
    /// Oracle confidence intervals are widened to this many standard
    /// deviations before biasing (matches the on-chain valuation).
    /// Expressed as a ratio: 212 / 100 = 2.12 sigma.
    pub const STD_DEV_MULTIPLE_NUM: i64 = 212;
    pub const STD_DEV_MULTIPLE_DEN: i64 = 100;

    /// Hard cap on the (widened) confidence interval, as a fraction of price:
    /// 5%. Prevents a blown-out oracle from zeroing every asset.
    pub const MAX_CONF_NUM: i64 = 5;
    pub const MAX_CONF_DEN: i64 = 100;

    /// Sanity bound on mint decimals accepted in a snapshot.
    pub const MAX_MINT_DECIMALS: u8 = 24;

    /// Default debounce window the surrounding UI is expected to apply before
    /// issuing a simulation request, in milliseconds. The engine itself has no
    /// timers; this is exported so callers agree on one number.
    pub const SIMULATION_DEBOUNCE_MS: u64 = 500;
}

// 2. mod math (checked I80F48 helpers)
pub mod math {
    use super::error::{Result, RiskError};
    use fixed::types::I80F48;

    pub const ZERO: I80F48 = I80F48::ZERO;
    pub const ONE: I80F48 = I80F48::ONE;

    #[inline]
    pub fn add(a: I80F48, b: I80F48) -> Result<I80F48> {
        a.checked_add(b).ok_or(RiskError::MathOverflow)
    }

    #[inline]
    pub fn sub(a: I80F48, b: I80F48) -> Result<I80F48> {
        a.checked_sub(b).ok_or(RiskError::MathOverflow)
    }

    #[inline]
    pub fn mul(a: I80F48, b: I80F48) -> Result<I80F48> {
        a.checked_mul(b).ok_or(RiskError::MathOverflow)
    }

    /// Division rounding toward zero. Operands in this crate are always
    /// non-negative, so this is a floor. Division by zero is an overflow
    /// error here; degenerate-pool cases are handled by explicit branches
    /// before any division is reached.
    #[inline]
    pub fn div_floor(a: I80F48, b: I80F48) -> Result<I80F48> {
        a.checked_div(b).ok_or(RiskError::MathOverflow)
    }

    /// Division rounding away from zero at the representation granularity
    /// (one `I80F48::DELTA` step). Used on the liability side so debt is
    /// never under-reported by a truncated quotient.
    #[inline]
    pub fn div_ceil(a: I80F48, b: I80F48) -> Result<I80F48> {
        let q = a.checked_div(b).ok_or(RiskError::MathOverflow)?;
        let back = q.checked_mul(b).ok_or(RiskError::MathOverflow)?;
        if back == a {
            Ok(q)
        } else {
            q.checked_add(I80F48::DELTA).ok_or(RiskError::MathOverflow)
        }
    }

    /// 10^p as I80F48. p is bounded by snapshot validation
    /// (MAX_MINT_DECIMALS), far below the type's integer range.
    pub fn exp10(p: u32) -> Result<I80F48> {
        let ten = I80F48::from_num(10);
        let mut v = ONE;
        for _ in 0..p {
            v = v.checked_mul(ten).ok_or(RiskError::MathOverflow)?;
        }
        Ok(v)
    }

    /// Ratio of two small integer constants.
    #[inline]
    pub fn ratio(num: i64, den: i64) -> I80F48 {
        I80F48::from_num(num) / I80F48::from_num(den)
    }

    #[inline]
    pub fn clamp_positive(v: I80F48) -> I80F48 {
        if v > ZERO {
            v
        } else {
            ZERO
        }
    }
}

// 3. mod error
pub mod error {
    use thiserror::Error;

    /// Hard failures. Everything in here means "refuse to render health data";
    /// user-actionable conditions are `ActionMessage`s, not errors.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
    pub enum RiskError {
        /// Oracle reading is older than the owning bank's `oracle_max_age`.
        /// Blocks health-critical output; passive display may keep showing the
        /// last known value.
        #[error("oracle price exceeds the bank's maximum age")]
        StaleOracle,

        /// A balance references a bank that is missing from the snapshot
        /// bundle. The snapshot is unusable for this account.
        #[error("balance references a bank absent from the snapshot")]
        UnknownBank,

        /// A snapshot field is out of range (negative share total, absurd
        /// decimals, non-positive price).
        #[error("malformed snapshot")]
        MalformedSnapshot,

        /// Fixed-point overflow. Snapshot magnitudes that trigger this are
        /// corrupt; there is no partial answer worth showing.
        #[error("fixed-point arithmetic overflow")]
        MathOverflow,

        /// The simulation request itself is inconsistent (negative amount,
        /// loop without a secondary bank).
        #[error("invalid simulation request")]
        InvalidRequest,
    }

    pub type Result<T> = core::result::Result<T, RiskError>;
}

// 4. mod state (snapshot data model)
pub mod state {
    use super::error::{Result, RiskError};
    use super::math;
    use super::price::OraclePriceSnapshot;
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use std::collections::HashMap;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RiskTier {
        /// Collateral in this bank combines freely with other banks'.
        Collateral,
        /// Collateral here cannot back borrows, and a borrow from this bank
        /// must be the account's only liability.
        Isolated,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum OperationalState {
        Operational,
        /// Only position-reducing actions (withdraw, repay) are allowed.
        ReduceOnly,
        Paused,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AssetTag {
        Default,
        Sol,
        Staked,
    }

    /// Which weight pair applies: Initial gates new exposure (borrowing
    /// power), Maintenance gates liquidation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RequirementType {
        Initial,
        Maintenance,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum BalanceSide {
        Assets,
        Liabilities,
    }

    /// Interest curve parameters plus the fee layers stacked on top of it.
    /// All values are annualized ratios (0.1 = 10% APR).
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct InterestRateConfig {
        pub optimal_utilization_rate: I80F48,
        pub plateau_interest_rate: I80F48,
        pub max_interest_rate: I80F48,
        pub insurance_fee_fixed_apr: I80F48,
        pub insurance_ir_fee: I80F48,
        pub protocol_fixed_fee_apr: I80F48,
        pub protocol_ir_fee: I80F48,
        /// One-shot fee on borrow principal. Does not enter APR math; the
        /// transaction builder applies it to borrow intents.
        pub protocol_origination_fee: I80F48,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct BankConfig {
        pub asset_weight_init: I80F48,
        pub asset_weight_maint: I80F48,
        pub liability_weight_init: I80F48,
        pub liability_weight_maint: I80F48,
        /// Native-unit caps. 0 = unlimited.
        pub deposit_limit: u64,
        pub borrow_limit: u64,
        /// USD cap on the bank's Initial-weighted deposit value. 0 = none.
        /// Above it the effective init asset weight is scaled down so the
        /// bank-wide weighted sum never exceeds the cap.
        pub total_asset_value_init_limit: u64,
        pub risk_tier: RiskTier,
        pub operational_state: OperationalState,
        /// Maximum oracle age in seconds before readings are rejected.
        pub oracle_max_age: u64,
        pub asset_tag: AssetTag,
        pub interest_rate_config: InterestRateConfig,
    }

    /// One lending pool for one token mint, as fetched.
    ///
    /// Share totals and token totals are both carried: the share/token ratio
    /// is the conversion rate, and is defined as 1 when a total is zero (no
    /// pool yet).
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Bank {
        pub address: Pubkey,
        pub mint: Pubkey,
        pub mint_decimals: u8,
        pub config: BankConfig,
        pub total_asset_shares: I80F48,
        pub total_liability_shares: I80F48,
        /// Total deposited tokens, native units.
        pub total_deposits: I80F48,
        /// Total borrowed tokens, native units.
        pub total_borrows: I80F48,
    }

    impl Bank {
        pub fn asset_weight(&self, req: RequirementType) -> I80F48 {
            match req {
                RequirementType::Initial => self.config.asset_weight_init,
                RequirementType::Maintenance => self.config.asset_weight_maint,
            }
        }

        pub fn liability_weight(&self, req: RequirementType) -> I80F48 {
            match req {
                RequirementType::Initial => self.config.liability_weight_init,
                RequirementType::Maintenance => self.config.liability_weight_maint,
            }
        }

        /// Native -> ui token amount (divide by 10^decimals).
        pub fn ui_amount(&self, native: I80F48) -> Result<I80F48> {
            math::div_floor(native, math::exp10(self.mint_decimals as u32)?)
        }

        /// Tokens sitting in the pool and not lent out, native units.
        pub fn available_liquidity(&self) -> I80F48 {
            math::clamp_positive(self.total_deposits.saturating_sub(self.total_borrows))
        }

        fn validate(&self) -> Result<()> {
            let c = &self.config;
            let weights = [
                c.asset_weight_init,
                c.asset_weight_maint,
                c.liability_weight_init,
                c.liability_weight_maint,
            ];
            if weights.iter().any(|w| *w < I80F48::ZERO) {
                return Err(RiskError::MalformedSnapshot);
            }
            if self.total_asset_shares < I80F48::ZERO
                || self.total_liability_shares < I80F48::ZERO
                || self.total_deposits < I80F48::ZERO
                || self.total_borrows < I80F48::ZERO
            {
                return Err(RiskError::MalformedSnapshot);
            }
            if self.mint_decimals > super::constants::MAX_MINT_DECIMALS {
                return Err(RiskError::MalformedSnapshot);
            }
            Ok(())
        }
    }

    /// One per bank the user has touched. At most one of `asset_shares` /
    /// `liability_shares` is non-zero: a position on a given bank is a lend
    /// or a borrow, never both.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Balance {
        pub bank: Pubkey,
        pub asset_shares: I80F48,
        pub liability_shares: I80F48,
        pub active: bool,
        pub last_update: i64,
    }

    impl Balance {
        pub fn empty(bank: Pubkey) -> Self {
            Self {
                bank,
                asset_shares: I80F48::ZERO,
                liability_shares: I80F48::ZERO,
                active: false,
                last_update: 0,
            }
        }

        /// None when the balance carries nothing on either side.
        pub fn side(&self) -> Option<BalanceSide> {
            if self.liability_shares > I80F48::ZERO {
                Some(BalanceSide::Liabilities)
            } else if self.asset_shares > I80F48::ZERO {
                Some(BalanceSide::Assets)
            } else {
                None
            }
        }
    }

    /// A user's margin account. The engine never mutates one in place;
    /// the simulator works on a clone.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct MarginAccount {
        pub address: Pubkey,
        pub authority: Pubkey,
        pub balances: Vec<Balance>,
    }

    impl MarginAccount {
        pub fn new(address: Pubkey, authority: Pubkey) -> Self {
            Self {
                address,
                authority,
                balances: Vec::new(),
            }
        }

        pub fn active_balances(&self) -> impl Iterator<Item = &Balance> {
            self.balances.iter().filter(|b| b.active)
        }

        pub fn balance(&self, bank: &Pubkey) -> Option<&Balance> {
            self.balances.iter().find(|b| b.active && &b.bank == bank)
        }

        /// Existing balance for `bank`, or a fresh inactive one appended in
        /// place (the on-chain account allocates slots the same way).
        pub(crate) fn balance_mut_or_insert(&mut self, bank: Pubkey) -> &mut Balance {
            if let Some(i) = self.balances.iter().position(|b| b.bank == bank) {
                return &mut self.balances[i];
            }
            self.balances.push(Balance::empty(bank));
            let last = self.balances.len() - 1;
            &mut self.balances[last]
        }

        /// True if any active balance other than `except` carries debt.
        pub fn has_other_liability(&self, except: &Pubkey) -> bool {
            self.active_balances()
                .any(|b| &b.bank != except && b.side() == Some(BalanceSide::Liabilities))
        }
    }

    /// Immutable bundle of fetched market state, threaded explicitly through
    /// every computation call. There is no global store: the fetch
    /// collaborator owns caching, the engine only ever reads one of these.
    #[derive(Clone, Debug)]
    pub struct MarketSnapshot {
        banks: HashMap<Pubkey, Bank>,
        prices: HashMap<Pubkey, OraclePriceSnapshot>,
        /// Unix seconds at fetch time; the reference "now" for staleness.
        pub timestamp: i64,
    }

    impl MarketSnapshot {
        pub fn new(
            banks: Vec<Bank>,
            prices: Vec<(Pubkey, OraclePriceSnapshot)>,
            timestamp: i64,
        ) -> Result<Self> {
            let mut bank_map = HashMap::with_capacity(banks.len());
            for bank in banks {
                bank.validate()?;
                bank_map.insert(bank.address, bank);
            }
            let mut price_map = HashMap::with_capacity(prices.len());
            for (bank, p) in prices {
                p.validate()?;
                price_map.insert(bank, p);
            }
            Ok(Self {
                banks: bank_map,
                prices: price_map,
                timestamp,
            })
        }

        pub fn bank(&self, address: &Pubkey) -> Result<&Bank> {
            self.banks.get(address).ok_or(RiskError::UnknownBank)
        }

        pub(crate) fn bank_mut(&mut self, address: &Pubkey) -> Result<&mut Bank> {
            self.banks.get_mut(address).ok_or(RiskError::UnknownBank)
        }

        pub fn banks(&self) -> impl Iterator<Item = &Bank> {
            self.banks.values()
        }

        /// Raw price, no staleness check. For passive display only.
        pub fn price(&self, bank: &Pubkey) -> Result<&OraclePriceSnapshot> {
            self.prices.get(bank).ok_or(RiskError::UnknownBank)
        }

        /// Price gated by the owning bank's max age. Health-critical paths
        /// must use this and propagate the error.
        pub fn checked_price(&self, bank: &Bank, now: i64) -> Result<&OraclePriceSnapshot> {
            let p = self.price(&bank.address)?;
            p.check_age(now, bank.config.oracle_max_age)?;
            Ok(p)
        }

        /// Same prices and timestamp, banks replaced by `banks` (missing ones
        /// kept). Used to evaluate an authoritative post-execution state.
        pub fn with_banks(&self, banks: Vec<Bank>) -> Result<Self> {
            let mut out = self.clone();
            for bank in banks {
                bank.validate()?;
                out.banks.insert(bank.address, bank);
            }
            Ok(out)
        }
    }
}

// 5. mod price (oracle resolution)
pub mod price {
    use super::constants::{MAX_CONF_DEN, MAX_CONF_NUM, STD_DEV_MULTIPLE_DEN, STD_DEV_MULTIPLE_NUM};
    use super::error::{Result, RiskError};
    use super::math;
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};

    /// Direction of the confidence adjustment applied when valuing a
    /// position. Assets take `Low` (worth less than quoted), liabilities take
    /// `High` (owed more than quoted); `None` is the raw reading.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PriceBias {
        None,
        Low,
        High,
    }

    /// A resolved oracle reading: USD per ui token plus the confidence
    /// interval already widened/capped for valuation.
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct OraclePriceSnapshot {
        pub price: I80F48,
        pub confidence: I80F48,
        /// Unix seconds of the reading.
        pub timestamp: i64,
    }

    impl OraclePriceSnapshot {
        /// Build from an already-scaled price and raw confidence. The
        /// confidence is widened to the standard-deviation multiple and
        /// capped at a fraction of price, matching on-chain valuation.
        pub fn new(price: I80F48, confidence: I80F48, timestamp: i64) -> Result<Self> {
            if price <= I80F48::ZERO || confidence < I80F48::ZERO {
                return Err(RiskError::MalformedSnapshot);
            }
            let widened = math::mul(
                confidence,
                math::ratio(STD_DEV_MULTIPLE_NUM, STD_DEV_MULTIPLE_DEN),
            )?;
            let cap = math::mul(price, math::ratio(MAX_CONF_NUM, MAX_CONF_DEN))?;
            Ok(Self {
                price,
                confidence: widened.min(cap),
                timestamp,
            })
        }

        /// Convert a raw Pyth reading (mantissa + exponent). Non-positive
        /// prices are rejected the way the program wrapper rejects them.
        pub fn from_pyth(reading: &pyth_sdk_solana::Price) -> Result<Self> {
            if reading.price <= 0 {
                return Err(RiskError::MalformedSnapshot);
            }
            let mantissa = I80F48::from_num(reading.price);
            let conf = I80F48::from_num(reading.conf);
            let (price, confidence) = if reading.expo >= 0 {
                let scale = math::exp10(reading.expo as u32)?;
                (math::mul(mantissa, scale)?, math::mul(conf, scale)?)
            } else {
                let scale = math::exp10((-reading.expo) as u32)?;
                (math::div_floor(mantissa, scale)?, math::div_floor(conf, scale)?)
            };
            Self::new(price, confidence, reading.publish_time)
        }

        /// Price under the requested bias. `Low` floors at zero so a huge
        /// confidence interval can never produce a negative asset value.
        pub fn biased(&self, bias: PriceBias) -> I80F48 {
            match bias {
                PriceBias::None => self.price,
                PriceBias::Low => math::clamp_positive(self.price.saturating_sub(self.confidence)),
                PriceBias::High => self.price.saturating_add(self.confidence),
            }
        }

        pub fn age(&self, now: i64) -> i64 {
            now.saturating_sub(self.timestamp)
        }

        pub fn check_age(&self, now: i64, max_age: u64) -> Result<()> {
            if self.age(now) > max_age as i64 {
                return Err(RiskError::StaleOracle);
            }
            Ok(())
        }

        pub(crate) fn validate(&self) -> Result<()> {
            if self.price <= I80F48::ZERO || self.confidence < I80F48::ZERO {
                return Err(RiskError::MalformedSnapshot);
            }
            Ok(())
        }
    }
}

// 6. mod shares (pooled-share accounting)
pub mod shares {
    use super::error::Result;
    use super::math;
    use super::state::BalanceSide;
    use fixed::types::I80F48;

    /// Shares -> tokens at the pool's current ratio.
    ///
    /// Degenerate pools (zero share total) convert 1:1. Rounding is directed
    /// by side: asset conversions truncate (the pool keeps the dust), debt
    /// conversions round up (debt is never under-reported).
    pub fn shares_to_tokens(
        shares: I80F48,
        total_shares: I80F48,
        total_tokens: I80F48,
        side: BalanceSide,
    ) -> Result<I80F48> {
        if shares == I80F48::ZERO {
            return Ok(I80F48::ZERO);
        }
        if total_shares == I80F48::ZERO {
            return Ok(shares);
        }
        let numerator = math::mul(shares, total_tokens)?;
        match side {
            BalanceSide::Assets => math::div_floor(numerator, total_shares),
            BalanceSide::Liabilities => math::div_ceil(numerator, total_shares),
        }
    }

    /// Tokens -> shares; exact inverse of [`shares_to_tokens`] up to one
    /// rounding step. Deposits mint shares rounded down (pool-favoring),
    /// borrows mint liability shares rounded up.
    pub fn tokens_to_shares(
        tokens: I80F48,
        total_shares: I80F48,
        total_tokens: I80F48,
        side: BalanceSide,
    ) -> Result<I80F48> {
        if tokens == I80F48::ZERO {
            return Ok(I80F48::ZERO);
        }
        if total_shares == I80F48::ZERO || total_tokens == I80F48::ZERO {
            return Ok(tokens);
        }
        let numerator = math::mul(tokens, total_shares)?;
        match side {
            BalanceSide::Assets => math::div_floor(numerator, total_tokens),
            BalanceSide::Liabilities => math::div_ceil(numerator, total_tokens),
        }
    }
}

// 7. mod rates (interest rate model)
pub mod rates {
    use super::error::Result;
    use super::math::{self, ONE, ZERO};
    use super::state::{Bank, InterestRateConfig};
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};

    /// Spot rates for one bank at its current utilization. All annualized.
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct InterestRates {
        pub utilization: I80F48,
        /// Curve output before fee layers.
        pub base_rate: I80F48,
        /// What lenders earn: base * utilization * (1 - ir fees).
        pub lending_apr: I80F48,
        /// What borrowers pay: base * (1 + ir fees) + fixed fees.
        pub borrowing_apr: I80F48,
    }

    /// Piecewise-linear base borrow rate. Both branches evaluate to
    /// `plateau` at the optimal point; the curve is continuous and
    /// non-decreasing in utilization.
    pub fn base_rate_for_utilization(cfg: &InterestRateConfig, u: I80F48) -> Result<I80F48> {
        let optimal = cfg.optimal_utilization_rate;
        let plateau = cfg.plateau_interest_rate;
        let max = cfg.max_interest_rate;

        let rate = if u <= optimal {
            if optimal == ZERO {
                plateau
            } else {
                math::div_floor(math::mul(u, plateau)?, optimal)?
            }
        } else {
            let headroom = math::sub(ONE, optimal)?;
            if headroom <= ZERO {
                // optimal at/above 100%: the upper segment has no width
                max
            } else {
                let excess = math::sub(u, optimal)?;
                let slope = math::div_floor(math::sub(max, plateau)?, headroom)?;
                math::add(plateau, math::mul(excess, slope)?)?
            }
        };
        Ok(math::clamp_positive(rate))
    }

    pub fn utilization(bank: &Bank) -> Result<I80F48> {
        if bank.total_deposits == ZERO {
            return Ok(ZERO);
        }
        math::div_floor(bank.total_borrows, bank.total_deposits)
    }

    /// Current lending / borrowing APRs for a bank.
    ///
    /// An empty pool has zero utilization and a zero lending rate; borrowers
    /// would still pay the curve floor plus fixed fees.
    pub fn compute_interest_rates(bank: &Bank) -> Result<InterestRates> {
        let cfg = &bank.config.interest_rate_config;
        let u = utilization(bank)?;
        let base = base_rate_for_utilization(cfg, u)?;

        let ir_fees = math::add(cfg.protocol_ir_fee, cfg.insurance_ir_fee)?;
        let fixed_fees = math::add(cfg.protocol_fixed_fee_apr, cfg.insurance_fee_fixed_apr)?;

        let borrowing_apr = math::add(math::mul(base, math::add(ONE, ir_fees)?)?, fixed_fees)?;
        let lender_share = math::clamp_positive(math::sub(ONE, ir_fees)?);
        let lending_apr = math::mul(math::mul(base, u)?, lender_share)?;

        Ok(InterestRates {
            utilization: u,
            base_rate: base,
            lending_apr: math::clamp_positive(lending_apr),
            borrowing_apr: math::clamp_positive(borrowing_apr),
        })
    }
}

// 8. mod weights (risk-weighted valuation)
pub mod weights {
    use super::error::Result;
    use super::math;
    use super::price::{OraclePriceSnapshot, PriceBias};
    use super::state::{Bank, RequirementType};
    use fixed::types::I80F48;

    /// USD value of a ui token amount at `price`, scaled by `weight`.
    pub fn weighted_usd_value(amount_ui: I80F48, price: I80F48, weight: I80F48) -> Result<I80F48> {
        math::mul(math::mul(amount_ui, price)?, weight)
    }

    /// The asset weight that actually applies for `req`.
    ///
    /// For Initial requirements the configured weight is additionally scaled
    /// down once the bank's total deposit value crosses
    /// `total_asset_value_init_limit`, capping the bank-wide Initial-weighted
    /// sum at the limit. Maintenance is never scaled. A bank whose init
    /// weight is configured to zero (being retired) therefore contributes no
    /// borrowing power while still counting toward liquidation thresholds —
    /// the configured weights are used verbatim, no substitution.
    pub fn effective_asset_weight(
        bank: &Bank,
        req: RequirementType,
        oracle: &OraclePriceSnapshot,
    ) -> Result<I80F48> {
        let weight = bank.asset_weight(req);
        if req != RequirementType::Initial || bank.config.total_asset_value_init_limit == 0 {
            return Ok(weight);
        }
        let limit = I80F48::from_num(bank.config.total_asset_value_init_limit);
        let total_value = math::mul(
            bank.ui_amount(bank.total_deposits)?,
            oracle.biased(PriceBias::None),
        )?;
        if total_value <= limit {
            return Ok(weight);
        }
        // Scale so that sum(weighted deposits) == limit at the margin.
        math::div_floor(math::mul(weight, limit)?, total_value)
    }
}

// 9. mod health (account-level aggregation)
pub mod health {
    use super::error::Result;
    use super::math::{self, ONE, ZERO};
    use super::price::PriceBias;
    use super::shares::shares_to_tokens;
    use super::state::{Bank, BalanceSide, MarginAccount, MarketSnapshot, RequirementType};
    use super::weights::{effective_asset_weight, weighted_usd_value};
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;

    /// Weighted USD totals for one requirement type.
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct HealthComponents {
        pub assets: I80F48,
        pub liabilities: I80F48,
    }

    /// Everything the portfolio view needs, recomputed from scratch each
    /// fetch cycle. Derived data only — never persisted, never authoritative.
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct AccountSummary {
        /// USD totals at unbiased prices, unweighted.
        pub lending_amount: I80F48,
        pub borrowing_amount: I80F48,
        /// Net of the two.
        pub balance: I80F48,
        /// Biased, weighted equivalents.
        pub lending_amount_init: I80F48,
        pub borrowing_amount_init: I80F48,
        pub lending_amount_maint: I80F48,
        pub borrowing_amount_maint: I80F48,
        pub health_factor: I80F48,
        pub free_collateral: I80F48,
        pub signed_free_collateral: I80F48,
    }

    /// Market-wide totals at unbiased prices.
    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ProtocolStats {
        pub deposits: I80F48,
        pub borrows: I80F48,
        pub tvl: I80F48,
    }

    fn balance_tokens_ui(bank: &Bank, shares: I80F48, side: BalanceSide) -> Result<I80F48> {
        let (total_shares, total_tokens) = match side {
            BalanceSide::Assets => (bank.total_asset_shares, bank.total_deposits),
            BalanceSide::Liabilities => (bank.total_liability_shares, bank.total_borrows),
        };
        bank.ui_amount(shares_to_tokens(shares, total_shares, total_tokens, side)?)
    }

    /// Biased, weighted asset/liability totals across all active balances.
    ///
    /// Fails hard on an unknown bank or a stale oracle: health must never be
    /// computed from bad inputs, the caller refuses to render instead.
    pub fn compute_health_components(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        req: RequirementType,
        now: i64,
    ) -> Result<HealthComponents> {
        let mut assets = ZERO;
        let mut liabilities = ZERO;

        for balance in account.active_balances() {
            let Some(side) = balance.side() else { continue };
            let bank = snapshot.bank(&balance.bank)?;
            let oracle = snapshot.checked_price(bank, now)?;

            match side {
                BalanceSide::Assets => {
                    let amount = balance_tokens_ui(bank, balance.asset_shares, side)?;
                    let weight = effective_asset_weight(bank, req, oracle)?;
                    let value =
                        weighted_usd_value(amount, oracle.biased(PriceBias::Low), weight)?;
                    assets = math::add(assets, value)?;
                }
                BalanceSide::Liabilities => {
                    let amount = balance_tokens_ui(bank, balance.liability_shares, side)?;
                    let value = weighted_usd_value(
                        amount,
                        oracle.biased(PriceBias::High),
                        bank.liability_weight(req),
                    )?;
                    liabilities = math::add(liabilities, value)?;
                }
            }
        }

        Ok(HealthComponents { assets, liabilities })
    }

    /// Unbiased, unweighted USD totals (portfolio display numbers).
    pub fn compute_unweighted_totals(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
    ) -> Result<HealthComponents> {
        let mut assets = ZERO;
        let mut liabilities = ZERO;
        for balance in account.active_balances() {
            let Some(side) = balance.side() else { continue };
            let bank = snapshot.bank(&balance.bank)?;
            // Passive display: last-known price, no staleness gate.
            let oracle = snapshot.price(&balance.bank)?;
            match side {
                BalanceSide::Assets => {
                    let amount = balance_tokens_ui(bank, balance.asset_shares, side)?;
                    assets = math::add(assets, math::mul(amount, oracle.price)?)?;
                }
                BalanceSide::Liabilities => {
                    let amount = balance_tokens_ui(bank, balance.liability_shares, side)?;
                    liabilities = math::add(liabilities, math::mul(amount, oracle.price)?)?;
                }
            }
        }
        Ok(HealthComponents { assets, liabilities })
    }

    /// (maint assets - maint liabilities) / maint assets.
    ///
    /// 1 with no liabilities (including the empty account), -1 floor when
    /// debt exists against zero maintenance assets. <= 0 means liquidatable.
    pub fn health_factor(maint: &HealthComponents) -> I80F48 {
        if maint.liabilities == ZERO {
            return ONE;
        }
        if maint.assets == ZERO {
            return -ONE;
        }
        let net = maint.assets.saturating_sub(maint.liabilities);
        net.checked_div(maint.assets).unwrap_or(-ONE)
    }

    /// Initial-weighted headroom for new exposure. Never negative.
    pub fn free_collateral(init: &HealthComponents) -> I80F48 {
        math::clamp_positive(init.assets.saturating_sub(init.liabilities))
    }

    /// Like [`free_collateral`] but allowed to go negative (how far under
    /// water the Initial requirement is).
    pub fn signed_free_collateral(init: &HealthComponents) -> I80F48 {
        init.assets.saturating_sub(init.liabilities)
    }

    /// Oracle price of `bank`'s underlying at which maintenance assets equal
    /// maintenance liabilities, all other banks held fixed.
    ///
    /// Closed-form linear solve; the confidence offset is held constant so
    /// the result is consistent with how Maintenance valuation biases prices.
    /// Well-posed only for a single token-pair position: the target balance
    /// plus at most one opposite-side balance. Everything else returns
    /// `None` (not an error — the UI simply has nothing to show).
    pub fn liquidation_price(
        account: &MarginAccount,
        bank_address: &Pubkey,
        snapshot: &MarketSnapshot,
        now: i64,
    ) -> Result<Option<I80F48>> {
        let Some(target) = account.balance(bank_address) else {
            return Ok(None);
        };
        let Some(target_side) = target.side() else {
            return Ok(None);
        };

        let others: Vec<_> = account
            .active_balances()
            .filter(|b| &b.bank != bank_address && b.side().is_some())
            .collect();
        if others.len() > 1 {
            return Ok(None);
        }
        if let Some(other) = others.first() {
            if other.side() == Some(target_side) {
                return Ok(None);
            }
        }

        // Fixed contribution from the other leg, at maintenance.
        let mut fixed_assets = ZERO;
        let mut fixed_liabilities = ZERO;
        for other in &others {
            let Some(other_side) = other.side() else { continue };
            let bank = snapshot.bank(&other.bank)?;
            let oracle = snapshot.checked_price(bank, now)?;
            match other_side {
                BalanceSide::Assets => {
                    let amount = balance_tokens_ui(bank, other.asset_shares, BalanceSide::Assets)?;
                    let weight =
                        effective_asset_weight(bank, RequirementType::Maintenance, oracle)?;
                    fixed_assets = math::add(
                        fixed_assets,
                        weighted_usd_value(amount, oracle.biased(PriceBias::Low), weight)?,
                    )?;
                }
                BalanceSide::Liabilities => {
                    let amount =
                        balance_tokens_ui(bank, other.liability_shares, BalanceSide::Liabilities)?;
                    fixed_liabilities = math::add(
                        fixed_liabilities,
                        weighted_usd_value(
                            amount,
                            oracle.biased(PriceBias::High),
                            bank.liability_weight(RequirementType::Maintenance),
                        )?,
                    )?;
                }
            }
        }

        let bank = snapshot.bank(bank_address)?;
        let oracle = snapshot.checked_price(bank, now)?;
        let conf = oracle.confidence;

        let solved = match target_side {
            BalanceSide::Assets => {
                // w * amt * (p - conf) = fixed_liabilities
                if fixed_liabilities == ZERO {
                    return Ok(None); // nothing to liquidate against
                }
                let amount = balance_tokens_ui(bank, target.asset_shares, BalanceSide::Assets)?;
                let weight = bank.asset_weight(RequirementType::Maintenance);
                let denom = math::mul(amount, weight)?;
                if denom == ZERO {
                    return Ok(None);
                }
                let shortfall = fixed_liabilities.saturating_sub(fixed_assets);
                math::add(math::div_floor(shortfall, denom)?, conf)?
            }
            BalanceSide::Liabilities => {
                // fixed_assets = w * amt * (p + conf)
                if fixed_assets == ZERO {
                    return Ok(None);
                }
                let amount =
                    balance_tokens_ui(bank, target.liability_shares, BalanceSide::Liabilities)?;
                let weight = bank.liability_weight(RequirementType::Maintenance);
                let denom = math::mul(amount, weight)?;
                if denom == ZERO {
                    return Ok(None);
                }
                let headroom = fixed_assets.saturating_sub(fixed_liabilities);
                math::sub(math::div_floor(headroom, denom)?, conf)?
            }
        };

        if solved <= ZERO {
            return Ok(None);
        }
        Ok(Some(solved))
    }

    /// Full derived view for the portfolio screen.
    pub fn compute_account_summary(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        now: i64,
    ) -> Result<AccountSummary> {
        let raw = compute_unweighted_totals(account, snapshot)?;
        let init = compute_health_components(account, snapshot, RequirementType::Initial, now)?;
        let maint =
            compute_health_components(account, snapshot, RequirementType::Maintenance, now)?;

        Ok(AccountSummary {
            lending_amount: raw.assets,
            borrowing_amount: raw.liabilities,
            balance: raw.assets.saturating_sub(raw.liabilities),
            lending_amount_init: init.assets,
            borrowing_amount_init: init.liabilities,
            lending_amount_maint: maint.assets,
            borrowing_amount_maint: maint.liabilities,
            health_factor: health_factor(&maint),
            free_collateral: free_collateral(&init),
            signed_free_collateral: signed_free_collateral(&init),
        })
    }

    /// Market totals for the protocol header (unbiased prices).
    pub fn compute_protocol_stats(snapshot: &MarketSnapshot) -> Result<ProtocolStats> {
        let mut deposits = ZERO;
        let mut borrows = ZERO;
        for bank in snapshot.banks() {
            let oracle = snapshot.price(&bank.address)?;
            deposits = math::add(
                deposits,
                math::mul(bank.ui_amount(bank.total_deposits)?, oracle.price)?,
            )?;
            borrows = math::add(
                borrows,
                math::mul(bank.ui_amount(bank.total_borrows)?, oracle.price)?,
            )?;
        }
        Ok(ProtocolStats {
            deposits,
            borrows,
            tvl: deposits.saturating_sub(borrows),
        })
    }

}

// 10. mod simulate (hypothetical actions)
pub mod simulate {
    use super::error::{Result, RiskError};
    use super::health::{
        compute_account_summary, compute_health_components, free_collateral, health_factor,
        liquidation_price, AccountSummary,
    };
    use super::math::{self, ONE, ZERO};
    use super::price::PriceBias;
    use super::rates::compute_interest_rates;
    use super::shares::{shares_to_tokens, tokens_to_shares};
    use super::state::{
        Bank, BalanceSide, MarginAccount, MarketSnapshot, OperationalState, RequirementType,
        RiskTier,
    };
    use super::weights::effective_asset_weight;
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use tracing::{debug, warn};

    /// The closed set of previewable actions. Adding a variant forces every
    /// dispatch site below to handle it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ActionType {
        Deposit,
        Withdraw,
        Borrow,
        Repay,
        /// Deposit on the target bank and borrow on the secondary bank in one
        /// step (leveraged exposure).
        Loop,
    }

    /// One simulation request. Amounts are native token units.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ActionRequest {
        pub action: ActionType,
        pub bank: Pubkey,
        pub amount: I80F48,
        /// Loop only: the bank borrowed against the deposit.
        pub secondary_bank: Option<Pubkey>,
        /// Loop only: the borrow leg's amount, native units of the secondary
        /// bank's mint.
        pub secondary_amount: Option<I80F48>,
        /// Withdraw/Repay: the UI means "close the entire position". A
        /// partial amount then gets flagged rather than silently accepted.
        pub whole_position: bool,
    }

    impl ActionRequest {
        pub fn new(action: ActionType, bank: Pubkey, amount: I80F48) -> Self {
            Self {
                action,
                bank,
                amount,
                secondary_bank: None,
                secondary_amount: None,
                whole_position: false,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Severity {
        Info,
        Warning,
        /// The action would fail on-chain; the submit button stays disabled.
        Blocking,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ActionMessageKind {
        InsufficientCollateral,
        ExceedsBankCapacity,
        BankPaused,
        BankReduceOnly,
        AmountNotWholePosition,
        AmountExceedsPosition,
        OppositeSidePosition,
        IsolatedTierViolation,
        StaleOracle,
    }

    /// User-facing validation result. These travel alongside the preview so
    /// the UI can explain why an action would fail without losing the other
    /// computed figures.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ActionMessage {
        pub kind: ActionMessageKind,
        pub severity: Severity,
        pub description: String,
    }

    impl ActionMessage {
        fn blocking(kind: ActionMessageKind, description: impl Into<String>) -> Self {
            Self {
                kind,
                severity: Severity::Blocking,
                description: description.into(),
            }
        }

        fn warning(kind: ActionMessageKind, description: impl Into<String>) -> Self {
            Self {
                kind,
                severity: Severity::Warning,
                description: description.into(),
            }
        }
    }

    /// Locally computed preview. `price_impact_pct` / `slippage_bps` are
    /// filled in by the caller from its swap quote when the action routes
    /// through a swap; the engine has no quote source.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ActionPreview {
        /// Position size on the target bank after the action, ui tokens.
        pub position_amount: I80F48,
        pub health: I80F48,
        pub liquidation_price: Option<I80F48>,
        /// Pool deposits after the action, ui tokens.
        pub pool_size: I80F48,
        /// The relevant capacity limit (deposit or borrow side), ui tokens.
        /// `None` when the bank is uncapped.
        pub bank_cap: Option<I80F48>,
        pub price_impact_pct: Option<I80F48>,
        pub slippage_bps: Option<u16>,
    }

    /// Preview assembled from an authoritative on-chain simulation supplied
    /// by the execution collaborator: adds realized post-state rates and the
    /// available-collateral ratio.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct SimulatedActionPreview {
        pub health: I80F48,
        pub liquidation_price: Option<I80F48>,
        pub deposit_rate: I80F48,
        pub borrow_rate: I80F48,
        pub position_amount: I80F48,
        pub available_collateral: AvailableCollateral,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
    pub struct AvailableCollateral {
        pub amount: I80F48,
        /// amount / initial-weighted assets, 0 when there are none.
        pub ratio: I80F48,
    }

    /// Post-execution state returned by the execution collaborator.
    #[derive(Clone, Debug, PartialEq)]
    pub struct ExecutionSimulation {
        pub account: MarginAccount,
        pub banks: Vec<Bank>,
    }

    /// What a simulation call hands back: the preview (when computable), the
    /// validation messages, and the mutated clone for further inspection.
    #[derive(Clone, Debug, PartialEq)]
    pub struct ActionOutcome {
        pub preview: Option<ActionPreview>,
        pub messages: Vec<ActionMessage>,
        pub account: MarginAccount,
    }

    /// Ordered semantic legs handed to the transaction-construction
    /// collaborator. One action maps to one or two legs (Loop).
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub enum ActionIntent {
        Deposit { bank: Pubkey, amount: I80F48 },
        Withdraw { bank: Pubkey, amount: I80F48, whole_position: bool },
        Borrow { bank: Pubkey, amount: I80F48 },
        Repay { bank: Pubkey, amount: I80F48, whole_position: bool },
    }

    pub fn action_intents(request: &ActionRequest) -> Vec<ActionIntent> {
        match request.action {
            ActionType::Deposit => vec![ActionIntent::Deposit {
                bank: request.bank,
                amount: request.amount,
            }],
            ActionType::Withdraw => vec![ActionIntent::Withdraw {
                bank: request.bank,
                amount: request.amount,
                whole_position: request.whole_position,
            }],
            ActionType::Borrow => vec![ActionIntent::Borrow {
                bank: request.bank,
                amount: request.amount,
            }],
            ActionType::Repay => vec![ActionIntent::Repay {
                bank: request.bank,
                amount: request.amount,
                whole_position: request.whole_position,
            }],
            ActionType::Loop => {
                let mut intents = vec![ActionIntent::Deposit {
                    bank: request.bank,
                    amount: request.amount,
                }];
                if let (Some(bank), Some(amount)) =
                    (request.secondary_bank, request.secondary_amount)
                {
                    intents.push(ActionIntent::Borrow { bank, amount });
                }
                intents
            }
        }
    }

    fn validate_operational(
        bank: &Bank,
        increases_exposure: bool,
        messages: &mut Vec<ActionMessage>,
    ) {
        match bank.config.operational_state {
            OperationalState::Paused => messages.push(ActionMessage::blocking(
                ActionMessageKind::BankPaused,
                format!("bank {} is paused; no actions are possible", bank.address),
            )),
            OperationalState::ReduceOnly if increases_exposure => {
                messages.push(ActionMessage::blocking(
                    ActionMessageKind::BankReduceOnly,
                    format!(
                        "bank {} is reduce-only; only withdraw and repay are allowed",
                        bank.address
                    ),
                ))
            }
            _ => {}
        }
    }

    fn validate_capacity(
        bank: &Bank,
        side: BalanceSide,
        amount: I80F48,
        messages: &mut Vec<ActionMessage>,
    ) -> Result<()> {
        let (limit, total, label) = match side {
            BalanceSide::Assets => (bank.config.deposit_limit, bank.total_deposits, "deposit"),
            BalanceSide::Liabilities => (bank.config.borrow_limit, bank.total_borrows, "borrow"),
        };
        if limit == 0 {
            return Ok(());
        }
        let post = math::add(total, amount)?;
        if post > I80F48::from_num(limit) {
            messages.push(ActionMessage::blocking(
                ActionMessageKind::ExceedsBankCapacity,
                format!(
                    "amount would push the bank past its {} limit; reduce the amount",
                    label
                ),
            ));
        }
        Ok(())
    }

    fn validate_isolated(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        borrow_bank: &Bank,
        messages: &mut Vec<ActionMessage>,
    ) -> Result<()> {
        let other_liability = account.has_other_liability(&borrow_bank.address);
        if borrow_bank.config.risk_tier == RiskTier::Isolated && other_liability {
            messages.push(ActionMessage::blocking(
                ActionMessageKind::IsolatedTierViolation,
                "isolated banks can only be borrowed as the account's sole liability",
            ));
            return Ok(());
        }
        // Conversely: an existing isolated borrow forbids adding any other.
        for balance in account.active_balances() {
            if balance.bank == borrow_bank.address
                || balance.side() != Some(BalanceSide::Liabilities)
            {
                continue;
            }
            if snapshot.bank(&balance.bank)?.config.risk_tier == RiskTier::Isolated {
                messages.push(ActionMessage::blocking(
                    ActionMessageKind::IsolatedTierViolation,
                    "account already borrows from an isolated bank; repay it first",
                ));
                break;
            }
        }
        Ok(())
    }

    /// Apply a deposit delta to the cloned account and the cloned bank.
    /// Returns a message instead of mutating when the position shape forbids
    /// the delta (existing debt on the same bank).
    fn apply_deposit(
        account: &mut MarginAccount,
        snapshot: &mut MarketSnapshot,
        bank_address: &Pubkey,
        amount: I80F48,
    ) -> Result<Option<ActionMessage>> {
        let bank = snapshot.bank_mut(bank_address)?;
        let balance = account.balance_mut_or_insert(*bank_address);
        if balance.liability_shares > ZERO {
            return Ok(Some(ActionMessage::blocking(
                ActionMessageKind::OppositeSidePosition,
                "repay the outstanding borrow on this bank before depositing",
            )));
        }
        let shares = tokens_to_shares(
            amount,
            bank.total_asset_shares,
            bank.total_deposits,
            BalanceSide::Assets,
        )?;
        balance.asset_shares = math::add(balance.asset_shares, shares)?;
        balance.active = true;
        bank.total_asset_shares = math::add(bank.total_asset_shares, shares)?;
        bank.total_deposits = math::add(bank.total_deposits, amount)?;
        Ok(None)
    }

    fn apply_withdraw(
        account: &mut MarginAccount,
        snapshot: &mut MarketSnapshot,
        bank_address: &Pubkey,
        amount: I80F48,
        whole_position: bool,
        messages: &mut Vec<ActionMessage>,
    ) -> Result<()> {
        let bank = snapshot.bank_mut(bank_address)?;
        let balance = account.balance_mut_or_insert(*bank_address);
        let position = shares_to_tokens(
            balance.asset_shares,
            bank.total_asset_shares,
            bank.total_deposits,
            BalanceSide::Assets,
        )?;
        if balance.asset_shares == ZERO || amount > position {
            messages.push(ActionMessage::blocking(
                ActionMessageKind::AmountExceedsPosition,
                "withdraw amount exceeds the lent position",
            ));
            return Ok(());
        }
        if whole_position && amount < position {
            messages.push(ActionMessage::warning(
                ActionMessageKind::AmountNotWholePosition,
                "closing the position requires withdrawing the full amount",
            ));
        }
        let shares = if whole_position && amount == position {
            balance.asset_shares
        } else {
            tokens_to_shares(
                amount,
                bank.total_asset_shares,
                bank.total_deposits,
                BalanceSide::Assets,
            )?
            .min(balance.asset_shares)
        };
        balance.asset_shares = math::sub(balance.asset_shares, shares)?;
        if balance.side().is_none() {
            balance.active = false;
        }
        bank.total_asset_shares = math::sub(bank.total_asset_shares, shares)?;
        bank.total_deposits = math::clamp_positive(bank.total_deposits.saturating_sub(amount));
        Ok(())
    }

    fn apply_borrow(
        account: &mut MarginAccount,
        snapshot: &mut MarketSnapshot,
        bank_address: &Pubkey,
        amount: I80F48,
    ) -> Result<Option<ActionMessage>> {
        let bank = snapshot.bank_mut(bank_address)?;
        let balance = account.balance_mut_or_insert(*bank_address);
        if balance.asset_shares > ZERO {
            return Ok(Some(ActionMessage::blocking(
                ActionMessageKind::OppositeSidePosition,
                "withdraw the lent position on this bank before borrowing",
            )));
        }
        let shares = tokens_to_shares(
            amount,
            bank.total_liability_shares,
            bank.total_borrows,
            BalanceSide::Liabilities,
        )?;
        balance.liability_shares = math::add(balance.liability_shares, shares)?;
        balance.active = true;
        bank.total_liability_shares = math::add(bank.total_liability_shares, shares)?;
        bank.total_borrows = math::add(bank.total_borrows, amount)?;
        Ok(None)
    }

    fn apply_repay(
        account: &mut MarginAccount,
        snapshot: &mut MarketSnapshot,
        bank_address: &Pubkey,
        amount: I80F48,
        whole_position: bool,
        messages: &mut Vec<ActionMessage>,
    ) -> Result<()> {
        let bank = snapshot.bank_mut(bank_address)?;
        let balance = account.balance_mut_or_insert(*bank_address);
        let position = shares_to_tokens(
            balance.liability_shares,
            bank.total_liability_shares,
            bank.total_borrows,
            BalanceSide::Liabilities,
        )?;
        if balance.liability_shares == ZERO || amount > position {
            messages.push(ActionMessage::blocking(
                ActionMessageKind::AmountExceedsPosition,
                "repay amount exceeds the outstanding borrow",
            ));
            return Ok(());
        }
        if whole_position && amount < position {
            messages.push(ActionMessage::warning(
                ActionMessageKind::AmountNotWholePosition,
                "closing the position requires repaying the full amount",
            ));
        }
        let shares = if whole_position && amount == position {
            balance.liability_shares
        } else {
            tokens_to_shares(
                amount,
                bank.total_liability_shares,
                bank.total_borrows,
                BalanceSide::Liabilities,
            )?
            .min(balance.liability_shares)
        };
        balance.liability_shares = math::sub(balance.liability_shares, shares)?;
        if balance.side().is_none() {
            balance.active = false;
        }
        bank.total_liability_shares = math::sub(bank.total_liability_shares, shares)?;
        bank.total_borrows = math::clamp_positive(bank.total_borrows.saturating_sub(amount));
        Ok(())
    }

    /// Position size on `bank` after whatever state `account` is in, ui
    /// tokens. Debt side wins when present (mirrors how the UI reports a
    /// position).
    pub fn position_amount_ui(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        bank_address: &Pubkey,
    ) -> Result<I80F48> {
        let bank = snapshot.bank(bank_address)?;
        let Some(balance) = account.balance(bank_address) else {
            return Ok(ZERO);
        };
        match balance.side() {
            Some(BalanceSide::Liabilities) => bank.ui_amount(shares_to_tokens(
                balance.liability_shares,
                bank.total_liability_shares,
                bank.total_borrows,
                BalanceSide::Liabilities,
            )?),
            Some(BalanceSide::Assets) => bank.ui_amount(shares_to_tokens(
                balance.asset_shares,
                bank.total_asset_shares,
                bank.total_deposits,
                BalanceSide::Assets,
            )?),
            None => Ok(ZERO),
        }
    }

    fn build_preview(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        bank_address: &Pubkey,
        capacity_side: BalanceSide,
        now: i64,
    ) -> Result<ActionPreview> {
        let maint =
            compute_health_components(account, snapshot, RequirementType::Maintenance, now)?;
        let bank = snapshot.bank(bank_address)?;
        let limit = match capacity_side {
            BalanceSide::Assets => bank.config.deposit_limit,
            BalanceSide::Liabilities => bank.config.borrow_limit,
        };
        let bank_cap = if limit == 0 {
            None
        } else {
            Some(bank.ui_amount(I80F48::from_num(limit))?)
        };
        Ok(ActionPreview {
            position_amount: position_amount_ui(account, snapshot, bank_address)?,
            health: health_factor(&maint),
            liquidation_price: liquidation_price(account, bank_address, snapshot, now)?,
            pool_size: bank.ui_amount(bank.total_deposits)?,
            bank_cap,
            price_impact_pct: None,
            slippage_bps: None,
        })
    }

    /// Simulate `request` against a cloned account and a bank set whose
    /// target totals are shifted by the action, then re-derive health on the
    /// clone. Nothing persisted is touched.
    ///
    /// Validation failures come back as messages *alongside* whatever could
    /// still be computed. Hard errors are reserved for unusable snapshots;
    /// a stale oracle downgrades to a blocking message with no preview so
    /// passive parts of the UI can keep rendering.
    pub fn simulate_action(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        request: &ActionRequest,
        now: i64,
    ) -> Result<ActionOutcome> {
        if request.amount < ZERO {
            return Err(RiskError::InvalidRequest);
        }
        debug!(
            action = ?request.action,
            bank = %request.bank,
            "simulating action"
        );

        let mut messages = Vec::new();
        let mut sim_account = account.clone();
        let mut sim_snapshot = snapshot.clone();

        let capacity_side = match request.action {
            ActionType::Deposit | ActionType::Withdraw | ActionType::Loop => BalanceSide::Assets,
            ActionType::Borrow | ActionType::Repay => BalanceSide::Liabilities,
        };

        // Zero amount: a no-op preview, numerically identical to the
        // account's current state.
        if request.amount == ZERO {
            let preview =
                match build_preview(&sim_account, &sim_snapshot, &request.bank, capacity_side, now)
                {
                    Ok(p) => Some(p),
                    Err(RiskError::StaleOracle) => {
                        messages.push(stale_message(&request.bank));
                        None
                    }
                    Err(e) => return Err(e),
                };
            return Ok(ActionOutcome {
                preview,
                messages,
                account: sim_account,
            });
        }

        {
            let target = snapshot.bank(&request.bank)?;
            match request.action {
                ActionType::Deposit | ActionType::Loop => {
                    validate_operational(target, true, &mut messages);
                    validate_capacity(target, BalanceSide::Assets, request.amount, &mut messages)?;
                }
                ActionType::Borrow => {
                    validate_operational(target, true, &mut messages);
                    validate_capacity(
                        target,
                        BalanceSide::Liabilities,
                        request.amount,
                        &mut messages,
                    )?;
                    validate_isolated(account, snapshot, target, &mut messages)?;
                }
                ActionType::Withdraw | ActionType::Repay => {
                    validate_operational(target, false, &mut messages);
                }
            }
        }

        match request.action {
            ActionType::Deposit => {
                if let Some(msg) =
                    apply_deposit(&mut sim_account, &mut sim_snapshot, &request.bank, request.amount)?
                {
                    messages.push(msg);
                }
            }
            ActionType::Withdraw => apply_withdraw(
                &mut sim_account,
                &mut sim_snapshot,
                &request.bank,
                request.amount,
                request.whole_position,
                &mut messages,
            )?,
            ActionType::Borrow => {
                if let Some(msg) =
                    apply_borrow(&mut sim_account, &mut sim_snapshot, &request.bank, request.amount)?
                {
                    messages.push(msg);
                }
            }
            ActionType::Repay => apply_repay(
                &mut sim_account,
                &mut sim_snapshot,
                &request.bank,
                request.amount,
                request.whole_position,
                &mut messages,
            )?,
            ActionType::Loop => {
                let secondary = request.secondary_bank.ok_or(RiskError::InvalidRequest)?;
                let secondary_amount =
                    request.secondary_amount.ok_or(RiskError::InvalidRequest)?;
                if secondary_amount < ZERO {
                    return Err(RiskError::InvalidRequest);
                }
                {
                    let borrow_bank = snapshot.bank(&secondary)?;
                    validate_operational(borrow_bank, true, &mut messages);
                    validate_capacity(
                        borrow_bank,
                        BalanceSide::Liabilities,
                        secondary_amount,
                        &mut messages,
                    )?;
                    validate_isolated(account, snapshot, borrow_bank, &mut messages)?;
                }
                // Both legs or neither: the on-chain action is atomic.
                let deposit_conflict = apply_deposit(
                    &mut sim_account,
                    &mut sim_snapshot,
                    &request.bank,
                    request.amount,
                )?;
                match deposit_conflict {
                    Some(msg) => messages.push(msg),
                    None => {
                        if let Some(msg) = apply_borrow(
                            &mut sim_account,
                            &mut sim_snapshot,
                            &secondary,
                            secondary_amount,
                        )? {
                            messages.push(msg);
                            // Roll the deposit leg back; a one-legged loop is
                            // not a previewable state.
                            sim_account = account.clone();
                            sim_snapshot = snapshot.clone();
                        }
                    }
                }
            }
        }

        // Initial-requirement check on the mutated clone.
        match compute_health_components(&sim_account, &sim_snapshot, RequirementType::Initial, now)
        {
            Ok(init) => {
                if init.liabilities > init.assets {
                    let shortfall = init.liabilities.saturating_sub(init.assets);
                    messages.push(ActionMessage::blocking(
                        ActionMessageKind::InsufficientCollateral,
                        format!(
                            "not enough collateral: initial requirement short by ${}",
                            shortfall
                        ),
                    ));
                }
            }
            Err(RiskError::StaleOracle) => {
                messages.push(stale_message(&request.bank));
                return Ok(ActionOutcome {
                    preview: None,
                    messages,
                    account: sim_account,
                });
            }
            Err(e) => return Err(e),
        }

        let preview =
            match build_preview(&sim_account, &sim_snapshot, &request.bank, capacity_side, now) {
                Ok(p) => Some(p),
                Err(RiskError::StaleOracle) => {
                    messages.push(stale_message(&request.bank));
                    None
                }
                Err(e) => return Err(e),
            };

        Ok(ActionOutcome {
            preview,
            messages,
            account: sim_account,
        })
    }

    fn stale_message(bank: &Pubkey) -> ActionMessage {
        warn!(%bank, "stale oracle blocks health preview");
        ActionMessage::blocking(
            ActionMessageKind::StaleOracle,
            "oracle price is stale; health preview unavailable until it refreshes",
        )
    }

    /// Assemble the authoritative preview from the execution collaborator's
    /// post-state: realized health, post-action rates and collateral ratio.
    pub fn simulated_action_preview(
        simulation: &ExecutionSimulation,
        bank_address: &Pubkey,
        snapshot: &MarketSnapshot,
        now: i64,
    ) -> Result<SimulatedActionPreview> {
        let post = snapshot.with_banks(simulation.banks.clone())?;
        let maint = compute_health_components(
            &simulation.account,
            &post,
            RequirementType::Maintenance,
            now,
        )?;
        let init =
            compute_health_components(&simulation.account, &post, RequirementType::Initial, now)?;
        let collateral = free_collateral(&init);
        let ratio = if init.assets > ZERO {
            math::div_floor(collateral, init.assets)?
        } else {
            ZERO
        };
        let bank = post.bank(bank_address)?;
        let rates = compute_interest_rates(bank)?;
        Ok(SimulatedActionPreview {
            health: health_factor(&maint),
            liquidation_price: liquidation_price(&simulation.account, bank_address, &post, now)?,
            deposit_rate: rates.lending_apr,
            borrow_rate: rates.borrowing_apr,
            position_amount: position_amount_ui(&simulation.account, &post, bank_address)?,
            available_collateral: AvailableCollateral {
                amount: collateral,
                ratio,
            },
        })
    }

    // ========================================
    // Max-amount helpers
    // ========================================

    /// Deposit headroom on the bank, native units. `None` = uncapped.
    pub fn max_deposit(bank: &Bank) -> Result<Option<I80F48>> {
        if bank.config.deposit_limit == 0 {
            return Ok(None);
        }
        let limit = I80F48::from_num(bank.config.deposit_limit);
        Ok(Some(math::clamp_positive(
            limit.saturating_sub(bank.total_deposits),
        )))
    }

    /// Largest withdraw that keeps the Initial requirement satisfied, native
    /// units. Debt-free accounts can take the whole position; otherwise the
    /// free collateral converts back through the Low-biased price and the
    /// effective init weight. Always capped by pool liquidity.
    pub fn max_withdraw(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        bank_address: &Pubkey,
        now: i64,
    ) -> Result<I80F48> {
        let bank = snapshot.bank(bank_address)?;
        let Some(balance) = account.balance(bank_address) else {
            return Ok(ZERO);
        };
        if balance.side() != Some(BalanceSide::Assets) {
            return Ok(ZERO);
        }
        let position = shares_to_tokens(
            balance.asset_shares,
            bank.total_asset_shares,
            bank.total_deposits,
            BalanceSide::Assets,
        )?;

        let init = compute_health_components(account, snapshot, RequirementType::Initial, now)?;
        let unlimited = init.liabilities == ZERO;
        let cap = if unlimited {
            position
        } else {
            let oracle = snapshot.checked_price(bank, now)?;
            let weight = effective_asset_weight(bank, RequirementType::Initial, oracle)?;
            let unit_value = math::mul(oracle.biased(PriceBias::Low), weight)?;
            if unit_value == ZERO {
                // Retired bank: withdrawing it frees no collateral but costs
                // none either.
                position
            } else {
                let freeable_ui = math::div_floor(free_collateral(&init), unit_value)?;
                let freeable_native =
                    math::mul(freeable_ui, math::exp10(bank.mint_decimals as u32)?)?;
                freeable_native.min(position)
            }
        };
        Ok(cap.min(bank.available_liquidity()))
    }

    /// Largest borrow the free collateral supports, native units, capped by
    /// the bank's borrow limit headroom and pool liquidity.
    pub fn max_borrow(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        bank_address: &Pubkey,
        now: i64,
    ) -> Result<I80F48> {
        let bank = snapshot.bank(bank_address)?;
        let oracle = snapshot.checked_price(bank, now)?;
        let init = compute_health_components(account, snapshot, RequirementType::Initial, now)?;

        let unit_value = math::mul(
            oracle.biased(PriceBias::High),
            bank.liability_weight(RequirementType::Initial),
        )?;
        if unit_value == ZERO {
            return Ok(ZERO);
        }
        let affordable_ui = math::div_floor(free_collateral(&init), unit_value)?;
        let mut cap = math::mul(affordable_ui, math::exp10(bank.mint_decimals as u32)?)?;

        if bank.config.borrow_limit != 0 {
            let headroom = math::clamp_positive(
                I80F48::from_num(bank.config.borrow_limit).saturating_sub(bank.total_borrows),
            );
            cap = cap.min(headroom);
        }
        Ok(cap.min(bank.available_liquidity()))
    }

    /// Outstanding debt on the bank (the most that can be repaid), native
    /// units.
    pub fn max_repay(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        bank_address: &Pubkey,
    ) -> Result<I80F48> {
        let bank = snapshot.bank(bank_address)?;
        let Some(balance) = account.balance(bank_address) else {
            return Ok(ZERO);
        };
        if balance.side() != Some(BalanceSide::Liabilities) {
            return Ok(ZERO);
        }
        shares_to_tokens(
            balance.liability_shares,
            bank.total_liability_shares,
            bank.total_borrows,
            BalanceSide::Liabilities,
        )
    }

    /// Upper bound on loop leverage for a deposit/borrow bank pair:
    /// `1 / (1 - ltv)` where `ltv = asset_weight_init / liability_weight_init`.
    /// `None` when the pair cannot be safely levered (ltv >= 1 or no
    /// liability weight).
    pub fn max_leverage(deposit_bank: &Bank, borrow_bank: &Bank) -> Option<I80F48> {
        let liability_weight = borrow_bank.liability_weight(RequirementType::Initial);
        if liability_weight == ZERO {
            return None;
        }
        let ltv = deposit_bank
            .asset_weight(RequirementType::Initial)
            .checked_div(liability_weight)?;
        if ltv >= ONE {
            return None;
        }
        ONE.checked_div(ONE - ltv)
    }

    /// Convenience: summary of the *unmodified* account, for callers that
    /// want the baseline next to a preview.
    pub fn baseline_summary(
        account: &MarginAccount,
        snapshot: &MarketSnapshot,
        now: i64,
    ) -> Result<AccountSummary> {
        compute_account_summary(account, snapshot, now)
    }
}

// 11. mod gate (generation tokens, last-request-wins)
pub mod gate {
    /// Monotonically increasing token identifying one simulation request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SimulationToken(u64);

    impl SimulationToken {
        pub fn value(&self) -> u64 {
            self.0
        }
    }

    /// Discards out-of-date simulation results.
    ///
    /// Every request draws a token from [`issue`](SimulationGate::issue);
    /// when its (possibly asynchronous, possibly reordered) result comes
    /// back, [`commit`](SimulationGate::commit) accepts it only if the token
    /// is still the latest issued. Last-request-wins, never
    /// first-response-wins: a response for an older token is dropped even if
    /// it arrives after the newest one. No timers, no threads — callers
    /// debounce input and schedule however they like.
    #[derive(Debug)]
    pub struct SimulationGate<T> {
        last_issued: u64,
        latest: Option<(u64, T)>,
    }

    impl<T> Default for SimulationGate<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T> SimulationGate<T> {
        pub fn new() -> Self {
            Self {
                last_issued: 0,
                latest: None,
            }
        }

        pub fn issue(&mut self) -> SimulationToken {
            self.last_issued += 1;
            SimulationToken(self.last_issued)
        }

        /// True if the result was accepted as current; false means it was
        /// superseded and dropped.
        pub fn commit(&mut self, token: SimulationToken, value: T) -> bool {
            if token.0 != self.last_issued {
                return false;
            }
            self.latest = Some((token.0, value));
            true
        }

        pub fn latest(&self) -> Option<&T> {
            self.latest.as_ref().map(|(_, v)| v)
        }

        /// Token of the accepted result, if any.
        pub fn latest_token(&self) -> Option<SimulationToken> {
            self.latest.as_ref().map(|(t, _)| SimulationToken(*t))
        }

        /// Forget any stored result (e.g. the input box was cleared).
        pub fn clear(&mut self) {
            self.latest = None;
        }
    }
}

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Result, RiskError};
pub use gate::{SimulationGate, SimulationToken};
pub use health::{
    compute_account_summary, compute_health_components, compute_protocol_stats,
    compute_unweighted_totals, free_collateral, health_factor, liquidation_price,
    signed_free_collateral, AccountSummary, HealthComponents, ProtocolStats,
};
pub use price::{OraclePriceSnapshot, PriceBias};
pub use rates::{base_rate_for_utilization, compute_interest_rates, utilization, InterestRates};
pub use shares::{shares_to_tokens, tokens_to_shares};
pub use simulate::{
    action_intents, baseline_summary, max_borrow, max_deposit, max_leverage, max_repay,
    max_withdraw, position_amount_ui, simulate_action, simulated_action_preview, ActionIntent,
    ActionMessage, ActionMessageKind, ActionOutcome, ActionPreview, ActionRequest, ActionType,
    AvailableCollateral, ExecutionSimulation, Severity, SimulatedActionPreview,
};
pub use state::{
    AssetTag, Balance, BalanceSide, Bank, BankConfig, InterestRateConfig, MarginAccount,
    MarketSnapshot, OperationalState, RequirementType, RiskTier,
};
pub use weights::{effective_asset_weight, weighted_usd_value};

/// Crate-level alias for the fixed-point type every quantity uses.
pub type Fixed = I80F48;
