//! Governor configuration
//!
//! All tunables carry serde defaults so a bare deployment runs with sane
//! values. Loaded from an optional `governor` file plus `GOVERNOR_*`
//! environment variables.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration for the governor engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl GovernorConfig {
    /// Load from `governor.{toml,json,yaml}` (optional) layered with
    /// `GOVERNOR_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("governor").required(false))
            .add_source(config::Environment::with_prefix("GOVERNOR").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Fee-coverage gate inputs, all in basis points
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeeConfig {
    /// Taker fee per exchange; `default_taker_fee_bps` when absent
    #[serde(default)]
    pub taker_fee_bps: HashMap<String, Decimal>,
    #[serde(default = "default_taker_fee_bps")]
    pub default_taker_fee_bps: Decimal,
    /// Spread estimate per symbol; `default_spread_bps` when absent
    #[serde(default)]
    pub spread_bps: HashMap<String, Decimal>,
    #[serde(default = "default_spread_bps")]
    pub default_spread_bps: Decimal,
    #[serde(default = "default_slippage_buffer_bps")]
    pub slippage_buffer_bps: Decimal,
    #[serde(default = "default_safety_margin_bps")]
    pub safety_margin_bps: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            taker_fee_bps: HashMap::new(),
            default_taker_fee_bps: default_taker_fee_bps(),
            spread_bps: HashMap::new(),
            default_spread_bps: default_spread_bps(),
            slippage_buffer_bps: default_slippage_buffer_bps(),
            safety_margin_bps: default_safety_margin_bps(),
        }
    }
}

impl FeeConfig {
    pub fn taker_fee(&self, exchange: &str) -> Decimal {
        self.taker_fee_bps
            .get(exchange)
            .copied()
            .unwrap_or(self.default_taker_fee_bps)
    }

    pub fn spread(&self, symbol: &str) -> Decimal {
        self.spread_bps
            .get(symbol)
            .copied()
            .unwrap_or(self.default_spread_bps)
    }

    /// Full round-trip cost used by the fee-coverage gate
    pub fn total_cost_bps(&self, exchange: &str, symbol: &str) -> Decimal {
        self.taker_fee(exchange)
            + self.spread(symbol)
            + self.slippage_buffer_bps
            + self.safety_margin_bps
    }
}

fn default_taker_fee_bps() -> Decimal {
    Decimal::from(25)
}
fn default_spread_bps() -> Decimal {
    Decimal::from(5)
}
fn default_slippage_buffer_bps() -> Decimal {
    Decimal::from(10)
}
fn default_safety_margin_bps() -> Decimal {
    Decimal::from(5)
}

/// Trade-limiter counters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_trades_per_bot_daily")]
    pub max_trades_per_bot_daily: u32,
    #[serde(default = "default_max_trades_per_user_daily")]
    pub max_trades_per_user_daily: u32,
    /// Exchange-wide order budget over the burst window, shared by every
    /// active bot on that exchange
    #[serde(default)]
    pub exchange_rate_limits: HashMap<String, u32>,
    #[serde(default = "default_exchange_rate_limit")]
    pub default_exchange_rate_limit: u32,
    #[serde(default = "default_burst_limit_window_seconds")]
    pub burst_limit_window_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_trades_per_bot_daily: default_max_trades_per_bot_daily(),
            max_trades_per_user_daily: default_max_trades_per_user_daily(),
            exchange_rate_limits: HashMap::new(),
            default_exchange_rate_limit: default_exchange_rate_limit(),
            burst_limit_window_seconds: default_burst_limit_window_seconds(),
        }
    }
}

impl LimitsConfig {
    pub fn exchange_rate_limit(&self, exchange: &str) -> u32 {
        self.exchange_rate_limits
            .get(exchange)
            .copied()
            .unwrap_or(self.default_exchange_rate_limit)
    }
}

fn default_max_trades_per_bot_daily() -> u32 {
    10
}
fn default_max_trades_per_user_daily() -> u32 {
    40
}
fn default_exchange_rate_limit() -> u32 {
    60
}
fn default_burst_limit_window_seconds() -> u64 {
    60
}

/// Circuit-breaker thresholds; per-exchange overrides take precedence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "default_daily_loss_pct")]
    pub daily_loss_pct: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_errors_per_hour")]
    pub max_errors_per_hour: u32,
    #[serde(default)]
    pub per_exchange: HashMap<String, BreakerOverrides>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            daily_loss_pct: default_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_errors_per_hour: default_max_errors_per_hour(),
            per_exchange: HashMap::new(),
        }
    }
}

impl BreakerConfig {
    /// Thresholds for a bot trading on `exchange`
    pub fn thresholds_for(&self, exchange: &str) -> BreakerThresholds {
        let ov = self.per_exchange.get(exchange);
        BreakerThresholds {
            max_drawdown_pct: ov
                .and_then(|o| o.max_drawdown_pct)
                .unwrap_or(self.max_drawdown_pct),
            daily_loss_pct: ov
                .and_then(|o| o.daily_loss_pct)
                .unwrap_or(self.daily_loss_pct),
            max_consecutive_losses: ov
                .and_then(|o| o.max_consecutive_losses)
                .unwrap_or(self.max_consecutive_losses),
            max_errors_per_hour: ov
                .and_then(|o| o.max_errors_per_hour)
                .unwrap_or(self.max_errors_per_hour),
        }
    }
}

/// Optional per-exchange threshold overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BreakerOverrides {
    pub max_drawdown_pct: Option<Decimal>,
    pub daily_loss_pct: Option<Decimal>,
    pub max_consecutive_losses: Option<u32>,
    pub max_errors_per_hour: Option<u32>,
}

/// Resolved thresholds handed to the breaker for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct BreakerThresholds {
    pub max_drawdown_pct: Decimal,
    pub daily_loss_pct: Decimal,
    pub max_consecutive_losses: u32,
    pub max_errors_per_hour: u32,
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::from(10)
}
fn default_daily_loss_pct() -> Decimal {
    Decimal::from(5)
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_max_errors_per_hour() -> u32 {
    10
}

/// How a reinvestment amount is split across the selected bots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSplit {
    /// Equal share per selected bot (default)
    Equal,
    /// Weighted by each bot's positive realized PnL over the lookback
    Proportional,
}

impl Default for AllocationSplit {
    fn default() -> Self {
        AllocationSplit::Equal
    }
}

/// Capital-allocator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocatorConfig {
    /// Minimum realized profit since the last run before reinvesting
    #[serde(default = "default_reinvest_threshold")]
    pub reinvest_threshold: Decimal,
    #[serde(default = "default_reinvest_top_n")]
    pub reinvest_top_n: usize,
    /// Percentage of realized profit to redistribute (0-100)
    #[serde(default = "default_reinvest_percentage")]
    pub reinvest_percentage: Decimal,
    #[serde(default)]
    pub split: AllocationSplit,
    /// Cadence window; one run per window per user
    #[serde(default = "default_cadence_hours")]
    pub cadence_hours: u64,
    /// Lookback for the per-bot performance ranking
    #[serde(default = "default_performance_lookback_hours")]
    pub performance_lookback_hours: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            reinvest_threshold: default_reinvest_threshold(),
            reinvest_top_n: default_reinvest_top_n(),
            reinvest_percentage: default_reinvest_percentage(),
            split: AllocationSplit::default(),
            cadence_hours: default_cadence_hours(),
            performance_lookback_hours: default_performance_lookback_hours(),
        }
    }
}

fn default_reinvest_threshold() -> Decimal {
    Decimal::from(500)
}
fn default_reinvest_top_n() -> usize {
    3
}
fn default_reinvest_percentage() -> Decimal {
    Decimal::from(80)
}
fn default_cadence_hours() -> u64 {
    24
}
fn default_performance_lookback_hours() -> u64 {
    168
}

/// Execution-side settings (timeouts, scheduler intervals, reconciliation)
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Bounded timeout for the exchange submission call
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,
    /// Circuit-breaker sweep interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How often the allocator checks whether its cadence window is due
    #[serde(default = "default_allocator_tick_secs")]
    pub allocator_tick_secs: u64,
    /// Reconciliation discrepancy threshold (%)
    #[serde(default = "default_reconcile_threshold_pct")]
    pub reconcile_threshold_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_secs: default_exchange_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            allocator_tick_secs: default_allocator_tick_secs(),
            reconcile_threshold_pct: default_reconcile_threshold_pct(),
        }
    }
}

fn default_exchange_timeout_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_allocator_tick_secs() -> u64 {
    300
}
fn default_reconcile_threshold_pct() -> f64 {
    0.5
}
