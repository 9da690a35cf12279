//! Static configuration for the trade lifecycle engine.
//!
//! All thresholds live in a single read-only [`Constants`] table that is
//! validated once at startup. There is no runtime mutation; components hold
//! an `Arc<Constants>` through the [`EngineContext`](crate::domain::ports::EngineContext).

use crate::domain::errors::ConfigError;
use crate::domain::trading::position::StrategyKind;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Fixed thresholds for the whole engine: VIX bands, DTE rules, profit and
/// stop targets, sizing caps, account-phase boundaries, freshness tiers and
/// timeouts.
#[derive(Debug, Clone)]
pub struct Constants {
    // VIX regime thresholds (inclusive upper bound of each band).
    pub vix_extremely_low: f64,
    pub vix_low: f64,
    pub vix_normal: f64,
    pub vix_elevated: f64,
    pub vix_high: f64,
    pub vix_extreme: f64,
    pub vix_crisis: f64,

    // DTE management.
    pub defensive_exit_dte: i64,
    pub lt112_entry_dte: i64,
    pub lt112_dte_tolerance: i64,
    pub strangle_entry_dte: i64,
    pub leap_min_dte: i64,
    pub leap_max_dte: i64,
    pub ipmcc_short_call_dte: i64,
    pub leap_roll_dte: i64,

    // Strike selection.
    /// Converts annual IV into a one-day expected move. This is sqrt(1/252)
    /// with an empirical adjustment baked in, applied to the underlying price.
    pub iv_daily_move_factor: f64,
    pub condor_wing_multiplier: f64,
    pub lt112_spread_long: Decimal,
    pub lt112_spread_short: Decimal,
    pub lt112_naked_put: Decimal,
    pub strangle_wing_delta: f64,
    pub leap_call_delta: f64,
    pub leap_put_strike_ratio: Decimal,

    // Sizing.
    pub kelly_factor: f64,
    pub contract_unit: Decimal,

    // Minimum credit floors, per contract.
    pub min_credit_condor: Decimal,
    pub min_credit_lt112: Decimal,
    pub min_credit_strangle: Decimal,

    // Account phase boundaries (value at the boundary maps to the lower phase).
    pub phase1_max: Decimal,
    pub phase2_max: Decimal,
    pub phase3_max: Decimal,

    // Drawdown thresholds as fractions of peak.
    pub drawdown_warning: f64,
    pub drawdown_critical: f64,
    pub drawdown_emergency: f64,

    // Margin pressure threshold for defensive exits.
    pub margin_pressure_utilization: f64,

    // Timeouts and cadence.
    pub order_group_timeout: Duration,
    pub order_poll_interval: Duration,
    pub stale_group_sweep_age: Duration,
    pub error_recovery_timeout: Duration,
    pub bar_soft_limit: Duration,
    pub off_hours_max_age: Duration,

    // Transient execution retry policy.
    pub execution_retries: u32,
    pub execution_retry_spacing: Duration,

    // Manual mode activation.
    pub order_failure_threshold: usize,
    pub order_failure_window: Duration,
    pub max_portfolio_delta: f64,

    // Bounded histories.
    pub pnl_history_cap: usize,
    pub transition_history_cap: usize,
    pub checkpoint_cap: usize,

    // Corporate event blackout window, calendar days before the event.
    pub event_blackout_days: i64,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            vix_extremely_low: 12.0,
            vix_low: 16.0,
            vix_normal: 20.0,
            vix_elevated: 25.0,
            vix_high: 30.0,
            vix_extreme: 40.0,
            vix_crisis: 50.0,

            defensive_exit_dte: 21,
            lt112_entry_dte: 120,
            lt112_dte_tolerance: 10,
            strangle_entry_dte: 90,
            leap_min_dte: 365,
            leap_max_dte: 730,
            ipmcc_short_call_dte: 45,
            leap_roll_dte: 150,

            iv_daily_move_factor: 0.0397,
            condor_wing_multiplier: 2.0,
            lt112_spread_long: dec!(0.98),
            lt112_spread_short: dec!(0.95),
            lt112_naked_put: dec!(0.90),
            strangle_wing_delta: 0.06,
            leap_call_delta: 0.80,
            leap_put_strike_ratio: dec!(0.90),

            kelly_factor: 0.25,
            contract_unit: dec!(10000),

            min_credit_condor: dec!(0.10),
            min_credit_lt112: dec!(0.50),
            min_credit_strangle: dec!(0.25),

            phase1_max: dec!(51000),
            phase2_max: dec!(76000),
            phase3_max: dec!(95000),

            drawdown_warning: 0.10,
            drawdown_critical: 0.15,
            drawdown_emergency: 0.20,

            margin_pressure_utilization: 0.85,

            order_group_timeout: Duration::from_secs(30),
            order_poll_interval: Duration::from_millis(250),
            stale_group_sweep_age: Duration::from_secs(300),
            error_recovery_timeout: Duration::from_secs(30 * 60),
            bar_soft_limit: Duration::from_secs(5),
            off_hours_max_age: Duration::from_secs(15 * 60),

            execution_retries: 3,
            execution_retry_spacing: Duration::from_secs(2),

            order_failure_threshold: 3,
            order_failure_window: Duration::from_secs(30 * 60),
            max_portfolio_delta: 100.0,

            pnl_history_cap: 1000,
            transition_history_cap: 1000,
            checkpoint_cap: 10,

            event_blackout_days: 3,
        }
    }
}

impl Constants {
    /// Validate internal consistency. A malformed table refuses to start the
    /// engine rather than trading with a bad threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bands = [
            self.vix_extremely_low,
            self.vix_low,
            self.vix_normal,
            self.vix_elevated,
            self.vix_high,
            self.vix_extreme,
            self.vix_crisis,
        ];
        if bands.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Malformed {
                name: "vix thresholds".into(),
                reason: "bands must be strictly increasing".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.kelly_factor) || self.kelly_factor == 0.0 {
            return Err(ConfigError::Malformed {
                name: "kelly_factor".into(),
                reason: format!("{} outside (0, 1]", self.kelly_factor),
            });
        }
        if self.contract_unit <= Decimal::ZERO {
            return Err(ConfigError::Malformed {
                name: "contract_unit".into(),
                reason: "must be positive".into(),
            });
        }
        if !(self.phase1_max < self.phase2_max && self.phase2_max < self.phase3_max) {
            return Err(ConfigError::Malformed {
                name: "account phase boundaries".into(),
                reason: "must be strictly increasing".into(),
            });
        }
        if !(self.drawdown_warning < self.drawdown_critical
            && self.drawdown_critical < self.drawdown_emergency)
        {
            return Err(ConfigError::Malformed {
                name: "drawdown thresholds".into(),
                reason: "must be strictly increasing".into(),
            });
        }
        if self.defensive_exit_dte <= 0 || self.lt112_entry_dte <= self.defensive_exit_dte {
            return Err(ConfigError::Malformed {
                name: "dte rules".into(),
                reason: "entry DTE must exceed the defensive exit DTE".into(),
            });
        }
        if self.order_group_timeout.is_zero() || self.order_poll_interval.is_zero() {
            return Err(ConfigError::Malformed {
                name: "executor timeouts".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Profit target as a fraction of entry credit (or debit for the ladder).
    pub fn profit_target(&self, strategy: StrategyKind) -> f64 {
        match strategy {
            StrategyKind::ZeroDte => 0.50,
            StrategyKind::Lt112 => 0.50,
            StrategyKind::FuturesStrangle => 0.50,
            StrategyKind::Ipmcc => 0.50,
            StrategyKind::LeapLadder => 0.30,
        }
    }

    /// Stop loss as a multiple of entry credit. `None` means the strategy is
    /// managed by rolling or held through drawdowns instead of stopped.
    pub fn stop_loss_multiple(&self, strategy: StrategyKind) -> Option<f64> {
        match strategy {
            StrategyKind::ZeroDte => Some(2.0),
            StrategyKind::Lt112 => Some(2.0),
            StrategyKind::FuturesStrangle => Some(2.5),
            StrategyKind::Ipmcc => None,
            StrategyKind::LeapLadder => None,
        }
    }

    /// Hard per-strategy contract cap, independent of account size.
    pub fn strategy_contract_cap(&self, strategy: StrategyKind) -> u32 {
        match strategy {
            StrategyKind::ZeroDte => 10,
            StrategyKind::Lt112 => 5,
            StrategyKind::FuturesStrangle => 3,
            StrategyKind::Ipmcc => 100,
            StrategyKind::LeapLadder => 10,
        }
    }

    /// Contract cap by account-value band.
    pub fn tier_contract_cap(&self, account_value: Decimal) -> u32 {
        if account_value <= dec!(10000) {
            1
        } else if account_value <= dec!(25000) {
            2
        } else if account_value <= dec!(50000) {
            3
        } else if account_value <= dec!(100000) {
            5
        } else if account_value <= dec!(250000) {
            10
        } else if account_value <= dec!(500000) {
            15
        } else {
            20
        }
    }

    /// Per-contract minimum credit floor for credit strategies.
    pub fn min_credit(&self, strategy: StrategyKind) -> Option<Decimal> {
        match strategy {
            StrategyKind::ZeroDte => Some(self.min_credit_condor),
            StrategyKind::Lt112 => Some(self.min_credit_lt112),
            StrategyKind::FuturesStrangle => Some(self.min_credit_strangle),
            StrategyKind::Ipmcc | StrategyKind::LeapLadder => None,
        }
    }

    /// Fraction of account value the protective put ladder may consume.
    pub fn ladder_allocation_pct(&self, account_value: Decimal) -> Decimal {
        if account_value < dec!(50000) {
            dec!(0.05)
        } else if account_value < dec!(100000) {
            dec!(0.075)
        } else {
            dec!(0.10)
        }
    }
}
