//! VIX regime gate: classifies a single volatility index level into regimes
//! and derives buying-power caps, size multipliers and 0DTE eligibility.
//!
//! The gate exposes pure queries only; it never closes positions itself.

use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::VixSample;
use crate::domain::market::calendar::is_trading_hours;
use crate::domain::risk::account_phase::AccountPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VixRegime {
    ExtremelyLow,
    Low,
    Normal,
    Elevated,
    High,
    Extreme,
    Crisis,
    Historic,
}

impl fmt::Display for VixRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VixRegime::ExtremelyLow => "EXTREMELY_LOW",
            VixRegime::Low => "LOW",
            VixRegime::Normal => "NORMAL",
            VixRegime::Elevated => "ELEVATED",
            VixRegime::High => "HIGH",
            VixRegime::Extreme => "EXTREME",
            VixRegime::Crisis => "CRISIS",
            VixRegime::Historic => "HISTORIC",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroDteEligibility {
    No,
    Yes,
    EmergencyOnly,
}

impl VixRegime {
    /// Band boundaries are inclusive on the lower regime: a level exactly at
    /// a threshold classifies into the regime below it.
    pub fn classify(level: f64, constants: &Constants) -> Self {
        if level <= constants.vix_extremely_low {
            VixRegime::ExtremelyLow
        } else if level <= constants.vix_low {
            VixRegime::Low
        } else if level <= constants.vix_normal {
            VixRegime::Normal
        } else if level <= constants.vix_elevated {
            VixRegime::Elevated
        } else if level <= constants.vix_high {
            VixRegime::High
        } else if level <= constants.vix_extreme {
            VixRegime::Extreme
        } else if level <= constants.vix_crisis {
            VixRegime::Crisis
        } else {
            VixRegime::Historic
        }
    }

    /// Maximum buying-power utilization for this regime and account phase.
    /// The extremely-low band trades like the low band: premium is thin but
    /// nothing about the tape argues for a tighter cap.
    pub fn max_buying_power(self, phase: AccountPhase) -> f64 {
        let row: [f64; 4] = match self {
            VixRegime::ExtremelyLow | VixRegime::Low => [0.45, 0.50, 0.55, 0.60],
            VixRegime::Normal => [0.50, 0.60, 0.65, 0.70],
            VixRegime::Elevated => [0.40, 0.50, 0.55, 0.60],
            VixRegime::High => [0.30, 0.35, 0.40, 0.45],
            VixRegime::Extreme | VixRegime::Crisis => [0.20, 0.25, 0.30, 0.35],
            VixRegime::Historic => [0.15, 0.20, 0.25, 0.30],
        };
        row[(phase.number() - 1) as usize]
    }

    pub fn zero_dte(self) -> ZeroDteEligibility {
        match self {
            VixRegime::Elevated | VixRegime::High => ZeroDteEligibility::Yes,
            VixRegime::Extreme => ZeroDteEligibility::EmergencyOnly,
            _ => ZeroDteEligibility::No,
        }
    }
}

/// Position-size multiplier from the raw level: full size through NORMAL,
/// linear taper 1.0→0.75 across ELEVATED, 0.75→0.5 across HIGH, 0.5→0.25
/// across EXTREME, and a 0.25 floor beyond.
pub fn size_multiplier(level: f64, constants: &Constants) -> f64 {
    let c = constants;
    if level <= c.vix_normal {
        1.0
    } else if level <= c.vix_elevated {
        let span = c.vix_elevated - c.vix_normal;
        1.0 - 0.25 * (level - c.vix_normal) / span
    } else if level <= c.vix_high {
        let span = c.vix_high - c.vix_elevated;
        0.75 - 0.25 * (level - c.vix_elevated) / span
    } else if level <= c.vix_extreme {
        let span = c.vix_extreme - c.vix_high;
        0.5 - 0.25 * (level - c.vix_high) / span
    } else {
        0.25
    }
}

/// Signals consumers must act on. The gate itself only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VixSignal {
    /// Level above the extreme threshold: block new premium-selling entries.
    EmergencyConditions,
    /// Level above the crisis threshold: close vulnerable positions.
    HaltTrading,
}

/// Cached view over the bar feed's VIX samples with fail-fast semantics.
#[derive(Debug, Clone, Default)]
pub struct VixGate {
    cached: Option<VixSample>,
}

impl VixGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the gate from a bar. Newer samples replace the cache; bars
    /// without a VIX reading leave the previous sample in place.
    pub fn observe(&mut self, sample: Option<VixSample>) {
        if let Some(s) = sample {
            let newer = self
                .cached
                .map(|prev| s.updated_at >= prev.updated_at)
                .unwrap_or(true);
            if newer {
                self.cached = Some(s);
            }
        }
    }

    /// Current level with the freshness policy applied: during trading hours
    /// the sample must be within the VIX tier; outside hours a cached value
    /// up to the off-hours limit is acceptable. Missing or non-positive
    /// levels are a deny.
    pub fn level(&self, now: DateTime<Utc>, constants: &Constants) -> Result<f64, ValidationError> {
        let sample = self.cached.ok_or_else(|| ValidationError::VixGate {
            reason: "no VIX sample available".to_string(),
        })?;

        if sample.level <= 0.0 {
            return Err(ValidationError::VixGate {
                reason: format!("non-positive VIX level {}", sample.level),
            });
        }

        let age = now.signed_duration_since(sample.updated_at).num_seconds();
        let limit = if is_trading_hours(now) {
            crate::domain::market::freshness::DatumKind::Vix
                .max_age()
                .as_secs() as i64
        } else {
            constants.off_hours_max_age.as_secs() as i64
        };
        if age > limit {
            return Err(ValidationError::VixGate {
                reason: format!("VIX stale: age {age}s > limit {limit}s"),
            });
        }

        Ok(sample.level)
    }

    pub fn regime(
        &self,
        now: DateTime<Utc>,
        constants: &Constants,
    ) -> Result<VixRegime, ValidationError> {
        Ok(VixRegime::classify(self.level(now, constants)?, constants))
    }

    /// Active emergency/halt signal, if any. A halt implies emergency.
    pub fn signal(&self, now: DateTime<Utc>, constants: &Constants) -> Option<VixSignal> {
        let level = self.level(now, constants).ok()?;
        if level > constants.vix_crisis {
            Some(VixSignal::HaltTrading)
        } else if level > constants.vix_extreme {
            Some(VixSignal::EmergencyConditions)
        } else {
            None
        }
    }
}
