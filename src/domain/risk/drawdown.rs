//! Peak-tracking drawdown monitor and circuit breaker.
//!
//! Tracks the portfolio high-water mark and classifies the current drawdown
//! into four levels, each with a prescribed response. Level improvements
//! revert the responses. The peak survives restarts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DrawdownLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrawdownLevel::Normal => "NORMAL",
            DrawdownLevel::Warning => "WARNING",
            DrawdownLevel::Critical => "CRITICAL",
            DrawdownLevel::Emergency => "EMERGENCY",
        };
        write!(f, "{s}")
    }
}

/// Prescribed response when the level changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawdownAction {
    /// 10–15%: halve position sizes for new entries.
    ReduceNewEntrySizes,
    /// 15–20%: block new entries, tighten profit targets to 25%.
    BlockNewEntries,
    /// > 20%: close positions losing more than 100% of credit, halve the rest.
    EmergencyProtocol,
    /// Back to normal: revert all responses.
    ResumeNormal,
}

#[derive(Debug, Clone)]
pub struct DrawdownUpdate {
    pub level: DrawdownLevel,
    pub previous: DrawdownLevel,
    pub drawdown: f64,
    pub peak: Decimal,
    pub action: Option<DrawdownAction>,
}

/// Persisted snapshot (namespace `drawdown/peak`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownSnapshot {
    pub schema_version: u32,
    pub peak: Decimal,
    pub peak_at: Option<DateTime<Utc>>,
    pub max_historical: f64,
}

#[derive(Debug, Clone)]
pub struct DrawdownMonitor {
    warning: f64,
    critical: f64,
    emergency: f64,
    peak: Decimal,
    peak_at: Option<DateTime<Utc>>,
    level: DrawdownLevel,
    current: f64,
    max_historical: f64,
}

impl DrawdownMonitor {
    pub fn new(constants: &Constants) -> Self {
        Self {
            warning: constants.drawdown_warning,
            critical: constants.drawdown_critical,
            emergency: constants.drawdown_emergency,
            peak: Decimal::ZERO,
            peak_at: None,
            level: DrawdownLevel::Normal,
            current: 0.0,
            max_historical: 0.0,
        }
    }

    fn classify(&self, drawdown: f64) -> DrawdownLevel {
        if drawdown >= self.emergency {
            DrawdownLevel::Emergency
        } else if drawdown >= self.critical {
            DrawdownLevel::Critical
        } else if drawdown >= self.warning {
            DrawdownLevel::Warning
        } else {
            DrawdownLevel::Normal
        }
    }

    /// Fold in the current portfolio value, returning the level and the
    /// response action when the level changed.
    pub fn update(&mut self, net_liq: Decimal, at: DateTime<Utc>) -> DrawdownUpdate {
        if net_liq > self.peak {
            self.peak = net_liq;
            self.peak_at = Some(at);
        }

        self.current = if self.peak > Decimal::ZERO {
            ((self.peak - net_liq) / self.peak).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        self.max_historical = self.max_historical.max(self.current);

        let previous = self.level;
        let level = self.classify(self.current);
        self.level = level;

        let action = if level > previous {
            Some(match level {
                DrawdownLevel::Warning => DrawdownAction::ReduceNewEntrySizes,
                DrawdownLevel::Critical => DrawdownAction::BlockNewEntries,
                DrawdownLevel::Emergency => DrawdownAction::EmergencyProtocol,
                DrawdownLevel::Normal => unreachable!("normal is the lowest level"),
            })
        } else if level < previous && level == DrawdownLevel::Normal {
            Some(DrawdownAction::ResumeNormal)
        } else {
            None
        };

        DrawdownUpdate {
            level,
            previous,
            drawdown: self.current,
            peak: self.peak,
            action,
        }
    }

    pub fn level(&self) -> DrawdownLevel {
        self.level
    }

    pub fn drawdown(&self) -> f64 {
        self.current
    }

    pub fn peak(&self) -> Decimal {
        self.peak
    }

    /// New entries are rejected at CRITICAL and EMERGENCY.
    pub fn entries_blocked(&self) -> bool {
        self.level >= DrawdownLevel::Critical
    }

    /// Size multiplier applied to new entries.
    pub fn size_multiplier(&self) -> f64 {
        match self.level {
            DrawdownLevel::Normal => 1.0,
            DrawdownLevel::Warning => 0.5,
            // Entries are blocked anyway.
            DrawdownLevel::Critical | DrawdownLevel::Emergency => 0.0,
        }
    }

    /// Tightened profit-target fraction while CRITICAL or worse.
    pub fn profit_target_override(&self) -> Option<f64> {
        (self.level >= DrawdownLevel::Critical).then_some(0.25)
    }

    pub fn snapshot(&self) -> DrawdownSnapshot {
        DrawdownSnapshot {
            schema_version: 1,
            peak: self.peak,
            peak_at: self.peak_at,
            max_historical: self.max_historical,
        }
    }

    pub fn restore(&mut self, snapshot: DrawdownSnapshot) {
        self.peak = snapshot.peak;
        self.peak_at = snapshot.peak_at;
        self.max_historical = snapshot.max_historical;
    }
}
