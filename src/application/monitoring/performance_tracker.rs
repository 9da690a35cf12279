//! Overflow-safe cumulative performance tracking.
//!
//! Cumulative P&L is kept as a decimal with hard ± $1B bounds; additions
//! that would cross the bounds are rejected rather than wrapped. History is
//! a rolling window and periodic checkpoints allow recovery after restart.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlEntry {
    pub at: DateTime<Utc>,
    pub pnl: Decimal,
    pub cumulative: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerCheckpoint {
    pub at: DateTime<Utc>,
    pub cumulative_pnl: Decimal,
    pub cumulative_fees: Decimal,
    pub trades: u64,
}

/// Persisted counters (namespace `performance/cumulative`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub schema_version: u32,
    pub cumulative_pnl: Decimal,
    pub cumulative_fees: Decimal,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub checkpoints: Vec<TrackerCheckpoint>,
}

/// Persisted rolling window (namespace `performance/history`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub schema_version: u32,
    pub entries: Vec<PnlEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct WinRateStats {
    pub win_rate: f64,
    pub wins: u64,
    pub losses: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DrawdownStats {
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub peak: Decimal,
}

const MAX_ABS_PNL: Decimal = dec!(1000000000);

#[derive(Debug)]
pub struct PerformanceTracker {
    cumulative_pnl: Decimal,
    cumulative_fees: Decimal,
    trades: u64,
    wins: u64,
    losses: u64,
    history: VecDeque<PnlEntry>,
    history_cap: usize,
    checkpoints: VecDeque<TrackerCheckpoint>,
    checkpoint_cap: usize,
}

impl PerformanceTracker {
    pub fn new(history_cap: usize, checkpoint_cap: usize) -> Self {
        Self {
            cumulative_pnl: Decimal::ZERO,
            cumulative_fees: Decimal::ZERO,
            trades: 0,
            wins: 0,
            losses: 0,
            history: VecDeque::new(),
            history_cap,
            checkpoints: VecDeque::new(),
            checkpoint_cap,
        }
    }

    /// Fold in one realized trade. Returns false (and changes nothing) when
    /// the value is absurd or the running total would leave its bounds.
    pub fn record_realized(
        &mut self,
        pnl: Decimal,
        fees: Decimal,
        at: DateTime<Utc>,
    ) -> bool {
        if pnl.abs() > MAX_ABS_PNL {
            error!(%pnl, "trade P&L exceeds bounds, rejected");
            return false;
        }
        let next = self.cumulative_pnl + pnl;
        if next.abs() > MAX_ABS_PNL {
            error!(%next, "cumulative P&L would exceed bounds, rejected");
            self.checkpoint(at);
            return false;
        }

        self.cumulative_pnl = next;
        self.cumulative_fees += fees;
        self.trades += 1;
        if pnl > Decimal::ZERO {
            self.wins += 1;
        } else if pnl < Decimal::ZERO {
            self.losses += 1;
        }

        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(PnlEntry {
            at,
            pnl,
            cumulative: next,
        });
        true
    }

    pub fn cumulative_pnl(&self) -> Decimal {
        self.cumulative_pnl
    }

    pub fn cumulative_fees(&self) -> Decimal {
        self.cumulative_fees
    }

    pub fn history(&self) -> impl Iterator<Item = &PnlEntry> {
        self.history.iter()
    }

    pub fn win_rate(&self) -> WinRateStats {
        let total = self.trades;
        WinRateStats {
            win_rate: if total > 0 {
                self.wins as f64 / total as f64
            } else {
                0.0
            },
            wins: self.wins,
            losses: self.losses,
            total,
        }
    }

    /// Max and current drawdown over the cumulative curve in the window.
    pub fn drawdown(&self) -> DrawdownStats {
        let mut peak = Decimal::ZERO;
        let mut max_dd = 0.0f64;
        let mut current_dd = 0.0f64;

        for entry in &self.history {
            if entry.cumulative > peak {
                peak = entry.cumulative;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - entry.cumulative) / peak).to_f64().unwrap_or(0.0);
                max_dd = max_dd.max(dd);
                current_dd = dd;
            }
        }

        DrawdownStats {
            max_drawdown: max_dd,
            current_drawdown: current_dd,
            peak,
        }
    }

    /// Record a recovery checkpoint.
    pub fn checkpoint(&mut self, at: DateTime<Utc>) {
        if self.checkpoints.len() == self.checkpoint_cap {
            self.checkpoints.pop_front();
        }
        self.checkpoints.push_back(TrackerCheckpoint {
            at,
            cumulative_pnl: self.cumulative_pnl,
            cumulative_fees: self.cumulative_fees,
            trades: self.trades,
        });
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &TrackerCheckpoint> {
        self.checkpoints.iter()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            schema_version: 1,
            cumulative_pnl: self.cumulative_pnl,
            cumulative_fees: self.cumulative_fees,
            trades: self.trades,
            wins: self.wins,
            losses: self.losses,
            checkpoints: self.checkpoints.iter().cloned().collect(),
        }
    }

    pub fn history_record(&self) -> HistoryRecord {
        HistoryRecord {
            schema_version: 1,
            entries: self.history.iter().cloned().collect(),
        }
    }

    pub fn restore(&mut self, snapshot: TrackerSnapshot) {
        if snapshot.cumulative_pnl.abs() > MAX_ABS_PNL {
            warn!("refusing to restore out-of-bounds counters");
            return;
        }
        self.cumulative_pnl = snapshot.cumulative_pnl;
        self.cumulative_fees = snapshot.cumulative_fees;
        self.trades = snapshot.trades;
        self.wins = snapshot.wins;
        self.losses = snapshot.losses;
        self.checkpoints = snapshot.checkpoints.into();
        while self.checkpoints.len() > self.checkpoint_cap {
            self.checkpoints.pop_front();
        }
    }

    pub fn restore_history(&mut self, record: HistoryRecord) {
        self.history = record.entries.into();
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }
}
