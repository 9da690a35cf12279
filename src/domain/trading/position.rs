use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::instrument::Instrument;
use crate::domain::risk::correlation::CorrelationGroup;
use crate::domain::trading::lifecycle::{MachineSnapshot, StrategyMachine};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The five strategies in the fixed portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    ZeroDte,
    Lt112,
    FuturesStrangle,
    Ipmcc,
    LeapLadder,
}

impl StrategyKind {
    /// Premium sellers are vulnerable to volatility spikes; the protective
    /// put ladder is the exception.
    pub fn is_premium_selling(self) -> bool {
        !matches!(self, StrategyKind::LeapLadder)
    }

    /// Strategies exempt from the 21 DTE defensive rule: same-day structures
    /// have no runway left and the ladder holds through.
    pub fn exempt_from_dte_rule(self) -> bool {
        matches!(self, StrategyKind::ZeroDte | StrategyKind::LeapLadder)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::ZeroDte => "0DTE",
            StrategyKind::Lt112 => "LT112",
            StrategyKind::FuturesStrangle => "FuturesStrangle",
            StrategyKind::Ipmcc => "IPMCC",
            StrategyKind::LeapLadder => "LEAPLadder",
        };
        write!(f, "{s}")
    }
}

/// Role of a leg inside its structure, for component-level management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegRole {
    ShortCall,
    LongCall,
    ShortPut,
    LongPut,
    NakedPut,
    SpreadLong,
    SpreadShort,
    LeapCall,
    WeeklyCall,
    LadderPut,
}

/// A leg that filled, with its average fill price and latest mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledLeg {
    pub role: LegRole,
    pub instrument: Instrument,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub mark: Option<Decimal>,
}

impl FilledLeg {
    /// Cash flow at entry: positive when the leg was sold (credit).
    pub fn entry_cash(&self) -> Decimal {
        -Decimal::from(self.quantity) * self.entry_price * self.instrument.multiplier
    }

    /// What the leg is worth now (negative for short legs). Falls back to the
    /// entry price when no mark has arrived yet.
    pub fn liquidation_value(&self) -> Decimal {
        let price = self.mark.unwrap_or(self.entry_price);
        Decimal::from(self.quantity) * price * self.instrument.multiplier
    }
}

/// One strategy instance: a group of filled legs held and managed together.
///
/// The position exclusively owns its legs and its lifecycle machine; risk
/// components only ever see it by reference through the book.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub underlying: String,
    pub group: CorrelationGroup,
    pub opened_at: DateTime<Utc>,
    pub contracts: u32,
    pub legs: Vec<FilledLeg>,
    /// Net cash flow at entry: positive = credit received, negative = debit paid.
    pub entry_cash: Decimal,
    pub margin_requirement: Decimal,
    /// The order group that created this position.
    pub order_group_id: u64,
    pub machine: StrategyMachine,
}

impl Position {
    /// Entry credit for premium-selling structures.
    pub fn entry_credit(&self) -> Option<Decimal> {
        (self.entry_cash > Decimal::ZERO).then_some(self.entry_cash)
    }

    /// Entry debit for long structures.
    pub fn entry_debit(&self) -> Option<Decimal> {
        (self.entry_cash < Decimal::ZERO).then_some(-self.entry_cash)
    }

    /// Refresh leg marks from the bar. Returns how many legs found a mark.
    pub fn mark_from_slice(&mut self, slice: &BarSlice) -> usize {
        let mut marked = 0;
        for leg in &mut self.legs {
            if let Some(mark) = slice.mark(&leg.instrument) {
                leg.mark = Some(mark);
                marked += 1;
            }
        }
        marked
    }

    pub fn liquidation_value(&self) -> Decimal {
        self.legs.iter().map(FilledLeg::liquidation_value).sum()
    }

    /// Cost to buy the whole structure back.
    pub fn cost_to_close(&self) -> Decimal {
        -self.liquidation_value()
    }

    /// Unrealized P&L from the credit actually received (or debit paid) at
    /// entry, never from mid-price estimates of what entry should have been.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.entry_cash + self.liquidation_value()
    }

    /// Profit as a fraction of entry credit/debit. 0.5 = half the credit
    /// captured (or half the debit gained for long structures).
    pub fn profit_fraction(&self) -> Option<f64> {
        if self.entry_cash == Decimal::ZERO {
            return None;
        }
        (self.unrealized_pnl() / self.entry_cash.abs()).to_f64()
    }

    /// Loss as a positive fraction of entry credit; `None` while profitable.
    pub fn loss_fraction(&self) -> Option<f64> {
        let pnl = self.unrealized_pnl();
        if pnl >= Decimal::ZERO || self.entry_cash == Decimal::ZERO {
            return None;
        }
        (-pnl / self.entry_cash.abs()).to_f64()
    }

    /// Calendar days to the nearest option expiry among the legs.
    pub fn dte(&self, now: DateTime<Utc>) -> Option<i64> {
        self.legs
            .iter()
            .filter_map(|l| l.instrument.dte(now))
            .min()
    }

    pub fn legs_with_role(&self, roles: &[LegRole]) -> impl Iterator<Item = &FilledLeg> {
        self.legs.iter().filter(move |l| roles.contains(&l.role))
    }

    pub fn has_role(&self, role: LegRole) -> bool {
        self.legs.iter().any(|l| l.role == role)
    }

    /// Entry cash flow of a component (subset of legs by role).
    pub fn component_entry_cash(&self, roles: &[LegRole]) -> Decimal {
        self.legs_with_role(roles).map(FilledLeg::entry_cash).sum()
    }

    /// Unrealized P&L of a component.
    pub fn component_pnl(&self, roles: &[LegRole]) -> Decimal {
        self.legs_with_role(roles)
            .map(|l| l.entry_cash() + l.liquidation_value())
            .sum()
    }

    /// Component profit as a fraction of the component's own entry cash.
    pub fn component_profit_fraction(&self, roles: &[LegRole]) -> Option<f64> {
        let entry = self.component_entry_cash(roles);
        if entry == Decimal::ZERO {
            return None;
        }
        (self.component_pnl(roles) / entry.abs()).to_f64()
    }

    /// Remove the legs in `roles`, returning them for the closing order.
    pub fn detach_component(&mut self, roles: &[LegRole]) -> Vec<FilledLeg> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.legs.drain(..).partition(|l| roles.contains(&l.role));
        self.legs = kept;
        removed
    }
}

/// Persisted form (namespace `positions/<position_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub schema_version: u32,
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub underlying: String,
    pub group: CorrelationGroup,
    pub opened_at: DateTime<Utc>,
    pub contracts: u32,
    pub legs: Vec<FilledLeg>,
    pub entry_cash: Decimal,
    pub margin_requirement: Decimal,
    pub order_group_id: u64,
    pub machine: MachineSnapshot,
}

impl Position {
    pub fn to_record(&self) -> PositionRecord {
        PositionRecord {
            schema_version: 1,
            id: self.id,
            strategy: self.strategy,
            underlying: self.underlying.clone(),
            group: self.group,
            opened_at: self.opened_at,
            contracts: self.contracts,
            legs: self.legs.clone(),
            entry_cash: self.entry_cash,
            margin_requirement: self.margin_requirement,
            order_group_id: self.order_group_id,
            machine: self.machine.snapshot(),
        }
    }

    pub fn from_record(
        record: PositionRecord,
        history_cap: usize,
        recovery_timeout: std::time::Duration,
    ) -> Self {
        let label = format!("{}/{}", record.strategy, record.id);
        Self {
            id: record.id,
            strategy: record.strategy,
            underlying: record.underlying,
            group: record.group,
            opened_at: record.opened_at,
            contracts: record.contracts,
            legs: record.legs,
            entry_cash: record.entry_cash,
            margin_requirement: record.margin_requirement,
            order_group_id: record.order_group_id,
            machine: StrategyMachine::restore(label, record.machine, history_cap, recovery_timeout),
        }
    }
}
