//! The trade lifecycle engine: per-bar orchestration and the programmatic
//! control plane.
//!
//! Control flow per bar: mark the book, refresh the unified risk view, act
//! on halt/drawdown signals, run lifecycle recovery, evaluate exits, then
//! evaluate entries strategy by strategy. Entries are serialized through the
//! risk manager so an approval is visible to the next strategy's checks.

use crate::application::execution::atomic_executor::{AtomicExecutor, ExecutionOutcome, GroupFill};
use crate::application::exits::defensive::equity_breach_victim;
use crate::application::exits::exit_engine::{
    DefensiveContext, ExitDecision, ExitRuleEngine, ExitScope,
};
use crate::application::monitoring::performance_tracker::PerformanceTracker;
use crate::application::risk_management::manual_mode::TradeSuggestion;
use crate::application::risk_management::position_sizer::{PositionSizer, SizerInputs};
use crate::application::risk_management::risk_manager::{
    EntryProposal, RiskSignal, UnifiedRiskManager,
};
use crate::application::strategies::{EntryPlan, StrategyController};
use crate::domain::errors::{EngineError, ExternalFailure, InvariantViolation, ValidationError};
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::CorporateEventTable;
use crate::domain::market::instrument::Leg;
use crate::domain::ports::EngineContext;
use crate::domain::risk::drawdown::{DrawdownAction, DrawdownSnapshot};
use crate::domain::risk::events::{RiskEvent, RiskEventKind, RiskLevel};
use crate::domain::trading::lifecycle::{StrategyMachine, StrategyState, TransitionTrigger};
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{FilledLeg, Position, PositionRecord, StrategyKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
}

/// Structured snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: String,
    pub open_positions: usize,
    pub net_liq: Decimal,
    pub margin_utilization: f64,
    pub drawdown_level: String,
    pub drawdown: f64,
    pub manual_mode: bool,
    pub cumulative_pnl: Decimal,
    pub win_rate: f64,
}

pub struct TradingEngine {
    ctx: EngineContext,
    risk: UnifiedRiskManager,
    sizer: PositionSizer,
    executor: AtomicExecutor,
    exits: ExitRuleEngine,
    controllers: Vec<Box<dyn StrategyController>>,
    corporate_events: CorporateEventTable,
    book: PositionBook,
    tracker: PerformanceTracker,
    state: EngineState,
    last_sweep: Option<DateTime<Utc>>,
}

impl TradingEngine {
    /// Build the engine. A malformed constants table refuses to start.
    pub fn new(
        ctx: EngineContext,
        controllers: Vec<Box<dyn StrategyController>>,
        corporate_events: CorporateEventTable,
        starting_cash: Decimal,
    ) -> Result<Self, EngineError> {
        ctx.constants.validate()?;
        let constants = ctx.constants.clone();
        Ok(Self {
            risk: UnifiedRiskManager::new(constants.clone()),
            sizer: PositionSizer::new(constants.clone()),
            executor: AtomicExecutor::new(ctx.clone()),
            exits: ExitRuleEngine::new(constants.clone()),
            controllers,
            corporate_events,
            book: PositionBook::new(starting_cash),
            tracker: PerformanceTracker::new(
                constants.pnl_history_cap,
                constants.checkpoint_cap,
            ),
            state: EngineState::Idle,
            last_sweep: None,
            ctx,
        })
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn book_mut(&mut self) -> &mut PositionBook {
        &mut self.book
    }

    pub fn risk(&self) -> &UnifiedRiskManager {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut UnifiedRiskManager {
        &mut self.risk
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    pub fn executor(&self) -> &AtomicExecutor {
        &self.executor
    }

    /// Load persisted state and reconcile in-flight order groups, then begin
    /// accepting bars.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let constants = &self.ctx.constants;

        let records = self
            .ctx
            .store
            .list("positions/")
            .await
            .map_err(ExternalFailure::StoreUnavailable)?;
        for (key, value) in records {
            match serde_json::from_value::<PositionRecord>(value) {
                Ok(record) => {
                    let position = Position::from_record(
                        record,
                        constants.transition_history_cap,
                        constants.error_recovery_timeout,
                    );
                    self.risk.record_entry(position.id, &position.underlying);
                    self.book.insert(position);
                }
                Err(e) => error!(%key, "unreadable position record: {e}"),
            }
        }

        if let Some(value) = self.ctx.store.get("drawdown/peak").await? {
            match serde_json::from_value::<DrawdownSnapshot>(value) {
                Ok(snapshot) => self.risk.drawdown_mut().restore(snapshot),
                Err(e) => error!("unreadable drawdown snapshot: {e}"),
            }
        }

        if let Some(value) = self.ctx.store.get("performance/cumulative").await? {
            match serde_json::from_value(value) {
                Ok(snapshot) => self.tracker.restore(snapshot),
                Err(e) => error!("unreadable performance snapshot: {e}"),
            }
        }

        if let Some(value) = self.ctx.store.get("performance/history").await? {
            match serde_json::from_value(value) {
                Ok(record) => self.tracker.restore_history(record),
                Err(e) => error!("unreadable performance history: {e}"),
            }
        }

        let reconciled = self.executor.recover_on_start().await?;
        if reconciled > 0 {
            warn!(reconciled, "reconciled in-flight order groups from a prior run");
        }

        self.state = EngineState::Running;
        info!(
            positions = self.book.len(),
            cash = %self.book.cash,
            "engine started"
        );
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == EngineState::Running {
            self.state = EngineState::Paused;
            info!("engine paused");
        }
    }

    pub fn resume(&mut self) {
        if self.state == EngineState::Paused {
            self.state = EngineState::Running;
            info!("engine resumed");
        }
    }

    pub fn enter_manual_mode(&mut self, reason: &str) {
        let at = self.ctx.clock.now();
        self.risk.activate_manual_mode(reason, at);
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: format!("{:?}", self.state),
            open_positions: self.book.len(),
            net_liq: self.book.net_liq(),
            margin_utilization: self.book.margin_utilization(),
            drawdown_level: self.risk.drawdown().level().to_string(),
            drawdown: self.risk.drawdown().drawdown(),
            manual_mode: self.risk.manual().is_active(),
            cumulative_pnl: self.tracker.cumulative_pnl(),
            win_rate: self.tracker.win_rate().win_rate,
        }
    }

    /// Process one market bar to completion.
    pub async fn on_bar(&mut self, slice: &BarSlice) -> anyhow::Result<()> {
        if self.state != EngineState::Running {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let at = slice.at;

        self.book.mark_all(slice);
        let signals = self.risk.refresh(slice, &self.book);

        self.recover_errored_machines(at);

        for signal in &signals {
            match signal {
                RiskSignal::VixHalt => self.close_vulnerable(slice, "volatility halt").await?,
                RiskSignal::VixEmergency => {
                    // Entry gates already deny premium sellers; nothing to
                    // close yet at this level.
                }
                RiskSignal::Drawdown(DrawdownAction::EmergencyProtocol) => {
                    self.drawdown_emergency(slice).await?;
                }
                RiskSignal::Drawdown(_) => {}
            }
        }

        self.evaluate_exits(slice).await?;
        self.evaluate_entries(slice).await?;

        // Stale-group sweep on its own cadence.
        let sweep_due = self
            .last_sweep
            .map(|t| {
                at.signed_duration_since(t).num_seconds()
                    >= self.ctx.constants.stale_group_sweep_age.as_secs() as i64
            })
            .unwrap_or(true);
        if sweep_due {
            self.executor.sweep_stale(at).await?;
            self.last_sweep = Some(at);
        }

        self.persist_bar_state().await?;

        let elapsed = started.elapsed();
        if elapsed > self.ctx.constants.bar_soft_limit {
            warn!(?elapsed, "bar processing exceeded soft limit");
        }
        Ok(())
    }

    /// Close every premium-selling position with market orders; the
    /// protective ladder is left alone.
    async fn close_vulnerable(&mut self, slice: &BarSlice, reason: &str) -> anyhow::Result<()> {
        let ids: Vec<Uuid> = self
            .book
            .iter()
            .filter(|p| p.strategy.is_premium_selling())
            .map(|p| p.id)
            .collect();
        for id in ids {
            self.close_position_full(id, slice, reason, TransitionTrigger::EmergencyExit, true)
                .await?;
        }
        Ok(())
    }

    /// Emergency drawdown protocol: close positions losing more than 100% of
    /// their entry credit, halve the rest of the premium book.
    async fn drawdown_emergency(&mut self, slice: &BarSlice) -> anyhow::Result<()> {
        let losing: Vec<Uuid> = self
            .book
            .iter()
            .filter(|p| p.loss_fraction().is_some_and(|l| l > 1.0))
            .map(|p| p.id)
            .collect();
        for id in losing {
            self.close_position_full(
                id,
                slice,
                "drawdown emergency: loss above 100%",
                TransitionTrigger::EmergencyExit,
                true,
            )
            .await?;
        }

        let remaining: Vec<Uuid> = self
            .book
            .iter()
            .filter(|p| p.strategy.is_premium_selling())
            .map(|p| p.id)
            .collect();
        for id in remaining {
            self.halve_position(id, slice).await?;
        }
        Ok(())
    }

    fn recover_errored_machines(&mut self, at: DateTime<Utc>) {
        for position in self.book.iter_mut() {
            if position.machine.state() == StrategyState::Error {
                position.machine.try_auto_recover(at);
            }
        }
    }

    async fn evaluate_exits(&mut self, slice: &BarSlice) -> anyhow::Result<()> {
        let at = slice.at;
        let defensive = DefensiveContext {
            vix: self.risk.vix().level(at, &self.ctx.constants).ok(),
            margin_utilization: self.book.margin_utilization(),
        };
        let tightened = self.risk.drawdown().profit_target_override();

        let ids = self.book.ids();
        for id in ids {
            let decision = {
                let Some(position) = self.book.get(id) else { continue };
                // A position claiming to hold legs with none attached is a
                // state the engine believes cannot happen: halt and hand
                // over to the operator.
                if position.machine.state().holds_legs() && position.legs.is_empty() {
                    let violation =
                        InvariantViolation(format!("position {id} open with no legs"));
                    self.risk.journal_mut().push(
                        RiskEvent::new(
                            RiskEventKind::InvariantViolation,
                            RiskLevel::Emergency,
                            at,
                            "engine",
                            violation.to_string(),
                        )
                        .with_payload(json!({"position": id.to_string()})),
                    );
                    self.risk.activate_manual_mode(&violation.to_string(), at);
                    self.state = EngineState::Paused;
                    return Ok(());
                }
                // Positions begin managing on their first full bar.
                if position.machine.state() == StrategyState::PositionOpen {
                    let p = self
                        .book
                        .get_mut(id)
                        .expect("position disappeared mid-bar");
                    p.machine
                        .transition(StrategyState::Managing, TransitionTrigger::MarketOpen, at);
                }
                let position = self.book.get(id).expect("position disappeared mid-bar");
                if position.machine.state() != StrategyState::Managing {
                    continue;
                }
                self.exits.evaluate(position, at, &defensive, tightened)
            };

            if let Some(decision) = decision {
                info!(position = %id, reason = %decision.reason, "exit rule matched");
                match decision.scope {
                    ExitScope::Full => {
                        self.close_position_full(
                            id,
                            slice,
                            &decision.reason,
                            decision.trigger,
                            decision.market_order,
                        )
                        .await?;
                    }
                    scope => {
                        self.close_position_component(id, scope, slice, &decision)
                            .await?;
                    }
                }
            }
        }

        // Correlation-group breach: close the weakest equity position.
        if let Some(victim) = equity_breach_victim(&self.book, self.risk.correlation()) {
            self.risk.journal_mut().push(
                RiskEvent::new(
                    RiskEventKind::DefensiveExit,
                    RiskLevel::Warning,
                    at,
                    "correlation",
                    "equity exposure breach, closing weakest position",
                )
                .with_payload(json!({"position": victim.to_string()})),
            );
            self.close_position_full(
                victim,
                slice,
                "equity exposure breach",
                TransitionTrigger::EmergencyExit,
                true,
            )
            .await?;
        }
        Ok(())
    }

    async fn evaluate_entries(&mut self, slice: &BarSlice) -> anyhow::Result<()> {
        let at = slice.at;

        for i in 0..self.controllers.len() {
            let (kind, underlying, in_window, band) = {
                let c = &self.controllers[i];
                (
                    c.kind(),
                    c.underlying().to_string(),
                    c.in_entry_window(at),
                    c.vix_band(),
                )
            };
            if !in_window {
                continue;
            }

            // Corporate-event blackout.
            if let Some(event) = self.corporate_events.blackout_event(
                &underlying,
                at.date_naive(),
                self.ctx.constants.event_blackout_days,
            ) {
                debug!(%kind, %underlying, %event, "entry blocked by corporate event");
                continue;
            }

            // Strategy VIX band; a stale read is a denial, not a default.
            let vix_level = match self.risk.vix().level(at, &self.ctx.constants) {
                Ok(level) => level,
                Err(err) => {
                    self.risk.note_stale_denial("VIX", &err, at);
                    continue;
                }
            };
            let (min, max) = band;
            if min.is_some_and(|m| vix_level < m) || max.is_some_and(|m| vix_level > m) {
                debug!(%kind, vix_level, "outside required VIX band");
                continue;
            }

            let Ok((vix_mult, dd_mult)) = self.risk.entry_multipliers(at) else {
                continue;
            };
            let inputs = SizerInputs::seeded(kind, self.book.net_liq());
            let contracts = self.sizer.contracts(&inputs, vix_mult, dd_mult);
            if contracts == 0 {
                continue;
            }

            let plan = {
                let controller = &self.controllers[i];
                match controller.propose(slice, &self.book, contracts, self.risk.freshness_mut())
                {
                    Ok(Some(plan)) => plan,
                    Ok(None) => continue,
                    Err(err @ ValidationError::StaleData { .. })
                    | Err(err @ ValidationError::MissingData { .. }) => {
                        self.risk.note_stale_denial(&underlying, &err, at);
                        continue;
                    }
                    Err(err) => {
                        debug!(%kind, "proposal failed: {err}");
                        continue;
                    }
                }
            };

            let proposal = EntryProposal {
                strategy: kind,
                underlying: &underlying,
                contracts: plan.contracts,
                margin_estimate: plan.margin_estimate,
            };
            match self.risk.can_open(&proposal, &self.book, at) {
                Ok(_approved) => {}
                Err(ValidationError::ManualMode { .. }) => {
                    // Suggest, never place.
                    let suggestion = TradeSuggestion {
                        at,
                        strategy: kind,
                        underlying: underlying.clone(),
                        contracts: plan.contracts,
                        summary: format!(
                            "{} {} x{} ({} legs)",
                            kind,
                            underlying,
                            plan.contracts,
                            plan.legs.len()
                        ),
                    };
                    self.risk.manual_mut().log_suggestion(suggestion);
                    continue;
                }
                Err(_) => continue,
            }

            self.open_position(kind, plan, slice).await?;
        }
        Ok(())
    }

    async fn open_position(
        &mut self,
        kind: StrategyKind,
        plan: EntryPlan,
        slice: &BarSlice,
    ) -> anyhow::Result<()> {
        let at = slice.at;
        let outcome = match self
            .executor
            .execute(kind, plan.legs.clone(), slice, None, false)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%kind, "entry group failed: {e}");
                self.risk.note_order_failure(at);
                return Ok(());
            }
        };

        let (group_id, fills) = match outcome {
            ExecutionOutcome::Filled { group_id, fills } => (group_id, fills),
            ExecutionOutcome::RolledBack { group_id, reason } => {
                self.risk.journal_mut().push(
                    RiskEvent::new(
                        RiskEventKind::OrderGroupRolledBack,
                        RiskLevel::Warning,
                        at,
                        "executor",
                        format!("entry group {group_id} rolled back: {reason}"),
                    )
                    .with_payload(json!({"strategy": kind.to_string()})),
                );
                self.risk.note_order_failure(at);
                return Ok(());
            }
        };

        let filled_legs = self.to_filled_legs(&plan, &fills);
        let entry_cash: Decimal = filled_legs.iter().map(FilledLeg::entry_cash).sum();
        let fees: Decimal = filled_legs
            .iter()
            .map(|l| {
                self.ctx
                    .fees
                    .fill_fee(&l.instrument, l.quantity, l.entry_price)
            })
            .sum();
        self.book.cash += entry_cash - fees;

        // An IPMCC weekly call against an existing LEAP attaches to the
        // position that owns the LEAP instead of opening a new one.
        if kind == StrategyKind::Ipmcc
            && let Some(existing) = self
                .book
                .active_leap_call(&plan.underlying)
                .filter(|p| !p.has_role(crate::domain::trading::position::LegRole::WeeklyCall))
                .map(|p| p.id)
        {
            let position = self
                .book
                .get_mut(existing)
                .expect("position disappeared mid-bar");
            position.legs.extend(filled_legs);
            position.entry_cash += entry_cash;
            info!(position = %existing, "weekly call attached to existing structure");
            self.persist_position(existing).await?;
            return Ok(());
        }

        let approved_group = self
            .risk
            .correlation()
            .group_of(&plan.underlying)
            .expect("entry approved for unmapped underlying");

        let id = Uuid::new_v4();
        let mut machine = StrategyMachine::new(
            format!("{kind}/{id}"),
            self.ctx.constants.transition_history_cap,
            self.ctx.constants.error_recovery_timeout,
        );
        // Walk the machine through its entry states to the open position.
        machine.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at);
        machine.transition(
            StrategyState::Analyzing,
            TransitionTrigger::EntryConditionsMet,
            at,
        );
        machine.transition(
            StrategyState::PendingEntry,
            TransitionTrigger::EntryConditionsMet,
            at,
        );
        machine.transition(
            StrategyState::Entering,
            TransitionTrigger::EntryConditionsMet,
            at,
        );
        machine.transition(StrategyState::PositionOpen, TransitionTrigger::OrderFilled, at);

        let position = Position {
            id,
            strategy: kind,
            underlying: plan.underlying.clone(),
            group: approved_group,
            opened_at: at,
            contracts: plan.contracts,
            legs: filled_legs,
            entry_cash,
            margin_requirement: plan.margin_estimate,
            order_group_id: group_id,
            machine,
        };

        info!(
            position = %id, strategy = %kind, underlying = %plan.underlying,
            contracts = plan.contracts, entry_cash = %entry_cash,
            "position opened"
        );
        self.risk.record_entry(id, &plan.underlying);
        self.book.insert(position);
        self.persist_position(id).await?;
        Ok(())
    }

    fn to_filled_legs(&self, plan: &EntryPlan, fills: &[GroupFill]) -> Vec<FilledLeg> {
        plan.legs
            .iter()
            .zip(plan.roles.iter())
            .map(|(leg, role)| {
                let avg = fills
                    .iter()
                    .find(|f| f.leg.instrument.key == leg.instrument.key)
                    .map(|f| f.avg_price)
                    .unwrap_or(Decimal::ZERO);
                FilledLeg {
                    role: *role,
                    instrument: leg.instrument.clone(),
                    quantity: leg.quantity,
                    entry_price: avg,
                    mark: Some(avg),
                }
            })
            .collect()
    }

    /// Close the whole position through the atomic executor and realize P&L.
    async fn close_position_full(
        &mut self,
        id: Uuid,
        slice: &BarSlice,
        reason: &str,
        trigger: TransitionTrigger,
        market: bool,
    ) -> anyhow::Result<()> {
        let at = slice.at;
        let (kind, closing_legs) = {
            let Some(position) = self.book.get_mut(id) else {
                return Ok(());
            };
            position
                .machine
                .transition(StrategyState::PendingExit, trigger, at);
            let legs: Vec<Leg> = position
                .legs
                .iter()
                .map(|l| Leg {
                    instrument: l.instrument.clone(),
                    quantity: -l.quantity,
                })
                .collect();
            (position.strategy, legs)
        };
        if closing_legs.is_empty() {
            // Nothing held; retire the shell.
            if let Some(mut position) = self.book.remove(id) {
                position
                    .machine
                    .transition(StrategyState::Exiting, trigger, at);
                self.risk.record_exit(id);
                self.ctx.store.delete(&format!("positions/{id}")).await?;
            }
            return Ok(());
        }

        let outcome = self
            .executor
            .execute(kind, closing_legs, slice, None, market)
            .await;

        match outcome {
            Ok(ExecutionOutcome::Filled { fills, .. }) => {
                let Some(mut position) = self.book.remove(id) else {
                    return Ok(());
                };
                position
                    .machine
                    .transition(StrategyState::Exiting, trigger, at);

                let (realized, close_cash, fees) = realize(&position.legs, &fills, &*self.ctx.fees);
                self.book.cash += close_cash - fees;
                self.tracker.record_realized(realized, fees, at);

                position
                    .machine
                    .transition(StrategyState::Closed, TransitionTrigger::OrderFilled, at);
                position
                    .machine
                    .transition(StrategyState::Terminated, TransitionTrigger::Reset, at);
                self.risk.record_exit(id);
                self.ctx.store.delete(&format!("positions/{id}")).await?;
                info!(
                    position = %id, %realized, reason,
                    "position closed"
                );
            }
            Ok(ExecutionOutcome::RolledBack { reason: why, .. }) => {
                warn!(position = %id, "close group rolled back: {why}");
                self.risk.note_order_failure(at);
                if let Some(position) = self.book.get_mut(id) {
                    position.machine.transition(
                        StrategyState::Error,
                        TransitionTrigger::OrderRejected,
                        at,
                    );
                }
            }
            Err(e) => {
                warn!(position = %id, "close group failed: {e}");
                self.risk.note_order_failure(at);
            }
        }
        Ok(())
    }

    /// Close only a component (LT112 naked puts or spread, IPMCC short call),
    /// keeping the rest of the position alive.
    async fn close_position_component(
        &mut self,
        id: Uuid,
        scope: ExitScope,
        slice: &BarSlice,
        decision: &ExitDecision,
    ) -> anyhow::Result<()> {
        let at = slice.at;
        let (kind, detached) = {
            let Some(position) = self.book.get_mut(id) else {
                return Ok(());
            };
            position
                .machine
                .transition(StrategyState::PendingExit, decision.trigger, at);
            (position.strategy, position.detach_component(scope.roles()))
        };
        if detached.is_empty() {
            return Ok(());
        }

        let closing: Vec<Leg> = detached
            .iter()
            .map(|l| Leg {
                instrument: l.instrument.clone(),
                quantity: -l.quantity,
            })
            .collect();

        match self
            .executor
            .execute(kind, closing, slice, None, decision.market_order)
            .await
        {
            Ok(ExecutionOutcome::Filled { fills, .. }) => {
                let (realized, close_cash, fees) = realize(&detached, &fills, &*self.ctx.fees);
                self.book.cash += close_cash - fees;
                self.tracker.record_realized(realized, fees, at);

                let emptied = {
                    let position = self
                        .book
                        .get_mut(id)
                        .expect("position disappeared mid-bar");
                    position.machine.transition(
                        StrategyState::PartialExit,
                        TransitionTrigger::OrderFilled,
                        at,
                    );
                    position.entry_cash =
                        position.legs.iter().map(FilledLeg::entry_cash).sum();
                    if position.legs.is_empty() {
                        position.machine.transition(
                            StrategyState::Exiting,
                            decision.trigger,
                            at,
                        );
                        position.machine.transition(
                            StrategyState::Closed,
                            TransitionTrigger::OrderFilled,
                            at,
                        );
                        true
                    } else {
                        position.machine.transition(
                            StrategyState::Managing,
                            TransitionTrigger::AdjustmentNeeded,
                            at,
                        );
                        false
                    }
                };
                if emptied {
                    self.book.remove(id);
                    self.risk.record_exit(id);
                    self.ctx.store.delete(&format!("positions/{id}")).await?;
                } else {
                    self.persist_position(id).await?;
                }
                info!(position = %id, ?scope, %realized, reason = %decision.reason,
                    "component closed");
            }
            Ok(ExecutionOutcome::RolledBack { reason: why, .. }) => {
                warn!(position = %id, "component close rolled back: {why}, legs restored");
                self.risk.note_order_failure(at);
                if let Some(position) = self.book.get_mut(id) {
                    position.legs.extend(detached);
                    position.entry_cash =
                        position.legs.iter().map(FilledLeg::entry_cash).sum();
                    position.machine.transition(
                        StrategyState::Error,
                        TransitionTrigger::OrderRejected,
                        at,
                    );
                }
            }
            Err(e) => {
                warn!(position = %id, "component close failed: {e}");
                self.risk.note_order_failure(at);
                if let Some(position) = self.book.get_mut(id) {
                    position.legs.extend(detached);
                    position.entry_cash =
                        position.legs.iter().map(FilledLeg::entry_cash).sum();
                }
            }
        }
        Ok(())
    }

    /// Flatten half of each leg's quantity with market orders, keeping the
    /// structure's shape.
    async fn halve_position(&mut self, id: Uuid, slice: &BarSlice) -> anyhow::Result<()> {
        let at = slice.at;
        let (kind, half_legs) = {
            let Some(position) = self.book.get(id) else {
                return Ok(());
            };
            let halves: Vec<Leg> = position
                .legs
                .iter()
                .filter_map(|l| {
                    let half = l.quantity / 2;
                    (half != 0).then(|| Leg {
                        instrument: l.instrument.clone(),
                        quantity: -half,
                    })
                })
                .collect();
            (position.strategy, halves)
        };
        if half_legs.is_empty() {
            return Ok(());
        }

        match self
            .executor
            .execute(kind, half_legs.clone(), slice, None, true)
            .await
        {
            Ok(ExecutionOutcome::Filled { fills, .. }) => {
                let position = self
                    .book
                    .get_mut(id)
                    .expect("position disappeared mid-bar");
                let mut realized = Decimal::ZERO;
                let mut close_cash = Decimal::ZERO;
                let mut fees = Decimal::ZERO;

                for fill in &fills {
                    if let Some(leg) = position
                        .legs
                        .iter_mut()
                        .find(|l| l.instrument.key == fill.leg.instrument.key)
                    {
                        let closed_qty = -fill.leg.quantity;
                        let cash = Decimal::from(-fill.leg.quantity)
                            * fill.avg_price
                            * leg.instrument.multiplier;
                        // Closed portion: entry cash of that fraction plus
                        // the close proceeds.
                        realized += -Decimal::from(closed_qty)
                            * leg.entry_price
                            * leg.instrument.multiplier
                            + cash;
                        close_cash += cash;
                        fees += self.ctx.fees.fill_fee(
                            &leg.instrument,
                            fill.leg.quantity,
                            fill.avg_price,
                        );
                        leg.quantity -= closed_qty;
                    }
                }
                position.entry_cash = position.legs.iter().map(FilledLeg::entry_cash).sum();
                position.margin_requirement /= Decimal::TWO;
                self.book.cash += close_cash - fees;
                self.tracker.record_realized(realized, fees, at);
                info!(position = %id, %realized, "position halved under drawdown protocol");
                self.persist_position(id).await?;
            }
            Ok(ExecutionOutcome::RolledBack { reason, .. }) => {
                warn!(position = %id, "halving rolled back: {reason}");
                self.risk.note_order_failure(at);
            }
            Err(e) => {
                warn!(position = %id, "halving failed: {e}");
                self.risk.note_order_failure(at);
            }
        }
        Ok(())
    }

    /// Close everything and surface a single EMERGENCY event.
    pub async fn force_close_all(&mut self, slice: &BarSlice, reason: &str) -> anyhow::Result<()> {
        let at = slice.at;
        let ids = self.book.ids();
        self.risk.journal_mut().push(
            RiskEvent::new(
                RiskEventKind::EmergencyHalt,
                RiskLevel::Emergency,
                at,
                "engine",
                format!("force close all: {reason}"),
            )
            .with_payload(json!({
                "positions": ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                "recommended": "verify flat at broker, review risk events, resume manually",
            })),
        );
        for id in ids {
            self.close_position_full(id, slice, reason, TransitionTrigger::EmergencyExit, true)
                .await?;
        }
        self.risk.activate_manual_mode(reason, at);
        Ok(())
    }

    async fn persist_position(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(position) = self.book.get(id) {
            let record = position.to_record();
            self.ctx
                .store
                .put(&format!("positions/{id}"), serde_json::to_value(&record)?)
                .await?;
        }
        Ok(())
    }

    async fn persist_bar_state(&mut self) -> anyhow::Result<()> {
        let snapshot = self.risk.drawdown().snapshot();
        self.ctx
            .store
            .put("drawdown/peak", serde_json::to_value(&snapshot)?)
            .await?;

        let tracker = self.tracker.snapshot();
        self.ctx
            .store
            .put("performance/cumulative", serde_json::to_value(&tracker)?)
            .await?;
        let history = self.tracker.history_record();
        self.ctx
            .store
            .put("performance/history", serde_json::to_value(&history)?)
            .await?;

        for event in self.risk.journal_mut().drain_new() {
            let key = format!(
                "risk_events/{}-{:?}",
                event.at.format("%Y%m%dT%H%M%S%.3f"),
                event.kind
            );
            self.ctx
                .store
                .put(&key, serde_json::to_value(&event)?)
                .await?;
        }
        Ok(())
    }
}

/// Realized P&L, close-side cash flow and fees for a set of closed legs.
fn realize(
    legs: &[FilledLeg],
    fills: &[GroupFill],
    fees: &dyn crate::domain::trading::fees::FeeModel,
) -> (Decimal, Decimal, Decimal) {
    let mut realized = Decimal::ZERO;
    let mut close_cash = Decimal::ZERO;
    let mut total_fees = Decimal::ZERO;

    for leg in legs {
        let fill = fills
            .iter()
            .find(|f| f.leg.instrument.key == leg.instrument.key);
        let close_price = fill.map(|f| f.avg_price).unwrap_or(leg.entry_price);
        // Closing cash: the original quantity sold back (longs receive,
        // shorts pay).
        let cash = Decimal::from(leg.quantity) * close_price * leg.instrument.multiplier;
        close_cash += cash;
        realized += leg.entry_cash() + cash;
        total_fees += fees.fill_fee(&leg.instrument, leg.quantity, close_price);
    }
    (realized, close_cash, total_fees)
}
