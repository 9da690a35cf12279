//! Unified risk manager: the single gate every entry must pass.
//!
//! Composes the volatility regime gate, the correlation limiter, the
//! drawdown circuit breaker and manual mode, in that order, stopping at the
//! first deny. Strategy controllers are not permitted any other path to the
//! executor.

use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::is_trading_hours;
use crate::domain::market::freshness::{DatumKind, FreshnessValidator};
use crate::domain::risk::account_phase::AccountPhase;
use crate::domain::risk::correlation::{CorrelationGroup, CorrelationLimiter, CorrelationMap};
use crate::domain::risk::drawdown::{DrawdownAction, DrawdownMonitor};
use crate::domain::risk::events::{EventJournal, RiskEvent, RiskEventKind, RiskLevel};
use crate::domain::risk::vix_regime::{
    size_multiplier, VixGate, VixRegime, VixSignal, ZeroDteEligibility,
};
use crate::application::risk_management::manual_mode::ManualModeController;
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::StrategyKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A proposed entry, as seen by the gate.
#[derive(Debug, Clone)]
pub struct EntryProposal<'a> {
    pub strategy: StrategyKind,
    pub underlying: &'a str,
    pub contracts: u32,
    pub margin_estimate: Decimal,
}

/// What an approved entry learned on the way through the gate.
#[derive(Debug, Clone, Copy)]
pub struct ApprovedEntry {
    pub regime: VixRegime,
    pub phase: AccountPhase,
    pub group: CorrelationGroup,
    pub vix_level: f64,
}

/// Signals the engine must act on after a portfolio refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskSignal {
    /// VIX above the extreme threshold: no new premium-selling entries.
    VixEmergency,
    /// VIX above the crisis threshold: close vulnerable positions.
    VixHalt,
    Drawdown(DrawdownAction),
}

pub struct UnifiedRiskManager {
    constants: Arc<Constants>,
    vix: VixGate,
    correlation: CorrelationLimiter,
    drawdown: DrawdownMonitor,
    manual: ManualModeController,
    freshness: FreshnessValidator,
    journal: EventJournal,
    last_regime: Option<VixRegime>,
    halt_latched: bool,
}

impl UnifiedRiskManager {
    pub fn new(constants: Arc<Constants>) -> Self {
        Self {
            vix: VixGate::new(),
            correlation: CorrelationLimiter::new(CorrelationMap::builtin()),
            drawdown: DrawdownMonitor::new(&constants),
            manual: ManualModeController::new(
                constants.order_failure_threshold,
                constants.order_failure_window,
            ),
            freshness: FreshnessValidator::new(constants.off_hours_max_age),
            journal: EventJournal::new(1000),
            last_regime: None,
            halt_latched: false,
            constants,
        }
    }

    /// Refresh the risk view from a bar: feed the VIX cache, update the
    /// drawdown monitor, check the portfolio delta limit, and surface any
    /// signals the engine must act on this bar.
    pub fn refresh(&mut self, slice: &BarSlice, book: &PositionBook) -> Vec<RiskSignal> {
        let mut signals = Vec::new();
        let at = slice.at;

        self.vix.observe(slice.vix);

        // Stale/missing VIX during the session is CRITICAL and escalates to
        // manual mode after three consecutive bars.
        match self.vix.level(at, &self.constants) {
            Ok(level) => {
                self.freshness.reset("VIX");
                let regime = VixRegime::classify(level, &self.constants);
                if self.last_regime != Some(regime) {
                    if let Some(previous) = self.last_regime {
                        self.journal.push(
                            RiskEvent::new(
                                RiskEventKind::VixRegimeChange,
                                RiskLevel::Info,
                                at,
                                "vix_gate",
                                format!("VIX regime {previous} -> {regime} ({level:.2})"),
                            )
                            .with_payload(json!({"level": level, "regime": regime.to_string()})),
                        );
                    }
                    self.last_regime = Some(regime);
                }

                match self.vix.signal(at, &self.constants) {
                    Some(VixSignal::HaltTrading) => {
                        if !self.halt_latched {
                            self.journal.push(
                                RiskEvent::new(
                                    RiskEventKind::HaltTrading,
                                    RiskLevel::Emergency,
                                    at,
                                    "vix_gate",
                                    format!("VIX {level:.2} above crisis threshold, halting"),
                                )
                                .with_payload(json!({"level": level})),
                            );
                            self.halt_latched = true;
                        }
                        signals.push(RiskSignal::VixHalt);
                    }
                    Some(VixSignal::EmergencyConditions) => {
                        self.halt_latched = false;
                        self.journal.push(
                            RiskEvent::new(
                                RiskEventKind::EmergencyConditions,
                                RiskLevel::Critical,
                                at,
                                "vix_gate",
                                format!("VIX {level:.2} above extreme threshold"),
                            )
                            .with_payload(json!({"level": level})),
                        );
                        signals.push(RiskSignal::VixEmergency);
                    }
                    None => self.halt_latched = false,
                }
            }
            Err(err) => {
                if is_trading_hours(at) {
                    let _ = self.freshness.note_missing("VIX", DatumKind::Vix);
                    self.journal.push(
                        RiskEvent::new(
                            RiskEventKind::StaleData,
                            RiskLevel::Critical,
                            at,
                            "vix_gate",
                            err.to_string(),
                        )
                        .with_payload(json!({"strikes": self.freshness.strikes("VIX")})),
                    );
                    self.escalate_if_needed("VIX", at);
                }
            }
        }

        // Drawdown off the live net liquidation value.
        let update = self.drawdown.update(book.net_liq(), at);
        if let Some(action) = update.action {
            let level = if update.level >= crate::domain::risk::drawdown::DrawdownLevel::Emergency {
                RiskLevel::Emergency
            } else if update.level >= crate::domain::risk::drawdown::DrawdownLevel::Critical {
                RiskLevel::Critical
            } else {
                RiskLevel::Warning
            };
            self.journal.push(
                RiskEvent::new(
                    RiskEventKind::DrawdownLevelChange,
                    level,
                    at,
                    "drawdown",
                    format!(
                        "drawdown {:.1}% ({} -> {})",
                        update.drawdown * 100.0,
                        update.previous,
                        update.level
                    ),
                )
                .with_payload(json!({
                    "drawdown": update.drawdown,
                    "peak": update.peak.to_string(),
                })),
            );
            signals.push(RiskSignal::Drawdown(action));
            if action == DrawdownAction::EmergencyProtocol {
                self.activate_manual_mode("drawdown circuit breaker", at);
            }
        }

        // Portfolio delta limit from whatever greeks the bar carries.
        let mut delta = 0.0;
        for position in book.iter() {
            for leg in &position.legs {
                for chain in slice.chains_for(leg.instrument.underlying_symbol()) {
                    if let Some(q) = chain.find(&leg.instrument.key)
                        && let Some(g) = q.greeks
                    {
                        delta += leg.quantity as f64 * g.delta;
                    }
                }
            }
        }
        if delta.abs() > self.constants.max_portfolio_delta {
            self.activate_manual_mode(
                &format!("portfolio delta limit exceeded: {delta:.1}"),
                at,
            );
        }

        signals
    }

    /// May this position open? Composes the gates in fixed order and stops at
    /// the first deny. Serialized within a bar so an approval is visible to
    /// the next caller's correlation and buying-power checks.
    pub fn can_open(
        &mut self,
        proposal: &EntryProposal<'_>,
        book: &PositionBook,
        at: DateTime<Utc>,
    ) -> Result<ApprovedEntry, ValidationError> {
        // 1. Volatility regime gate.
        let vix_level = self.vix.level(at, &self.constants).map_err(|e| {
            if is_trading_hours(at) {
                let _ = self.freshness.note_missing("VIX", DatumKind::Vix);
                self.journal.push(
                    RiskEvent::new(
                        RiskEventKind::StaleData,
                        RiskLevel::Critical,
                        at,
                        "risk_manager",
                        format!("entry denied: {e}"),
                    )
                    .with_payload(json!({"strategy": proposal.strategy.to_string()})),
                );
                self.escalate_if_needed("VIX", at);
            }
            e
        })?;
        let regime = VixRegime::classify(vix_level, &self.constants);

        if proposal.strategy == StrategyKind::ZeroDte
            && regime.zero_dte() != ZeroDteEligibility::Yes
        {
            return self.deny(
                proposal,
                ValidationError::VixGate {
                    reason: format!("0DTE not eligible in {regime} regime"),
                },
            );
        }

        if vix_level > self.constants.vix_extreme && proposal.strategy.is_premium_selling() {
            return self.deny(
                proposal,
                ValidationError::VixGate {
                    reason: format!("emergency conditions: VIX {vix_level:.2}"),
                },
            );
        }

        let net_liq = book.net_liq();
        let phase = AccountPhase::from_net_liq(net_liq, &self.constants);
        let cap = regime.max_buying_power(phase);
        let utilization = book.margin_utilization_with(proposal.margin_estimate);
        if utilization > cap {
            return self.deny(
                proposal,
                ValidationError::BuyingPowerCap {
                    utilization,
                    cap,
                    regime: regime.to_string(),
                },
            );
        }

        // 2. Correlation / concentration limiter.
        let group = match self.correlation.check(proposal.underlying, phase, regime) {
            Ok(group) => group,
            Err(err) => {
                self.journal.push(
                    RiskEvent::new(
                        RiskEventKind::CorrelationBlocked,
                        RiskLevel::Warning,
                        at,
                        "correlation",
                        err.to_string(),
                    )
                    .with_payload(json!({
                        "underlying": proposal.underlying,
                        "strategy": proposal.strategy.to_string(),
                    })),
                );
                return Err(err);
            }
        };

        // 3. Drawdown circuit breaker.
        if self.drawdown.entries_blocked() {
            return self.deny(
                proposal,
                ValidationError::DrawdownBlock {
                    level: self.drawdown.level().to_string(),
                },
            );
        }

        // 4. Manual mode.
        if self.manual.is_active() {
            return self.deny(
                proposal,
                ValidationError::ManualMode {
                    reason: self.manual.reason().unwrap_or("unknown").to_string(),
                },
            );
        }

        Ok(ApprovedEntry {
            regime,
            phase,
            group,
            vix_level,
        })
    }

    fn deny(
        &mut self,
        proposal: &EntryProposal<'_>,
        err: ValidationError,
    ) -> Result<ApprovedEntry, ValidationError> {
        // Ordinary denies stay at debug; repeats surface through the
        // freshness and correlation paths which journal on their own.
        debug!(
            strategy = %proposal.strategy,
            underlying = proposal.underlying,
            "entry denied: {err}"
        );
        Err(err)
    }

    /// Size multipliers for a new entry: regime taper times the drawdown
    /// reduction.
    pub fn entry_multipliers(&self, at: DateTime<Utc>) -> Result<(f64, f64), ValidationError> {
        let level = self.vix.level(at, &self.constants)?;
        Ok((
            size_multiplier(level, &self.constants),
            self.drawdown.size_multiplier(),
        ))
    }

    pub fn record_entry(&mut self, position_id: Uuid, underlying: &str) {
        self.correlation.register_open(position_id, underlying);
    }

    pub fn record_exit(&mut self, position_id: Uuid) {
        self.correlation.release(position_id);
    }

    /// The combined equity-exposure breach used by defensive exits.
    pub fn equity_breach(&self) -> bool {
        self.correlation.equity_exposure() > 3
    }

    pub fn activate_manual_mode(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        let activated = self.manual.activate(reason, at);
        if activated {
            self.journal.push(
                RiskEvent::new(
                    RiskEventKind::ManualModeActivated,
                    RiskLevel::Critical,
                    at,
                    "manual_mode",
                    format!("manual mode: {reason}"),
                )
                .with_payload(json!({"reason": reason})),
            );
        }
        activated
    }

    pub fn resume_automation(&mut self, operator: &str, at: DateTime<Utc>) {
        self.manual.resume(operator, at);
        self.journal.push(RiskEvent::new(
            RiskEventKind::ManualModeResumed,
            RiskLevel::Info,
            at,
            "manual_mode",
            format!("resumed by {operator}"),
        ));
    }

    /// Record an order failure; three inside the window activate manual mode.
    pub fn note_order_failure(&mut self, at: DateTime<Utc>) {
        if self.manual.note_order_failure(at) {
            self.activate_manual_mode("consecutive order failures", at);
        }
    }

    fn escalate_if_needed(&mut self, symbol: &str, at: DateTime<Utc>) {
        if self.freshness.should_escalate(symbol) {
            self.activate_manual_mode(&format!("persistent stale data for {symbol}"), at);
            self.freshness.reset(symbol);
        }
    }

    pub fn vix(&self) -> &VixGate {
        &self.vix
    }

    pub fn correlation(&self) -> &CorrelationLimiter {
        &self.correlation
    }

    pub fn correlation_mut(&mut self) -> &mut CorrelationLimiter {
        &mut self.correlation
    }

    pub fn drawdown(&self) -> &DrawdownMonitor {
        &self.drawdown
    }

    pub fn drawdown_mut(&mut self) -> &mut DrawdownMonitor {
        &mut self.drawdown
    }

    pub fn manual(&self) -> &ManualModeController {
        &self.manual
    }

    pub fn manual_mut(&mut self) -> &mut ManualModeController {
        &mut self.manual
    }

    pub fn freshness_mut(&mut self) -> &mut FreshnessValidator {
        &mut self.freshness
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut EventJournal {
        &mut self.journal
    }

    /// Journal a stale-data denial from a controller and escalate when the
    /// per-symbol streak reaches three.
    pub fn note_stale_denial(&mut self, symbol: &str, err: &ValidationError, at: DateTime<Utc>) {
        self.journal.push(
            RiskEvent::new(
                RiskEventKind::StaleData,
                RiskLevel::Critical,
                at,
                "freshness",
                err.to_string(),
            )
            .with_payload(json!({"symbol": symbol, "strikes": self.freshness.strikes(symbol)})),
        );
        self.escalate_if_needed(symbol, at);
    }
}
