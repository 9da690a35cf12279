//! Coordinated exit rules.
//!
//! For each open position on each bar the rules evaluate in fixed order:
//! profit target, stop loss, the 21 DTE defensive rule, time-of-day (0DTE
//! only), then the defensive conditions. The first matching rule wins.
//! Profit and stop are computed from the credit actually received at entry.

use crate::config::Constants;
use crate::domain::market::calendar::is_at_or_after;
use crate::domain::trading::lifecycle::TransitionTrigger;
use crate::domain::trading::position::{LegRole, Position, StrategyKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Close,
    Roll,
}

/// Which part of the structure the action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitScope {
    Full,
    /// LT112 naked puts, managed independently of the spread.
    NakedPuts,
    /// LT112 debit spread, managed independently of the naked puts.
    DebitSpread,
    /// IPMCC weekly short call.
    ShortCall,
}

impl ExitScope {
    pub fn roles(self) -> &'static [LegRole] {
        match self {
            ExitScope::Full => &[],
            ExitScope::NakedPuts => &[LegRole::NakedPut],
            ExitScope::DebitSpread => &[LegRole::SpreadLong, LegRole::SpreadShort],
            ExitScope::ShortCall => &[LegRole::WeeklyCall],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub scope: ExitScope,
    pub reason: String,
    /// Defensive closes bypass limit-price waiting.
    pub market_order: bool,
    /// Lifecycle trigger recorded on the position's machine.
    pub trigger: TransitionTrigger,
}

/// Portfolio-level conditions feeding the defensive rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefensiveContext {
    pub vix: Option<f64>,
    pub margin_utilization: f64,
}

pub struct ExitRuleEngine {
    constants: Arc<Constants>,
}

impl ExitRuleEngine {
    pub fn new(constants: Arc<Constants>) -> Self {
        Self { constants }
    }

    pub fn evaluate(
        &self,
        position: &Position,
        now: DateTime<Utc>,
        defensive: &DefensiveContext,
        tightened_target: Option<f64>,
    ) -> Option<ExitDecision> {
        if let Some(d) = self.profit_target(position, tightened_target) {
            return Some(d);
        }
        if let Some(d) = self.stop_loss(position) {
            return Some(d);
        }
        if let Some(d) = self.dte_rule(position, now) {
            return Some(d);
        }
        if let Some(d) = self.time_exit(position, now) {
            return Some(d);
        }
        self.defensive(position, defensive)
    }

    fn profit_target(
        &self,
        position: &Position,
        tightened_target: Option<f64>,
    ) -> Option<ExitDecision> {
        let base_target = self.constants.profit_target(position.strategy);
        let target = tightened_target.map_or(base_target, |t| t.min(base_target));

        match position.strategy {
            StrategyKind::Lt112 => {
                // Components are managed independently: naked puts at 90%,
                // the debit spread at 50%.
                if position.has_role(LegRole::NakedPut) {
                    let naked = position.component_profit_fraction(&[LegRole::NakedPut]);
                    if naked.is_some_and(|p| p >= 0.90) {
                        return Some(ExitDecision {
                            action: ExitAction::Close,
                            scope: ExitScope::NakedPuts,
                            reason: "naked puts at 90% profit".to_string(),
                            market_order: false,
                            trigger: TransitionTrigger::ProfitTargetHit,
                        });
                    }
                }
                if position.has_role(LegRole::SpreadLong) {
                    let spread = position
                        .component_profit_fraction(&[LegRole::SpreadLong, LegRole::SpreadShort]);
                    if spread.is_some_and(|p| p >= target) {
                        return Some(ExitDecision {
                            action: ExitAction::Close,
                            scope: ExitScope::DebitSpread,
                            reason: format!("debit spread at {:.0}% profit", target * 100.0),
                            market_order: false,
                            trigger: TransitionTrigger::ProfitTargetHit,
                        });
                    }
                }
                None
            }
            StrategyKind::Ipmcc => {
                if position.has_role(LegRole::WeeklyCall) {
                    let short = position.component_profit_fraction(&[LegRole::WeeklyCall]);
                    if short.is_some_and(|p| p >= target) {
                        return Some(ExitDecision {
                            action: ExitAction::Close,
                            scope: ExitScope::ShortCall,
                            reason: format!("short call at {:.0}% profit", target * 100.0),
                            market_order: false,
                            trigger: TransitionTrigger::ProfitTargetHit,
                        });
                    }
                }
                None
            }
            _ => {
                let profit = position.profit_fraction()?;
                (profit >= target).then(|| ExitDecision {
                    action: ExitAction::Close,
                    scope: ExitScope::Full,
                    reason: format!(
                        "profit target {:.0}% hit ({:.1}%)",
                        target * 100.0,
                        profit * 100.0
                    ),
                    market_order: false,
                    trigger: TransitionTrigger::ProfitTargetHit,
                })
            }
        }
    }

    fn stop_loss(&self, position: &Position) -> Option<ExitDecision> {
        if position.strategy == StrategyKind::Lt112 {
            // Either component reaching a 200% loss forces the full position
            // closed.
            for (roles, name) in [
                (&[LegRole::NakedPut][..], "naked puts"),
                (&[LegRole::SpreadLong, LegRole::SpreadShort][..], "debit spread"),
            ] {
                let entry = position.component_entry_cash(roles);
                if entry == Decimal::ZERO {
                    continue;
                }
                let pnl = position.component_pnl(roles);
                if pnl < Decimal::ZERO {
                    let loss = (-pnl / entry.abs()).to_f64().unwrap_or(0.0);
                    if loss >= 2.0 {
                        return Some(ExitDecision {
                            action: ExitAction::Close,
                            scope: ExitScope::Full,
                            reason: format!("{name} at {:.0}% loss, closing full position", loss * 100.0),
                            market_order: false,
                            trigger: TransitionTrigger::StopLossHit,
                        });
                    }
                }
            }
            return None;
        }

        let multiple = self.constants.stop_loss_multiple(position.strategy)?;
        let loss = position.loss_fraction()?;
        (loss >= multiple).then(|| ExitDecision {
            action: ExitAction::Close,
            scope: ExitScope::Full,
            reason: format!(
                "stop loss at {multiple}x credit hit ({:.0}% loss)",
                loss * 100.0
            ),
            market_order: false,
            trigger: TransitionTrigger::StopLossHit,
        })
    }

    /// The 21 calendar-day defensive rule, regardless of profit status.
    /// Same-day structures and the put ladder are exempt; the covered-call
    /// structure rolls its short call instead of closing.
    fn dte_rule(&self, position: &Position, now: DateTime<Utc>) -> Option<ExitDecision> {
        if position.strategy.exempt_from_dte_rule() {
            // Ladder rungs still roll forward when they get short-dated.
            if position.strategy == StrategyKind::LeapLadder {
                let dte = position.dte(now)?;
                if dte <= self.constants.leap_roll_dte {
                    return Some(ExitDecision {
                        action: ExitAction::Roll,
                        scope: ExitScope::Full,
                        reason: format!("ladder rung at {dte} DTE, rolling forward"),
                        market_order: false,
                        trigger: TransitionTrigger::DefensiveExitDte,
                    });
                }
            }
            return None;
        }

        let dte = position.dte(now)?;
        if dte > self.constants.defensive_exit_dte {
            return None;
        }

        if position.strategy == StrategyKind::Ipmcc {
            return Some(ExitDecision {
                action: ExitAction::Roll,
                scope: ExitScope::ShortCall,
                reason: format!("short call at {dte} DTE, rolling"),
                market_order: false,
                trigger: TransitionTrigger::DefensiveExitDte,
            });
        }
        Some(ExitDecision {
            action: ExitAction::Close,
            scope: ExitScope::Full,
            reason: format!("{dte} DTE defensive rule"),
            market_order: false,
            trigger: TransitionTrigger::DefensiveExitDte,
        })
    }

    /// 0DTE time exits: 15:00 ET normal, 15:30 ET defensive with market
    /// orders.
    fn time_exit(&self, position: &Position, now: DateTime<Utc>) -> Option<ExitDecision> {
        if position.strategy != StrategyKind::ZeroDte {
            return None;
        }
        if is_at_or_after(now, 15, 30) {
            return Some(ExitDecision {
                action: ExitAction::Close,
                scope: ExitScope::Full,
                reason: "15:30 ET defensive exit".to_string(),
                market_order: true,
                trigger: TransitionTrigger::DefensiveExitDte,
            });
        }
        if is_at_or_after(now, 15, 0) {
            return Some(ExitDecision {
                action: ExitAction::Close,
                scope: ExitScope::Full,
                reason: "15:00 ET time exit".to_string(),
                market_order: false,
                trigger: TransitionTrigger::DefensiveExitDte,
            });
        }
        None
    }

    fn defensive(
        &self,
        position: &Position,
        ctx: &DefensiveContext,
    ) -> Option<ExitDecision> {
        let vix = ctx.vix.unwrap_or(0.0);

        // Volatility spike against a short strangle already deep underwater.
        if vix > self.constants.vix_high
            && position.strategy == StrategyKind::FuturesStrangle
            && position.loss_fraction().is_some_and(|l| l > 2.0)
        {
            info!(position = %position.id, "defensive strangle exit: VIX {vix:.1}");
            return Some(ExitDecision {
                action: ExitAction::Close,
                scope: ExitScope::Full,
                reason: format!("VIX {vix:.1} with strangle loss above 200%"),
                market_order: true,
                trigger: TransitionTrigger::VixSpike,
            });
        }

        // Margin pressure: shed losers first.
        if ctx.margin_utilization > self.constants.margin_pressure_utilization
            && position.unrealized_pnl() < Decimal::ZERO
        {
            return Some(ExitDecision {
                action: ExitAction::Close,
                scope: ExitScope::Full,
                reason: format!(
                    "margin utilization {:.0}% with losing position",
                    ctx.margin_utilization * 100.0
                ),
                market_order: true,
                trigger: TransitionTrigger::MarginCall,
            });
        }

        // Crisis: every premium seller goes, the protective ladder stays.
        if vix > self.constants.vix_crisis && position.strategy.is_premium_selling() {
            return Some(ExitDecision {
                action: ExitAction::Close,
                scope: ExitScope::Full,
                reason: format!("VIX {vix:.1} crisis exit"),
                market_order: true,
                trigger: TransitionTrigger::EmergencyExit,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::instrument::{Instrument, OptionRight};
    use crate::domain::risk::correlation::CorrelationGroup;
    use crate::domain::trading::lifecycle::StrategyMachine;
    use crate::domain::trading::position::FilledLeg;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use uuid::Uuid;

    fn engine() -> ExitRuleEngine {
        ExitRuleEngine::new(Arc::new(Constants::default()))
    }

    fn at_et(h: u32, m: u32) -> DateTime<Utc> {
        // EDT: ET + 4h.
        Utc.with_ymd_and_hms(2026, 8, 7, h + 4, m, 0).unwrap()
    }

    fn credit_position(strategy: StrategyKind, dte_days: i64, mark_ratio: Decimal) -> Position {
        let now = at_et(11, 0);
        let expiry = now.date_naive() + chrono::Duration::days(dte_days);
        let entry = dec!(2.00);
        let legs = vec![
            FilledLeg {
                role: LegRole::ShortCall,
                instrument: Instrument::equity_option("SPY", expiry, dec!(480), OptionRight::Call),
                quantity: -1,
                entry_price: entry,
                mark: Some(entry * mark_ratio),
            },
            FilledLeg {
                role: LegRole::ShortPut,
                instrument: Instrument::equity_option("SPY", expiry, dec!(420), OptionRight::Put),
                quantity: -1,
                entry_price: entry,
                mark: Some(entry * mark_ratio),
            },
        ];
        let entry_cash = legs.iter().map(FilledLeg::entry_cash).sum();
        Position {
            id: Uuid::new_v4(),
            strategy,
            underlying: "SPY".to_string(),
            group: CorrelationGroup::A2,
            opened_at: now,
            contracts: 1,
            legs,
            entry_cash,
            margin_requirement: dec!(9000),
            order_group_id: 1,
            machine: StrategyMachine::new("test", 1000, Duration::from_secs(1800)),
        }
    }

    #[test]
    fn profit_target_fires_first() {
        let e = engine();
        // Marks at half of entry: 50% of credit captured.
        let p = credit_position(StrategyKind::FuturesStrangle, 60, dec!(0.5));
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert_eq!(d.action, ExitAction::Close);
        assert_eq!(d.scope, ExitScope::Full);
        assert!(d.reason.contains("profit target"));
    }

    #[test]
    fn tightened_targets_fire_earlier() {
        let e = engine();
        // 30% captured: below the 50% target but above a tightened 25%.
        let p = credit_position(StrategyKind::FuturesStrangle, 60, dec!(0.7));
        assert!(
            e.evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
                .is_none()
        );
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), Some(0.25))
            .unwrap();
        assert!(d.reason.contains("25%"));
    }

    #[test]
    fn stop_loss_uses_entry_credit_multiple() {
        let e = engine();
        // Strangle stop is 2.5x: marks at 3.5x entry = 250% loss.
        let p = credit_position(StrategyKind::FuturesStrangle, 60, dec!(3.5));
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert!(d.reason.contains("stop loss"));
    }

    #[test]
    fn dte_rule_closes_at_21_calendar_days() {
        let e = engine();
        let p = credit_position(StrategyKind::FuturesStrangle, 21, dec!(0.9));
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert!(d.reason.contains("21 DTE"));

        let p = credit_position(StrategyKind::FuturesStrangle, 22, dec!(0.9));
        assert!(
            e.evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
                .is_none()
        );
    }

    #[test]
    fn zero_dte_is_exempt_from_dte_rule_but_has_time_exits() {
        let e = engine();
        let p = credit_position(StrategyKind::ZeroDte, 0, dec!(0.9));
        assert!(
            e.evaluate(&p, at_et(14, 59), &DefensiveContext::default(), None)
                .is_none()
        );
        let d = e
            .evaluate(&p, at_et(15, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert!(!d.market_order);
        let d = e
            .evaluate(&p, at_et(15, 30), &DefensiveContext::default(), None)
            .unwrap();
        assert!(d.market_order);
    }

    #[test]
    fn vix_spike_closes_underwater_strangles_with_market_orders() {
        let e = engine();
        let p = credit_position(StrategyKind::FuturesStrangle, 60, dec!(3.2));
        // 220% loss, below the 2.5x stop, but VIX is spiking.
        let ctx = DefensiveContext {
            vix: Some(32.0),
            margin_utilization: 0.3,
        };
        let d = e.evaluate(&p, at_et(11, 0), &ctx, None).unwrap();
        assert!(d.market_order);
        assert!(d.reason.contains("VIX"));
    }

    #[test]
    fn crisis_vix_closes_premium_sellers_only() {
        let e = engine();
        let ctx = DefensiveContext {
            vix: Some(55.0),
            margin_utilization: 0.3,
        };
        let p = credit_position(StrategyKind::Lt112, 60, dec!(1.0));
        // LT112 with component roles absent falls through to defensive.
        let d = e.evaluate(&p, at_et(11, 0), &ctx, None).unwrap();
        assert!(d.reason.contains("crisis"));

        // The ladder holds.
        let mut ladder = credit_position(StrategyKind::LeapLadder, 400, dec!(1.0));
        ladder.legs[0].quantity = 1;
        ladder.legs[1].quantity = 1;
        ladder.entry_cash = ladder.legs.iter().map(FilledLeg::entry_cash).sum();
        assert!(e.evaluate(&ladder, at_et(11, 0), &ctx, None).is_none());
    }

    #[test]
    fn margin_pressure_sheds_losers() {
        let e = engine();
        let ctx = DefensiveContext {
            vix: Some(18.0),
            margin_utilization: 0.9,
        };
        let losing = credit_position(StrategyKind::FuturesStrangle, 60, dec!(1.5));
        let d = e.evaluate(&losing, at_et(11, 0), &ctx, None).unwrap();
        assert!(d.reason.contains("margin"));

        let winning = credit_position(StrategyKind::FuturesStrangle, 60, dec!(0.8));
        assert!(e.evaluate(&winning, at_et(11, 0), &ctx, None).is_none());
    }

    fn lt112_position(naked_mark: Decimal, spread_ratio: Decimal) -> Position {
        let now = at_et(11, 0);
        let expiry = now.date_naive() + chrono::Duration::days(100);
        let legs = vec![
            FilledLeg {
                role: LegRole::NakedPut,
                instrument: Instrument::equity_option("SPY", expiry, dec!(428), OptionRight::Put),
                quantity: -1,
                entry_price: dec!(3.00),
                mark: Some(naked_mark),
            },
            FilledLeg {
                role: LegRole::NakedPut,
                instrument: Instrument::equity_option("SPY", expiry, dec!(405), OptionRight::Put),
                quantity: -1,
                entry_price: dec!(2.00),
                mark: Some(naked_mark),
            },
            FilledLeg {
                role: LegRole::SpreadLong,
                instrument: Instrument::equity_option("SPY", expiry, dec!(441), OptionRight::Put),
                quantity: 1,
                entry_price: dec!(5.00),
                mark: Some(dec!(5.00) * spread_ratio),
            },
            FilledLeg {
                role: LegRole::SpreadShort,
                instrument: Instrument::equity_option("SPY", expiry, dec!(428), OptionRight::Put),
                quantity: -1,
                entry_price: dec!(3.00),
                mark: Some(dec!(3.00) * spread_ratio),
            },
        ];
        let entry_cash = legs.iter().map(FilledLeg::entry_cash).sum();
        let mut p = credit_position(StrategyKind::Lt112, 100, dec!(1.0));
        p.legs = legs;
        p.entry_cash = entry_cash;
        p
    }

    #[test]
    fn lt112_naked_puts_close_alone_at_ninety_percent() {
        let e = engine();
        let p = lt112_position(dec!(0.20), dec!(1.0));
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert_eq!(d.scope, ExitScope::NakedPuts);
    }

    #[test]
    fn lt112_component_blowout_closes_everything() {
        let e = engine();
        // Naked puts at 3.2x entry: > 200% component loss.
        let p = lt112_position(dec!(8.00), dec!(1.0));
        let d = e
            .evaluate(&p, at_et(11, 0), &DefensiveContext::default(), None)
            .unwrap();
        assert_eq!(d.scope, ExitScope::Full);
        assert!(d.reason.contains("loss"));
    }

    #[test]
    fn ipmcc_rolls_short_call_at_dte() {
        let e = engine();
        let now = at_et(11, 0);
        let weekly_expiry = now.date_naive() + chrono::Duration::days(18);
        let leap_expiry = now.date_naive() + chrono::Duration::days(500);
        let legs = vec![
            FilledLeg {
                role: LegRole::LeapCall,
                instrument: Instrument::equity_option(
                    "AAPL",
                    leap_expiry,
                    dec!(150),
                    OptionRight::Call,
                ),
                quantity: 1,
                entry_price: dec!(60.00),
                mark: Some(dec!(60.00)),
            },
            FilledLeg {
                role: LegRole::WeeklyCall,
                instrument: Instrument::equity_option(
                    "AAPL",
                    weekly_expiry,
                    dec!(210),
                    OptionRight::Call,
                ),
                quantity: -1,
                entry_price: dec!(2.50),
                mark: Some(dec!(2.00)),
            },
        ];
        let mut p = credit_position(StrategyKind::Ipmcc, 500, dec!(1.0));
        p.underlying = "AAPL".to_string();
        p.entry_cash = legs.iter().map(FilledLeg::entry_cash).sum();
        p.legs = legs;

        let d = e
            .evaluate(&p, now, &DefensiveContext::default(), None)
            .unwrap();
        assert_eq!(d.action, ExitAction::Roll);
        assert_eq!(d.scope, ExitScope::ShortCall);
    }
}
