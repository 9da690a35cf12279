//! Correlation-group concentration limiter.
//!
//! Underlyings are assigned to fixed groups of instruments that co-move in
//! crises. Per-group caps scale with account phase, shrink when volatility
//! regimes deteriorate, and combined equity-index plus equity-ETF exposure is
//! hard-capped after the August 2024 concentration loss.

use crate::domain::errors::ValidationError;
use crate::domain::risk::account_phase::AccountPhase;
use crate::domain::risk::vix_regime::VixRegime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrelationGroup {
    /// Equity index futures
    A1,
    /// Equity ETFs
    A2,
    /// Safe havens (gold, treasuries)
    B1,
    /// Industrial metals
    B2,
    /// Crude complex
    C1,
    /// Natural gas
    C2,
    /// Grains
    D1,
    /// Proteins
    D2,
    /// Currencies
    E,
}

impl CorrelationGroup {
    pub const ALL: [CorrelationGroup; 9] = [
        CorrelationGroup::A1,
        CorrelationGroup::A2,
        CorrelationGroup::B1,
        CorrelationGroup::B2,
        CorrelationGroup::C1,
        CorrelationGroup::C2,
        CorrelationGroup::D1,
        CorrelationGroup::D2,
        CorrelationGroup::E,
    ];

    pub fn is_equity(self) -> bool {
        matches!(self, CorrelationGroup::A1 | CorrelationGroup::A2)
    }
}

impl fmt::Display for CorrelationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CorrelationGroup::A1 => "A1",
            CorrelationGroup::A2 => "A2",
            CorrelationGroup::B1 => "B1",
            CorrelationGroup::B2 => "B2",
            CorrelationGroup::C1 => "C1",
            CorrelationGroup::C2 => "C2",
            CorrelationGroup::D1 => "D1",
            CorrelationGroup::D2 => "D2",
            CorrelationGroup::E => "E",
        };
        write!(f, "{s}")
    }
}

/// Fixed assignment of underlying symbols to groups. Unknown symbols are
/// blocked by default.
#[derive(Debug, Clone)]
pub struct CorrelationMap {
    by_symbol: HashMap<String, CorrelationGroup>,
}

impl CorrelationMap {
    pub fn builtin() -> Self {
        let groups: [(&[&str], CorrelationGroup); 9] = [
            (
                &["ES", "MES", "NQ", "MNQ", "RTY", "M2K", "YM", "MYM"],
                CorrelationGroup::A1,
            ),
            (&["SPY", "QQQ", "IWM", "DIA"], CorrelationGroup::A2),
            (
                &["GC", "MGC", "GLD", "TLT", "ZB", "ZN"],
                CorrelationGroup::B1,
            ),
            (
                &["SI", "SIL", "SLV", "HG", "PL", "PA"],
                CorrelationGroup::B2,
            ),
            (
                &["CL", "MCL", "QM", "RB", "HO", "XLE", "XOP"],
                CorrelationGroup::C1,
            ),
            (&["NG"], CorrelationGroup::C2),
            (&["ZC", "ZS", "ZW"], CorrelationGroup::D1),
            (&["LE", "HE", "GF"], CorrelationGroup::D2),
            (
                &["6E", "6B", "6A", "6C", "M6E", "M6A", "DXY"],
                CorrelationGroup::E,
            ),
        ];
        let mut by_symbol = HashMap::new();
        for (symbols, group) in groups {
            for s in symbols {
                by_symbol.insert((*s).to_string(), group);
            }
        }
        // IPMCC equities trade against ETF-like single names.
        for s in ["AAPL", "MSFT", "AMZN", "GOOGL"] {
            by_symbol.insert(s.to_string(), CorrelationGroup::A2);
        }
        Self { by_symbol }
    }

    pub fn group_of(&self, symbol: &str) -> Option<CorrelationGroup> {
        self.by_symbol.get(&symbol.to_uppercase()).copied()
    }
}

/// Per-group cap for an account phase before regime adjustment.
fn phase_cap(group: CorrelationGroup, phase: AccountPhase) -> usize {
    use CorrelationGroup::*;
    match phase {
        AccountPhase::Phase1 => match group {
            A2 => 2,
            _ => 1,
        },
        AccountPhase::Phase2 => match group {
            A1 | A2 | B1 | C1 | E => 2,
            _ => 1,
        },
        AccountPhase::Phase3 => match group {
            A2 => 3,
            A1 | B1 | B2 | C1 | D1 | E => 2,
            _ => 1,
        },
        AccountPhase::Phase4 => match group {
            A1 | A2 | C1 => 3,
            _ => 2,
        },
    }
}

/// Combined A1 + A2 position ceiling, independent of phase.
const EQUITY_EXPOSURE_CAP: usize = 3;

/// Single-use token authorizing one correlation bypass during an emergency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyToken(Uuid);

impl EmergencyToken {
    pub fn issue() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone)]
pub struct GroupDecision {
    pub allowed: bool,
    pub reason: String,
    pub group: Option<CorrelationGroup>,
    pub current: usize,
    pub cap: usize,
}

#[derive(Debug)]
pub struct CorrelationLimiter {
    map: CorrelationMap,
    open: HashMap<Uuid, (String, CorrelationGroup)>,
    bypass_attempts: Vec<DateTime<Utc>>,
    armed_token: Option<EmergencyToken>,
}

impl CorrelationLimiter {
    pub fn new(map: CorrelationMap) -> Self {
        Self {
            map,
            open: HashMap::new(),
            bypass_attempts: Vec::new(),
            armed_token: None,
        }
    }

    pub fn group_of(&self, symbol: &str) -> Option<CorrelationGroup> {
        self.map.group_of(symbol)
    }

    pub fn open_in_group(&self, group: CorrelationGroup) -> usize {
        self.open.values().filter(|(_, g)| *g == group).count()
    }

    /// Combined A1 + A2 position count.
    pub fn equity_exposure(&self) -> usize {
        self.open.values().filter(|(_, g)| g.is_equity()).count()
    }

    /// Position ids currently open in a group.
    pub fn positions_in_group(&self, group: CorrelationGroup) -> Vec<Uuid> {
        self.open
            .iter()
            .filter(|(_, (_, g))| *g == group)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Effective cap after the regime adjustment: above ELEVATED every cap
    /// loses one slot, floored at 1.
    pub fn cap(&self, group: CorrelationGroup, phase: AccountPhase, regime: VixRegime) -> usize {
        let base = phase_cap(group, phase);
        if regime > VixRegime::Elevated {
            base.saturating_sub(1).max(1)
        } else {
            base
        }
    }

    /// Whether one more position in `underlying` fits under the group and
    /// combined-equity caps. Unknown underlyings are denied with a warning.
    pub fn can_add(
        &self,
        underlying: &str,
        phase: AccountPhase,
        regime: VixRegime,
    ) -> GroupDecision {
        let Some(group) = self.map.group_of(underlying) else {
            warn!("correlation: unknown underlying {underlying}, blocking by default");
            return GroupDecision {
                allowed: false,
                reason: format!("Symbol {underlying} not in correlation groups - blocked"),
                group: None,
                current: 0,
                cap: 0,
            };
        };

        let current = self.open_in_group(group);
        let cap = self.cap(group, phase, regime);
        if current >= cap {
            return GroupDecision {
                allowed: false,
                reason: format!("Group {group} at limit"),
                group: Some(group),
                current,
                cap,
            };
        }

        if group.is_equity() {
            let equity = self.equity_exposure();
            if equity >= EQUITY_EXPOSURE_CAP {
                return GroupDecision {
                    allowed: false,
                    reason: "Total equity exposure at limit".to_string(),
                    group: Some(group),
                    current: equity,
                    cap: EQUITY_EXPOSURE_CAP,
                };
            }
        }

        GroupDecision {
            allowed: true,
            reason: format!("Allowed: {current}/{cap} in group {group}"),
            group: Some(group),
            current,
            cap,
        }
    }

    /// Validating wrapper over [`Self::can_add`].
    pub fn check(
        &self,
        underlying: &str,
        phase: AccountPhase,
        regime: VixRegime,
    ) -> Result<CorrelationGroup, ValidationError> {
        let decision = self.can_add(underlying, phase, regime);
        match (decision.allowed, decision.group) {
            (true, Some(group)) => Ok(group),
            (false, None) => Err(ValidationError::UnknownUnderlying {
                symbol: underlying.to_string(),
            }),
            (false, Some(group)) => {
                if decision.reason == "Total equity exposure at limit" {
                    Err(ValidationError::EquityExposureCap {
                        current: decision.current,
                        cap: decision.cap,
                    })
                } else {
                    Err(ValidationError::CorrelationCap {
                        group: group.to_string(),
                        current: decision.current,
                        cap: decision.cap,
                    })
                }
            }
            (true, None) => unreachable!("allowed decision always carries a group"),
        }
    }

    /// Arm a single-use emergency override. The next bypass consumes it.
    pub fn arm_emergency_override(&mut self, token: EmergencyToken) {
        self.armed_token = Some(token);
    }

    /// Bypass request: audited, and denied unless the presented token matches
    /// the armed one. A matching token is consumed on use.
    pub fn request_bypass(
        &mut self,
        underlying: &str,
        token: Option<&EmergencyToken>,
        at: DateTime<Utc>,
    ) -> bool {
        self.bypass_attempts.push(at);
        warn!("correlation: bypass attempted for {underlying}");

        match (token, self.armed_token.as_ref()) {
            (Some(presented), Some(armed)) if presented == armed => {
                self.armed_token = None;
                true
            }
            _ => false,
        }
    }

    pub fn bypass_attempts(&self) -> usize {
        self.bypass_attempts.len()
    }

    pub fn register_open(&mut self, position_id: Uuid, underlying: &str) {
        if let Some(group) = self.map.group_of(underlying) {
            debug!("correlation: registering {underlying} ({group}) for {position_id}");
            self.open.insert(position_id, (underlying.to_string(), group));
        }
    }

    pub fn release(&mut self, position_id: Uuid) {
        self.open.remove(&position_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter() -> CorrelationLimiter {
        CorrelationLimiter::new(CorrelationMap::builtin())
    }

    #[test]
    fn unknown_symbol_is_blocked() {
        let l = limiter();
        let d = l.can_add("ZZZT", AccountPhase::Phase4, VixRegime::Normal);
        assert!(!d.allowed);
        assert!(d.reason.contains("blocked"));
    }

    #[test]
    fn group_cap_enforced_by_phase() {
        let mut l = limiter();
        // Phase 1 allows a single A1 position.
        l.register_open(Uuid::new_v4(), "ES");
        let d = l.can_add("MES", AccountPhase::Phase1, VixRegime::Normal);
        assert!(!d.allowed);
        assert_eq!(d.reason, "Group A1 at limit");

        // Phase 4 allows up to three.
        let d = l.can_add("MES", AccountPhase::Phase4, VixRegime::Normal);
        assert!(d.allowed);
    }

    #[test]
    fn combined_equity_exposure_capped_at_three() {
        let mut l = limiter();
        l.register_open(Uuid::new_v4(), "SPY");
        l.register_open(Uuid::new_v4(), "SPY");
        l.register_open(Uuid::new_v4(), "MES");
        let d = l.can_add("QQQ", AccountPhase::Phase4, VixRegime::Normal);
        assert!(!d.allowed);
        assert_eq!(d.reason, "Total equity exposure at limit");

        // A non-equity group is unaffected.
        let d = l.can_add("GC", AccountPhase::Phase4, VixRegime::Normal);
        assert!(d.allowed);
    }

    #[test]
    fn caps_shrink_above_elevated_regime() {
        let l = limiter();
        assert_eq!(
            l.cap(CorrelationGroup::A2, AccountPhase::Phase3, VixRegime::Normal),
            3
        );
        assert_eq!(
            l.cap(CorrelationGroup::A2, AccountPhase::Phase3, VixRegime::High),
            2
        );
        // Floor of one slot.
        assert_eq!(
            l.cap(CorrelationGroup::C2, AccountPhase::Phase1, VixRegime::Crisis),
            1
        );
    }

    #[test]
    fn release_frees_a_slot() {
        let mut l = limiter();
        let id = Uuid::new_v4();
        l.register_open(id, "NG");
        assert!(
            !l.can_add("NG", AccountPhase::Phase1, VixRegime::Normal)
                .allowed
        );
        l.release(id);
        assert!(
            l.can_add("NG", AccountPhase::Phase1, VixRegime::Normal)
                .allowed
        );
    }

    #[test]
    fn emergency_token_is_consumed_on_use() {
        let mut l = limiter();
        let at = Utc.with_ymd_and_hms(2026, 8, 4, 14, 0, 0).unwrap();
        let token = EmergencyToken::issue();
        l.arm_emergency_override(token.clone());

        assert!(l.request_bypass("SPY", Some(&token), at));
        // Second use of the same token is denied.
        assert!(!l.request_bypass("SPY", Some(&token), at));
        assert_eq!(l.bypass_attempts(), 2);
    }

    #[test]
    fn bypass_without_token_is_denied_and_audited() {
        let mut l = limiter();
        let at = Utc.with_ymd_and_hms(2026, 8, 4, 14, 0, 0).unwrap();
        assert!(!l.request_bypass("SPY", None, at));
        assert_eq!(l.bypass_attempts(), 1);
    }
}
