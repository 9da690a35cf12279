//! Manual-mode fallback.
//!
//! When automation can no longer be trusted — repeated order failures, a
//! crisis-level volatility print, a breached portfolio delta limit, the
//! circuit breaker, or an operator request — the engine stops executing and
//! starts suggesting. Intended trades are logged, never placed, until an
//! operator explicitly resumes.

use crate::domain::trading::position::StrategyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSuggestion {
    pub at: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub underlying: String,
    pub contracts: u32,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualActivation {
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug)]
pub struct ManualModeController {
    active: bool,
    reason: Option<String>,
    failure_times: VecDeque<DateTime<Utc>>,
    failure_threshold: usize,
    failure_window: Duration,
    suggestions: VecDeque<TradeSuggestion>,
    activations: Vec<ManualActivation>,
}

impl ManualModeController {
    pub fn new(failure_threshold: usize, failure_window: Duration) -> Self {
        Self {
            active: false,
            reason: None,
            failure_times: VecDeque::new(),
            failure_threshold,
            failure_window,
            suggestions: VecDeque::new(),
            activations: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Record an order failure. Returns true when the threshold (N failures
    /// inside the rolling window) was just crossed; the caller activates.
    pub fn note_order_failure(&mut self, at: DateTime<Utc>) -> bool {
        self.failure_times.push_back(at);
        let window_secs = self.failure_window.as_secs() as i64;
        while let Some(first) = self.failure_times.front() {
            if at.signed_duration_since(*first).num_seconds() > window_secs {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
        self.failure_times.len() >= self.failure_threshold
    }

    /// Activate manual mode. Idempotent; the first reason wins until resume.
    pub fn activate(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.reason = Some(reason.to_string());
        self.activations.push(ManualActivation {
            at,
            reason: reason.to_string(),
        });
        error!(
            reason,
            "MANUAL MODE ACTIVATED: automated trading suspended, trades will be logged as suggestions"
        );
        true
    }

    /// Operator resume. Clears the failure window.
    pub fn resume(&mut self, operator: &str, at: DateTime<Utc>) {
        if !self.active {
            return;
        }
        self.active = false;
        self.reason = None;
        self.failure_times.clear();
        info!(operator, %at, "manual mode resumed by operator");
    }

    /// Log an intended trade instead of placing it.
    pub fn log_suggestion(&mut self, suggestion: TradeSuggestion) {
        info!(
            strategy = %suggestion.strategy,
            underlying = %suggestion.underlying,
            contracts = suggestion.contracts,
            "MANUAL TRADE SUGGESTION: {}",
            suggestion.summary
        );
        if self.suggestions.len() == 256 {
            self.suggestions.pop_front();
        }
        self.suggestions.push_back(suggestion);
    }

    pub fn suggestions(&self) -> impl Iterator<Item = &TradeSuggestion> {
        self.suggestions.iter()
    }

    pub fn activations(&self) -> &[ManualActivation] {
        &self.activations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 4, 14, 0, 0).unwrap() + chrono::Duration::minutes(min)
    }

    fn controller() -> ManualModeController {
        ManualModeController::new(3, Duration::from_secs(30 * 60))
    }

    #[test]
    fn three_failures_in_window_cross_threshold() {
        let mut m = controller();
        assert!(!m.note_order_failure(at(0)));
        assert!(!m.note_order_failure(at(5)));
        assert!(m.note_order_failure(at(10)));
    }

    #[test]
    fn failures_outside_window_age_out() {
        let mut m = controller();
        assert!(!m.note_order_failure(at(0)));
        assert!(!m.note_order_failure(at(5)));
        // 40 minutes later the first two have aged out.
        assert!(!m.note_order_failure(at(45)));
    }

    #[test]
    fn activation_is_idempotent_and_resumable() {
        let mut m = controller();
        assert!(m.activate("order failures", at(0)));
        assert!(!m.activate("second reason", at(1)));
        assert_eq!(m.reason(), Some("order failures"));

        m.resume("operator", at(2));
        assert!(!m.is_active());
        assert!(m.activate("again", at(3)));
        assert_eq!(m.activations().len(), 2);
    }

    #[test]
    fn suggestions_are_bounded() {
        let mut m = controller();
        m.activate("test", at(0));
        for i in 0..300 {
            m.log_suggestion(TradeSuggestion {
                at: at(i),
                strategy: StrategyKind::ZeroDte,
                underlying: "SPY".to_string(),
                contracts: 1,
                summary: format!("suggestion {i}"),
            });
        }
        assert_eq!(m.suggestions().count(), 256);
    }
}
