//! Per-position lifecycle state machine.
//!
//! Each open position is driven through a fixed set of states with validated
//! transitions. Attempting a transition not in the table fails silently with
//! a log record and never corrupts state. Every accepted transition is
//! recorded in a bounded history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Initializing,
    Ready,
    Analyzing,
    PendingEntry,
    Entering,
    PositionOpen,
    Managing,
    Adjusting,
    PendingExit,
    Exiting,
    PartialExit,
    Closed,
    Error,
    Suspended,
    Terminated,
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyState::Initializing => "INITIALIZING",
            StrategyState::Ready => "READY",
            StrategyState::Analyzing => "ANALYZING",
            StrategyState::PendingEntry => "PENDING_ENTRY",
            StrategyState::Entering => "ENTERING",
            StrategyState::PositionOpen => "POSITION_OPEN",
            StrategyState::Managing => "MANAGING",
            StrategyState::Adjusting => "ADJUSTING",
            StrategyState::PendingExit => "PENDING_EXIT",
            StrategyState::Exiting => "EXITING",
            StrategyState::PartialExit => "PARTIAL_EXIT",
            StrategyState::Closed => "CLOSED",
            StrategyState::Error => "ERROR",
            StrategyState::Suspended => "SUSPENDED",
            StrategyState::Terminated => "TERMINATED",
        };
        write!(f, "{s}")
    }
}

impl StrategyState {
    /// The static transition table. TERMINATED is a sink.
    pub fn valid_transitions(self) -> &'static [StrategyState] {
        use StrategyState::*;
        match self {
            Initializing => &[Ready, Error],
            Ready => &[Analyzing, Suspended, Error],
            Analyzing => &[PendingEntry, Ready, Error],
            PendingEntry => &[Entering, Ready, Suspended, Error],
            Entering => &[PositionOpen, Error],
            PositionOpen => &[Managing, PendingExit, Error],
            Managing => &[Adjusting, PendingExit, Error],
            Adjusting => &[Managing, PendingExit, Error],
            PendingExit => &[Exiting, PartialExit, Error],
            Exiting => &[Closed, PartialExit, Error],
            PartialExit => &[Managing, Exiting, Error],
            Closed => &[Ready, Terminated],
            Error => &[Ready, Terminated],
            Suspended => &[Ready, Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition(self, to: StrategyState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self == StrategyState::Terminated
    }

    /// States in which the position holds live legs.
    pub fn holds_legs(self) -> bool {
        use StrategyState::*;
        matches!(
            self,
            PositionOpen | Managing | Adjusting | PendingExit | Exiting | PartialExit
        )
    }
}

/// Closed set of transition reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTrigger {
    MarketOpen,
    EntryConditionsMet,
    OrderFilled,
    OrderRejected,
    PartialFill,
    ProfitTargetHit,
    StopLossHit,
    DefensiveExitDte,
    AdjustmentNeeded,
    MarginCall,
    VixSpike,
    EmergencyExit,
    ManualOverride,
    SystemError,
    DataStale,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub from: StrategyState,
    pub to: StrategyState,
    pub trigger: TransitionTrigger,
    pub payload: Value,
}

/// Persisted machine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub schema_version: u32,
    pub state: StrategyState,
    pub history: Vec<TransitionRecord>,
    pub error_count: u32,
    pub error_entered_at: Option<DateTime<Utc>>,
}

const MAX_CALLBACK_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct StrategyMachine {
    label: String,
    state: StrategyState,
    history: VecDeque<TransitionRecord>,
    history_cap: usize,
    error_count: u32,
    error_entered_at: Option<DateTime<Utc>>,
    recovery_timeout: Duration,
}

impl StrategyMachine {
    pub fn new(label: impl Into<String>, history_cap: usize, recovery_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            state: StrategyState::Initializing,
            history: VecDeque::new(),
            history_cap,
            error_count: 0,
            error_entered_at: None,
            recovery_timeout,
        }
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Attempt a transition. Invalid transitions are logged and refused; the
    /// current state is never corrupted.
    pub fn transition(
        &mut self,
        to: StrategyState,
        trigger: TransitionTrigger,
        at: DateTime<Utc>,
    ) -> bool {
        self.transition_with(to, trigger, Value::Null, at)
    }

    pub fn transition_with(
        &mut self,
        to: StrategyState,
        trigger: TransitionTrigger,
        payload: Value,
        at: DateTime<Utc>,
    ) -> bool {
        if !self.state.can_transition(to) {
            debug!(
                machine = %self.label,
                "invalid transition {} -> {} (trigger {:?}), ignored",
                self.state,
                to,
                trigger
            );
            return false;
        }

        let record = TransitionRecord {
            at,
            from: self.state,
            to,
            trigger,
            payload,
        };
        self.state = to;
        if to == StrategyState::Error {
            self.error_entered_at = Some(at);
        }
        self.record(record);

        debug!(machine = %self.label, "{} -> {} ({:?})",
            self.history.back().map(|r| r.from).unwrap_or(self.state),
            self.state, trigger);
        true
    }

    fn record(&mut self, record: TransitionRecord) {
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Note a failed enter/exit handler. Three consecutive failures force the
    /// machine into ERROR regardless of the current state.
    pub fn note_callback_failure(&mut self, at: DateTime<Utc>) {
        self.error_count += 1;
        warn!(
            machine = %self.label,
            "handler failure {}/{MAX_CALLBACK_ERRORS}", self.error_count
        );
        if self.error_count >= MAX_CALLBACK_ERRORS && self.state != StrategyState::Error {
            self.force_error(at);
        }
    }

    pub fn note_callback_success(&mut self) {
        self.error_count = 0;
    }

    /// Force the ERROR state outside the transition table. Used only by the
    /// fault handler; recorded like any other transition.
    pub fn force_error(&mut self, at: DateTime<Utc>) {
        error!(machine = %self.label, "forced into ERROR after repeated failures");
        let record = TransitionRecord {
            at,
            from: self.state,
            to: StrategyState::Error,
            trigger: TransitionTrigger::SystemError,
            payload: Value::Null,
        };
        self.state = StrategyState::Error;
        self.error_entered_at = Some(at);
        self.record(record);
    }

    /// Auto-recover from ERROR to READY once the wall-clock timeout elapsed.
    /// Returns true when recovery happened; the error count resets.
    pub fn try_auto_recover(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != StrategyState::Error {
            return false;
        }
        let Some(entered) = self.error_entered_at else {
            return false;
        };
        let elapsed = now.signed_duration_since(entered);
        if elapsed.num_seconds() < self.recovery_timeout.as_secs() as i64 {
            return false;
        }
        if self.transition(StrategyState::Ready, TransitionTrigger::Reset, now) {
            self.error_count = 0;
            self.error_entered_at = None;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            schema_version: 1,
            state: self.state,
            history: self.history.iter().cloned().collect(),
            error_count: self.error_count,
            error_entered_at: self.error_entered_at,
        }
    }

    pub fn restore(
        label: impl Into<String>,
        snapshot: MachineSnapshot,
        history_cap: usize,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            state: snapshot.state,
            history: snapshot.history.into(),
            history_cap,
            error_count: snapshot.error_count,
            error_entered_at: snapshot.error_entered_at,
            recovery_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 4, 14, min, 0).unwrap()
    }

    fn machine() -> StrategyMachine {
        StrategyMachine::new("test", 1000, Duration::from_secs(30 * 60))
    }

    #[test]
    fn happy_path_to_open() {
        let mut m = machine();
        assert!(m.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at(0)));
        assert!(m.transition(
            StrategyState::Analyzing,
            TransitionTrigger::EntryConditionsMet,
            at(1)
        ));
        assert!(m.transition(
            StrategyState::PendingEntry,
            TransitionTrigger::EntryConditionsMet,
            at(2)
        ));
        assert!(m.transition(
            StrategyState::Entering,
            TransitionTrigger::EntryConditionsMet,
            at(3)
        ));
        assert!(m.transition(
            StrategyState::PositionOpen,
            TransitionTrigger::OrderFilled,
            at(4)
        ));
        assert_eq!(m.state(), StrategyState::PositionOpen);
        assert_eq!(m.history().count(), 5);
    }

    #[test]
    fn invalid_transition_is_refused_without_corruption() {
        let mut m = machine();
        assert!(!m.transition(
            StrategyState::PositionOpen,
            TransitionTrigger::OrderFilled,
            at(0)
        ));
        assert_eq!(m.state(), StrategyState::Initializing);
        assert_eq!(m.history().count(), 0);
    }

    #[test]
    fn observed_pairs_stay_within_the_table() {
        let mut m = machine();
        // Throw a mix of valid and invalid requests at the machine.
        let attempts = [
            (StrategyState::Ready, TransitionTrigger::MarketOpen),
            (StrategyState::Exiting, TransitionTrigger::StopLossHit),
            (StrategyState::Analyzing, TransitionTrigger::EntryConditionsMet),
            (StrategyState::Terminated, TransitionTrigger::Reset),
            (StrategyState::Ready, TransitionTrigger::Reset),
            (StrategyState::Suspended, TransitionTrigger::ManualOverride),
        ];
        for (i, (to, trigger)) in attempts.into_iter().enumerate() {
            let _ = m.transition(to, trigger, at(i as u32));
        }
        for record in m.history() {
            assert!(record.from.can_transition(record.to));
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut m = StrategyMachine::new("bounded", 4, Duration::from_secs(60));
        // Ping-pong between READY and ANALYZING.
        m.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at(0));
        for i in 0..10 {
            m.transition(
                StrategyState::Analyzing,
                TransitionTrigger::EntryConditionsMet,
                at(i),
            );
            m.transition(StrategyState::Ready, TransitionTrigger::Reset, at(i));
        }
        assert_eq!(m.history().count(), 4);
    }

    #[test]
    fn three_callback_failures_force_error() {
        let mut m = machine();
        m.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at(0));
        m.note_callback_failure(at(1));
        m.note_callback_failure(at(2));
        assert_eq!(m.state(), StrategyState::Ready);
        m.note_callback_failure(at(3));
        assert_eq!(m.state(), StrategyState::Error);
    }

    #[test]
    fn error_auto_recovers_after_timeout() {
        let mut m = StrategyMachine::new("recover", 1000, Duration::from_secs(30 * 60));
        m.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at(0));
        m.force_error(at(1));

        // Too early.
        assert!(!m.try_auto_recover(at(10)));
        assert_eq!(m.state(), StrategyState::Error);

        let later = at(1) + chrono::Duration::minutes(30);
        assert!(m.try_auto_recover(later));
        assert_eq!(m.state(), StrategyState::Ready);
    }

    #[test]
    fn terminated_is_a_sink() {
        let mut m = machine();
        m.force_error(at(0));
        assert!(m.transition(
            StrategyState::Terminated,
            TransitionTrigger::ManualOverride,
            at(1)
        ));
        for to in [
            StrategyState::Ready,
            StrategyState::Initializing,
            StrategyState::Error,
        ] {
            assert!(!m.transition(to, TransitionTrigger::Reset, at(2)));
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut m = machine();
        m.transition(StrategyState::Ready, TransitionTrigger::MarketOpen, at(0));
        let snap = m.snapshot();
        let restored =
            StrategyMachine::restore("test", snap, 1000, Duration::from_secs(30 * 60));
        assert_eq!(restored.state(), StrategyState::Ready);
        assert_eq!(restored.history().count(), 1);
    }
}
