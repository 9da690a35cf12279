use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Info => write!(f, "INFO"),
            RiskLevel::Warning => write!(f, "WARNING"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
            RiskLevel::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskEventKind {
    VixRegimeChange,
    EmergencyConditions,
    HaltTrading,
    CorrelationBlocked,
    CorrelationBypassAttempt,
    DrawdownLevelChange,
    StaleData,
    EntryDenied,
    DefensiveExit,
    OrderGroupRolledBack,
    ManualModeActivated,
    ManualModeResumed,
    InvariantViolation,
    EmergencyHalt,
}

/// A structured event carried on the reporting stream and, for the gating
/// kinds, consumed by risk decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub level: RiskLevel,
    pub at: DateTime<Utc>,
    pub component: String,
    pub message: String,
    pub payload: Value,
}

impl RiskEvent {
    pub fn new(
        kind: RiskEventKind,
        level: RiskLevel,
        at: DateTime<Utc>,
        component: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            level,
            at,
            component: component.to_string(),
            message: message.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Bounded in-memory journal backing the line-oriented reporting sink. Every
/// push also emits a tracing record at the matching severity; pushes since
/// the last drain are kept aside for durable persistence by the engine.
#[derive(Debug)]
pub struct EventJournal {
    events: VecDeque<RiskEvent>,
    unpersisted: Vec<RiskEvent>,
    cap: usize,
}

impl EventJournal {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap.min(64)),
            unpersisted: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, event: RiskEvent) {
        match event.level {
            RiskLevel::Info => info!(
                component = %event.component,
                kind = ?event.kind,
                payload = %event.payload,
                "{}",
                event.message
            ),
            RiskLevel::Warning => warn!(
                component = %event.component,
                kind = ?event.kind,
                payload = %event.payload,
                "{}",
                event.message
            ),
            RiskLevel::Critical | RiskLevel::Emergency => error!(
                component = %event.component,
                kind = ?event.kind,
                level = %event.level,
                payload = %event.payload,
                "{}",
                event.message
            ),
        }
        if self.events.len() == self.cap {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        self.unpersisted.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest(&self, n: usize) -> impl Iterator<Item = &RiskEvent> {
        self.events.iter().rev().take(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RiskEvent> {
        self.events.iter()
    }

    /// Events pushed since the last drain, for durable persistence.
    pub fn drain_new(&mut self) -> Vec<RiskEvent> {
        std::mem::take(&mut self.unpersisted)
    }
}
