use rust_decimal::Decimal;
use thiserror::Error;

/// Pre-trade checks that failed. Surfaced to controllers as a deny; these are
/// expected outcomes, not faults.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("stale {datum} for {symbol}: age {age_secs}s > limit {limit_secs}s")]
    StaleData {
        symbol: String,
        datum: String,
        age_secs: i64,
        limit_secs: i64,
    },

    #[error("missing {datum} for {symbol}")]
    MissingData { symbol: String, datum: String },

    #[error("unknown underlying {symbol}: not in any correlation group")]
    UnknownUnderlying { symbol: String },

    #[error("correlation group {group} at limit: {current}/{cap}")]
    CorrelationCap {
        group: String,
        current: usize,
        cap: usize,
    },

    #[error("total equity exposure at limit: {current}/{cap}")]
    EquityExposureCap { current: usize, cap: usize },

    #[error("vix gate denied: {reason}")]
    VixGate { reason: String },

    #[error("buying power cap exceeded: utilization {utilization:.2} > {cap:.2} ({regime} regime)")]
    BuyingPowerCap {
        utilization: f64,
        cap: f64,
        regime: String,
    },

    #[error("drawdown level {level} blocks new entries")]
    DrawdownBlock { level: String },

    #[error("manual mode active: {reason}")]
    ManualMode { reason: String },

    #[error("credit {credit} per contract below floor {floor}")]
    CreditBelowFloor { credit: Decimal, floor: Decimal },

    #[error("corporate event blackout for {symbol} ({event_date})")]
    EventBlackout { symbol: String, event_date: String },

    #[error("no suitable contract: {reason}")]
    NoSuitableContract { reason: String },
}

/// Order placement or fill-monitoring failures. These always trigger atomic
/// rollback of the affected group.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected for {instrument}: {reason}")]
    OrderRejected { instrument: String, reason: String },

    #[error("group {group_id} timed out after {timeout_secs}s with {pending} legs pending")]
    GroupTimeout {
        group_id: u64,
        timeout_secs: u64,
        pending: usize,
    },

    #[error("group {group_id} partial fill: leg {instrument} ended {status}")]
    PartialGroup {
        group_id: u64,
        instrument: String,
        status: String,
    },

    #[error("broker call failed: {0}")]
    Broker(#[source] anyhow::Error),
}

impl ExecutionError {
    /// Transient failures are retried before rollback; terminal rejections
    /// roll back immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Broker(_))
    }
}

/// Internal state the engine believes cannot happen. Fatal: trading halts and
/// manual mode activates.
#[derive(Debug, Clone, Error)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Collaborator outages: broker unreachable, feed stalled, store unavailable.
#[derive(Debug, Error)]
pub enum ExternalFailure {
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("market data feed stalled: last update {age_secs}s ago")]
    FeedStalled { age_secs: i64 },

    #[error("state store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),
}

/// A missing or malformed constant. The engine refuses to start.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing constant: {name}")]
    Missing { name: String },

    #[error("malformed constant {name}: {reason}")]
    Malformed { name: String, reason: String },
}

/// Umbrella error for engine-level operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    External(#[from] ExternalFailure),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn validation_error_formatting() {
        let err = ValidationError::StaleData {
            symbol: "SPY".to_string(),
            datum: "bid/ask".to_string(),
            age_secs: 70,
            limit_secs: 45,
        };
        let msg = err.to_string();
        assert!(msg.contains("SPY"));
        assert!(msg.contains("70"));
        assert!(msg.contains("45"));
    }

    #[test]
    fn credit_floor_formatting() {
        let err = ValidationError::CreditBelowFloor {
            credit: dec!(0.05),
            floor: dec!(0.10),
        };
        assert!(err.to_string().contains("0.05"));
    }

    #[test]
    fn broker_errors_are_transient() {
        assert!(ExecutionError::Broker(anyhow::anyhow!("connection reset")).is_transient());
        let rejected = ExecutionError::OrderRejected {
            instrument: "SPY".into(),
            reason: "account reject".into(),
        };
        assert!(!rejected.is_transient());
    }
}
