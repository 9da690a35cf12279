//! External collaborator interfaces: broker adapter, clock and durable
//! key-value store. Implementations live in `infrastructure` or in the host
//! runtime; the engine only ever sees these traits.

use crate::config::Constants;
use crate::domain::market::instrument::Instrument;
use crate::domain::trading::fees::FeeModel;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Broker-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderState {
    Submitted,
    PartiallyFilled { filled: i64 },
    Filled { avg_price: Decimal, quantity: i64 },
    Canceled,
    Invalid,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled { .. } | OrderState::Canceled | OrderState::Invalid
        )
    }
}

/// The four broker operations the engine needs. Fills are also observable by
/// polling [`query_order`](BrokerAdapter::query_order); the executor's
/// monitoring loop relies on polling so it stays cancellable.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_market(&self, instrument: &Instrument, quantity: i64) -> Result<OrderId>;

    async fn place_limit(
        &self,
        instrument: &Instrument,
        quantity: i64,
        price: Decimal,
    ) -> Result<OrderId>;

    async fn cancel(&self, order: OrderId) -> Result<()>;

    async fn query_order(&self, order: OrderId) -> Result<OrderState>;
}

/// Time source. In a backtest this is the bar clock, not the host clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Durable key-value storage behind the persistence namespaces
/// (`positions/`, `order_groups/`, `risk_events/`, `performance/`,
/// `drawdown/`). Values are self-describing JSON records carrying a schema
/// version tag.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
}

/// Everything external the engine needs, passed by reference through
/// constructors rather than looked up on demand.
#[derive(Clone)]
pub struct EngineContext {
    pub clock: Arc<dyn Clock>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub store: Arc<dyn StateStore>,
    pub fees: Arc<dyn FeeModel>,
    pub constants: Arc<Constants>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("fees", &self.fees.description())
            .finish_non_exhaustive()
    }
}

/// Fixed clock for tests and replay.
#[derive(Debug, Clone)]
pub struct FixedClock(pub std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>);

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Arc::new(std::sync::Mutex::new(now)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().expect("clock lock poisoned") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.0.lock().expect("clock lock poisoned");
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock lock poisoned")
    }
}
