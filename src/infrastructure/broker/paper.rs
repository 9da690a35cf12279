//! Paper broker for backtests and integration tests.
//!
//! Fills limit orders at their limit price and market orders at the
//! configured mark, with optional per-instrument scripted outcomes (reject,
//! cancel, sit working) to exercise rollback and reconciliation paths.

use crate::domain::market::instrument::Instrument;
use crate::domain::ports::{BrokerAdapter, OrderId, OrderState};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Scripted behaviour for an instrument, consumed in order; after the script
/// runs dry the default fill behaviour applies.
#[derive(Debug, Clone, Copy)]
pub enum PaperOutcome {
    Fill,
    Reject,
    Cancel,
    /// Stay `Submitted` until the script is replaced.
    Work,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    instrument: Instrument,
    quantity: i64,
    state: OrderState,
    is_market: bool,
}

#[derive(Debug, Default)]
struct PaperState {
    next_id: u64,
    orders: HashMap<u64, PaperOrder>,
    marks: HashMap<String, Decimal>,
    scripts: HashMap<String, Vec<PaperOutcome>>,
    slippage_bps: u32,
}

/// Deterministic by default; slippage adds uniform noise when configured.
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark used for market-order fills on `key` (instrument key).
    pub fn set_mark(&self, key: &str, mark: Decimal) {
        self.state
            .lock()
            .expect("paper broker lock")
            .marks
            .insert(key.to_string(), mark);
    }

    /// Queue scripted outcomes for an instrument key.
    pub fn script(&self, key: &str, outcomes: Vec<PaperOutcome>) {
        self.state
            .lock()
            .expect("paper broker lock")
            .scripts
            .insert(key.to_string(), outcomes);
    }

    pub fn set_slippage_bps(&self, bps: u32) {
        self.state.lock().expect("paper broker lock").slippage_bps = bps;
    }

    /// Every (instrument key, quantity) placed as a market order.
    pub fn market_orders(&self) -> Vec<(String, i64)> {
        self.state
            .lock()
            .expect("paper broker lock")
            .orders
            .values()
            .filter(|o| o.is_market)
            .map(|o| (o.instrument.key.clone(), o.quantity))
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().expect("paper broker lock").orders.len()
    }

    fn place(&self, instrument: &Instrument, quantity: i64, price: Option<Decimal>) -> OrderId {
        let is_market = price.is_none();
        let mut state = self.state.lock().expect("paper broker lock");
        state.next_id += 1;
        let id = state.next_id;

        let outcome = state
            .scripts
            .get_mut(&instrument.key)
            .and_then(|s| if s.is_empty() { None } else { Some(s.remove(0)) })
            .unwrap_or(PaperOutcome::Fill);

        let order_state = match outcome {
            PaperOutcome::Reject => OrderState::Invalid,
            PaperOutcome::Cancel => OrderState::Canceled,
            PaperOutcome::Work => OrderState::Submitted,
            PaperOutcome::Fill => {
                let base = price
                    .or_else(|| state.marks.get(&instrument.key).copied())
                    .unwrap_or(dec!(1.00));
                let fill = if state.slippage_bps > 0 {
                    let bps = rand::rng().random_range(0..=state.slippage_bps);
                    let drift = base * Decimal::from(bps) / dec!(10000);
                    if quantity > 0 { base + drift } else { base - drift }
                } else {
                    base
                };
                OrderState::Filled {
                    avg_price: fill,
                    quantity,
                }
            }
        };

        debug!(order = id, instrument = %instrument.key, quantity, ?order_state, "paper order");
        state.orders.insert(
            id,
            PaperOrder {
                instrument: instrument.clone(),
                quantity,
                state: order_state,
                is_market,
            },
        );
        OrderId(id)
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_market(&self, instrument: &Instrument, quantity: i64) -> Result<OrderId> {
        Ok(self.place(instrument, quantity, None))
    }

    async fn place_limit(
        &self,
        instrument: &Instrument,
        quantity: i64,
        price: Decimal,
    ) -> Result<OrderId> {
        Ok(self.place(instrument, quantity, Some(price)))
    }

    async fn cancel(&self, order: OrderId) -> Result<()> {
        let mut state = self.state.lock().expect("paper broker lock");
        if let Some(o) = state.orders.get_mut(&order.0)
            && !o.state.is_terminal()
        {
            o.state = OrderState::Canceled;
        }
        Ok(())
    }

    async fn query_order(&self, order: OrderId) -> Result<OrderState> {
        Ok(self
            .state
            .lock()
            .expect("paper broker lock")
            .orders
            .get(&order.0)
            .map(|o| o.state)
            .unwrap_or(OrderState::Invalid))
    }
}
