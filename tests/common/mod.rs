//! Shared fixtures for the integration scenarios.
#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wheelhouse::config::Constants;
use wheelhouse::domain::market::bar_slice::{BarSlice, QuoteSnapshot, VixSample};
use wheelhouse::domain::market::instrument::{Instrument, OptionRight};
use wheelhouse::domain::market::option_chain::{Greeks, OptionChain, OptionQuote};
use wheelhouse::domain::ports::{EngineContext, FixedClock, StateStore};
use wheelhouse::domain::risk::correlation::CorrelationGroup;
use wheelhouse::domain::trading::fees::PerContractFeeModel;
use wheelhouse::domain::trading::lifecycle::{StrategyMachine, StrategyState, TransitionTrigger};
use wheelhouse::domain::trading::position::{FilledLeg, LegRole, Position, StrategyKind};
use wheelhouse::infrastructure::broker::PaperBroker;
use wheelhouse::infrastructure::persistence::InMemoryStateStore;

/// Route engine logs through the usual env-filtered subscriber when a test
/// run wants them (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_constants() -> Constants {
    let mut constants = Constants::default();
    constants.order_poll_interval = Duration::from_millis(1);
    constants.execution_retry_spacing = Duration::from_millis(1);
    constants
}

pub fn engine_ctx(
    broker: Arc<PaperBroker>,
    store: Arc<InMemoryStateStore>,
    now: DateTime<Utc>,
) -> (EngineContext, FixedClock) {
    init_tracing();
    let clock = FixedClock::at(now);
    let ctx = EngineContext {
        clock: Arc::new(clock.clone()),
        broker,
        store,
        fees: Arc::new(PerContractFeeModel::default()),
        constants: Arc::new(fast_constants()),
    };
    (ctx, clock)
}

/// Friday 2026-08-07, 10:30 ET (14:30 UTC, EDT).
pub fn friday_1030() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 7, 14, 30, 0).unwrap()
}

/// Tuesday 2026-08-04, 11:00 ET: inside the session, outside every entry
/// window.
pub fn quiet_tuesday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 4, 15, 0, 0).unwrap()
}

pub fn vix_sample(level: f64, at: DateTime<Utc>) -> VixSample {
    VixSample {
        level,
        updated_at: at,
    }
}

pub fn quote_snapshot(price: Decimal, at: DateTime<Utc>) -> QuoteSnapshot {
    QuoteSnapshot {
        price,
        bid: price - dec!(0.02),
        ask: price + dec!(0.02),
        volume: 1_000_000,
        updated_at: at,
    }
}

pub fn option_quote(
    underlying: &str,
    expiry: NaiveDate,
    strike: Decimal,
    right: OptionRight,
    mid: Decimal,
    iv: f64,
    at: DateTime<Utc>,
) -> OptionQuote {
    let delta = match right {
        OptionRight::Call => 0.30,
        OptionRight::Put => -0.30,
    };
    OptionQuote {
        instrument: Instrument::equity_option(underlying, expiry, strike, right),
        bid: mid - dec!(0.05),
        ask: mid + dec!(0.05),
        last: mid,
        volume: 500,
        open_interest: 2500,
        greeks: Some(Greeks {
            delta,
            gamma: 0.01,
            vega: 0.2,
            theta: -0.2,
            iv,
        }),
        quoted_at: at,
    }
}

/// Same-day SPY chain around 450 with enough strikes for a condor.
pub fn spy_condor_chain(at: DateTime<Utc>) -> OptionChain {
    let expiry = at.date_naive();
    let mut contracts = Vec::new();
    for strike in [438, 442, 446, 450, 454, 458, 462] {
        let s = Decimal::from(strike);
        let dist = (s - dec!(450)).abs();
        let mid = (dec!(3.00) - dist * dec!(0.25)).max(dec!(0.25));
        contracts.push(option_quote("SPY", expiry, s, OptionRight::Call, mid, 0.24, at));
        contracts.push(option_quote("SPY", expiry, s, OptionRight::Put, mid, 0.24, at));
    }
    OptionChain::new("SPY", expiry, at, contracts)
}

pub fn bar(at: DateTime<Utc>, vix: f64) -> BarSlice {
    let mut slice = BarSlice::new(at);
    slice.vix = Some(vix_sample(vix, at));
    slice
        .quotes
        .insert("SPY".to_string(), quote_snapshot(dec!(450), at));
    slice
}

/// A machine walked to MANAGING, as a live position would be.
pub fn managing_machine(at: DateTime<Utc>) -> StrategyMachine {
    let mut machine = StrategyMachine::new("test", 1000, Duration::from_secs(1800));
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
    machine.transition(StrategyState::Managing, TransitionTrigger::MarketOpen, at);
    machine
}

/// A short-strangle position on `underlying` with the given entry and mark.
pub fn strangle_position(
    underlying: &str,
    group: CorrelationGroup,
    entry_price: Decimal,
    mark: Decimal,
    expiry: NaiveDate,
    at: DateTime<Utc>,
) -> Position {
    let legs = vec![
        FilledLeg {
            role: LegRole::ShortCall,
            instrument: Instrument::equity_option(underlying, expiry, dec!(480), OptionRight::Call),
            quantity: -1,
            entry_price,
            mark: Some(mark),
        },
        FilledLeg {
            role: LegRole::ShortPut,
            instrument: Instrument::equity_option(underlying, expiry, dec!(420), OptionRight::Put),
            quantity: -1,
            entry_price,
            mark: Some(mark),
        },
    ];
    let entry_cash = legs.iter().map(FilledLeg::entry_cash).sum();
    Position {
        id: Uuid::new_v4(),
        strategy: StrategyKind::FuturesStrangle,
        underlying: underlying.to_string(),
        group,
        opened_at: at - ChronoDuration::days(10),
        contracts: 1,
        legs,
        entry_cash,
        margin_requirement: dec!(9000),
        order_group_id: 1,
        machine: managing_machine(at - ChronoDuration::days(10)),
    }
}

/// A single-leg short-put position, useful for seeding equity exposure.
pub fn short_put_position(
    underlying: &str,
    strategy: StrategyKind,
    group: CorrelationGroup,
    expiry: NaiveDate,
    at: DateTime<Utc>,
) -> Position {
    let leg = FilledLeg {
        role: LegRole::ShortPut,
        instrument: Instrument::equity_option(underlying, expiry, dec!(430), OptionRight::Put),
        quantity: -1,
        entry_price: dec!(3.00),
        mark: Some(dec!(3.00)),
    };
    let entry_cash = leg.entry_cash();
    Position {
        id: Uuid::new_v4(),
        strategy,
        underlying: underlying.to_string(),
        group,
        opened_at: at - ChronoDuration::days(5),
        contracts: 1,
        legs: vec![leg],
        entry_cash,
        margin_requirement: dec!(5000),
        order_group_id: 1,
        machine: managing_machine(at - ChronoDuration::days(5)),
    }
}

pub async fn seed_position(store: &InMemoryStateStore, position: &Position) {
    store
        .put(
            &format!("positions/{}", position.id),
            serde_json::to_value(position.to_record()).unwrap(),
        )
        .await
        .unwrap();
}
