//! Crisis-level volatility: the moment VIX crosses the halt threshold, every
//! premium-selling position receives a close within the same bar through
//! market flatten orders; the protective put ladder is left standing.

mod common;

use common::*;
use chrono::Duration as ChronoDuration;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;
use wheelhouse::application::engine::TradingEngine;
use wheelhouse::domain::market::calendar::CorporateEventTable;
use wheelhouse::domain::market::instrument::{Instrument, OptionRight};
use wheelhouse::domain::risk::correlation::CorrelationGroup;
use wheelhouse::domain::risk::events::RiskEventKind;
use wheelhouse::domain::trading::position::{FilledLeg, LegRole, Position, StrategyKind};
use wheelhouse::infrastructure::broker::PaperBroker;
use wheelhouse::infrastructure::persistence::InMemoryStateStore;

fn ladder_position(expiry: chrono::NaiveDate, at: chrono::DateTime<chrono::Utc>) -> Position {
    let leg = FilledLeg {
        role: LegRole::LadderPut,
        instrument: Instrument::equity_option("SPY", expiry, dec!(405), OptionRight::Put),
        quantity: 1,
        entry_price: dec!(14.00),
        mark: Some(dec!(14.00)),
    };
    let entry_cash = leg.entry_cash();
    Position {
        id: Uuid::new_v4(),
        strategy: StrategyKind::LeapLadder,
        underlying: "SPY".to_string(),
        group: CorrelationGroup::A2,
        opened_at: at - ChronoDuration::days(30),
        contracts: 1,
        legs: vec![leg],
        entry_cash,
        margin_requirement: dec!(1400),
        order_group_id: 2,
        machine: managing_machine(at - ChronoDuration::days(30)),
    }
}

#[tokio::test]
async fn crisis_vix_flattens_premium_sellers_within_the_bar() {
    let broker = Arc::new(PaperBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let at = quiet_tuesday();
    let (ctx, _clock) = engine_ctx(broker.clone(), store.clone(), at);

    // A strangle fully at its credit (100% captured would be mark 0; here
    // marks sit at entry) plus a ladder rung.
    let expiry = at.date_naive() + ChronoDuration::days(60);
    let strangle = strangle_position("SPY", CorrelationGroup::A2, dec!(2.00), dec!(2.00), expiry, at);
    let strangle_id = strangle.id;
    let ladder = ladder_position(at.date_naive() + ChronoDuration::days(420), at);
    let ladder_id = ladder.id;
    seed_position(&store, &strangle).await;
    seed_position(&store, &ladder).await;

    let mut engine =
        TradingEngine::new(ctx.clone(), vec![], CorporateEventTable::new(), dec!(80000)).unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.book().len(), 2);

    // VIX jumps 20 -> 55 in one bar.
    engine.on_bar(&bar(at, 20.0)).await.unwrap();
    let crisis_at = at + ChronoDuration::minutes(1);
    engine.on_bar(&bar(crisis_at, 55.0)).await.unwrap();

    // The strangle is gone, the ladder survives.
    assert!(engine.book().get(strangle_id).is_none());
    assert!(engine.book().get(ladder_id).is_some());

    // Flatten orders went out as market orders.
    let market = broker.market_orders();
    assert_eq!(market.len(), 2);
    assert!(market.iter().all(|(_, qty)| *qty == 1));

    // The halt surfaced as an EMERGENCY event on the journal.
    assert!(
        engine
            .risk()
            .journal()
            .iter()
            .any(|e| e.kind == RiskEventKind::HaltTrading)
    );
}

#[tokio::test]
async fn halt_event_is_not_respammed_while_latched() {
    let broker = Arc::new(PaperBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let at = quiet_tuesday();
    let (ctx, _clock) = engine_ctx(broker, store.clone(), at);

    let mut engine =
        TradingEngine::new(ctx.clone(), vec![], CorporateEventTable::new(), dec!(80000)).unwrap();
    engine.start().await.unwrap();

    engine.on_bar(&bar(at, 55.0)).await.unwrap();
    engine
        .on_bar(&bar(at + ChronoDuration::minutes(1), 56.0))
        .await
        .unwrap();

    let halts = engine
        .risk()
        .journal()
        .iter()
        .filter(|e| e.kind == RiskEventKind::HaltTrading)
        .count();
    assert_eq!(halts, 1);
}
