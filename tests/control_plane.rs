//! The programmatic control plane: pause/resume gating, force-close, and
//! the structured status snapshot.

mod common;

use common::*;
use chrono::Duration as ChronoDuration;
use rust_decimal_macros::dec;
use std::sync::Arc;
use wheelhouse::application::engine::TradingEngine;
use wheelhouse::application::strategies::{StrategyController, ZeroDteController};
use wheelhouse::domain::market::calendar::CorporateEventTable;
use wheelhouse::domain::risk::correlation::CorrelationGroup;
use wheelhouse::domain::risk::events::{RiskEventKind, RiskLevel};
use wheelhouse::infrastructure::broker::PaperBroker;
use wheelhouse::infrastructure::persistence::InMemoryStateStore;

#[tokio::test]
async fn paused_engine_ignores_bars() {
    let broker = Arc::new(PaperBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let at = friday_1030();
    let (ctx, _clock) = engine_ctx(broker.clone(), store, at);

    let controllers: Vec<Box<dyn StrategyController>> =
        vec![Box::new(ZeroDteController::new("SPY", ctx.constants.clone()))];
    let mut engine = TradingEngine::new(
        ctx.clone(),
        controllers,
        CorporateEventTable::new(),
        dec!(60000),
    )
    .unwrap();
    engine.start().await.unwrap();
    engine.pause();

    let mut slice = bar(at, 24.0);
    slice.chains.push(spy_condor_chain(at));
    engine.on_bar(&slice).await.unwrap();
    assert_eq!(engine.book().len(), 0);
    assert_eq!(broker.order_count(), 0);

    engine.resume();
    let later = at + ChronoDuration::minutes(1);
    let mut slice = bar(later, 24.0);
    slice.chains.push(spy_condor_chain(later));
    engine.on_bar(&slice).await.unwrap();
    assert_eq!(engine.book().len(), 1);
}

#[tokio::test]
async fn force_close_all_flattens_and_requires_manual_resume() {
    let broker = Arc::new(PaperBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let at = quiet_tuesday();
    let (ctx, _clock) = engine_ctx(broker.clone(), store.clone(), at);

    let expiry = at.date_naive() + ChronoDuration::days(60);
    seed_position(
        &store,
        &strangle_position("SPY", CorrelationGroup::A2, dec!(2.00), dec!(2.00), expiry, at),
    )
    .await;
    seed_position(
        &store,
        &strangle_position("MES", CorrelationGroup::A1, dec!(2.00), dec!(2.00), expiry, at),
    )
    .await;

    let mut engine =
        TradingEngine::new(ctx.clone(), vec![], CorporateEventTable::new(), dec!(80000)).unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.book().len(), 2);

    engine
        .force_close_all(&bar(at, 20.0), "operator close")
        .await
        .unwrap();

    assert_eq!(engine.book().len(), 0);
    assert!(engine.risk().manual().is_active());
    // One EMERGENCY event naming the affected positions.
    let emergencies: Vec<_> = engine
        .risk()
        .journal()
        .iter()
        .filter(|e| e.kind == RiskEventKind::EmergencyHalt && e.level == RiskLevel::Emergency)
        .collect();
    assert_eq!(emergencies.len(), 1);
    assert_eq!(emergencies[0].payload["positions"].as_array().unwrap().len(), 2);
    // All closes went out as market orders.
    assert_eq!(broker.market_orders().len(), 4);
}

#[tokio::test]
async fn status_reports_a_structured_snapshot() {
    let broker = Arc::new(PaperBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let at = quiet_tuesday();
    let (ctx, _clock) = engine_ctx(broker, store.clone(), at);

    let expiry = at.date_naive() + ChronoDuration::days(60);
    seed_position(
        &store,
        &strangle_position("SPY", CorrelationGroup::A2, dec!(2.00), dec!(2.00), expiry, at),
    )
    .await;

    let mut engine =
        TradingEngine::new(ctx.clone(), vec![], CorporateEventTable::new(), dec!(80000)).unwrap();
    engine.start().await.unwrap();
    engine.on_bar(&bar(at, 20.0)).await.unwrap();

    let status = engine.status();
    assert_eq!(status.state, "Running");
    assert_eq!(status.open_positions, 1);
    assert!(!status.manual_mode);
    assert_eq!(status.drawdown_level, "NORMAL");

    // The snapshot serializes for the reporting sink.
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["open_positions"], 1);
}
