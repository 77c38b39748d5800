mod common;

use common::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use warden::domain::{ExitReason, PositionStatus};
use warden::exchange::{ExchangeClient, PaperExchange};
use warden::lifecycle::{Discrepancy, TickOutcome};
use warden::persistence::{FileStateStore, StateStore};
use warden::TradingEngine;

#[tokio::test]
async fn crash_recovery_reattaches_open_position() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let exchange = Arc::new(PaperExchange::new(&config.paper));

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let first = TradingEngine::start(config.clone(), exchange.clone(), store)
        .await
        .unwrap();
    let position = open(&first, long_signal(t0())).await;
    first.on_tick(tick(minutes(10), dec!(990))).await.unwrap();
    // Process dies here: no shutdown, no flush beyond what each transition wrote
    drop(first);

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let second = TradingEngine::start(config, exchange.clone(), store.clone())
        .await
        .unwrap();

    let recovered = second.lifecycle().positions();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, position.id);
    assert_eq!(recovered[0].status, PositionStatus::Open);
    assert_eq!(recovered[0].stop_price, dec!(950));
    assert!(second.lifecycle().has_monitor(&position.id));
    assert_eq!(
        second.ledger().snapshot().await.committed_margin,
        position.margin
    );

    let mut trades = second.subscribe_trades();
    let outcomes = second.on_tick(tick(minutes(20), dec!(960))).await.unwrap();
    assert_eq!(outcomes[0].1.as_ref().unwrap(), &TickOutcome::Hold);
    let outcomes = second.on_tick(tick(minutes(30), dec!(950))).await.unwrap();
    assert!(matches!(
        outcomes[0].1,
        Ok(TickOutcome::Triggered {
            reason: ExitReason::Stop,
            ..
        })
    ));
    second.settle().await;

    let trade = trades.recv().await.unwrap();
    assert_eq!(trade.position_id(), position.id);
    let state = store.load().await.unwrap();
    assert_eq!(state.trades.len(), 1);
    assert!(state.live_positions().is_empty());
    assert!(exchange.list_open_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn graceful_shutdown_then_restart_keeps_position() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let exchange = Arc::new(PaperExchange::new(&config.paper));

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let first = Arc::new(
        TradingEngine::start(config.clone(), exchange.clone(), store)
            .await
            .unwrap(),
    );
    let position = open(&first, long_signal(t0())).await;
    first.shutdown().await.unwrap();
    assert_eq!(first.lifecycle().monitor_count(), 0);

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let second = TradingEngine::start(config, exchange, store).await.unwrap();
    assert_eq!(second.lifecycle().positions()[0].id, position.id);
    assert_eq!(second.lifecycle().monitor_count(), 1);
    assert_eq!(second.account().equity().await, dec!(10000));
}

#[tokio::test]
async fn position_closed_while_away_is_booked_as_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let exchange = Arc::new(PaperExchange::new(&config.paper));

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let first = TradingEngine::start(config.clone(), exchange.clone(), store)
        .await
        .unwrap();
    let position = open(&first, long_signal(t0())).await;
    drop(first);

    // Liquidated or closed by hand while the process was down
    exchange.remove_position(&position.open_request_id).await;
    exchange.set_price(SYMBOL, dec!(1030)).await;

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let second = TradingEngine::start(config, exchange, store.clone())
        .await
        .unwrap();

    assert!(second.lifecycle().positions().is_empty());
    assert_eq!(
        second.ledger().snapshot().await.committed_margin,
        rust_decimal::Decimal::ZERO
    );
    let state = store.load().await.unwrap();
    let trade = &state.trades[0].record;
    assert_eq!(trade.exit_reason, ExitReason::Reconciled);
    assert_eq!(trade.exit_price, dec!(1030));
    assert_eq!(trade.realized_pnl, dec!(60));
    assert_eq!(second.account().equity().await, dec!(10060));
}

#[tokio::test]
async fn untracked_exchange_position_raises_critical_alert() {
    let (exchange, engine) = start(config(), Arc::new(warden::MemoryStateStore::new())).await;
    let mut alerts = engine.subscribe_alerts();
    exchange
        .insert_position(
            warden::domain::ClientRequestId::new("manual-7"),
            warden::ExchangePosition {
                symbol: "SOLUSDT".into(),
                direction: warden::Direction::Short,
                size: dec!(10),
                entry_price: dec!(150),
                open_request_id: None,
                mark_price: None,
            },
        )
        .await;

    let result = engine.reconcile().await.unwrap();
    assert_eq!(result.critical_issues, 1);
    assert!(matches!(
        result.discrepancies[0],
        Discrepancy::ExchangeOnly { ref symbol, .. } if symbol == "SOLUSDT"
    ));
    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.level, warden::AlertLevel::Critical);
    // No automatic action on positions we did not open
    assert_eq!(exchange.list_open_positions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn restarted_dry_run_rebuilds_paper_book_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();

    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let first = TradingEngine::start(
        config.clone(),
        Arc::new(PaperExchange::new(&config.paper)),
        store,
    )
    .await
    .unwrap();
    let position = open(&first, long_signal(t0())).await;
    drop(first);

    // A new process starts with an empty in-memory venue
    let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
    let exchange = Arc::new(PaperExchange::new(&config.paper));
    let persisted = store.load().await.unwrap();
    assert_eq!(exchange.restore_positions(&persisted.live_positions()).await, 1);

    let second = TradingEngine::start(config, exchange.clone(), store.clone())
        .await
        .unwrap();
    let recovered = second.lifecycle().position(&position.id).unwrap();
    assert_eq!(recovered.status, PositionStatus::Open);
    assert!(second.lifecycle().has_monitor(&position.id));
    assert!(store.load().await.unwrap().trades.is_empty());

    let mut trades = second.subscribe_trades();
    second.on_tick(tick(minutes(30), dec!(950))).await.unwrap();
    second.settle().await;
    let trade = trades.recv().await.unwrap();
    assert_eq!(trade.exit_reason, ExitReason::Stop);
    assert!(exchange.list_open_positions().await.unwrap().is_empty());
}
