#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use warden::config::{
    AccountConfig, AppConfig, ExecutionConfig, ExitProfile, LoggingConfig, PaperExchangeConfig,
    ReconciliationConfig, RiskConfig, RiskLimits, SizingConfig, StoreConfig,
};
use warden::coordination::ShutdownConfig;
use warden::domain::{MarketTick, Signal, SignalDirection, SignalEvent};
use warden::engine::{SignalOutcome, TradingEngine};
use warden::exchange::PaperExchange;
use warden::persistence::StateStore;
use warden::supervisor::AlertManagerConfig;
use warden::Position;

pub const SYMBOL: &str = "ETHUSDT";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn minutes(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

fn profile(max_hold_mins: i64) -> ExitProfile {
    ExitProfile {
        stop_atr: dec!(1),
        target_atr: dec!(2),
        early_failure_atr: dec!(0.5),
        early_failure_window_mins: 0,
        max_hold_mins,
    }
}

/// equity 10,000, 1% risk per trade, k1 = 1, k2 = 2, leverage 5, no early-failure rule
pub fn config() -> AppConfig {
    AppConfig {
        risk: RiskConfig {
            limits: RiskLimits {
                max_risk_per_trade_fraction: dec!(0.01),
                max_margin_usage_fraction: dec!(0.75),
                max_concurrent_long: 3,
                max_concurrent_short: 2,
                max_leverage: dec!(5),
            },
            max_margin_per_trade_fraction: None,
            daily_loss_limit_fraction: None,
            reject_cooldown_secs: 0,
            kill_switch: false,
        },
        sizing: SizingConfig {
            leverage: dec!(5),
            high_confidence_threshold: dec!(0.7),
            min_confidence: dec!(0.5),
            qty_step: dec!(0.001),
            min_qty: dec!(0.01),
            long: profile(180),
            short: profile(120),
        },
        execution: ExecutionConfig {
            order_timeout_ms: 200,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            poll_interval_ms: 1,
            fill_timeout_ms: 50,
        },
        account: AccountConfig {
            initial_equity: dec!(10000),
        },
        store: StoreConfig {
            dir: PathBuf::from("state"),
        },
        paper: PaperExchangeConfig::default(),
        reconciliation: ReconciliationConfig { interval_secs: 0 },
        shutdown: ShutdownConfig::default(),
        alerts: AlertManagerConfig::default(),
        logging: LoggingConfig::default(),
    }
}

pub fn long_signal(at: DateTime<Utc>) -> SignalEvent {
    signal(SYMBOL, SignalDirection::Long, at)
}

pub fn signal(symbol: &str, direction: SignalDirection, at: DateTime<Utc>) -> SignalEvent {
    SignalEvent {
        signal: Signal {
            symbol: symbol.to_string(),
            direction,
            confidence: dec!(0.9),
            generated_at: at,
            feature_snapshot_ref: format!("features/{}/{}", symbol, at.timestamp()),
            model_id: "lgbm-1h-v3".to_string(),
        },
        atr: dec!(50),
        reference_price: dec!(1000),
    }
}

pub fn tick(at: DateTime<Utc>, price: Decimal) -> MarketTick {
    MarketTick::price(SYMBOL, at, price)
}

pub async fn start(
    config: AppConfig,
    store: Arc<dyn StateStore>,
) -> (Arc<PaperExchange>, TradingEngine) {
    let exchange = Arc::new(PaperExchange::new(&config.paper));
    let engine = TradingEngine::start(config, exchange.clone(), store)
        .await
        .unwrap();
    (exchange, engine)
}

pub async fn open(engine: &TradingEngine, event: SignalEvent) -> Position {
    match engine.on_signal(event).await.unwrap() {
        SignalOutcome::Opened(position) => position,
        other => panic!("expected an open, got {:?}", other),
    }
}
