//! Trading engine
//!
//! Wires the risk gate, sizer, executor and lifecycle manager together.
//! Startup restores equity and positions from the state store and reconciles
//! them against the exchange; shutdown stops signal intake first, lets
//! in-flight orders resolve, checkpoints and flushes the store.
//!
//! Time comes from the market data: positions open at the signal's
//! generation time and close at the tick that triggered them, so a replayed
//! stream produces the same trades as the live one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::account::EquityTracker;
use crate::config::AppConfig;
use crate::coordination::{
    CircuitBreakerConfig, GracefulShutdown, PhaseFuture, ShutdownSignal, TradingCircuitBreaker,
    TripKind,
};
use crate::domain::{
    EquitySnapshot, MarketEvent, MarketTick, Position, PositionId, SignalEvent, Trade,
};
use crate::error::{Result, RiskRejection, WardenError};
use crate::exchange::ExchangeClient;
use crate::execution::OrderExecutor;
use crate::lifecycle::{PositionLifecycleManager, ReconciliationResult, TickOutcome};
use crate::persistence::StateStore;
use crate::risk::{GateDecision, PositionSizer, RiskGate, RiskLedger, SizingSkip};
use crate::supervisor::{Alert, AlertManager};

const SIGNAL_QUEUE: usize = 64;

/// What became of one signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// No trade this cycle
    Skipped(SizingSkip),
    /// New opens are blocked
    Halted(String),
    Rejected(RiskRejection),
    Opened(Position),
}

/// Result of processing one market event
#[derive(Debug)]
pub enum EventOutcome {
    Signal(SignalOutcome),
    Tick(Vec<(PositionId, Result<TickOutcome>)>),
}

/// Point-in-time view for operators
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub equity: Decimal,
    pub day_start_equity: Decimal,
    pub daily_pnl: Decimal,
    pub committed_margin: Decimal,
    pub open_long: u32,
    pub open_short: u32,
    pub halted: Vec<String>,
    pub positions: Vec<Position>,
}

pub struct TradingEngine {
    config: AppConfig,
    sizer: PositionSizer,
    gate: RiskGate,
    executor: Arc<OrderExecutor>,
    ledger: Arc<RiskLedger>,
    account: Arc<EquityTracker>,
    breaker: Arc<TradingCircuitBreaker>,
    alerts: Arc<AlertManager>,
    store: Arc<dyn StateStore>,
    lifecycle: PositionLifecycleManager,
    shutdown: Arc<GracefulShutdown>,
    accepting: AtomicBool,
    /// Latest market timestamp seen
    clock: RwLock<Option<DateTime<Utc>>>,
}

impl TradingEngine {
    /// Restore persisted state, re-attach open positions and reconcile them
    /// with the exchange
    pub async fn start(
        config: AppConfig,
        client: Arc<dyn ExchangeClient>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| WardenError::InvalidConfig(errors.join("; ")))?;

        let state = store.load().await?;
        let trades: Vec<Trade> = state.trades.iter().map(|t| t.record.clone()).collect();
        // The trading day is the day of the last booked activity; a fresh store
        // starts before any day so the first trade opens one
        let last_activity = state
            .last_equity()
            .map(|s| s.timestamp)
            .into_iter()
            .chain(trades.iter().map(|t| t.closed_at))
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let account = Arc::new(EquityTracker::restore(
            config.account.initial_equity,
            state.last_equity(),
            &trades,
            last_activity,
        ));

        let ledger = Arc::new(RiskLedger::new());
        let breaker = Arc::new(TradingCircuitBreaker::new(CircuitBreakerConfig::from(
            &config.risk,
        )));
        let alerts = Arc::new(AlertManager::new(config.alerts.clone()));
        let executor = Arc::new(OrderExecutor::new(
            client.clone(),
            config.execution.clone(),
        ));
        let lifecycle = PositionLifecycleManager::new(
            executor.clone(),
            store.clone(),
            ledger.clone(),
            account.clone(),
            breaker.clone(),
            alerts.clone(),
        );

        let recovered = lifecycle.recover(&state).await?;
        info!(
            exchange = client.name(),
            dry_run = client.is_dry_run(),
            recovered,
            trades = trades.len(),
            "Engine state restored"
        );

        let engine = Self {
            sizer: PositionSizer::new(config.sizing.clone(), &config.risk),
            gate: RiskGate::new(config.risk.limits.clone(), ledger.clone()),
            shutdown: Arc::new(GracefulShutdown::new(config.shutdown.clone())),
            config,
            executor,
            ledger,
            account,
            breaker,
            alerts,
            store,
            lifecycle,
            accepting: AtomicBool::new(true),
            clock: RwLock::new(None),
        };

        // The exchange may be briefly unreachable at boot; retry on the next pass
        if let Err(e) = engine.reconcile().await {
            warn!("Startup reconciliation failed: {}", e);
            engine
                .alerts
                .warning("engine", "Startup reconciliation failed", &e.to_string())
                .await;
            engine.lifecycle.request_reconciliation();
        }
        Ok(engine)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &PositionLifecycleManager {
        &self.lifecycle
    }

    pub fn ledger(&self) -> &Arc<RiskLedger> {
        &self.ledger
    }

    pub fn account(&self) -> &Arc<EquityTracker> {
        &self.account
    }

    pub fn breaker(&self) -> &Arc<TradingCircuitBreaker> {
        &self.breaker
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<Trade> {
        self.lifecycle.subscribe_trades()
    }

    pub fn subscribe_equity(&self) -> broadcast::Receiver<EquitySnapshot> {
        self.lifecycle.subscribe_equity()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Market time, or wall-clock time before the first event
    pub async fn now(&self) -> DateTime<Utc> {
        self.clock.read().await.unwrap_or_else(Utc::now)
    }

    async fn advance_clock(&self, at: DateTime<Utc>) {
        let mut clock = self.clock.write().await;
        if clock.map_or(true, |current| at > current) {
            *clock = Some(at);
        }
    }

    /// Gate, size and open one signal
    pub async fn on_signal(&self, event: SignalEvent) -> Result<SignalOutcome> {
        let at = event.signal.generated_at;
        let symbol = event.signal.symbol.clone();
        if !self.is_accepting() {
            return Ok(SignalOutcome::Halted("signal intake stopped".to_string()));
        }
        self.advance_clock(at).await;

        if let Err(reason) = self.breaker.check(at).await {
            info!(symbol = %symbol, reason = %reason, "Open blocked by circuit breaker");
            return Ok(SignalOutcome::Halted(reason.to_string()));
        }

        let equity = self.account.equity().await;
        let plan = match self.sizer.size(&event, equity, self.gate.limits()) {
            Ok(plan) => plan,
            Err(skip) => {
                debug!(symbol = %symbol, reason = %skip, "Signal skipped");
                return Ok(SignalOutcome::Skipped(skip));
            }
        };

        let plan = match self.gate.evaluate(plan, equity).await {
            GateDecision::Accept(plan) => plan,
            GateDecision::Reject(rejection) => {
                info!(
                    symbol = %symbol,
                    code = rejection.code(),
                    reason = %rejection,
                    "Signal rejected by risk gate"
                );
                return Ok(SignalOutcome::Rejected(rejection));
            }
        };

        let machine = self.lifecycle.begin_open(&plan, at).await?;
        match self.executor.open(&plan, at).await {
            Ok(filled) => {
                let position = self.lifecycle.confirm_open(machine, filled).await?;
                Ok(SignalOutcome::Opened(position))
            }
            Err(e) if e.requires_reconciliation() => {
                let open_id = machine.position().open_request_id.clone();
                error!(
                    position_id = %plan.position_id,
                    client_request_id = %open_id,
                    "Open outcome unknown: {}", e
                );
                self.lifecycle.leave_unresolved(machine);
                self.alerts.outcome_unknown(open_id.as_str()).await;
                Err(e)
            }
            Err(e) => {
                warn!(position_id = %plan.position_id, symbol = %symbol, "Open failed: {}", e);
                if let WardenError::RejectedByExchange {
                    client_request_id,
                    reason,
                } = &e
                {
                    self.breaker.record_open_rejected(client_request_id, at).await;
                    self.alerts
                        .open_rejected(&symbol, client_request_id, reason)
                        .await;
                }
                if let Err(abandon) = self.lifecycle.abandon_open(machine).await {
                    error!(position_id = %plan.position_id, "Could not abandon open: {}", abandon);
                }
                Err(e)
            }
        }
    }

    /// Route one tick to the monitors of its symbol
    pub async fn on_tick(&self, tick: MarketTick) -> Result<Vec<(PositionId, Result<TickOutcome>)>> {
        if !tick.is_well_formed() {
            return Err(WardenError::Validation(format!(
                "malformed tick for {} at {}",
                tick.symbol, tick.timestamp
            )));
        }
        self.advance_clock(tick.timestamp).await;
        Ok(self.lifecycle.route_tick(&tick).await)
    }

    pub async fn process(&self, event: MarketEvent) -> Result<EventOutcome> {
        match event {
            MarketEvent::Signal(e) => self.on_signal(e).await.map(EventOutcome::Signal),
            MarketEvent::Tick(t) => self.on_tick(t).await.map(EventOutcome::Tick),
        }
    }

    /// Wait until no close is in flight
    pub async fn settle(&self) {
        self.lifecycle.settle().await;
    }

    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        let now = self.now().await;
        self.lifecycle.reconcile(now).await
    }

    async fn reconcile_logged(&self) {
        if let Err(e) = self.reconcile().await {
            warn!("Reconciliation failed: {}", e);
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let now = self.now().await;
        let account = self.account.state().await;
        let ledger = self.ledger.snapshot().await;
        let breaker = self.breaker.get_stats(now).await;
        EngineStatus {
            equity: account.equity,
            day_start_equity: account.day_start_equity,
            daily_pnl: account.daily_pnl,
            committed_margin: ledger.committed_margin,
            open_long: ledger.open_long_count,
            open_short: ledger.open_short_count,
            halted: breaker
                .active_trips
                .iter()
                .map(|r| r.to_string())
                .collect(),
            positions: self.lifecycle.positions(),
        }
    }

    /// Operator halt; stays until `resume_opens(TripKind::Manual)`
    pub async fn halt_opens(&self, reason: &str) {
        self.breaker.manual_trip(reason).await;
        self.alerts.circuit_breaker_tripped(reason).await;
    }

    /// Operator reset of one kind of trip, e.g. once the store is writable again
    pub async fn resume_opens(&self, kind: TripKind) {
        info!(kind = ?kind, "Operator resumed opens");
        self.breaker.reset(kind).await;
    }

    /// Consume market events until the stream ends or shutdown is requested,
    /// then shut down. Signals are handled by a dedicated intake task so a
    /// slow open never delays tick routing.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<MarketEvent>) -> Result<()> {
        let (signal_tx, mut signal_rx) = mpsc::channel::<SignalEvent>(SIGNAL_QUEUE);
        let intake_engine = self.clone();
        let intake = tokio::spawn(async move {
            while let Some(event) = signal_rx.recv().await {
                let symbol = event.signal.symbol.clone();
                match intake_engine.on_signal(event).await {
                    Ok(SignalOutcome::Opened(position)) => {
                        debug!(position_id = %position.id, symbol = %symbol, "Signal opened position")
                    }
                    Ok(outcome) => debug!(symbol = %symbol, outcome = ?outcome, "Signal handled"),
                    Err(e) => warn!(symbol = %symbol, "Signal failed: {}", e),
                }
            }
            debug!("Signal intake task exited");
        });

        let interval_secs = self.config.reconciliation.interval_secs;
        let mut reconcile_timer = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile_timer.tick().await;
        let mut shutdown_rx = self.shutdown.subscribe();

        info!(reconcile_interval_secs = interval_secs, "Engine running");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(MarketEvent::Signal(e)) => {
                        if signal_tx.send(e).await.is_err() {
                            error!("Signal intake task is gone");
                            break;
                        }
                    }
                    Some(MarketEvent::Tick(t)) => {
                        if let Err(e) = self.on_tick(t).await {
                            warn!("Tick rejected: {}", e);
                        }
                    }
                    None => {
                        info!("Market event stream ended");
                        break;
                    }
                },
                _ = reconcile_timer.tick(), if interval_secs > 0 => self.reconcile_logged().await,
                _ = self.lifecycle.reconciliation_requested() => self.reconcile_logged().await,
                signal = shutdown_rx.recv() => {
                    info!(signal = ?signal, "Leaving event loop");
                    break;
                }
            }
        }

        drop(signal_tx);
        self.shutdown_sequence(Some(intake)).await
    }

    /// Ordered shutdown; see `GracefulShutdown::execute`
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.shutdown_sequence(None).await
    }

    async fn shutdown_sequence(self: &Arc<Self>, intake: Option<JoinHandle<()>>) -> Result<()> {
        if !self.shutdown.is_shutdown_requested() {
            self.shutdown.request_shutdown(ShutdownSignal::Graceful);
        }

        let stop = self.clone();
        let drain = self.clone();
        let checkpoint = self.clone();
        let flush = self.clone();
        self.shutdown
            .execute(
                move || -> PhaseFuture<()> {
                    Box::pin(async move {
                        stop.accepting.store(false, Ordering::SeqCst);
                        if let Some(task) = intake {
                            if let Err(e) = task.await {
                                error!("Signal intake task failed: {}", e);
                            }
                        }
                    })
                },
                move || -> PhaseFuture<bool> {
                    Box::pin(async move {
                        let poll = Duration::from_millis(drain.shutdown.config().poll_interval_ms.max(1));
                        while drain.executor.in_flight() > 0 {
                            tokio::time::sleep(poll).await;
                        }
                        drain.lifecycle.settle().await;
                        true
                    })
                },
                move || -> PhaseFuture<std::result::Result<(), String>> {
                    Box::pin(async move {
                        checkpoint.lifecycle.stop_monitors().await;
                        checkpoint
                            .lifecycle
                            .checkpoint()
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    })
                },
                move || -> PhaseFuture<std::result::Result<(), String>> {
                    Box::pin(async move { flush.store.flush().await.map_err(|e| e.to_string()) })
                },
            )
            .await
            .map_err(|e| WardenError::Internal(format!("shutdown: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::{Signal, SignalDirection};
    use crate::exchange::PaperExchange;
    use crate::persistence::MemoryStateStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn signal(direction: SignalDirection, confidence: Decimal) -> SignalEvent {
        SignalEvent {
            signal: Signal {
                symbol: "ETHUSDT".into(),
                direction,
                confidence,
                generated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                feature_snapshot_ref: "features/42".into(),
                model_id: "lgbm-v3".into(),
            },
            atr: dec!(50),
            reference_price: dec!(1000),
        }
    }

    async fn engine() -> (Arc<PaperExchange>, TradingEngine) {
        let config = test_config();
        let exchange = Arc::new(PaperExchange::new(&config.paper));
        let engine = TradingEngine::start(config, exchange.clone(), Arc::new(MemoryStateStore::new()))
            .await
            .unwrap();
        (exchange, engine)
    }

    #[tokio::test]
    async fn test_flat_and_low_confidence_signals_skip() {
        let (exchange, engine) = engine().await;
        let flat = engine.on_signal(signal(SignalDirection::Flat, dec!(0.9))).await.unwrap();
        assert_eq!(flat, SignalOutcome::Skipped(SizingSkip::NoDirection));
        let weak = engine.on_signal(signal(SignalDirection::Long, dec!(0.2))).await.unwrap();
        assert!(matches!(weak, SignalOutcome::Skipped(SizingSkip::LowConfidence { .. })));
        assert_eq!(exchange.submit_calls().await, 0);
    }

    #[tokio::test]
    async fn test_exchange_reject_releases_budget_and_alerts() {
        let (exchange, engine) = engine().await;
        let mut alerts = engine.subscribe_alerts();
        exchange
            .push_submit_fault(crate::exchange::SubmitFault::Reject("insufficient margin".into()))
            .await;

        let result = engine.on_signal(signal(SignalDirection::Long, dec!(0.9))).await;
        assert!(matches!(result, Err(WardenError::RejectedByExchange { .. })));
        assert_eq!(engine.ledger().snapshot().await.committed_margin, Decimal::ZERO);
        assert!(engine.lifecycle().positions().is_empty());
        let alert = alerts.recv().await.unwrap();
        assert!(alert.title.starts_with("Open rejected"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_intake() {
        let (_exchange, engine) = engine().await;
        let engine = Arc::new(engine);
        engine.shutdown().await.unwrap();
        assert!(!engine.is_accepting());
        let outcome = engine.on_signal(signal(SignalDirection::Long, dec!(0.9))).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Halted(_)));
    }
}
