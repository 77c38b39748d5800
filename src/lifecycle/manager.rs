//! Position Lifecycle Manager
//!
//! Owns every live position and the monitor task supervising it. Closing a
//! position is one logical unit, serialized with every snapshot write:
//! append the trade, then release the risk budget, drop the monitor, rewrite
//! the open-position snapshot and book equity and compliance records. A crash
//! anywhere inside it is repaired at startup from the snapshot, the trade log
//! and the exchange's position list.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::exit_machine::{ExitStateMachine, TickOutcome};
use super::monitor::MonitorHandle;
use super::reconciliation::{diff_positions, Discrepancy, ReconciliationResult};
use crate::account::{AccountState, EquityTracker};
use crate::coordination::TradingCircuitBreaker;
use crate::domain::{
    margin_for, ClientRequestId, ComplianceEntry, EquitySnapshot, ExitReason, Fill, MarketTick,
    Position, PositionId, PositionStatus, Trade,
};
use crate::error::{Result, WardenError};
use crate::execution::OrderExecutor;
use crate::persistence::{PersistedState, StateStore};
use crate::risk::{Reservation, RiskLedger, SizedPlan};
use crate::supervisor::AlertManager;

const STREAM_CAPACITY: usize = 256;

/// State shared between the manager and its monitor tasks
pub struct LifecycleContext {
    executor: Arc<OrderExecutor>,
    store: Arc<dyn StateStore>,
    ledger: Arc<RiskLedger>,
    account: Arc<EquityTracker>,
    breaker: Arc<TradingCircuitBreaker>,
    alerts: Arc<AlertManager>,
    /// Every live position, PENDING_OPEN included
    positions: DashMap<PositionId, Position>,
    monitors: DashMap<PositionId, MonitorHandle>,
    /// Positions with an open or close order in flight
    busy: DashSet<PositionId>,
    /// Serializes snapshot writes and close finalization
    commit: Mutex<()>,
    reconcile_requested: Notify,
    trade_tx: broadcast::Sender<Trade>,
    equity_tx: broadcast::Sender<EquitySnapshot>,
}

impl LifecycleContext {
    pub(crate) fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub(crate) fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub(crate) fn mark_busy(&self, id: PositionId) {
        self.busy.insert(id);
    }

    pub(crate) fn clear_busy(&self, id: &PositionId) {
        self.busy.remove(id);
    }

    pub(crate) fn request_reconciliation(&self) {
        debug!("Reconciliation requested");
        self.reconcile_requested.notify_one();
    }

    /// Mirror a machine transition and persist the snapshot
    pub(crate) async fn record_transition(&self, position: &Position) {
        let updated = match self.positions.get_mut(&position.id) {
            Some(mut entry) => {
                *entry = position.clone();
                true
            }
            None => false,
        };
        if !updated {
            return;
        }
        if let Err(e) = self.checkpoint().await {
            self.persistence_failed(&e).await;
        }
    }

    async fn checkpoint(&self) -> Result<u64> {
        let _commit = self.commit.lock().await;
        self.save_snapshot_locked().await
    }

    /// Caller holds `commit`
    async fn save_snapshot_locked(&self) -> Result<u64> {
        let mut positions: Vec<Position> =
            self.positions.iter().map(|e| e.value().clone()).collect();
        positions.sort_by_key(|p| p.opened_at);
        self.store.save_open_positions(&positions).await
    }

    async fn persistence_failed(&self, err: &WardenError) {
        let message = err.to_string();
        error!("State store write failed, halting new opens: {}", message);
        self.breaker.persistence_failed(&message).await;
        self.alerts.persistence_failed(&message).await;
    }

    async fn record_compliance(&self, entry: &ComplianceEntry) -> Result<u64> {
        info!(
            target: "compliance",
            phase = ?entry.phase,
            position_id = %entry.position_id,
            symbol = %entry.symbol,
            model_id = %entry.model_id,
            feature_snapshot_ref = %entry.feature_snapshot_ref,
            confidence = %entry.signal_confidence,
            size = %entry.sizing.size,
            leverage = %entry.sizing.leverage,
            exit_reason = ?entry.exit_reason,
            realized_pnl = ?entry.realized_pnl,
            "AI-assisted trade"
        );
        self.store.append_compliance(entry).await
    }

    /// Book a closed position. Idempotent per position.
    ///
    /// The trade is appended before anything else changes. If that write
    /// fails the position keeps its snapshot entry and its budget, and the
    /// next reconciliation books the close again from the exchange's record.
    pub(crate) async fn finalize_close(&self, trade: Trade) -> Result<()> {
        let id = trade.position_id();
        let commit = self.commit.lock().await;
        if !self.positions.contains_key(&id) {
            debug!(position_id = %id, "Close already finalized");
            return Ok(());
        }
        if let Err(e) = self.store.append_trade(&trade).await {
            // The closing monitor exits either way; the position waits unsupervised
            self.monitors.remove(&id);
            drop(commit);
            error!(
                position_id = %id,
                exit = %trade.exit_price,
                size = %trade.exit_size,
                "Trade not recorded, position kept for reconciliation: {}", e
            );
            self.persistence_failed(&e).await;
            self.request_reconciliation();
            return Err(e);
        }

        self.positions.remove(&id);
        self.busy.remove(&id);
        self.monitors.remove(&id);
        self.ledger.release(&id).await;
        self.executor.release(&trade.position);
        let mut first_error = self.save_snapshot_locked().await.err();
        let (account, snapshot, booking_error) = self.book_locked(&trade).await;
        first_error = first_error.or(booking_error);
        drop(commit);

        self.publish(trade, account, snapshot).await;
        match first_error {
            Some(e) => {
                self.persistence_failed(&e).await;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Book the executed part of a close and shrink the live position to
    /// `remaining`. Nothing changes unless the trade is recorded first.
    pub(crate) async fn book_partial_close(&self, trade: Trade, remaining: &Position) -> Result<()> {
        let id = trade.position_id();
        let commit = self.commit.lock().await;
        if let Err(e) = self.store.append_trade(&trade).await {
            drop(commit);
            error!(
                position_id = %id,
                exit = %trade.exit_price,
                size = %trade.exit_size,
                pnl = %trade.realized_pnl,
                "Partial close not recorded: {}", e
            );
            self.persistence_failed(&e).await;
            self.request_reconciliation();
            return Err(e);
        }

        if let Some(mut entry) = self.positions.get_mut(&id) {
            *entry = remaining.clone();
        }
        let equity = self.account.equity().await + trade.realized_pnl;
        self.ledger
            .adjust(
                &id,
                remaining.margin,
                remaining.exit_plan.stop_distance * remaining.size,
                equity,
            )
            .await;
        let (account, snapshot, booking_error) = self.book_locked(&trade).await;
        let first_error = self.save_snapshot_locked().await.err().or(booking_error);
        drop(commit);

        self.publish(trade, account, snapshot).await;
        match first_error {
            Some(e) => {
                self.persistence_failed(&e).await;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Apply a recorded trade to the account and append its equity and
    /// compliance entries. Caller holds `commit`.
    async fn book_locked(&self, trade: &Trade) -> (AccountState, EquitySnapshot, Option<WardenError>) {
        let account = self.account.apply_trade(trade).await;
        let committed = self.ledger.snapshot().await.committed_margin;
        let snapshot = self.account.snapshot(committed, trade.closed_at).await;
        let mut first_error = self.store.append_equity(&snapshot).await.err();
        if let Err(e) = self.record_compliance(&ComplianceEntry::closed(trade)).await {
            first_error = first_error.or(Some(e));
        }
        (account, snapshot, first_error)
    }

    async fn publish(&self, trade: Trade, account: AccountState, snapshot: EquitySnapshot) {
        info!(
            position_id = %trade.position_id(),
            symbol = %trade.position.symbol,
            reason = %trade.exit_reason,
            size = %trade.exit_size,
            remaining = %trade.remaining_size(),
            pnl = %trade.realized_pnl,
            equity = %account.equity,
            daily_pnl = %account.daily_pnl,
            "Trade booked"
        );
        let closed_at = trade.closed_at;
        let _ = self.trade_tx.send(trade);
        let _ = self.equity_tx.send(snapshot);

        if self
            .breaker
            .update_daily_pnl(account.daily_pnl, account.day_start_equity, closed_at)
            .await
        {
            self.alerts
                .circuit_breaker_tripped(&format!(
                    "daily realized PnL {} on day-start equity {}",
                    account.daily_pnl, account.day_start_equity
                ))
                .await;
        }
    }
}

fn reservation_for(position: &Position, equity: Decimal) -> Reservation {
    let risk_amount = position.exit_plan.stop_distance * position.size;
    Reservation {
        position_id: position.id,
        symbol: position.symbol.clone(),
        direction: position.direction,
        margin: position.margin,
        risk_amount,
        risk_fraction: if equity > Decimal::ZERO {
            risk_amount / equity
        } else {
            Decimal::ZERO
        },
    }
}

/// Position lifecycle manager
#[derive(Clone)]
pub struct PositionLifecycleManager {
    ctx: Arc<LifecycleContext>,
}

impl PositionLifecycleManager {
    pub fn new(
        executor: Arc<OrderExecutor>,
        store: Arc<dyn StateStore>,
        ledger: Arc<RiskLedger>,
        account: Arc<EquityTracker>,
        breaker: Arc<TradingCircuitBreaker>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let (trade_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (equity_tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            ctx: Arc::new(LifecycleContext {
                executor,
                store,
                ledger,
                account,
                breaker,
                alerts,
                positions: DashMap::new(),
                monitors: DashMap::new(),
                busy: DashSet::new(),
                commit: Mutex::new(()),
                reconcile_requested: Notify::new(),
                trade_tx,
                equity_tx,
            }),
        }
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<Trade> {
        self.ctx.trade_tx.subscribe()
    }

    pub fn subscribe_equity(&self) -> broadcast::Receiver<EquitySnapshot> {
        self.ctx.equity_tx.subscribe()
    }

    /// Live positions, oldest first
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.ctx.positions.iter().map(|e| e.value().clone()).collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub fn position(&self, id: &PositionId) -> Option<Position> {
        self.ctx.positions.get(id).map(|p| p.value().clone())
    }

    /// Number of running monitor tasks
    pub fn monitor_count(&self) -> usize {
        self.ctx.monitors.len()
    }

    pub fn has_monitor(&self, id: &PositionId) -> bool {
        self.ctx.monitors.contains_key(id)
    }

    /// Resolves when a monitor or an execution failure asked for reconciliation
    pub async fn reconciliation_requested(&self) {
        self.ctx.reconcile_requested.notified().await
    }

    pub fn request_reconciliation(&self) {
        self.ctx.request_reconciliation();
    }

    /// Register an accepted plan as PENDING_OPEN and persist it before any
    /// order goes out. The plan's reservation is released if that fails.
    pub async fn begin_open(&self, plan: &SizedPlan, at: DateTime<Utc>) -> Result<ExitStateMachine> {
        let position = plan.pending_position(at);
        let id = position.id;
        self.ctx.mark_busy(id);
        self.ctx.positions.insert(id, position.clone());

        if let Err(e) = self.ctx.checkpoint().await {
            self.ctx.positions.remove(&id);
            self.ctx.clear_busy(&id);
            self.ctx.ledger.release(&id).await;
            self.ctx.persistence_failed(&e).await;
            return Err(e);
        }
        Ok(ExitStateMachine::pending(position))
    }

    /// Open order filled: re-bind the reservation to the fill, start the
    /// monitor and record the open.
    pub async fn confirm_open(
        &self,
        mut machine: ExitStateMachine,
        filled: Position,
    ) -> Result<Position> {
        machine.confirm_open(filled)?;
        let position = machine.position().clone();
        let id = position.id;

        let equity = self.ctx.account.equity().await;
        self.ctx
            .ledger
            .adjust(
                &id,
                position.margin,
                position.exit_plan.stop_distance * position.size,
                equity,
            )
            .await;
        self.ctx.positions.insert(id, position.clone());
        self.attach(machine);
        self.ctx.clear_busy(&id);

        let mut first_error = self.ctx.checkpoint().await.err();
        if let Err(e) = self
            .ctx
            .record_compliance(&ComplianceEntry::opened(&position))
            .await
        {
            first_error = first_error.or(Some(e));
        }
        let committed = self.ctx.ledger.snapshot().await.committed_margin;
        let snapshot = self.ctx.account.snapshot(committed, position.opened_at).await;
        if let Err(e) = self.ctx.store.append_equity(&snapshot).await {
            first_error = first_error.or(Some(e));
        }
        let _ = self.ctx.equity_tx.send(snapshot);

        if let Some(e) = first_error {
            self.ctx.persistence_failed(&e).await;
            return Err(e);
        }
        Ok(position)
    }

    /// Open order definitively failed: forget the position and free its budget
    pub async fn abandon_open(&self, mut machine: ExitStateMachine) -> Result<()> {
        let id = machine.position().id;
        if let Err(e) = machine.abandon_open() {
            warn!(position_id = %id, "Abandoning open in unexpected state: {}", e);
        }
        self.drop_pending(&id).await
    }

    /// Open outcome unknown: keep the PENDING_OPEN record and its budget until
    /// reconciliation finds out what the exchange did
    pub fn leave_unresolved(&self, machine: ExitStateMachine) {
        let id = machine.position().id;
        warn!(position_id = %id, "Open outcome unknown, holding budget for reconciliation");
        self.ctx.clear_busy(&id);
        self.ctx.request_reconciliation();
    }

    async fn drop_pending(&self, id: &PositionId) -> Result<()> {
        if let Some((_, position)) = self.ctx.positions.remove(id) {
            self.ctx.executor.release(&position);
        }
        self.ctx.clear_busy(id);
        self.ctx.ledger.release(id).await;
        if let Err(e) = self.ctx.checkpoint().await {
            self.ctx.persistence_failed(&e).await;
            return Err(e);
        }
        Ok(())
    }

    fn attach(&self, machine: ExitStateMachine) {
        let id = machine.position().id;
        if self.ctx.monitors.contains_key(&id) {
            error!(position_id = %id, "Position already has a monitor, not attaching another");
            return;
        }
        let handle = MonitorHandle::spawn(machine, self.ctx.clone());
        self.ctx.monitors.insert(id, handle);
    }

    /// Route a tick to every monitor for its symbol and wait for each evaluation
    pub async fn route_tick(&self, tick: &MarketTick) -> Vec<(PositionId, Result<TickOutcome>)> {
        let senders: Vec<_> = self
            .ctx
            .monitors
            .iter()
            .filter(|m| m.value().symbol() == tick.symbol)
            .map(|m| m.value().sender())
            .collect();

        let outcomes = futures::future::join_all(
            senders.iter().map(|sender| sender.tick(tick.clone())),
        )
        .await;
        senders
            .iter()
            .map(|s| s.position_id())
            .zip(outcomes)
            .collect()
    }

    /// Wait until no monitor has a close in flight
    pub async fn settle(&self) {
        let senders: Vec<_> = self.ctx.monitors.iter().map(|m| m.value().sender()).collect();
        futures::future::join_all(senders.iter().map(|s| s.settle())).await;
    }

    /// Stop every monitor. In-flight closes are allowed to finish.
    pub async fn stop_monitors(&self) {
        let ids: Vec<PositionId> = self.ctx.monitors.iter().map(|m| *m.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.ctx.monitors.remove(&id) {
                handle.stop().await;
            }
        }
        info!("All position monitors stopped");
    }

    /// Persist the open-position snapshot
    pub async fn checkpoint(&self) -> Result<u64> {
        let result = self.ctx.checkpoint().await;
        if let Err(e) = &result {
            self.ctx.persistence_failed(e).await;
        }
        result
    }

    /// Re-attach positions persisted before the last exit. Ledger budgets are
    /// restored for every live position; PENDING_OPEN records wait for
    /// reconciliation.
    pub async fn recover(&self, state: &PersistedState) -> Result<usize> {
        let equity = self.ctx.account.equity().await;
        let live = state.live_positions();
        let skipped = state.open_positions.len() - live.len();
        if skipped > 0 {
            info!(skipped, "Snapshot positions already closed in the trade log");
        }

        for position in &live {
            self.ctx
                .ledger
                .restore(reservation_for(position, equity))
                .await;
            if position.status == PositionStatus::PendingOpen {
                self.ctx.positions.insert(position.id, position.clone());
                continue;
            }
            let machine = ExitStateMachine::recovered(position.clone());
            self.ctx
                .positions
                .insert(position.id, machine.position().clone());
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                direction = %position.direction,
                entry = %position.entry_price,
                stop = %position.stop_price,
                target = %position.target_price,
                "Re-attached recovered position"
            );
            self.attach(machine);
        }

        self.checkpoint().await?;
        Ok(live.len())
    }

    /// Compare local positions with the exchange and repair what can be repaired
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let start = Instant::now();
        let exchange = self
            .ctx
            .executor
            .client()
            .list_open_positions()
            .await
            .map_err(|source| WardenError::TransientExchange {
                attempts: 1,
                source,
            })?;

        let local = self.positions();
        let busy: HashSet<ClientRequestId> = local
            .iter()
            .filter(|p| self.ctx.busy.contains(&p.id))
            .map(|p| p.open_request_id.clone())
            .collect();
        let discrepancies = diff_positions(&local, &exchange, &busy);

        let mut auto_corrections = 0;
        let mut critical_issues = 0;
        for discrepancy in &discrepancies {
            let outcome = match discrepancy {
                Discrepancy::LocalOnly { position_id, .. } => {
                    self.close_missing(position_id, now).await
                }
                Discrepancy::ExchangeOnly {
                    symbol,
                    direction,
                    size,
                    entry_price,
                } => {
                    critical_issues += 1;
                    self.ctx
                        .alerts
                        .untracked_exchange_position(
                            symbol,
                            &format!("{} {} @ {}", direction, size, entry_price),
                        )
                        .await;
                    continue;
                }
                Discrepancy::SizeMismatch {
                    position_id,
                    exchange_size,
                    ..
                } => self.correct_size(position_id, *exchange_size).await,
                Discrepancy::PendingFilled {
                    position_id,
                    entry_price,
                    size,
                    ..
                } => self.adopt_pending(position_id, *entry_price, *size).await,
                Discrepancy::PendingUnfilled { position_id, .. } => {
                    self.drop_pending(position_id).await
                }
            };
            match outcome {
                Ok(()) => auto_corrections += 1,
                Err(e) => error!(
                    symbol = %discrepancy.symbol(),
                    "Reconciliation correction failed: {}", e
                ),
            }
        }

        let rearmed = self.rearm_held_closes(&discrepancies).await;
        if rearmed > 0 {
            info!(rearmed, "Re-armed positions whose close never reached the exchange");
        }

        let result = ReconciliationResult {
            timestamp: now,
            discrepancies_found: discrepancies.len(),
            auto_corrections,
            critical_issues,
            duration_ms: start.elapsed().as_millis() as u64,
            discrepancies,
        };
        if result.is_clean() {
            debug!(positions = local.len(), "Reconciliation clean");
        } else {
            warn!(
                "Reconciliation completed: {} discrepancies, {} auto-corrected, {} critical ({}ms)",
                result.discrepancies_found,
                result.auto_corrections,
                result.critical_issues,
                result.duration_ms
            );
        }
        Ok(result)
    }

    /// A close whose outcome was unknown holds its monitor in CLOSING. If the
    /// exchange still has the position after this pass, the close did not go
    /// through: re-arm under the next close generation.
    async fn rearm_held_closes(&self, discrepancies: &[Discrepancy]) -> usize {
        let resolved: HashSet<PositionId> = discrepancies
            .iter()
            .filter_map(|d| match d {
                Discrepancy::LocalOnly { position_id, .. } => Some(*position_id),
                _ => None,
            })
            .collect();
        let held: Vec<PositionId> = self
            .ctx
            .positions
            .iter()
            .filter(|p| {
                p.status == PositionStatus::Closing
                    && !self.ctx.busy.contains(p.key())
                    && !resolved.contains(p.key())
            })
            .map(|p| *p.key())
            .collect();

        let mut rearmed = 0;
        for id in held {
            let sender = self.ctx.monitors.get(&id).map(|h| h.value().sender());
            if let Some(sender) = sender {
                if sender.rearm().await {
                    rearmed += 1;
                }
            }
        }
        rearmed
    }

    /// The exchange no longer holds the position: book it as RECONCILED
    async fn close_missing(&self, id: &PositionId, now: DateTime<Utc>) -> Result<()> {
        if let Some((_, handle)) = self.ctx.monitors.remove(id) {
            handle.stop().await;
        }
        // The monitor may have booked its own close while stopping
        let Some(position) = self.position(id) else {
            return Ok(());
        };

        let price = self.last_known_exit_price(&position).await;
        let trade = Trade::from_close(
            &position,
            Fill {
                price,
                size: position.size,
            },
            ExitReason::Reconciled,
            now,
        );
        warn!(
            position_id = %id,
            symbol = %position.symbol,
            exit = %price,
            "Position missing on exchange, booking reconciled close"
        );
        self.ctx.finalize_close(trade).await
    }

    /// Fill of the newest close order that executed, else the venue's last
    /// price, else the entry. Every close generation is checked: an order
    /// whose outcome was unknown may have filled before a later re-arm.
    async fn last_known_exit_price(&self, position: &Position) -> Decimal {
        let client = self.ctx.executor.client();
        for generation in (0..=position.close_generation).rev() {
            let id = ClientRequestId::for_close(position.id, generation);
            match client.query_status(&id).await {
                Ok(state) => {
                    if let Some(fill) = state.executed() {
                        debug!(position_id = %position.id, generation, price = %fill.price, "Found executed close");
                        return fill.price;
                    }
                }
                Err(e) => debug!(client_request_id = %id, "Close status lookup failed: {}", e),
            }
        }
        match client.last_price(&position.symbol).await {
            Ok(Some(price)) => price,
            Ok(None) => position.entry_price,
            Err(e) => {
                debug!(symbol = %position.symbol, "Last price lookup failed: {}", e);
                position.entry_price
            }
        }
    }

    async fn correct_size(&self, id: &PositionId, size: Decimal) -> Result<()> {
        let Some(position) = self.position(id) else {
            return Err(WardenError::PositionNotFound(*id));
        };
        warn!(
            position_id = %id,
            local = %position.size,
            exchange = %size,
            "Adopting exchange position size"
        );
        let sender = self.ctx.monitors.get(id).map(|h| h.value().sender());
        let delivered = match sender {
            Some(sender) => sender.correct_size(size).await,
            None => false,
        };
        if !delivered {
            let mut corrected = position.clone();
            corrected.size = size;
            corrected.margin = margin_for(size, corrected.entry_price, corrected.leverage);
            self.ctx.record_transition(&corrected).await;
        }

        let equity = self.ctx.account.equity().await;
        self.ctx
            .ledger
            .adjust(
                id,
                margin_for(size, position.entry_price, position.leverage),
                position.exit_plan.stop_distance * size,
                equity,
            )
            .await;
        Ok(())
    }

    /// An open whose outcome was unknown did fill: start supervising it
    async fn adopt_pending(&self, id: &PositionId, entry_price: Decimal, size: Decimal) -> Result<()> {
        let Some(position) = self.position(id) else {
            return Err(WardenError::PositionNotFound(*id));
        };
        let mut filled = position.clone();
        filled.apply_open_fill(
            Fill {
                price: entry_price,
                size,
            },
            position.opened_at,
        );
        info!(position_id = %id, entry = %entry_price, size = %size, "Adopting open found on exchange");
        self.confirm_open(ExitStateMachine::pending(position), filled)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::coordination::CircuitBreakerConfig;
    use crate::domain::{Direction, ExitState, Order, Signal, SignalDirection, SignalEvent};
    use crate::exchange::{ExchangeClient, PaperExchange};
    use crate::persistence::MemoryStateStore;
    use crate::risk::{GateDecision, PositionSizer, RiskGate};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    struct Fixture {
        exchange: Arc<PaperExchange>,
        store: Arc<MemoryStateStore>,
        ledger: Arc<RiskLedger>,
        manager: PositionLifecycleManager,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let config = test_config();
        let exchange = Arc::new(PaperExchange::new(&config.paper));
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(RiskLedger::new());
        let executor = Arc::new(OrderExecutor::new(exchange.clone(), config.execution.clone()));
        let manager = PositionLifecycleManager::new(
            executor,
            store.clone(),
            ledger.clone(),
            Arc::new(EquityTracker::new(config.account.initial_equity, t0())),
            Arc::new(TradingCircuitBreaker::new(CircuitBreakerConfig::from(&config.risk))),
            Arc::new(AlertManager::with_defaults()),
        );
        Fixture {
            exchange,
            store,
            ledger,
            manager,
        }
    }

    async fn accepted_plan(f: &Fixture) -> SizedPlan {
        let config = test_config();
        let sizer = PositionSizer::new(config.sizing.clone(), &config.risk);
        let event = SignalEvent {
            signal: Signal {
                symbol: "ETHUSDT".into(),
                direction: SignalDirection::Long,
                confidence: dec!(0.9),
                generated_at: t0(),
                feature_snapshot_ref: "features/1".into(),
                model_id: "model-a".into(),
            },
            atr: dec!(50),
            reference_price: dec!(1000),
        };
        let plan = sizer
            .size(&event, dec!(10000), &config.risk.limits)
            .unwrap();
        let gate = RiskGate::new(config.risk.limits.clone(), f.ledger.clone());
        match gate.evaluate(plan, dec!(10000)).await {
            GateDecision::Accept(plan) => plan,
            GateDecision::Reject(r) => panic!("rejected: {}", r),
        }
    }

    async fn open(f: &Fixture) -> Position {
        let plan = accepted_plan(f).await;
        let machine = f.manager.begin_open(&plan, t0()).await.unwrap();
        assert_eq!(machine.state(), ExitState::PendingOpen);
        let executor = OrderExecutor::new(f.exchange.clone(), test_config().execution);
        let filled = executor.open(&plan, t0()).await.unwrap();
        f.manager.confirm_open(machine, filled).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_then_stop_books_trade_once() {
        let f = fixture();
        let mut trades = f.manager.subscribe_trades();
        let position = open(&f).await;
        assert_eq!(f.manager.monitor_count(), 1);
        assert!(f.ledger.is_consistent().await);

        let tick = MarketTick::price("ETHUSDT", t0() + Duration::minutes(5), dec!(940));
        f.exchange.set_price("ETHUSDT", dec!(940)).await;
        let outcomes = f.manager.route_tick(&tick).await;
        assert!(matches!(
            outcomes[0].1,
            Ok(TickOutcome::Triggered {
                reason: ExitReason::EarlyFailure,
                ..
            })
        ));
        f.manager.settle().await;

        let trade = trades.recv().await.unwrap();
        assert_eq!(trade.position_id(), position.id);
        assert_eq!(f.manager.monitor_count(), 0);
        assert!(f.manager.positions().is_empty());
        assert_eq!(f.ledger.snapshot().await.committed_margin, Decimal::ZERO);

        let state = f.store.load().await.unwrap();
        assert_eq!(state.trades.len(), 1);
        assert!(state.open_positions.is_empty());
        assert_eq!(f.store.compliance_entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_books_position_closed_elsewhere() {
        let f = fixture();
        let position = open(&f).await;
        f.exchange.remove_position(&position.open_request_id).await;
        f.exchange.set_price("ETHUSDT", dec!(1020)).await;

        let result = f.manager.reconcile(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(result.discrepancies_found, 1);
        assert_eq!(result.auto_corrections, 1);

        let state = f.store.load().await.unwrap();
        let trade = &state.trades[0].record;
        assert_eq!(trade.exit_reason, ExitReason::Reconciled);
        assert_eq!(trade.exit_price, dec!(1020));
        assert!(!f.manager.has_monitor(&position.id));
        assert!(f.ledger.is_consistent().await);
    }

    #[tokio::test]
    async fn test_reconciled_close_uses_fill_of_earlier_generation() {
        let f = fixture();
        let position = open(&f).await;
        // Generation 0 filled after the machine had moved on to generation 1
        let late = Order::market_close(
            ClientRequestId::for_close(position.id, 0),
            &position.symbol,
            position.direction.closing_side(),
            position.size,
            dec!(940),
            position.leverage,
            position.open_request_id.clone(),
        );
        let executor = OrderExecutor::new(f.exchange.clone(), test_config().execution);
        executor.execute(&late).await.unwrap();
        if let Some(mut entry) = f.manager.ctx.positions.get_mut(&position.id) {
            entry.close_generation = 1;
        }
        f.exchange.set_price("ETHUSDT", dec!(1200)).await;

        f.manager.reconcile(t0() + Duration::hours(1)).await.unwrap();
        let state = f.store.load().await.unwrap();
        let trade = &state.trades[0].record;
        assert_eq!(trade.exit_reason, ExitReason::Reconciled);
        assert_eq!(trade.exit_price, dec!(940));
        assert!(f.manager.positions().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_open_is_adopted_by_reconciliation() {
        let f = fixture();
        let plan = accepted_plan(&f).await;
        let machine = f.manager.begin_open(&plan, t0()).await.unwrap();
        // The order reached the exchange but the caller never heard back
        let executor = OrderExecutor::new(f.exchange.clone(), test_config().execution);
        executor.open(&plan, t0()).await.unwrap();
        f.manager.leave_unresolved(machine);

        let result = f.manager.reconcile(t0()).await.unwrap();
        assert!(matches!(
            result.discrepancies[0],
            Discrepancy::PendingFilled { .. }
        ));
        assert!(f.manager.has_monitor(&plan.position_id));
        let adopted = f.manager.position(&plan.position_id).unwrap();
        assert_eq!(adopted.status, PositionStatus::Open);
        assert_eq!(adopted.direction, Direction::Long);
        assert_eq!(f.ledger.snapshot().await.open_long_count, 1);
    }

    #[tokio::test]
    async fn test_abandoned_open_releases_budget() {
        let f = fixture();
        let plan = accepted_plan(&f).await;
        let machine = f.manager.begin_open(&plan, t0()).await.unwrap();
        f.manager.abandon_open(machine).await.unwrap();

        assert!(f.manager.positions().is_empty());
        assert_eq!(f.ledger.snapshot().await.open_long_count, 0);
        assert_eq!(f.exchange.submit_calls().await, 0);
        assert!(f.exchange.list_open_positions().await.unwrap().is_empty());
    }
}
