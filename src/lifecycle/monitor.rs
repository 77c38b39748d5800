//! Position Monitor
//!
//! One tokio task per open position. The task owns the position's exit state
//! machine, so ticks for one position are evaluated strictly in order while
//! different positions run independently. A close runs inside the task
//! alongside the tick queue; ticks that arrive meanwhile are acknowledged as
//! ignored. A close whose outcome is unknown keeps the machine in CLOSING
//! until reconciliation either books it or re-arms it.

use futures::future::{BoxFuture, OptionFuture};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::exit_machine::{ExitStateMachine, TickOutcome};
use super::manager::LifecycleContext;
use crate::domain::{ExitState, MarketTick, PositionId, Trade};
use crate::error::{Result, WardenError};

const MONITOR_QUEUE: usize = 256;

pub(crate) enum MonitorCommand {
    Tick {
        tick: MarketTick,
        reply: oneshot::Sender<Result<TickOutcome>>,
    },
    /// Reply once no close is in flight
    Settle(oneshot::Sender<()>),
    /// Adopt the exchange's size
    CorrectSize(Decimal),
    /// Leave a CLOSING state held after an unknown close outcome; replies
    /// whether the machine was re-armed
    Rearm(oneshot::Sender<bool>),
    /// Finish any in-flight close, then exit
    Stop,
}

/// Cloneable sending side of a monitor
#[derive(Clone)]
pub struct MonitorSender {
    position_id: PositionId,
    tx: mpsc::Sender<MonitorCommand>,
}

impl MonitorSender {
    pub fn position_id(&self) -> PositionId {
        self.position_id
    }

    /// Feed one tick and wait for its evaluation (not for a resulting close)
    pub async fn tick(&self, tick: MarketTick) -> Result<TickOutcome> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MonitorCommand::Tick { tick, reply })
            .await
            .is_err()
        {
            return Ok(TickOutcome::Ignored);
        }
        rx.await.unwrap_or(Ok(TickOutcome::Ignored))
    }

    /// Wait until the monitor has no close in flight
    pub async fn settle(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MonitorCommand::Settle(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) async fn correct_size(&self, size: Decimal) -> bool {
        self.tx.send(MonitorCommand::CorrectSize(size)).await.is_ok()
    }

    pub(crate) async fn rearm(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MonitorCommand::Rearm(reply)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Running monitor task
pub struct MonitorHandle {
    symbol: String,
    sender: MonitorSender,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(machine: ExitStateMachine, ctx: Arc<LifecycleContext>) -> Self {
        let (tx, rx) = mpsc::channel(MONITOR_QUEUE);
        let position_id = machine.position().id;
        let symbol = machine.position().symbol.clone();
        debug!(position_id = %position_id, symbol = %symbol, "Spawning position monitor");

        let monitor = PositionMonitor {
            machine,
            ctx,
            rx,
            settle_waiters: Vec::new(),
        };
        Self {
            symbol,
            sender: MonitorSender { position_id, tx },
            task: tokio::spawn(monitor.run()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn sender(&self) -> MonitorSender {
        self.sender.clone()
    }

    /// Ask the task to exit and wait for it. An in-flight close completes first.
    pub async fn stop(self) {
        let _ = self.sender.tx.send(MonitorCommand::Stop).await;
        if let Err(e) = self.task.await {
            error!(position_id = %self.sender.position_id, "Monitor task failed: {}", e);
        }
    }
}

struct PositionMonitor {
    machine: ExitStateMachine,
    ctx: Arc<LifecycleContext>,
    rx: mpsc::Receiver<MonitorCommand>,
    settle_waiters: Vec<oneshot::Sender<()>>,
}

impl PositionMonitor {
    async fn run(mut self) {
        let position_id = self.machine.position().id;
        let mut closing: OptionFuture<BoxFuture<'static, Result<Trade>>> = None.into();
        let mut close_in_flight = false;
        let mut stopping = false;

        loop {
            tokio::select! {
                Some(result) = &mut closing, if close_in_flight => {
                    closing = None.into();
                    close_in_flight = false;
                    let closed = self.on_close_result(result).await;
                    for waiter in self.settle_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    if closed || stopping {
                        break;
                    }
                }
                cmd = self.rx.recv(), if !stopping => match cmd {
                    Some(MonitorCommand::Tick { tick, reply }) => {
                        let outcome = self.machine.on_tick(&tick);
                        if let Ok(TickOutcome::Triggered { .. }) = &outcome {
                            match self.start_close().await {
                                Ok(close) => {
                                    closing = Some(close).into();
                                    close_in_flight = true;
                                }
                                Err(e) => error!(position_id = %position_id, "Could not start close: {}", e),
                            }
                        }
                        if let Err(e) = &outcome {
                            warn!(position_id = %position_id, "Tick discarded: {}", e);
                        }
                        let _ = reply.send(outcome);
                    }
                    Some(MonitorCommand::Settle(waiter)) => {
                        if close_in_flight {
                            self.settle_waiters.push(waiter);
                        } else {
                            let _ = waiter.send(());
                        }
                    }
                    Some(MonitorCommand::CorrectSize(size)) => {
                        self.machine.correct_size(size);
                        self.ctx.record_transition(self.machine.position()).await;
                    }
                    Some(MonitorCommand::Rearm(reply)) => {
                        let rearmed = !close_in_flight
                            && self.machine.state() == ExitState::Closing
                            && self.rearm("exchange still holds the position");
                        if rearmed {
                            self.ctx.record_transition(self.machine.position()).await;
                        }
                        let _ = reply.send(rearmed);
                    }
                    Some(MonitorCommand::Stop) | None => {
                        if !close_in_flight {
                            break;
                        }
                        debug!(position_id = %position_id, "Stop requested, waiting for in-flight close");
                        stopping = true;
                    }
                },
                else => break,
            }
        }

        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
        debug!(position_id = %position_id, state = %self.machine.state(), "Position monitor exited");
    }

    /// Enter CLOSING, persist it, and build the close call
    async fn start_close(&mut self) -> Result<BoxFuture<'static, Result<Trade>>> {
        let request = self.machine.begin_close()?;
        self.ctx.mark_busy(request.position.id);
        self.ctx.record_transition(self.machine.position()).await;

        let executor = self.ctx.executor().clone();
        Ok(Box::pin(async move {
            executor
                .close(
                    &request.position,
                    request.reason,
                    request.reference_price,
                    request.triggered_at,
                )
                .await
        }))
    }

    /// Returns true once the position is closed
    async fn on_close_result(&mut self, result: Result<Trade>) -> bool {
        let position_id = self.machine.position().id;
        self.ctx.clear_busy(&position_id);

        match result {
            Ok(trade) if !trade.is_final() => {
                if let Err(e) = self.machine.partially_closed(&trade) {
                    error!(position_id = %position_id, "Partial close in unexpected state: {}", e);
                    return false;
                }
                info!(
                    position_id = %position_id,
                    closed = %trade.exit_size,
                    remaining = %self.machine.position().size,
                    generation = self.machine.position().close_generation,
                    "Close partially filled, supervising remainder"
                );
                if let Err(e) = self
                    .ctx
                    .book_partial_close(trade, self.machine.position())
                    .await
                {
                    error!(position_id = %position_id, "Partial close booking incomplete: {}", e);
                }
                false
            }
            Ok(trade) => {
                if let Err(e) = self.machine.mark_closed(&trade) {
                    error!(position_id = %position_id, "Close confirmed in unexpected state: {}", e);
                }
                if let Err(e) = self.ctx.finalize_close(trade).await {
                    error!(position_id = %position_id, "Close finalization incomplete: {}", e);
                }
                true
            }
            // The order may still execute: stay in CLOSING until
            // reconciliation finds out
            Err(e @ WardenError::OutcomeUnknown { .. }) => {
                warn!(position_id = %position_id, "Close outcome unknown, holding for reconciliation: {}", e);
                self.ctx
                    .alerts()
                    .close_failed(position_id, &self.machine.position().symbol, &e.to_string())
                    .await;
                self.ctx.request_reconciliation();
                false
            }
            Err(e) => {
                warn!(position_id = %position_id, "Close failed, re-arming: {}", e);
                if self.rearm(&e.to_string()) {
                    self.ctx.record_transition(self.machine.position()).await;
                }
                self.ctx
                    .alerts()
                    .close_failed(position_id, &self.machine.position().symbol, &e.to_string())
                    .await;
                if e.requires_reconciliation()
                    || matches!(e, WardenError::RejectedByExchange { .. })
                {
                    self.ctx.request_reconciliation();
                }
                false
            }
        }
    }

    /// CLOSING back to OPEN under the next close generation
    fn rearm(&mut self, cause: &str) -> bool {
        let position_id = self.machine.position().id;
        if let Err(e) = self.machine.close_failed() {
            error!(position_id = %position_id, "Re-arm failed: {}", e);
            return false;
        }
        info!(
            position_id = %position_id,
            generation = self.machine.position().close_generation,
            cause,
            "Exit machine re-armed"
        );
        true
    }
}
