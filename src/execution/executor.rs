use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::idempotency::IdempotencyManager;
use crate::config::ExecutionConfig;
use crate::domain::{ClientRequestId, ExitReason, Fill, Order, Position, Trade};
use crate::error::{ExchangeError, Result, WardenError};
use crate::exchange::{ExchangeClient, OrderState};
use crate::risk::SizedPlan;

/// Order executor: submit → verify → reconcile with bounded retries
pub struct OrderExecutor {
    client: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    idempotency: Arc<IdempotencyManager>,
}

/// Execution result with the authoritative fill
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecutionResult {
    pub client_request_id: String,
    pub fill: Fill,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, config: ExecutionConfig) -> Self {
        Self {
            client,
            config,
            idempotency: Arc::new(IdempotencyManager::new()),
        }
    }

    /// Share an idempotency registry with other executors
    pub fn with_idempotency(mut self, idempotency: Arc<IdempotencyManager>) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.client.is_dry_run()
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    /// Requests currently talking to the exchange
    pub fn in_flight(&self) -> usize {
        self.idempotency.in_flight_count()
    }

    /// Request ids still remembered for deduplication
    pub fn tracked_requests(&self) -> usize {
        self.idempotency.len()
    }

    /// Release every request id a finished position used: its open and each
    /// close generation.
    pub fn release(&self, position: &Position) -> usize {
        let mut ids = vec![position.open_request_id.clone()];
        ids.extend(
            (0..=position.close_generation)
                .map(|generation| ClientRequestId::for_close(position.id, generation)),
        );
        self.idempotency.forget(&ids)
    }

    /// Open the position described by `plan`. The returned position carries the
    /// actual fill price and size, with stop and target re-anchored on the fill.
    pub async fn open(&self, plan: &SizedPlan, at: DateTime<Utc>) -> Result<Position> {
        let mut position = plan.pending_position(at);
        let order = Order::market_open(
            position.open_request_id.clone(),
            &position.symbol,
            position.direction.opening_side(),
            position.size,
            plan.entry_price,
            position.leverage,
        );

        let result = self.execute(&order).await?;
        if result.fill.size < plan.size {
            warn!(
                position_id = %position.id,
                requested = %plan.size,
                filled = %result.fill.size,
                "Open partially filled, keeping executed size"
            );
        }
        position.apply_open_fill(result.fill, at);

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            entry = %position.entry_price,
            size = %position.size,
            stop = %position.stop_price,
            target = %position.target_price,
            attempts = result.attempts,
            "Position opened"
        );
        Ok(position)
    }

    /// Close `position` with a reduce-only market order
    pub async fn close(
        &self,
        position: &Position,
        reason: ExitReason,
        reference_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Trade> {
        let order = Order::market_close(
            position.close_request_id(),
            &position.symbol,
            position.direction.closing_side(),
            position.size,
            reference_price,
            position.leverage,
            position.open_request_id.clone(),
        );

        let result = self.execute(&order).await?;
        if result.fill.size < position.size {
            warn!(
                position_id = %position.id,
                size = %position.size,
                closed = %result.fill.size,
                "Close partially filled"
            );
        }

        let trade = Trade::from_close(position, result.fill, reason, at);
        info!(
            position_id = %position.id,
            reason = %reason,
            exit = %trade.exit_price,
            pnl = %trade.realized_pnl,
            "Position closed"
        );
        Ok(trade)
    }

    /// Execute an order with idempotency protection and retry logic
    pub async fn execute(&self, order: &Order) -> Result<ExecutionResult> {
        let guard = self.idempotency.begin(order)?;

        let result = self.execute_with_retry(order).await;
        match &result {
            Ok(exec) => guard.complete(OrderState::Filled { fill: exec.fill }),
            Err(WardenError::RejectedByExchange { reason, .. }) => guard.fail(reason.clone()),
            // Outcome unknown: the guard marks the id as unresolved on drop
            Err(_) => drop(guard),
        }
        result
    }

    async fn execute_with_retry(&self, order: &Order) -> Result<ExecutionResult> {
        let start = Instant::now();
        let id = &order.client_request_id;
        let max_attempts = self.config.max_attempts.max(1);
        let mut outcome_unknown = false;
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(self.config.backoff(attempt - 1)).await;
            }

            // Never resubmit while a previous attempt may have executed:
            // ask the exchange first and only resubmit on NotFound.
            let response = if outcome_unknown {
                match self.bounded(self.client.query_status(id)).await {
                    Ok(OrderState::NotFound) => {
                        debug!(client_request_id = %id, "Verified not received, resubmitting");
                        outcome_unknown = false;
                        self.bounded(self.client.submit(order)).await
                    }
                    other => other,
                }
            } else {
                self.bounded(self.client.submit(order)).await
            };

            match response {
                Ok(OrderState::NotFound) => {
                    warn!(client_request_id = %id, attempt, "Exchange acknowledged an order it cannot find");
                    outcome_unknown = true;
                    last_error = Some(ExchangeError::Protocol("order not found after submit".into()));
                }
                Ok(state) => {
                    let fill = self.settle(order, state).await?;
                    return Ok(ExecutionResult {
                        client_request_id: id.to_string(),
                        fill,
                        attempts: attempt,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(ExchangeError::Rejected(reason)) => {
                    return Err(self.rejected(order, reason));
                }
                // Everything short of a rejection is retried; an ambiguous
                // failure switches the next attempt to verify-first.
                Err(e) => {
                    if e.is_ambiguous() {
                        outcome_unknown = true;
                    }
                    warn!(
                        client_request_id = %id,
                        attempt,
                        max_attempts,
                        outcome_unknown,
                        error = %e,
                        "Exchange call failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        if outcome_unknown {
            error!(
                client_request_id = %id,
                attempts = max_attempts,
                "Order outcome still unknown after all attempts"
            );
            return Err(WardenError::OutcomeUnknown {
                client_request_id: id.to_string(),
                attempts: max_attempts,
            });
        }

        error!(client_request_id = %id, attempts = max_attempts, "Order failed after all attempts");
        Err(WardenError::TransientExchange {
            attempts: max_attempts,
            source: last_error.unwrap_or(ExchangeError::Unavailable("no response".into())),
        })
    }

    /// Turn an exchange-side order state into a fill or a failure
    async fn settle(&self, order: &Order, state: OrderState) -> Result<Fill> {
        match state {
            OrderState::Filled { fill } => Ok(fill),
            OrderState::Rejected { reason } => Err(self.rejected(order, reason)),
            OrderState::Cancelled { filled: Some(fill) } if fill.size > Decimal::ZERO => Ok(fill),
            OrderState::Cancelled { .. } => Err(self.rejected(order, "cancelled before any fill".into())),
            OrderState::Pending | OrderState::PartiallyFilled { .. } => self.wait_for_fill(order).await,
            OrderState::NotFound => Err(WardenError::OutcomeUnknown {
                client_request_id: order.client_request_id.to_string(),
                attempts: 0,
            }),
        }
    }

    /// Poll an accepted order until it fills or the fill timeout passes, then
    /// cancel the remainder and keep whatever executed.
    async fn wait_for_fill(&self, order: &Order) -> Result<Fill> {
        let id = &order.client_request_id;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = Instant::now() + Duration::from_millis(self.config.fill_timeout_ms);

        while Instant::now() < deadline {
            sleep(poll_interval).await;
            match self.bounded(self.client.query_status(id)).await {
                Ok(OrderState::Filled { fill }) => return Ok(fill),
                Ok(OrderState::Rejected { reason }) => return Err(self.rejected(order, reason)),
                Ok(OrderState::Cancelled { filled: Some(fill) }) if fill.size > Decimal::ZERO => {
                    return Ok(fill)
                }
                Ok(OrderState::Cancelled { .. }) => {
                    return Err(self.rejected(order, "cancelled before any fill".into()))
                }
                Ok(state) => debug!(client_request_id = %id, state = %state, "Waiting for fill"),
                Err(e) => debug!(client_request_id = %id, error = %e, "Status poll failed"),
            }
        }

        info!(client_request_id = %id, "Fill timeout, cancelling remainder");
        match self.bounded(self.client.cancel(id)).await {
            Ok(OrderState::Filled { fill }) => Ok(fill),
            Ok(state) => match state.executed() {
                Some(fill) if fill.size > Decimal::ZERO => Ok(fill),
                _ if state.is_terminal() => {
                    Err(self.rejected(order, "not filled before timeout".into()))
                }
                _ => Err(WardenError::OutcomeUnknown {
                    client_request_id: id.to_string(),
                    attempts: 1,
                }),
            },
            Err(e) => {
                warn!(client_request_id = %id, error = %e, "Cancel failed, outcome unknown");
                Err(WardenError::OutcomeUnknown {
                    client_request_id: id.to_string(),
                    attempts: 1,
                })
            }
        }
    }

    /// Run one exchange call under the per-call timeout
    async fn bounded<F>(&self, call: F) -> std::result::Result<OrderState, ExchangeError>
    where
        F: Future<Output = std::result::Result<OrderState, ExchangeError>>,
    {
        let limit = Duration::from_millis(self.config.order_timeout_ms);
        match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                elapsed_ms: self.config.order_timeout_ms,
            }),
        }
    }

    fn rejected(&self, order: &Order, reason: String) -> WardenError {
        warn!(
            client_request_id = %order.client_request_id,
            reason = %reason,
            "Order rejected by exchange"
        );
        WardenError::RejectedByExchange {
            client_request_id: order.client_request_id.to_string(),
            reason,
        }
    }
}
