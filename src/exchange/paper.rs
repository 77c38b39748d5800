//! Paper exchange
//!
//! In-memory venue used for dry runs and tests. Orders fill immediately at
//! the last known price (or the order's reference price) with optional
//! adverse slippage. Faults can be scripted per call so the execution
//! protocol can be exercised deterministically.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::PaperExchangeConfig;
use crate::domain::{ClientRequestId, Direction, Fill, Order, OrderSide, Position, PositionStatus};
use crate::error::ExchangeError;
use crate::exchange::traits::{ExchangeClient, ExchangePosition, OrderState};

/// Scripted outcome for the next `submit` call
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitFault {
    /// The order executes, but the caller sees a timeout
    TimeoutAfterApply,
    /// The request never reaches the matching engine
    TimeoutBeforeApply,
    RateLimited,
    Unavailable,
    /// Confirmed rejection
    Reject(String),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order: Order,
    state: OrderState,
}

#[derive(Debug, Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    orders: HashMap<ClientRequestId, PaperOrder>,
    /// Keyed by the client request id of the opening order
    positions: HashMap<ClientRequestId, ExchangePosition>,
    submit_faults: VecDeque<SubmitFault>,
    query_faults: VecDeque<ExchangeError>,
    hold_pending: bool,
    partial_fill_fraction: Option<Decimal>,
    submit_calls: u64,
    executions: u64,
}

/// In-memory exchange
pub struct PaperExchange {
    slippage_bps: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(config: &PaperExchangeConfig) -> Self {
        Self {
            slippage_bps: config.slippage_bps,
            book: Mutex::new(PaperBook::default()),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.book.lock().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn push_submit_fault(&self, fault: SubmitFault) {
        self.book.lock().await.submit_faults.push_back(fault);
    }

    pub async fn push_query_fault(&self, fault: ExchangeError) {
        self.book.lock().await.query_faults.push_back(fault);
    }

    /// Accept orders without filling them until `release_pending`
    pub async fn set_hold_pending(&self, hold: bool) {
        self.book.lock().await.hold_pending = hold;
    }

    /// Fill only this fraction of each new order and leave it working
    pub async fn set_partial_fill(&self, fraction: Option<Decimal>) {
        self.book.lock().await.partial_fill_fraction = fraction;
    }

    /// Fill every order accepted while holding
    pub async fn release_pending(&self) {
        let mut book = self.book.lock().await;
        let pending: Vec<ClientRequestId> = book
            .orders
            .iter()
            .filter(|(_, o)| o.state == OrderState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            if let Some(order) = book.orders.get(&id).map(|o| o.order.clone()) {
                let state = self.execute(&mut book, &order, None);
                if let Some(entry) = book.orders.get_mut(&id) {
                    entry.state = state;
                }
            }
        }
    }

    /// Number of `submit` calls received, including duplicates and faults
    pub async fn submit_calls(&self) -> u64 {
        self.book.lock().await.submit_calls
    }

    /// Number of orders that actually executed
    pub async fn executions(&self) -> u64 {
        self.book.lock().await.executions
    }

    pub async fn order_state(&self, id: &ClientRequestId) -> Option<OrderState> {
        self.book.lock().await.orders.get(id).map(|o| o.state.clone())
    }

    /// Drop a position as if it was closed outside this process
    pub async fn remove_position(&self, open_request_id: &ClientRequestId) -> Option<ExchangePosition> {
        self.book.lock().await.positions.remove(open_request_id)
    }

    /// Install a position this process knows nothing about
    pub async fn insert_position(&self, key: ClientRequestId, position: ExchangePosition) {
        self.book.lock().await.positions.insert(key, position);
    }

    /// Rebuild the book from positions persisted by an earlier run, so a
    /// restarted dry run finds the positions it left open. PENDING_OPEN records
    /// are skipped: their open never confirmed. Returns how many were seeded.
    pub async fn restore_positions(&self, positions: &[Position]) -> usize {
        let mut book = self.book.lock().await;
        let mut seeded = 0;
        for position in positions {
            if position.status == PositionStatus::PendingOpen {
                continue;
            }
            let key = position.open_request_id.clone();
            if book.positions.contains_key(&key) {
                continue;
            }
            book.positions.insert(
                key.clone(),
                ExchangePosition {
                    symbol: position.symbol.clone(),
                    direction: position.direction,
                    size: position.size,
                    entry_price: position.entry_price,
                    open_request_id: Some(key),
                    mark_price: None,
                },
            );
            seeded += 1;
        }
        if seeded > 0 {
            info!(seeded, "Paper book restored from persisted positions");
        }
        seeded
    }

    fn fill_price(&self, book: &PaperBook, order: &Order) -> Decimal {
        let base = book
            .prices
            .get(&order.symbol)
            .copied()
            .unwrap_or(order.reference_price);
        let slip = base * self.slippage_bps / Decimal::from(10_000);
        match order.side {
            OrderSide::Buy => base + slip,
            OrderSide::Sell => base - slip,
        }
    }

    /// Apply an order to the book and return its resulting state
    fn execute(&self, book: &mut PaperBook, order: &Order, fraction: Option<Decimal>) -> OrderState {
        let price = self.fill_price(book, order);
        let mut size = order.size;
        if let Some(f) = fraction {
            size = (order.size * f).round_dp(8);
        }

        if order.reduce_only {
            let Some(link) = &order.linked_request else {
                return OrderState::Rejected {
                    reason: "reduce-only order without linked position".into(),
                };
            };
            let Some(position) = book.positions.get_mut(link) else {
                return OrderState::Rejected {
                    reason: "no position to reduce".into(),
                };
            };
            size = size.min(position.size);
            position.size -= size;
            if position.size <= Decimal::ZERO {
                book.positions.remove(link);
            }
        } else {
            let direction = match order.side {
                OrderSide::Buy => Direction::Long,
                OrderSide::Sell => Direction::Short,
            };
            book.positions.insert(
                order.client_request_id.clone(),
                ExchangePosition {
                    symbol: order.symbol.clone(),
                    direction,
                    size,
                    entry_price: price,
                    open_request_id: Some(order.client_request_id.clone()),
                    mark_price: Some(price),
                },
            );
        }

        book.executions += 1;
        let fill = Fill { price, size };
        debug!(
            client_request_id = %order.client_request_id,
            price = %price,
            size = %size,
            "Paper fill"
        );
        if size < order.size {
            OrderState::PartiallyFilled { fill }
        } else {
            OrderState::Filled { fill }
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn submit(&self, order: &Order) -> Result<OrderState, ExchangeError> {
        let mut book = self.book.lock().await;
        book.submit_calls += 1;

        if let Some(existing) = book.orders.get(&order.client_request_id) {
            info!(
                client_request_id = %order.client_request_id,
                state = %existing.state,
                "Duplicate submit, returning existing order"
            );
            return Ok(existing.state.clone());
        }

        let fault = book.submit_faults.pop_front();
        let timeout_after_apply = fault == Some(SubmitFault::TimeoutAfterApply);
        match fault {
            Some(SubmitFault::TimeoutBeforeApply) => {
                return Err(ExchangeError::Timeout { elapsed_ms: 0 });
            }
            Some(SubmitFault::RateLimited) => {
                return Err(ExchangeError::RateLimited("paper: too many requests".into()));
            }
            Some(SubmitFault::Unavailable) => {
                return Err(ExchangeError::Unavailable("paper: connection refused".into()));
            }
            Some(SubmitFault::Reject(reason)) => {
                let state = OrderState::Rejected { reason };
                book.orders.insert(
                    order.client_request_id.clone(),
                    PaperOrder {
                        order: order.clone(),
                        state: state.clone(),
                    },
                );
                return Ok(state);
            }
            Some(SubmitFault::TimeoutAfterApply) | None => {}
        }

        let state = if book.hold_pending {
            OrderState::Pending
        } else {
            let fraction = book.partial_fill_fraction;
            self.execute(&mut book, order, fraction)
        };
        book.orders.insert(
            order.client_request_id.clone(),
            PaperOrder {
                order: order.clone(),
                state: state.clone(),
            },
        );

        if timeout_after_apply {
            return Err(ExchangeError::Timeout { elapsed_ms: 0 });
        }
        Ok(state)
    }

    async fn query_status(
        &self,
        client_request_id: &ClientRequestId,
    ) -> Result<OrderState, ExchangeError> {
        let mut book = self.book.lock().await;
        if let Some(fault) = book.query_faults.pop_front() {
            return Err(fault);
        }
        Ok(book
            .orders
            .get(client_request_id)
            .map(|o| o.state.clone())
            .unwrap_or(OrderState::NotFound))
    }

    async fn cancel(&self, client_request_id: &ClientRequestId) -> Result<OrderState, ExchangeError> {
        let mut book = self.book.lock().await;
        let Some(entry) = book.orders.get_mut(client_request_id) else {
            return Ok(OrderState::NotFound);
        };
        entry.state = match &entry.state {
            OrderState::Pending => OrderState::Cancelled { filled: None },
            OrderState::PartiallyFilled { fill } => OrderState::Cancelled { filled: Some(*fill) },
            terminal => terminal.clone(),
        };
        Ok(entry.state.clone())
    }

    async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let book = self.book.lock().await;
        Ok(book
            .positions
            .values()
            .filter(|p| p.size > Decimal::ZERO)
            .map(|p| {
                let mut p = p.clone();
                if let Some(price) = book.prices.get(&p.symbol) {
                    p.mark_price = Some(*price);
                }
                p
            })
            .collect())
    }

    async fn last_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        Ok(self.book.lock().await.prices.get(symbol).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionId;
    use rust_decimal_macros::dec;

    fn open_order(id: PositionId) -> Order {
        Order::market_open(
            ClientRequestId::for_open(id),
            "ETHUSDT",
            OrderSide::Buy,
            dec!(2),
            dec!(1000),
            dec!(5),
        )
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_per_request_id() {
        let exchange = PaperExchange::new(&PaperExchangeConfig::default());
        let order = open_order(PositionId::new());

        let first = exchange.submit(&order).await.unwrap();
        let second = exchange.submit(&order).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(exchange.submit_calls().await, 2);
        assert_eq!(exchange.executions().await, 1);
        assert_eq!(exchange.list_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_after_apply_is_visible_via_query() {
        let exchange = PaperExchange::new(&PaperExchangeConfig::default());
        exchange.push_submit_fault(SubmitFault::TimeoutAfterApply).await;
        let order = open_order(PositionId::new());

        assert!(matches!(
            exchange.submit(&order).await,
            Err(ExchangeError::Timeout { .. })
        ));
        let state = exchange.query_status(&order.client_request_id).await.unwrap();
        assert!(matches!(state, OrderState::Filled { .. }));
    }

    #[tokio::test]
    async fn test_slippage_is_adverse() {
        let exchange = PaperExchange::new(&PaperExchangeConfig {
            slippage_bps: dec!(10),
        });
        exchange.set_price("ETHUSDT", dec!(1000)).await;
        let state = exchange.submit(&open_order(PositionId::new())).await.unwrap();
        assert_eq!(state.executed().unwrap().price, dec!(1001));
    }

    #[tokio::test]
    async fn test_reduce_only_close_removes_position() {
        let exchange = PaperExchange::new(&PaperExchangeConfig::default());
        let id = PositionId::new();
        let open = open_order(id);
        exchange.submit(&open).await.unwrap();

        let close = Order::market_close(
            ClientRequestId::for_close(id, 0),
            "ETHUSDT",
            OrderSide::Sell,
            dec!(2),
            dec!(950),
            dec!(5),
            open.client_request_id.clone(),
        );
        let state = exchange.submit(&close).await.unwrap();
        assert_eq!(state.executed().unwrap().size, dec!(2));
        assert!(exchange.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_fill() {
        let exchange = PaperExchange::new(&PaperExchangeConfig::default());
        exchange.set_partial_fill(Some(dec!(0.5))).await;
        let order = open_order(PositionId::new());

        let state = exchange.submit(&order).await.unwrap();
        assert!(matches!(state, OrderState::PartiallyFilled { .. }));

        let state = exchange.cancel(&order.client_request_id).await.unwrap();
        assert_eq!(state.executed().unwrap().size, dec!(1));
    }
}
