use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{ClientRequestId, Direction, Fill, Order};
use crate::error::ExchangeError;

/// Exchange-side view of an order, looked up by client request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderState {
    /// The exchange has never seen this client request id
    NotFound,
    /// Accepted, nothing filled yet
    Pending,
    /// Accepted, partly filled, still working
    PartiallyFilled { fill: Fill },
    Filled { fill: Fill },
    Rejected { reason: String },
    /// Cancelled; `filled` carries whatever executed before the cancel
    Cancelled { filled: Option<Fill> },
}

impl OrderState {
    /// Whether the exchange will not change this order any further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled { .. } | OrderState::Rejected { .. } | OrderState::Cancelled { .. }
        )
    }

    /// Executed quantity, if any
    pub fn executed(&self) -> Option<Fill> {
        match self {
            OrderState::PartiallyFilled { fill } | OrderState::Filled { fill } => Some(*fill),
            OrderState::Cancelled { filled } => *filled,
            _ => None,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::NotFound => write!(f, "not_found"),
            OrderState::Pending => write!(f, "pending"),
            OrderState::PartiallyFilled { fill } => write!(f, "partially_filled({}@{})", fill.size, fill.price),
            OrderState::Filled { fill } => write!(f, "filled({}@{})", fill.size, fill.price),
            OrderState::Rejected { reason } => write!(f, "rejected({})", reason),
            OrderState::Cancelled { .. } => write!(f, "cancelled"),
        }
    }
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    /// Client request id of the order that opened it, when the exchange tracks it
    pub open_request_id: Option<ClientRequestId>,
    /// Last traded price, used to value positions that disappear
    pub mark_price: Option<Decimal>,
}

/// Abstract exchange contract. Implementations must be idempotent per
/// client request id: a repeated `submit` returns the existing order's state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    fn is_dry_run(&self) -> bool;

    async fn submit(&self, order: &Order) -> Result<OrderState, ExchangeError>;

    async fn query_status(
        &self,
        client_request_id: &ClientRequestId,
    ) -> Result<OrderState, ExchangeError>;

    async fn cancel(&self, client_request_id: &ClientRequestId) -> Result<OrderState, ExchangeError>;

    async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Last price for `symbol`, when the venue can provide one
    async fn last_price(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        Ok(None)
    }
}
