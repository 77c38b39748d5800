use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::PositionId;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order submitted to exchange
    Submitted,
    /// Order fully or partially filled (terminal for our purposes)
    Filled,
    /// Order rejected by exchange
    Rejected,
    /// Order cancelled
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// Idempotency key, generated once per logical intent and reused across retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientRequestId(String);

impl ClientRequestId {
    /// Key for opening position `id`
    pub fn for_open(id: PositionId) -> Self {
        Self(format!("open-{}", id))
    }

    /// Key for the `generation`-th close attempt of position `id`
    pub fn for_close(id: PositionId, generation: u32) -> Self {
        Self(format!("close-{}-{}", id, generation))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order request (what we want the exchange to do)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_request_id: ClientRequestId,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub order_type: OrderType,
    /// Expected execution price (trigger level for closes, last price for opens)
    pub reference_price: Decimal,
    pub leverage: Decimal,
    /// Close orders only reduce the position opened by `linked_request`
    pub reduce_only: bool,
    pub linked_request: Option<ClientRequestId>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn market_open(
        client_request_id: ClientRequestId,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        reference_price: Decimal,
        leverage: Decimal,
    ) -> Self {
        Self {
            client_request_id,
            symbol: symbol.to_string(),
            side,
            size,
            order_type: OrderType::Market,
            reference_price,
            leverage,
            reduce_only: false,
            linked_request: None,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn market_close(
        client_request_id: ClientRequestId,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        reference_price: Decimal,
        leverage: Decimal,
        opened_by: ClientRequestId,
    ) -> Self {
        Self {
            client_request_id,
            symbol: symbol.to_string(),
            side,
            size,
            order_type: OrderType::Market,
            reference_price,
            leverage,
            reduce_only: true,
            linked_request: Some(opened_by),
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Authoritative fill reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub size: Decimal,
}
