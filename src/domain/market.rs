use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::order::OrderSide;

/// Trade direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens a position in this direction
    pub fn opening_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction
    pub fn closing_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction recommended by the signal source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Long,
    Short,
    /// No trade this cycle
    #[serde(rename = "none")]
    Flat,
}

impl SignalDirection {
    pub fn as_direction(&self) -> Option<Direction> {
        match self {
            SignalDirection::Long => Some(Direction::Long),
            SignalDirection::Short => Some(Direction::Short),
            SignalDirection::Flat => None,
        }
    }
}

/// Directional signal emitted by the model, consumed once by the risk gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: SignalDirection,
    /// Model confidence in [0, 1]
    pub confidence: Decimal,
    pub generated_at: DateTime<Utc>,
    /// Reference to the causal feature vector used for this decision
    pub feature_snapshot_ref: String,
    pub model_id: String,
}

/// A signal together with the market context needed to size it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal: Signal,
    /// Average true range on the signal's timeframe
    pub atr: Decimal,
    /// Last closed price, used as the expected entry price
    pub reference_price: Decimal,
}

/// One closed candle (or a single trade print when open = high = low = close)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl MarketTick {
    /// Tick carrying a single price
    pub fn price(symbol: &str, timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    pub fn candle(
        symbol: &str,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
        }
    }

    /// Basic OHLC sanity
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.low > Decimal::ZERO
    }
}

/// One line of the engine's input stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    Signal(SignalEvent),
    Tick(MarketTick),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Signal(e) => &e.signal.symbol,
            MarketEvent::Tick(t) => &t.symbol,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MarketEvent::Signal(e) => e.signal.generated_at,
            MarketEvent::Tick(t) => t.timestamp,
        }
    }
}
