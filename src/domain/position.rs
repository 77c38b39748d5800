use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::market::Direction;
use super::order::{ClientRequestId, Fill};

/// Unique position identifier, assigned when a plan is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(Uuid);

impl PositionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    PendingOpen,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::PendingOpen => write!(f, "PENDING_OPEN"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closing => write!(f, "CLOSING"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    EarlyFailure,
    Stop,
    Target,
    Time,
    /// Found closed on the exchange during reconciliation
    Reconciled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::EarlyFailure => "EARLY_FAILURE",
            ExitReason::Stop => "STOP",
            ExitReason::Target => "TARGET",
            ExitReason::Time => "TIME",
            ExitReason::Reconciled => "RECONCILED",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit parameters fixed at open time. Distances are absolute price distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub stop_distance: Decimal,
    pub target_distance: Decimal,
    /// Adverse move that counts as an early failure; tighter than the stop
    pub early_failure_distance: Decimal,
    pub early_failure_window_secs: i64,
    pub time_limit_secs: i64,
}

impl ExitPlan {
    pub fn early_failure_window(&self) -> Duration {
        Duration::seconds(self.early_failure_window_secs)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::seconds(self.time_limit_secs)
    }

    /// Stop price for an entry in `direction`
    pub fn stop_price(&self, direction: Direction, entry: Decimal) -> Decimal {
        entry - direction.sign() * self.stop_distance
    }

    pub fn target_price(&self, direction: Direction, entry: Decimal) -> Decimal {
        entry + direction.sign() * self.target_distance
    }

    pub fn early_failure_price(&self, direction: Direction, entry: Decimal) -> Decimal {
        entry - direction.sign() * self.early_failure_distance
    }
}

/// Where the trade decision came from (for compliance logging)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalProvenance {
    pub model_id: String,
    pub feature_snapshot_ref: String,
    pub confidence: Decimal,
    pub generated_at: DateTime<Utc>,
}

/// Position record. Owned by its exit state machine while open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: Decimal,
    /// Margin reserved in the risk ledger for this position
    pub margin: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub exit_plan: ExitPlan,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub open_request_id: ClientRequestId,
    /// Bumped every time a failed close re-arms the position
    pub close_generation: u32,
    pub provenance: SignalProvenance,
}

impl Position {
    /// Re-anchor prices on the authoritative fill; the plan's distances are kept.
    pub fn apply_open_fill(&mut self, fill: Fill, filled_at: DateTime<Utc>) {
        self.entry_price = fill.price;
        self.size = fill.size;
        self.margin = margin_for(fill.size, fill.price, self.leverage);
        self.stop_price = self.exit_plan.stop_price(self.direction, fill.price);
        self.target_price = self.exit_plan.target_price(self.direction, fill.price);
        self.opened_at = filled_at;
        self.status = PositionStatus::Open;
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.entry_price
    }

    /// PnL if closed at `exit_price`
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.size * self.direction.sign()
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.opened_at)
    }

    pub fn close_request_id(&self) -> ClientRequestId {
        ClientRequestId::for_close(self.id, self.close_generation)
    }
}

/// Margin needed for `size` units at `price` with `leverage`
pub fn margin_for(size: Decimal, price: Decimal, leverage: Decimal) -> Decimal {
    if leverage <= Decimal::ZERO {
        return size * price;
    }
    size * price / leverage
}

/// Closed position. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub position: Position,
    pub exit_price: Decimal,
    /// Size actually closed on the exchange
    pub exit_size: Decimal,
    pub exit_reason: ExitReason,
    pub realized_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    pub fn from_close(
        position: &Position,
        fill: Fill,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let mut position = position.clone();
        position.status = PositionStatus::Closed;
        let realized_pnl = (fill.price - position.entry_price) * fill.size * position.direction.sign();
        Self {
            position,
            exit_price: fill.price,
            exit_size: fill.size,
            exit_reason: reason,
            realized_pnl,
            closed_at,
        }
    }

    pub fn position_id(&self) -> PositionId {
        self.position.id
    }

    /// Whether this close flattened the position. A partial close leaves
    /// `position.size - exit_size` open under the same id.
    pub fn is_final(&self) -> bool {
        self.exit_size >= self.position.size
    }

    pub fn remaining_size(&self) -> Decimal {
        (self.position.size - self.exit_size).max(Decimal::ZERO)
    }

    pub fn holding_minutes(&self) -> i64 {
        self.closed_at
            .signed_duration_since(self.position.opened_at)
            .num_minutes()
    }
}

/// Point on the equity curve. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub open_margin_used: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plan() -> ExitPlan {
        ExitPlan {
            stop_distance: dec!(50),
            target_distance: dec!(100),
            early_failure_distance: dec!(20),
            early_failure_window_secs: 1800,
            time_limit_secs: 3 * 3600,
        }
    }

    fn position(direction: Direction) -> Position {
        let id = PositionId::new();
        let plan = plan();
        Position {
            id,
            symbol: "ETHUSDT".into(),
            direction,
            entry_price: dec!(1000),
            size: dec!(2),
            leverage: dec!(5),
            margin: dec!(400),
            stop_price: plan.stop_price(direction, dec!(1000)),
            target_price: plan.target_price(direction, dec!(1000)),
            exit_plan: plan,
            opened_at: Utc::now(),
            status: PositionStatus::PendingOpen,
            open_request_id: ClientRequestId::for_open(id),
            close_generation: 0,
            provenance: SignalProvenance {
                model_id: "m".into(),
                feature_snapshot_ref: "f".into(),
                confidence: dec!(0.8),
                generated_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_exit_prices_mirror_by_direction() {
        let p = plan();
        assert_eq!(p.stop_price(Direction::Long, dec!(1000)), dec!(950));
        assert_eq!(p.target_price(Direction::Long, dec!(1000)), dec!(1100));
        assert_eq!(p.stop_price(Direction::Short, dec!(1000)), dec!(1050));
        assert_eq!(p.target_price(Direction::Short, dec!(1000)), dec!(900));
        assert_eq!(p.early_failure_price(Direction::Short, dec!(1000)), dec!(1020));
    }

    #[test]
    fn test_open_fill_reanchors_prices() {
        let mut pos = position(Direction::Long);
        pos.apply_open_fill(
            Fill {
                price: dec!(1002),
                size: dec!(1.5),
            },
            Utc::now(),
        );
        assert_eq!(pos.entry_price, dec!(1002));
        assert_eq!(pos.stop_price, dec!(952));
        assert_eq!(pos.target_price, dec!(1102));
        assert_eq!(pos.margin, dec!(300.6));
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[test]
    fn test_trade_pnl() {
        let pos = position(Direction::Short);
        let trade = Trade::from_close(
            &pos,
            Fill {
                price: dec!(950),
                size: dec!(2),
            },
            ExitReason::Target,
            Utc::now(),
        );
        assert_eq!(trade.realized_pnl, dec!(100));
        assert_eq!(trade.position.status, PositionStatus::Closed);
        assert_eq!(pos.pnl_at(dec!(1010)), dec!(-20));
    }

    #[test]
    fn test_exit_reason_serde() {
        let json = serde_json::to_string(&ExitReason::EarlyFailure).unwrap();
        assert_eq!(json, "\"EARLY_FAILURE\"");
    }
}
