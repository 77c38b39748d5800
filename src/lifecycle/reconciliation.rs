//! Position Reconciliation
//!
//! Compares local positions with the exchange's authoritative position list.
//! Classification is pure; the lifecycle manager carries out the corrections.
//!
//! - `LocalOnly`: closed on the exchange while we were not watching; finalized
//!   as a RECONCILED trade
//! - `ExchangeOnly`: exchange position no local record accounts for; critical
//!   alert, no automatic action
//! - `SizeMismatch`: local size corrected to the exchange's
//! - `PendingFilled` / `PendingUnfilled`: open order whose outcome was unknown

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{ClientRequestId, Direction, Position, PositionId, PositionStatus};
use crate::exchange::ExchangePosition;

/// Discrepancy severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscrepancySeverity {
    /// Corrected automatically
    Info,
    /// Corrected automatically, but a trade or order was missed
    Warning,
    /// Needs an operator
    Critical,
}

impl std::fmt::Display for DiscrepancySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscrepancySeverity::Info => write!(f, "INFO"),
            DiscrepancySeverity::Warning => write!(f, "WARNING"),
            DiscrepancySeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One difference between local state and the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    LocalOnly {
        position_id: PositionId,
        symbol: String,
        local_size: Decimal,
    },
    ExchangeOnly {
        symbol: String,
        direction: Direction,
        size: Decimal,
        entry_price: Decimal,
    },
    SizeMismatch {
        position_id: PositionId,
        symbol: String,
        local_size: Decimal,
        exchange_size: Decimal,
    },
    /// Open order outcome was unknown; the exchange holds the position
    PendingFilled {
        position_id: PositionId,
        symbol: String,
        entry_price: Decimal,
        size: Decimal,
    },
    /// Open order outcome was unknown; the exchange never filled it
    PendingUnfilled {
        position_id: PositionId,
        symbol: String,
    },
}

impl Discrepancy {
    pub fn severity(&self) -> DiscrepancySeverity {
        match self {
            Discrepancy::SizeMismatch { .. } | Discrepancy::PendingUnfilled { .. } => {
                DiscrepancySeverity::Info
            }
            Discrepancy::LocalOnly { .. } | Discrepancy::PendingFilled { .. } => {
                DiscrepancySeverity::Warning
            }
            Discrepancy::ExchangeOnly { .. } => DiscrepancySeverity::Critical,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Discrepancy::LocalOnly { symbol, .. }
            | Discrepancy::ExchangeOnly { symbol, .. }
            | Discrepancy::SizeMismatch { symbol, .. }
            | Discrepancy::PendingFilled { symbol, .. }
            | Discrepancy::PendingUnfilled { symbol, .. } => symbol,
        }
    }
}

/// Reconciliation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub timestamp: DateTime<Utc>,
    pub discrepancies_found: usize,
    pub auto_corrections: usize,
    pub critical_issues: usize,
    pub duration_ms: u64,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Classify every difference between `local` and `exchange`.
///
/// Positions whose open request id is in `busy` have an order in flight and
/// are left out on both sides. Exchange positions are matched by open request
/// id when the venue reports one, otherwise by symbol and direction.
pub fn diff_positions(
    local: &[Position],
    exchange: &[ExchangePosition],
    busy: &HashSet<ClientRequestId>,
) -> Vec<Discrepancy> {
    let mut unmatched: Vec<&ExchangePosition> = exchange
        .iter()
        .filter(|p| p.size > Decimal::ZERO)
        .filter(|p| match &p.open_request_id {
            Some(id) => !busy.contains(id),
            None => true,
        })
        .collect();
    let mut discrepancies = Vec::new();

    for position in local.iter().filter(|p| !busy.contains(&p.open_request_id)) {
        let by_id = unmatched
            .iter()
            .position(|e| e.open_request_id.as_ref() == Some(&position.open_request_id));
        let found = by_id.or_else(|| {
            unmatched.iter().position(|e| {
                e.open_request_id.is_none()
                    && e.symbol == position.symbol
                    && e.direction == position.direction
            })
        });
        let matched = found.map(|idx| unmatched.swap_remove(idx));

        match (position.status, matched) {
            (PositionStatus::PendingOpen, Some(ex)) => {
                discrepancies.push(Discrepancy::PendingFilled {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    entry_price: ex.entry_price,
                    size: ex.size,
                })
            }
            (PositionStatus::PendingOpen, None) => {
                discrepancies.push(Discrepancy::PendingUnfilled {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                })
            }
            (_, Some(ex)) if ex.size != position.size => {
                discrepancies.push(Discrepancy::SizeMismatch {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    local_size: position.size,
                    exchange_size: ex.size,
                })
            }
            (_, Some(_)) => {}
            (_, None) => discrepancies.push(Discrepancy::LocalOnly {
                position_id: position.id,
                symbol: position.symbol.clone(),
                local_size: position.size,
            }),
        }
    }

    for ex in unmatched {
        discrepancies.push(Discrepancy::ExchangeOnly {
            symbol: ex.symbol.clone(),
            direction: ex.direction,
            size: ex.size,
            entry_price: ex.entry_price,
        });
    }
    discrepancies
}
