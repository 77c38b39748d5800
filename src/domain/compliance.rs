use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::Direction;
use super::position::{ExitReason, Position, PositionId, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompliancePhase {
    Opened,
    Closed,
}

/// Sizing decision recorded with every AI-assisted trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingDecision {
    pub direction: Direction,
    pub size: Decimal,
    pub leverage: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub margin: Decimal,
}

/// One entry per opened and one per closed AI-assisted trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceEntry {
    pub phase: CompliancePhase,
    pub position_id: PositionId,
    pub symbol: String,
    pub model_id: String,
    pub feature_snapshot_ref: String,
    pub signal_confidence: Decimal,
    pub sizing: SizingDecision,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<Decimal>,
    pub recorded_at: DateTime<Utc>,
}

impl ComplianceEntry {
    pub fn opened(position: &Position) -> Self {
        Self {
            phase: CompliancePhase::Opened,
            position_id: position.id,
            symbol: position.symbol.clone(),
            model_id: position.provenance.model_id.clone(),
            feature_snapshot_ref: position.provenance.feature_snapshot_ref.clone(),
            signal_confidence: position.provenance.confidence,
            sizing: sizing_of(position),
            exit_reason: None,
            realized_pnl: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn closed(trade: &Trade) -> Self {
        let position = &trade.position;
        Self {
            phase: CompliancePhase::Closed,
            position_id: position.id,
            symbol: position.symbol.clone(),
            model_id: position.provenance.model_id.clone(),
            feature_snapshot_ref: position.provenance.feature_snapshot_ref.clone(),
            signal_confidence: position.provenance.confidence,
            sizing: sizing_of(position),
            exit_reason: Some(trade.exit_reason),
            realized_pnl: Some(trade.realized_pnl),
            recorded_at: trade.closed_at,
        }
    }
}

fn sizing_of(position: &Position) -> SizingDecision {
    SizingDecision {
        direction: position.direction,
        size: position.size,
        leverage: position.leverage,
        entry_price: position.entry_price,
        stop_price: position.stop_price,
        target_price: position.target_price,
        margin: position.margin,
    }
}
