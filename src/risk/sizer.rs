//! Position Sizer
//!
//! Turns a signal plus volatility into a concrete size, leverage and exit plan.
//! Deterministic: identical inputs always produce identical plans.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{RiskConfig, RiskLimits, SizingConfig};
use crate::domain::{
    margin_for, ClientRequestId, Direction, ExitPlan, Position, PositionId, PositionStatus,
    SignalEvent, SignalProvenance,
};

/// A fully sized trade, ready for the risk gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedPlan {
    pub position_id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub leverage: Decimal,
    /// Expected entry (the signal's reference price)
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub exit_plan: ExitPlan,
    /// Size multiplier applied for confidence (≤ 1)
    pub confidence_factor: Decimal,
    pub provenance: SignalProvenance,
}

impl SizedPlan {
    /// Loss if the stop is hit
    pub fn risk_amount(&self) -> Decimal {
        self.exit_plan.stop_distance * self.size
    }

    /// Position record for this plan before the open order confirms
    pub fn pending_position(&self, at: DateTime<Utc>) -> Position {
        Position {
            id: self.position_id,
            symbol: self.symbol.clone(),
            direction: self.direction,
            entry_price: self.entry_price,
            size: self.size,
            leverage: self.leverage,
            margin: self.margin,
            stop_price: self.stop_price,
            target_price: self.target_price,
            exit_plan: self.exit_plan,
            opened_at: at,
            status: PositionStatus::PendingOpen,
            open_request_id: ClientRequestId::for_open(self.position_id),
            close_generation: 0,
            provenance: self.provenance.clone(),
        }
    }
}

/// Why a signal produced no plan (normal control flow, not an error)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingSkip {
    NoDirection,
    LowConfidence { confidence: Decimal, min: Decimal },
    InvalidInput(String),
    BelowMinQty { size: Decimal, min: Decimal },
}

impl fmt::Display for SizingSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingSkip::NoDirection => write!(f, "no direction"),
            SizingSkip::LowConfidence { confidence, min } => {
                write!(f, "confidence {} below minimum {}", confidence, min)
            }
            SizingSkip::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            SizingSkip::BelowMinQty { size, min } => {
                write!(f, "size {} below minimum quantity {}", size, min)
            }
        }
    }
}

/// Position sizer
#[derive(Debug, Clone)]
pub struct PositionSizer {
    sizing: SizingConfig,
    max_margin_per_trade_fraction: Option<Decimal>,
}

impl PositionSizer {
    pub fn new(sizing: SizingConfig, risk: &RiskConfig) -> Self {
        Self {
            sizing,
            max_margin_per_trade_fraction: risk.max_margin_per_trade_fraction,
        }
    }

    /// Monotonic, never above 1: full size at or above the high-confidence threshold,
    /// linearly smaller below it.
    pub fn confidence_factor(&self, confidence: Decimal) -> Decimal {
        let threshold = self.sizing.high_confidence_threshold;
        if confidence >= threshold || threshold <= Decimal::ZERO {
            return Decimal::ONE;
        }
        (confidence / threshold).max(Decimal::ZERO)
    }

    /// Size a signal
    pub fn size(
        &self,
        event: &SignalEvent,
        equity: Decimal,
        limits: &RiskLimits,
    ) -> Result<SizedPlan, SizingSkip> {
        let signal = &event.signal;
        let direction = signal
            .direction
            .as_direction()
            .ok_or(SizingSkip::NoDirection)?;

        if signal.confidence < self.sizing.min_confidence {
            return Err(SizingSkip::LowConfidence {
                confidence: signal.confidence,
                min: self.sizing.min_confidence,
            });
        }
        if event.atr <= Decimal::ZERO {
            return Err(SizingSkip::InvalidInput(format!("atr {}", event.atr)));
        }
        if event.reference_price <= Decimal::ZERO {
            return Err(SizingSkip::InvalidInput(format!(
                "reference price {}",
                event.reference_price
            )));
        }
        if equity <= Decimal::ZERO {
            return Err(SizingSkip::InvalidInput(format!("equity {}", equity)));
        }

        let profile = self.sizing.profile(direction);
        let entry = event.reference_price;
        let exit_plan = ExitPlan {
            stop_distance: profile.stop_atr * event.atr,
            target_distance: profile.target_atr * event.atr,
            early_failure_distance: profile.early_failure_atr * event.atr,
            early_failure_window_secs: profile.early_failure_window_mins * 60,
            time_limit_secs: profile.max_hold_mins * 60,
        };

        let leverage = self.sizing.leverage.min(limits.max_leverage);
        let confidence_factor = self.confidence_factor(signal.confidence);

        // size = (equity × risk fraction) / stop distance, scaled for confidence
        let by_risk =
            equity * limits.max_risk_per_trade_fraction / exit_plan.stop_distance * confidence_factor;
        // notional ≤ max_leverage × equity
        let by_leverage = limits.max_leverage * equity / entry;
        let mut raw = by_risk.min(by_leverage);
        if let Some(fraction) = self.max_margin_per_trade_fraction {
            raw = raw.min(fraction * equity * leverage / entry);
        }

        let size = floor_to_step(raw, self.sizing.qty_step);
        if size <= Decimal::ZERO || size < self.sizing.min_qty {
            return Err(SizingSkip::BelowMinQty {
                size,
                min: self.sizing.min_qty,
            });
        }

        Ok(SizedPlan {
            position_id: PositionId::new(),
            symbol: signal.symbol.clone(),
            direction,
            size,
            leverage,
            entry_price: entry,
            margin: margin_for(size, entry, leverage),
            stop_price: exit_plan.stop_price(direction, entry),
            target_price: exit_plan.target_price(direction, entry),
            exit_plan,
            confidence_factor,
            provenance: SignalProvenance {
                model_id: signal.model_id.clone(),
                feature_snapshot_ref: signal.feature_snapshot_ref.clone(),
                confidence: signal.confidence,
                generated_at: signal.generated_at,
            },
        })
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}
