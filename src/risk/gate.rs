//! Risk Gate
//!
//! Evaluates a sized plan against the static limits and the shared ledger.
//! Checks run in a fixed order and stop at the first failure:
//! 0. equity must be positive; every cap below is a fraction of it
//! 1. concurrency cap for the direction
//! 2. projected committed margin
//! 3. per-trade risk at the stop
//! 4. leverage
//!
//! On accept the margin and risk budget are reserved inside the same critical
//! section that ran the checks, so two concurrent signals cannot both spend
//! the last slot.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RiskLimits;
use crate::error::RiskRejection;
use crate::risk::ledger::{LedgerBook, Reservation, RiskLedger};
use crate::risk::sizer::SizedPlan;

/// Gate outcome
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Plan accepted; its budget is now reserved under `plan.position_id`
    Accept(SizedPlan),
    Reject(RiskRejection),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept(_))
    }
}

/// Pre-trade risk gate
pub struct RiskGate {
    limits: RiskLimits,
    ledger: Arc<RiskLedger>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, ledger: Arc<RiskLedger>) -> Self {
        Self { limits, ledger }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn ledger(&self) -> &Arc<RiskLedger> {
        &self.ledger
    }

    /// Evaluate a plan and, on accept, reserve its budget atomically
    pub async fn evaluate(&self, plan: SizedPlan, equity: Decimal) -> GateDecision {
        let limits = &self.limits;
        let outcome = self
            .ledger
            .with_exclusive(|book| {
                check(book, &plan, limits, equity)?;
                let risk_amount = plan.risk_amount();
                book.insert(Reservation {
                    position_id: plan.position_id,
                    symbol: plan.symbol.clone(),
                    direction: plan.direction,
                    margin: plan.margin,
                    risk_amount,
                    risk_fraction: risk_amount / equity,
                });
                Ok::<_, RiskRejection>(book.totals().committed_margin)
            })
            .await;

        match outcome {
            Ok(committed) => {
                info!(
                    position_id = %plan.position_id,
                    symbol = %plan.symbol,
                    direction = %plan.direction,
                    size = %plan.size,
                    margin = %plan.margin,
                    committed = %committed,
                    "Risk gate accepted plan"
                );
                GateDecision::Accept(plan)
            }
            Err(rejection) => {
                info!(
                    symbol = %plan.symbol,
                    direction = %plan.direction,
                    reason = rejection.code(),
                    "Risk gate rejected plan: {}",
                    rejection
                );
                GateDecision::Reject(rejection)
            }
        }
    }
}

/// The gate checks, in order. Pure: reads the book, never mutates it.
pub fn check(
    book: &LedgerBook,
    plan: &SizedPlan,
    limits: &RiskLimits,
    equity: Decimal,
) -> Result<(), RiskRejection> {
    if equity <= Decimal::ZERO {
        return Err(RiskRejection::NoEquity { equity });
    }

    let totals = book.totals();

    // (a) concurrency
    let open = totals.open_count(plan.direction);
    let cap = limits.concurrency_cap(plan.direction);
    if open >= cap {
        return Err(RiskRejection::ConcurrencyCapExceeded {
            direction: plan.direction,
            open,
            cap,
        });
    }

    // (b) margin usage
    let projected = totals.committed_margin + plan.margin;
    let margin_cap = limits.max_margin_usage_fraction * equity;
    if projected > margin_cap {
        return Err(RiskRejection::MarginCapExceeded {
            projected,
            cap: margin_cap,
        });
    }

    // (c) per-trade risk
    let risk = plan.risk_amount();
    let risk_cap = limits.max_risk_per_trade_fraction * equity;
    if risk > risk_cap {
        return Err(RiskRejection::PerTradeRiskExceeded {
            risk,
            cap: risk_cap,
        });
    }

    // (d) leverage
    if plan.leverage > limits.max_leverage {
        return Err(RiskRejection::LeverageExceeded {
            requested: plan.leverage,
            max: limits.max_leverage,
        });
    }

    debug!(
        projected_margin = %projected,
        risk = %risk,
        "All risk checks passed"
    );
    Ok(())
}
