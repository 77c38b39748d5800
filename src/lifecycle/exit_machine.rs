//! Exit State Machine
//!
//! One instance per position. Synchronous and free of I/O: the monitor task
//! feeds it ticks and carries out the close it asks for.
//!
//! Per-tick evaluation, first match wins:
//! 1. early failure (adverse move past the early-failure threshold inside the window)
//! 2. stop
//! 3. target
//! 4. time limit
//!
//! Ticks are candles; a long hits its stop when `low <= stop` and its target
//! when `high >= target`, shorts mirrored. When a candle opens beyond a level
//! the trigger price is the open.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{Direction, ExitReason, ExitState, MarketTick, Position, Trade};
use crate::error::{Result, WardenError};

/// Result of feeding one tick to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Evaluated, no exit condition met
    Hold,
    /// An exit condition fired on this tick
    Triggered {
        reason: ExitReason,
        trigger_price: Decimal,
    },
    /// Not evaluated (not open, other symbol, or predates the position)
    Ignored,
}

/// Close the machine wants executed
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub position: Position,
    pub reason: ExitReason,
    pub reference_price: Decimal,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExitStateMachine {
    position: Position,
    state: ExitState,
    last_tick_at: Option<DateTime<Utc>>,
    trigger: Option<(ExitReason, Decimal, DateTime<Utc>)>,
}

impl ExitStateMachine {
    /// Machine for a position whose open order has not confirmed yet
    pub fn pending(position: Position) -> Self {
        Self {
            position,
            state: ExitState::PendingOpen,
            last_tick_at: None,
            trigger: None,
        }
    }

    /// Machine for a position recovered from the store, armed immediately.
    /// A close that was in flight at the crash keeps its request id; the next
    /// close goes out under a fresh generation.
    pub fn recovered(position: Position) -> Self {
        let interrupted_close = position.status == crate::domain::PositionStatus::Closing;
        let mut machine = Self::pending(position);
        if interrupted_close {
            machine.position.close_generation += 1;
        }
        machine.state = ExitState::Open;
        machine.position.status = ExitState::Open.position_status();
        machine
    }

    pub fn state(&self) -> ExitState {
        self.state
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at
    }

    pub fn trigger(&self) -> Option<(ExitReason, Decimal)> {
        self.trigger.map(|(reason, price, _)| (reason, price))
    }

    fn transition(&mut self, target: ExitState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            warn!(
                position_id = %self.position.id,
                from = %self.state,
                to = %target,
                "Rejected exit state transition"
            );
            return Err(WardenError::InvalidStateTransition {
                position_id: self.position.id,
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        debug!(position_id = %self.position.id, from = %self.state, to = %target, "Exit state transition");
        self.state = target;
        self.position.status = target.position_status();
        Ok(())
    }

    /// Open order filled: adopt the filled position and start evaluating ticks
    pub fn confirm_open(&mut self, filled: Position) -> Result<()> {
        if filled.id != self.position.id {
            return Err(WardenError::Validation(format!(
                "fill for {} applied to machine {}",
                filled.id, self.position.id
            )));
        }
        self.transition(ExitState::Open)?;
        self.position = filled;
        self.position.status = self.state.position_status();
        Ok(())
    }

    /// Open order failed: nothing to supervise
    pub fn abandon_open(&mut self) -> Result<()> {
        self.transition(ExitState::Closed)
    }

    /// Evaluate one tick
    pub fn on_tick(&mut self, tick: &MarketTick) -> Result<TickOutcome> {
        if tick.symbol != self.position.symbol || self.state != ExitState::Open {
            return Ok(TickOutcome::Ignored);
        }
        if let Some(last) = self.last_tick_at {
            if tick.timestamp < last {
                return Err(WardenError::StaleData {
                    symbol: tick.symbol.clone(),
                    tick_at: tick.timestamp,
                    last_at: last,
                });
            }
        }
        if tick.timestamp < self.position.opened_at {
            return Ok(TickOutcome::Ignored);
        }
        self.last_tick_at = Some(tick.timestamp);

        let Some((reason, trigger_price)) = evaluate(&self.position, tick) else {
            return Ok(TickOutcome::Hold);
        };

        self.transition(ExitState::triggered_by(reason))?;
        self.trigger = Some((reason, trigger_price, tick.timestamp));
        info!(
            position_id = %self.position.id,
            symbol = %self.position.symbol,
            reason = %reason,
            trigger_price = %trigger_price,
            tick_at = %tick.timestamp,
            "Exit condition triggered"
        );
        Ok(TickOutcome::Triggered {
            reason,
            trigger_price,
        })
    }

    /// Enter CLOSING and hand out the close to execute
    pub fn begin_close(&mut self) -> Result<CloseRequest> {
        let Some((reason, reference_price, triggered_at)) = self.trigger else {
            return Err(WardenError::InvalidStateTransition {
                position_id: self.position.id,
                from: self.state.to_string(),
                to: ExitState::Closing.to_string(),
            });
        };
        self.transition(ExitState::Closing)?;
        Ok(CloseRequest {
            position: self.position.clone(),
            reason,
            reference_price,
            triggered_at,
        })
    }

    /// Close order failed irrecoverably: re-arm for the next tick under a new
    /// close request id
    pub fn close_failed(&mut self) -> Result<()> {
        self.transition(ExitState::Open)?;
        self.trigger = None;
        self.position.close_generation += 1;
        Ok(())
    }

    /// Part of the close executed: keep supervising what is left under the
    /// next close generation. The trigger is cleared, so the remainder exits
    /// on the next tick that meets an exit condition.
    pub fn partially_closed(&mut self, trade: &Trade) -> Result<()> {
        if trade.position_id() != self.position.id || trade.is_final() {
            return Err(WardenError::Validation(format!(
                "partial close of {} for {} does not leave a remainder on {}",
                trade.exit_size,
                trade.position_id(),
                self.position.id
            )));
        }
        self.transition(ExitState::Open)?;
        self.trigger = None;
        self.position.close_generation += 1;
        self.correct_size(trade.remaining_size());
        Ok(())
    }

    /// Close confirmed. Terminal.
    pub fn mark_closed(&mut self, trade: &Trade) -> Result<()> {
        if trade.position_id() != self.position.id {
            return Err(WardenError::Validation(format!(
                "trade for {} applied to machine {}",
                trade.position_id(),
                self.position.id
            )));
        }
        self.transition(ExitState::Closed)
    }

    /// Adopt the exchange's size for an open position
    pub fn correct_size(&mut self, size: Decimal) {
        self.position.size = size;
        self.position.margin =
            crate::domain::margin_for(size, self.position.entry_price, self.position.leverage);
    }
}

/// Exit check for one tick, in priority order
pub fn evaluate(position: &Position, tick: &MarketTick) -> Option<(ExitReason, Decimal)> {
    let plan = &position.exit_plan;
    let elapsed = tick.timestamp.signed_duration_since(position.opened_at);

    // (worst price against us, best price for us)
    let (adverse, favorable) = match position.direction {
        Direction::Long => (tick.low, tick.high),
        Direction::Short => (tick.high, tick.low),
    };
    let crossed_against = |level: Decimal| match position.direction {
        Direction::Long => adverse <= level,
        Direction::Short => adverse >= level,
    };
    let crossed_for = |level: Decimal| match position.direction {
        Direction::Long => favorable >= level,
        Direction::Short => favorable <= level,
    };
    // Fill reference: the level itself, or the open if the candle gapped through it
    let against_fill = |level: Decimal| match position.direction {
        Direction::Long => level.min(tick.open),
        Direction::Short => level.max(tick.open),
    };
    let for_fill = |level: Decimal| match position.direction {
        Direction::Long => level.max(tick.open),
        Direction::Short => level.min(tick.open),
    };

    if plan.early_failure_window_secs > 0 && elapsed <= plan.early_failure_window() {
        let level = plan.early_failure_price(position.direction, position.entry_price);
        if crossed_against(level) {
            return Some((ExitReason::EarlyFailure, against_fill(level)));
        }
    }

    if crossed_against(position.stop_price) {
        return Some((ExitReason::Stop, against_fill(position.stop_price)));
    }

    if crossed_for(position.target_price) {
        return Some((ExitReason::Target, for_fill(position.target_price)));
    }

    if elapsed >= plan.time_limit() {
        return Some((ExitReason::Time, tick.close));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClientRequestId, ExitPlan, Fill, PositionId, PositionStatus, SignalProvenance};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn position(direction: Direction, ef_window_secs: i64) -> Position {
        let id = PositionId::new();
        let plan = ExitPlan {
            stop_distance: dec!(50),
            target_distance: dec!(100),
            early_failure_distance: dec!(20),
            early_failure_window_secs: ef_window_secs,
            time_limit_secs: 3 * 3600,
        };
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
            opened_at: t0(),
            status: PositionStatus::Open,
            open_request_id: ClientRequestId::for_open(id),
            close_generation: 0,
            provenance: SignalProvenance {
                model_id: "m".into(),
                feature_snapshot_ref: "f".into(),
                confidence: dec!(0.8),
                generated_at: t0(),
            },
        }
    }

    fn candle(mins: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> MarketTick {
        MarketTick::candle("ETHUSDT", t0() + Duration::minutes(mins), open, high, low, close)
    }

    #[test]
    fn test_scenario_c_stop_on_fifth_tick() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        let lows = [dec!(990), dec!(975), dec!(960), dec!(951), dec!(950)];

        for (i, low) in lows.iter().enumerate() {
            let tick = candle(10 * (i as i64 + 1), dec!(1000), dec!(1005), *low, dec!(1000));
            let outcome = machine.on_tick(&tick).unwrap();
            if i < 4 {
                assert_eq!(outcome, TickOutcome::Hold, "tick {} must not trigger", i + 1);
            } else {
                assert_eq!(
                    outcome,
                    TickOutcome::Triggered {
                        reason: ExitReason::Stop,
                        trigger_price: dec!(950)
                    }
                );
            }
        }
        assert_eq!(machine.state(), ExitState::StopTriggered);
    }

    #[test]
    fn test_stop_wins_over_target_in_same_candle() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        let outcome = machine
            .on_tick(&candle(60, dec!(1000), dec!(1200), dec!(900), dec!(1000)))
            .unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Triggered {
                reason: ExitReason::Stop,
                ..
            }
        ));

        let mut machine = ExitStateMachine::recovered(position(Direction::Short, 0));
        let outcome = machine
            .on_tick(&candle(60, dec!(1000), dec!(1100), dec!(850), dec!(1000)))
            .unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Triggered {
                reason: ExitReason::Stop,
                ..
            }
        ));
    }

    #[test]
    fn test_early_failure_only_inside_window() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 1800));
        let outcome = machine
            .on_tick(&candle(10, dec!(1000), dec!(1001), dec!(979), dec!(985)))
            .unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Triggered {
                reason: ExitReason::EarlyFailure,
                trigger_price: dec!(980)
            }
        );

        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 1800));
        let outcome = machine
            .on_tick(&candle(45, dec!(1000), dec!(1001), dec!(979), dec!(985)))
            .unwrap();
        assert_eq!(outcome, TickOutcome::Hold);
    }

    #[test]
    fn test_target_and_gap_fill_reference() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Short, 0));
        // Gapped below the target: reference the open
        let outcome = machine
            .on_tick(&candle(60, dec!(880), dec!(885), dec!(870), dec!(875)))
            .unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Triggered {
                reason: ExitReason::Target,
                trigger_price: dec!(880)
            }
        );
    }

    #[test]
    fn test_time_limit() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        assert_eq!(
            machine
                .on_tick(&candle(179, dec!(1000), dec!(1001), dec!(999), dec!(1000)))
                .unwrap(),
            TickOutcome::Hold
        );
        assert_eq!(
            machine
                .on_tick(&candle(180, dec!(1000), dec!(1001), dec!(999), dec!(1003)))
                .unwrap(),
            TickOutcome::Triggered {
                reason: ExitReason::Time,
                trigger_price: dec!(1003)
            }
        );
    }

    #[test]
    fn test_stale_tick_rejected_equal_accepted() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        let tick = candle(30, dec!(1000), dec!(1001), dec!(999), dec!(1000));
        machine.on_tick(&tick).unwrap();
        assert!(machine.on_tick(&tick).is_ok());

        let stale = candle(20, dec!(1000), dec!(1001), dec!(900), dec!(1000));
        assert!(matches!(
            machine.on_tick(&stale),
            Err(WardenError::StaleData { .. })
        ));
        // Not applied
        assert_eq!(machine.state(), ExitState::Open);
    }

    #[test]
    fn test_closing_ignores_ticks_and_rearms_on_failure() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        machine
            .on_tick(&candle(60, dec!(1000), dec!(1001), dec!(940), dec!(945)))
            .unwrap();
        let request = machine.begin_close().unwrap();
        assert_eq!(request.reason, ExitReason::Stop);
        assert!(request.position.close_request_id().as_str().ends_with("-0"));
        assert_eq!(machine.state(), ExitState::Closing);

        let outcome = machine
            .on_tick(&candle(61, dec!(945), dec!(1200), dec!(940), dec!(1150)))
            .unwrap();
        assert_eq!(outcome, TickOutcome::Ignored);

        machine.close_failed().unwrap();
        assert_eq!(machine.state(), ExitState::Open);
        assert_eq!(machine.position().close_generation, 1);

        let outcome = machine
            .on_tick(&candle(62, dec!(945), dec!(950), dec!(930), dec!(935)))
            .unwrap();
        assert!(matches!(outcome, TickOutcome::Triggered { .. }));
        let request = machine.begin_close().unwrap();
        assert!(request.position.close_request_id().as_str().ends_with("-1"));
    }

    #[test]
    fn test_partial_close_rearms_remainder() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        machine
            .on_tick(&candle(60, dec!(1000), dec!(1001), dec!(940), dec!(945)))
            .unwrap();
        let request = machine.begin_close().unwrap();
        let partial = Trade::from_close(
            &request.position,
            Fill {
                price: dec!(950),
                size: dec!(0.5),
            },
            request.reason,
            t0(),
        );
        machine.partially_closed(&partial).unwrap();
        assert_eq!(machine.state(), ExitState::Open);
        assert_eq!(machine.trigger(), None);
        assert_eq!(machine.position().size, dec!(1.5));
        assert_eq!(machine.position().margin, dec!(300));
        assert!(machine.position().close_request_id().as_str().ends_with("-1"));

        // A full-size trade is not a partial close
        let full = Trade::from_close(
            machine.position(),
            Fill {
                price: dec!(950),
                size: dec!(1.5),
            },
            ExitReason::Stop,
            t0(),
        );
        assert!(machine.partially_closed(&full).is_err());
    }

    #[test]
    fn test_recovered_mid_close_uses_next_generation() {
        let mut pos = position(Direction::Long, 0);
        pos.status = PositionStatus::Closing;
        let machine = ExitStateMachine::recovered(pos);
        assert_eq!(machine.state(), ExitState::Open);
        assert_eq!(machine.position().close_generation, 1);

        let machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        assert_eq!(machine.position().close_generation, 0);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut machine = ExitStateMachine::recovered(position(Direction::Long, 0));
        machine
            .on_tick(&candle(60, dec!(1000), dec!(1001), dec!(940), dec!(945)))
            .unwrap();
        let request = machine.begin_close().unwrap();
        let trade = Trade::from_close(
            &request.position,
            Fill {
                price: dec!(950),
                size: dec!(2),
            },
            request.reason,
            t0(),
        );
        machine.mark_closed(&trade).unwrap();
        assert!(machine.state().is_terminal());
        assert!(machine.mark_closed(&trade).is_err());
        assert!(machine.close_failed().is_err());
        assert_eq!(
            machine
                .on_tick(&candle(70, dec!(1000), dec!(1001), dec!(900), dec!(945)))
                .unwrap(),
            TickOutcome::Ignored
        );
    }

    #[test]
    fn test_pending_open_ignores_ticks() {
        let mut pos = position(Direction::Long, 0);
        pos.status = PositionStatus::PendingOpen;
        let mut machine = ExitStateMachine::pending(pos.clone());
        assert_eq!(
            machine
                .on_tick(&candle(60, dec!(1000), dec!(1001), dec!(900), dec!(945)))
                .unwrap(),
            TickOutcome::Ignored
        );
        machine.confirm_open(pos).unwrap();
        assert_eq!(machine.state(), ExitState::Open);
        assert!(machine.confirm_open(machine.position().clone()).is_err());
    }
}
