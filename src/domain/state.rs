use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::{ExitReason, PositionStatus};

/// Exit state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitState {
    /// Sizing accepted, open order not yet confirmed
    PendingOpen,
    /// Open order filled, evaluating ticks
    Open,
    EarlyFailureTriggered,
    StopTriggered,
    TargetTriggered,
    TimeTriggered,
    /// Close order in flight
    Closing,
    /// Terminal
    Closed,
}

impl ExitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitState::PendingOpen => "PENDING_OPEN",
            ExitState::Open => "OPEN",
            ExitState::EarlyFailureTriggered => "EARLY_FAILURE_TRIGGERED",
            ExitState::StopTriggered => "STOP_TRIGGERED",
            ExitState::TargetTriggered => "TARGET_TRIGGERED",
            ExitState::TimeTriggered => "TIME_TRIGGERED",
            ExitState::Closing => "CLOSING",
            ExitState::Closed => "CLOSED",
        }
    }

    /// Trigger state entered when `reason` fires
    pub fn triggered_by(reason: ExitReason) -> Self {
        match reason {
            ExitReason::EarlyFailure => ExitState::EarlyFailureTriggered,
            ExitReason::Stop => ExitState::StopTriggered,
            ExitReason::Target => ExitState::TargetTriggered,
            // Reconciliation closes never go through the tick path; treat as time-out
            ExitReason::Time | ExitReason::Reconciled => ExitState::TimeTriggered,
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(
            self,
            ExitState::EarlyFailureTriggered
                | ExitState::StopTriggered
                | ExitState::TargetTriggered
                | ExitState::TimeTriggered
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExitState::Closed)
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ExitState) -> bool {
        use ExitState::*;

        match (self, target) {
            // Open confirmed
            (PendingOpen, Open) => true,
            // Open order failed: nothing to supervise
            (PendingOpen, Closed) => true,

            // A tick satisfied an exit condition
            (Open, EarlyFailureTriggered)
            | (Open, StopTriggered)
            | (Open, TargetTriggered)
            | (Open, TimeTriggered) => true,

            // Close order submitted
            (EarlyFailureTriggered, Closing)
            | (StopTriggered, Closing)
            | (TargetTriggered, Closing)
            | (TimeTriggered, Closing) => true,

            // Close resolved
            (Closing, Closed) => true,
            // Close failed irrecoverably: re-arm
            (Closing, Open) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ExitState> {
        use ExitState::*;

        match self {
            PendingOpen => vec![Open, Closed],
            Open => vec![
                EarlyFailureTriggered,
                StopTriggered,
                TargetTriggered,
                TimeTriggered,
            ],
            EarlyFailureTriggered | StopTriggered | TargetTriggered | TimeTriggered => {
                vec![Closing]
            }
            Closing => vec![Closed, Open],
            Closed => vec![],
        }
    }

    /// Persisted position status for this machine state
    pub fn position_status(&self) -> PositionStatus {
        match self {
            ExitState::PendingOpen => PositionStatus::PendingOpen,
            ExitState::Open => PositionStatus::Open,
            ExitState::EarlyFailureTriggered
            | ExitState::StopTriggered
            | ExitState::TargetTriggered
            | ExitState::TimeTriggered
            | ExitState::Closing => PositionStatus::Closing,
            ExitState::Closed => PositionStatus::Closed,
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
