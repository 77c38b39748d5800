//! Position lifecycle: exit state machine, per-position monitors, the manager
//! that owns them, and exchange reconciliation

pub mod exit_machine;
pub mod manager;
pub mod monitor;
pub mod reconciliation;

pub use exit_machine::{evaluate, CloseRequest, ExitStateMachine, TickOutcome};
pub use manager::{LifecycleContext, PositionLifecycleManager};
pub use monitor::{MonitorHandle, MonitorSender};
pub use reconciliation::{
    diff_positions, Discrepancy, DiscrepancySeverity, ReconciliationResult,
};
