//! Pre-trade risk control: shared ledger, gate and sizer

pub mod gate;
pub mod ledger;
pub mod sizer;

pub use gate::{GateDecision, RiskGate};
pub use ledger::{LedgerSnapshot, Reservation, RiskLedger};
pub use sizer::{PositionSizer, SizedPlan, SizingSkip};
