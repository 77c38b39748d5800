//! Supervisor layer
//!
//! Alert manager for the operator-visible alert channel.

pub mod alert_manager;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
