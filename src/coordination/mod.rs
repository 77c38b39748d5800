//! Coordination layer
//!
//! - Circuit breaker gating new opens (daily loss, reject cooldown, persistence, kill switch)
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod shutdown;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerStats, CircuitState, TradingCircuitBreaker, TripKind,
    TripReason,
};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, PhaseFuture, ShutdownConfig, ShutdownError,
    ShutdownPhase, ShutdownSignal,
};
