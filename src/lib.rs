pub mod account;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod lifecycle;
pub mod persistence;
pub mod risk;
pub mod supervisor;

pub use account::{AccountState, EquityTracker};
pub use config::AppConfig;
pub use coordination::{
    CircuitState, GracefulShutdown, ShutdownSignal, TradingCircuitBreaker, TripReason,
};
pub use domain::{
    Direction, EquitySnapshot, ExitReason, MarketEvent, MarketTick, Position, PositionId, Signal,
    SignalEvent, Trade,
};
pub use engine::{EngineStatus, EventOutcome, SignalOutcome, TradingEngine};
pub use error::{ExchangeError, Result, RiskRejection, WardenError};
pub use exchange::{ExchangeClient, ExchangePosition, OrderState, PaperExchange};
pub use lifecycle::{ExitStateMachine, PositionLifecycleManager, ReconciliationResult};
pub use persistence::{FileStateStore, MemoryStateStore, StateStore};
pub use risk::{GateDecision, PositionSizer, RiskGate, RiskLedger};
pub use supervisor::{Alert, AlertLevel, AlertManager};
