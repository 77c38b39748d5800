use thiserror::Error;

use crate::domain::{Direction, PositionId};

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Exchange errors
    #[error("Transient exchange error after {attempts} attempt(s): {source}")]
    TransientExchange {
        attempts: u32,
        #[source]
        source: ExchangeError,
    },

    #[error("Rejected by exchange ({client_request_id}): {reason}")]
    RejectedByExchange {
        client_request_id: String,
        reason: String,
    },

    #[error("Order outcome unknown after {attempts} attempt(s): {client_request_id}")]
    OutcomeUnknown {
        client_request_id: String,
        attempts: u32,
    },

    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    // Risk control
    #[error("Risk violation: {0}")]
    RiskViolation(#[from] RiskRejection),

    #[error("Trading halted: {0}")]
    TradingHalted(String),

    // Market data
    #[error("Stale data for {symbol}: tick at {tick_at} is older than {last_at}")]
    StaleData {
        symbol: String,
        tick_at: chrono::DateTime<chrono::Utc>,
        last_at: chrono::DateTime<chrono::Utc>,
    },

    // State machine errors
    #[error("Invalid state transition for {position_id}: from {from} to {to}")]
    InvalidStateTransition {
        position_id: PositionId,
        from: String,
        to: String,
    },

    #[error("Position not found: {0}")]
    PositionNotFound(PositionId),

    // Persistence
    #[error("Persistence failure: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl WardenError {
    /// Errors after which local state may disagree with the exchange.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self,
            WardenError::OutcomeUnknown { .. } | WardenError::Persistence(_)
        )
    }

    /// Errors that must reach the operator alert channel.
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            WardenError::RejectedByExchange { .. }
                | WardenError::OutcomeUnknown { .. }
                | WardenError::Persistence(_)
                | WardenError::InvalidStateTransition { .. }
        )
    }
}

/// Result type alias for WardenError
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors reported by an exchange client implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The call did not complete in time; the outcome is unknown
    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Confirmed, non-transient refusal (insufficient margin, invalid order)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Connection-level failure before the request reached the exchange
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ExchangeError {
    /// Transient errors are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout { .. }
                | ExchangeError::RateLimited(_)
                | ExchangeError::Unavailable(_)
        )
    }

    /// Whether the request may have reached the exchange and been acted upon
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout { .. } | ExchangeError::Protocol(_)
        )
    }
}

/// Reasons the risk gate refuses a candidate trade, one per check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    #[error("no equity to size against: {equity}")]
    NoEquity { equity: rust_decimal::Decimal },

    #[error("concurrency cap exceeded: {open} open {direction} position(s), cap {cap}")]
    ConcurrencyCapExceeded {
        direction: Direction,
        open: u32,
        cap: u32,
    },

    #[error("margin cap exceeded: projected {projected} > cap {cap}")]
    MarginCapExceeded {
        projected: rust_decimal::Decimal,
        cap: rust_decimal::Decimal,
    },

    #[error("per-trade risk exceeded: {risk} > cap {cap}")]
    PerTradeRiskExceeded {
        risk: rust_decimal::Decimal,
        cap: rust_decimal::Decimal,
    },

    #[error("leverage exceeded: {requested} > max {max}")]
    LeverageExceeded {
        requested: rust_decimal::Decimal,
        max: rust_decimal::Decimal,
    },
}

impl RiskRejection {
    /// Short machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::NoEquity { .. } => "no_equity",
            RiskRejection::ConcurrencyCapExceeded { .. } => "concurrency_cap",
            RiskRejection::MarginCapExceeded { .. } => "margin_cap",
            RiskRejection::PerTradeRiskExceeded { .. } => "per_trade_risk",
            RiskRejection::LeverageExceeded { .. } => "leverage",
        }
    }
}
