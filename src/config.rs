use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::coordination::shutdown::ShutdownConfig;
use crate::domain::Direction;
use crate::supervisor::AlertManagerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub execution: ExecutionConfig,
    pub account: AccountConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub paper: PaperExchangeConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub alerts: AlertManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hard limits enforced by the risk gate. Read-only during operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RiskLimits {
    /// Equity fraction that one trade may lose at its stop (e.g., 0.01 = 1%)
    pub max_risk_per_trade_fraction: Decimal,
    /// Equity fraction that all open positions may commit as margin
    pub max_margin_usage_fraction: Decimal,
    pub max_concurrent_long: u32,
    pub max_concurrent_short: u32,
    pub max_leverage: Decimal,
}

impl RiskLimits {
    pub fn concurrency_cap(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.max_concurrent_long,
            Direction::Short => self.max_concurrent_short,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(flatten)]
    pub limits: RiskLimits,
    /// Margin cap for a single trade as an equity fraction
    #[serde(default)]
    pub max_margin_per_trade_fraction: Option<Decimal>,
    /// Realized daily loss (fraction of day-start equity) that halts new opens
    #[serde(default)]
    pub daily_loss_limit_fraction: Option<Decimal>,
    /// Seconds to suppress new opens after the exchange rejects one
    #[serde(default)]
    pub reject_cooldown_secs: u64,
    /// Block all new opens
    #[serde(default)]
    pub kill_switch: bool,
}

/// Exit parameters for one direction, in ATR multiples and minutes
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExitProfile {
    /// Stop distance multiple (k1)
    pub stop_atr: Decimal,
    /// Target distance multiple (k2, must exceed k1)
    pub target_atr: Decimal,
    /// Adverse move multiple that counts as an early failure
    pub early_failure_atr: Decimal,
    /// Early-failure rule only applies this long after entry (0 disables it)
    pub early_failure_window_mins: i64,
    pub max_hold_mins: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Leverage applied to new positions (≤ risk.max_leverage)
    pub leverage: Decimal,
    /// At or above this confidence the size is not scaled down
    pub high_confidence_threshold: Decimal,
    /// Below this confidence no trade is taken
    pub min_confidence: Decimal,
    /// Exchange quantity increment
    pub qty_step: Decimal,
    /// Exchange minimum quantity
    pub min_qty: Decimal,
    pub long: ExitProfile,
    pub short: ExitProfile,
}

impl SizingConfig {
    pub fn profile(&self, direction: Direction) -> &ExitProfile {
        match direction {
            Direction::Long => &self.long,
            Direction::Short => &self.short,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Per-call timeout for exchange requests in milliseconds
    pub order_timeout_ms: u64,
    /// Maximum attempts per logical action (submit or verify)
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Polling interval for order status in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long to wait for an accepted order to fill before cancelling
    pub fill_timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    500
}

impl ExecutionConfig {
    /// Backoff before attempt `attempt + 1` (attempt is 1-based)
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << shift);
        std::time::Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Equity used when no equity history has been persisted yet
    pub initial_equity: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the position snapshot and append-only logs
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperExchangeConfig {
    /// Adverse slippage applied to paper fills, in basis points
    #[serde(default)]
    pub slippage_bps: Decimal,
}

impl Default for PaperExchangeConfig {
    fn default() -> Self {
        Self {
            slippage_bps: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Periodic reconciliation interval in seconds (0 = startup and on-demand only)
    #[serde(default = "default_reconciliation_interval")]
    pub interval_secs: u64,
}

fn default_reconciliation_interval() -> u64 {
    300
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconciliation_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.poll_interval_ms", 500)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WARDEN_RISK__KILL_SWITCH, etc.)
            .add_source(
                Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let limits = &self.risk.limits;

        let fraction_ok = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        if !fraction_ok(limits.max_risk_per_trade_fraction) {
            errors.push("max_risk_per_trade_fraction must be in (0, 1]".to_string());
        }
        if !fraction_ok(limits.max_margin_usage_fraction) {
            errors.push("max_margin_usage_fraction must be in (0, 1]".to_string());
        }
        if limits.max_leverage < Decimal::ONE {
            errors.push("max_leverage must be at least 1".to_string());
        }
        if let Some(f) = self.risk.max_margin_per_trade_fraction {
            if !fraction_ok(f) {
                errors.push("max_margin_per_trade_fraction must be in (0, 1]".to_string());
            }
        }
        if let Some(f) = self.risk.daily_loss_limit_fraction {
            if !fraction_ok(f) {
                errors.push("daily_loss_limit_fraction must be in (0, 1]".to_string());
            }
        }

        let sizing = &self.sizing;
        if sizing.leverage < Decimal::ONE || sizing.leverage > limits.max_leverage {
            errors.push(format!(
                "sizing.leverage {} must be within [1, max_leverage {}]",
                sizing.leverage, limits.max_leverage
            ));
        }
        if !fraction_ok(sizing.high_confidence_threshold) {
            errors.push("high_confidence_threshold must be in (0, 1]".to_string());
        }
        if sizing.min_confidence < Decimal::ZERO || sizing.min_confidence > Decimal::ONE {
            errors.push("min_confidence must be in [0, 1]".to_string());
        }
        if sizing.qty_step <= Decimal::ZERO {
            errors.push("qty_step must be positive".to_string());
        }
        if sizing.min_qty < Decimal::ZERO {
            errors.push("min_qty must not be negative".to_string());
        }

        for (name, profile) in [("long", &sizing.long), ("short", &sizing.short)] {
            if profile.stop_atr <= Decimal::ZERO {
                errors.push(format!("{name}.stop_atr must be positive"));
            }
            if profile.target_atr <= profile.stop_atr {
                errors.push(format!("{name}.target_atr must exceed stop_atr"));
            }
            if profile.early_failure_window_mins > 0
                && (profile.early_failure_atr <= Decimal::ZERO
                    || profile.early_failure_atr >= profile.stop_atr)
            {
                errors.push(format!(
                    "{name}.early_failure_atr must be positive and tighter than stop_atr"
                ));
            }
            if profile.early_failure_window_mins < 0 {
                errors.push(format!("{name}.early_failure_window_mins must not be negative"));
            }
            if profile.max_hold_mins <= 0 {
                errors.push(format!("{name}.max_hold_mins must be positive"));
            }
        }

        let exec = &self.execution;
        if exec.max_attempts == 0 {
            errors.push("execution.max_attempts must be at least 1".to_string());
        }
        if exec.order_timeout_ms == 0 {
            errors.push("execution.order_timeout_ms must be positive".to_string());
        }
        if exec.backoff_max_ms < exec.backoff_base_ms {
            errors.push("execution.backoff_max_ms must be >= backoff_base_ms".to_string());
        }

        if self.account.initial_equity <= Decimal::ZERO {
            errors.push("account.initial_equity must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
