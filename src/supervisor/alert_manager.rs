//! Alert Manager
//!
//! Operator-visible alert channel. Every alert is logged; warnings and above
//! are published to subscribers, with rate limiting to prevent alert storms.
//! Critical alerts bypass the global throttle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::PositionId;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    Warning,
    /// Operator action likely needed
    Error,
    /// Local state may disagree with the exchange
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add metadata to the alert
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// One-line rendering for log sinks and terminals
    pub fn format_line(&self) -> String {
        format!(
            "[{}] {} {}: {} ({})",
            self.level.as_str().to_uppercase(),
            self.component,
            self.title,
            self.message,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (default: 60s)
    pub rate_limit_secs: u64,
    /// Whether to publish info level alerts (default: false)
    pub notify_info: bool,
    /// Maximum alerts per minute before throttling (default: 10)
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            notify_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Alert Manager for coordinating notifications
pub struct AlertManager {
    config: AlertManagerConfig,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    alerts_this_minute: Arc<RwLock<Vec<DateTime<Utc>>>>,
    event_tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            alerts_this_minute: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Subscribe to published alerts
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    /// Check if alert should be rate limited
    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = Utc::now();

        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }

            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Check global rate limit (alerts per minute)
    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    /// Send an alert
    pub async fn alert(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Info => info!(target: "alert", "[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!(target: "alert", "[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!(target: "alert", "[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    target: "alert",
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        let should_publish = match alert.level {
            AlertLevel::Info => self.config.notify_info,
            AlertLevel::Warning | AlertLevel::Error | AlertLevel::Critical => true,
        };
        if !should_publish {
            return;
        }

        if self.should_rate_limit(&alert).await {
            return;
        }
        if alert.level < AlertLevel::Critical && self.is_throttled().await {
            return;
        }

        let _ = self.event_tx.send(alert);
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// Open order refused by the exchange
    pub async fn open_rejected(&self, symbol: &str, client_request_id: &str, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                "execution",
                &format!("Open rejected: {}", symbol),
                reason,
            )
            .with_metadata(serde_json::json!({
                "action": "budget_released",
                "client_request_id": client_request_id,
            })),
        )
        .await;
    }

    /// Close failed irrecoverably; the exit machine re-armed
    pub async fn close_failed(&self, position_id: PositionId, symbol: &str, error: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                "lifecycle",
                &format!("Close failed: {}", position_id),
                error,
            )
            .with_metadata(serde_json::json!({
                "action": "rearmed",
                "symbol": symbol,
            })),
        )
        .await;
    }

    /// Exchange outcome unknown after the retry budget
    pub async fn outcome_unknown(&self, client_request_id: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "execution",
                &format!("Outcome unknown: {}", client_request_id),
                "retry budget spent without a definitive answer, reconciling",
            )
            .with_metadata(serde_json::json!({
                "action": "reconciliation",
            })),
        )
        .await;
    }

    /// State store write failed; new opens are halted
    pub async fn persistence_failed(&self, error: &str) {
        self.alert(
            Alert::new(AlertLevel::Critical, "store", "Persistence Failure", error).with_metadata(
                serde_json::json!({
                    "action": "opens_halted",
                }),
            ),
        )
        .await;
    }

    /// Position on the exchange that no local record accounts for
    pub async fn untracked_exchange_position(&self, symbol: &str, detail: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "reconciliation",
                &format!("Untracked exchange position: {}", symbol),
                detail,
            )
            .with_metadata(serde_json::json!({
                "action": "manual_intervention_required",
            })),
        )
        .await;
    }

    /// Send alert about circuit breaker trip
    pub async fn circuit_breaker_tripped(&self, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                "circuit_breaker",
                "Circuit Breaker Tripped",
                reason,
            )
            .with_metadata(serde_json::json!({
                "action": "opens_paused",
                "reason": reason
            })),
        )
        .await;
    }

    /// Get suppressed alert counts
    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    /// Reset rate limits (call daily)
    pub async fn reset_rate_limits(&self) {
        self.rate_limits.write().await.clear();
        debug!("Alert rate limits reset");
    }
}
