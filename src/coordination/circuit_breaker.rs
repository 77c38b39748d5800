//! Trading Circuit Breaker
//!
//! Halts new position opens while any trip condition is active. Open
//! positions are unaffected: their exit machines keep running.
//!
//! Trip conditions and how they clear:
//! - daily loss limit: at the next UTC day
//! - reject cooldown: after `reject_cooldown_secs`
//! - persistence failure: only by operator reset
//! - kill switch / manual: only by operator reset

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::RiskConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - opens allowed
    Closed,
    /// At least one trip active - opens blocked
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Configuration for the trading circuit breaker
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerConfig {
    /// Realized daily loss, as a fraction of day-start equity, that halts opens
    pub daily_loss_limit_fraction: Option<Decimal>,
    pub reject_cooldown_secs: u64,
    pub kill_switch: bool,
}

impl From<&RiskConfig> for CircuitBreakerConfig {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            daily_loss_limit_fraction: risk.daily_loss_limit_fraction,
            reject_cooldown_secs: risk.reject_cooldown_secs,
            kill_switch: risk.kill_switch,
        }
    }
}

/// Trip category; one active trip per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TripKind {
    DailyLoss,
    RejectCooldown,
    Persistence,
    KillSwitch,
    Manual,
}

/// Trip reasons for the circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum TripReason {
    DailyLossLimit { loss: Decimal, limit: Decimal },
    RejectCooldown { client_request_id: String },
    PersistenceFailure(String),
    KillSwitch,
    ManualTrip(String),
}

impl TripReason {
    pub fn kind(&self) -> TripKind {
        match self {
            TripReason::DailyLossLimit { .. } => TripKind::DailyLoss,
            TripReason::RejectCooldown { .. } => TripKind::RejectCooldown,
            TripReason::PersistenceFailure(_) => TripKind::Persistence,
            TripReason::KillSwitch => TripKind::KillSwitch,
            TripReason::ManualTrip(_) => TripKind::Manual,
        }
    }
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::DailyLossLimit { loss, limit } => {
                write!(f, "daily loss {} reached limit {}", loss, limit)
            }
            TripReason::RejectCooldown { client_request_id } => {
                write!(f, "cooling down after rejected order {}", client_request_id)
            }
            TripReason::PersistenceFailure(msg) => write!(f, "persistence failure: {}", msg),
            TripReason::KillSwitch => write!(f, "kill switch engaged"),
            TripReason::ManualTrip(reason) => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveTrip {
    reason: TripReason,
    tripped_at: DateTime<Utc>,
    /// Trip clears by itself at this instant
    until: Option<DateTime<Utc>>,
}

/// Circuit breaker gating new opens
pub struct TradingCircuitBreaker {
    config: CircuitBreakerConfig,
    trips: RwLock<HashMap<TripKind, ActiveTrip>>,
    total_trips: AtomicU64,
}

impl TradingCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let mut trips = HashMap::new();
        if config.kill_switch {
            warn!("Kill switch engaged: new positions will not be opened");
            trips.insert(
                TripKind::KillSwitch,
                ActiveTrip {
                    reason: TripReason::KillSwitch,
                    tripped_at: Utc::now(),
                    until: None,
                },
            );
        }
        Self {
            config,
            trips: RwLock::new(trips),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get current state as of `now`
    pub async fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.check(now).await {
            Ok(()) => CircuitState::Closed,
            Err(_) => CircuitState::Open,
        }
    }

    /// Whether a new position may be opened at `now`; expired trips are cleared
    pub async fn check(&self, now: DateTime<Utc>) -> Result<(), TripReason> {
        let mut trips = self.trips.write().await;
        trips.retain(|kind, trip| match trip.until {
            Some(until) if now >= until => {
                info!(kind = ?kind, "Circuit breaker trip expired");
                false
            }
            _ => true,
        });

        // Report the most severe active trip
        for kind in [
            TripKind::KillSwitch,
            TripKind::Persistence,
            TripKind::Manual,
            TripKind::DailyLoss,
            TripKind::RejectCooldown,
        ] {
            if let Some(trip) = trips.get(&kind) {
                return Err(trip.reason.clone());
            }
        }
        Ok(())
    }

    /// Trip the circuit breaker
    pub async fn trip(&self, reason: TripReason, until: Option<DateTime<Utc>>) {
        let mut trips = self.trips.write().await;
        let kind = reason.kind();
        let newly = !trips.contains_key(&kind);
        if newly {
            self.total_trips.fetch_add(1, Ordering::SeqCst);
            warn!(until = ?until, "Circuit breaker TRIPPED: {}", reason);
        }
        trips.insert(
            kind,
            ActiveTrip {
                reason,
                tripped_at: Utc::now(),
                until,
            },
        );
    }

    /// Open rejected by the exchange: suppress opens for the cooldown
    pub async fn record_open_rejected(&self, client_request_id: &str, now: DateTime<Utc>) {
        if self.config.reject_cooldown_secs == 0 {
            return;
        }
        let until = now + Duration::seconds(self.config.reject_cooldown_secs as i64);
        self.trip(
            TripReason::RejectCooldown {
                client_request_id: client_request_id.to_string(),
            },
            Some(until),
        )
        .await;
    }

    /// Check realized daily PnL against the loss limit; trips until the next UTC day
    pub async fn update_daily_pnl(
        &self,
        daily_pnl: Decimal,
        day_start_equity: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(fraction) = self.config.daily_loss_limit_fraction else {
            return false;
        };
        let limit = fraction * day_start_equity;
        if daily_pnl > -limit {
            return false;
        }
        let next_day = (now.date_naive() + Duration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc();
        self.trip(
            TripReason::DailyLossLimit {
                loss: -daily_pnl,
                limit,
            },
            Some(next_day),
        )
        .await;
        true
    }

    /// State store write failed; opens stay blocked until an operator resets
    pub async fn persistence_failed(&self, message: &str) {
        self.trip(TripReason::PersistenceFailure(message.to_string()), None)
            .await;
    }

    /// Manually trip the circuit
    pub async fn manual_trip(&self, reason: &str) {
        self.trip(TripReason::ManualTrip(reason.to_string()), None).await;
    }

    /// Clear one kind of trip
    pub async fn reset(&self, kind: TripKind) {
        if self.trips.write().await.remove(&kind).is_some() {
            info!(kind = ?kind, "Circuit breaker trip reset");
        }
    }

    /// Force close the circuit (manual reset of every trip)
    pub async fn force_close(&self) {
        self.trips.write().await.clear();
        warn!("Circuit breaker force-closed");
    }

    /// Get circuit breaker statistics
    pub async fn get_stats(&self, now: DateTime<Utc>) -> CircuitBreakerStats {
        let state = self.state(now).await;
        let trips = self.trips.read().await;
        let mut active: Vec<(DateTime<Utc>, TripReason)> = trips
            .values()
            .map(|t| (t.tripped_at, t.reason.clone()))
            .collect();
        active.sort_by_key(|(at, _)| *at);
        CircuitBreakerStats {
            state,
            active_trips: active.into_iter().map(|(_, r)| r).collect(),
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub active_trips: Vec<TripReason>,
    pub total_trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = TradingCircuitBreaker::with_defaults();
        assert_eq!(cb.state(at(0, 0, 0)).await, CircuitState::Closed);
        assert!(cb.check(at(0, 0, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_until_reset() {
        let cb = TradingCircuitBreaker::new(CircuitBreakerConfig {
            kill_switch: true,
            ..Default::default()
        });
        assert_eq!(cb.check(at(1, 0, 0)).await, Err(TripReason::KillSwitch));
        cb.reset(TripKind::KillSwitch).await;
        assert!(cb.check(at(1, 0, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_reject_cooldown_expires() {
        let cb = TradingCircuitBreaker::new(CircuitBreakerConfig {
            reject_cooldown_secs: 30,
            ..Default::default()
        });
        cb.record_open_rejected("open-x", at(10, 0, 0)).await;
        assert!(cb.check(at(10, 0, 29)).await.is_err());
        assert!(cb.check(at(10, 0, 30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_loss_halts_until_next_day() {
        let cb = TradingCircuitBreaker::new(CircuitBreakerConfig {
            daily_loss_limit_fraction: Some(dec!(0.05)),
            ..Default::default()
        });
        assert!(!cb.update_daily_pnl(dec!(-499), dec!(10000), at(12, 0, 0)).await);
        assert!(cb.update_daily_pnl(dec!(-500), dec!(10000), at(12, 0, 0)).await);

        match cb.check(at(23, 59, 59)).await {
            Err(TripReason::DailyLossLimit { loss, limit }) => {
                assert_eq!(loss, dec!(500));
                assert_eq!(limit, dec!(500));
            }
            other => panic!("expected daily loss trip, got {:?}", other),
        }
        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert!(cb.check(next_day).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistence_failure_outranks_cooldown() {
        let cb = TradingCircuitBreaker::new(CircuitBreakerConfig {
            reject_cooldown_secs: 30,
            ..Default::default()
        });
        cb.record_open_rejected("open-x", at(10, 0, 0)).await;
        cb.persistence_failed("disk full").await;

        assert!(matches!(
            cb.check(at(10, 0, 1)).await,
            Err(TripReason::PersistenceFailure(_))
        ));
        // Still blocked long after the cooldown
        assert!(cb.check(at(18, 0, 0)).await.is_err());

        let stats = cb.get_stats(at(18, 0, 0)).await;
        assert_eq!(stats.total_trips, 2);
        assert_eq!(stats.active_trips.len(), 1);

        cb.force_close().await;
        assert_eq!(cb.state(at(18, 0, 0)).await, CircuitState::Closed);
    }
}
