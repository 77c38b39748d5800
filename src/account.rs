//! Account equity tracking
//!
//! Equity moves only by realized PnL. Daily metrics roll over at the UTC
//! day boundary; equity itself is carried across days and restarts.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::{EquitySnapshot, Trade};

/// Equity and daily PnL at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Decimal,
    pub day_start_equity: Decimal,
    pub daily_pnl: Decimal,
    pub day: NaiveDate,
    pub trades_today: u32,
}

impl AccountState {
    fn roll_to(&mut self, day: NaiveDate) {
        if day > self.day {
            info!(
                from = %self.day,
                to = %day,
                equity = %self.equity,
                daily_pnl = %self.daily_pnl,
                "New trading day, resetting daily metrics"
            );
            self.day = day;
            self.day_start_equity = self.equity;
            self.daily_pnl = Decimal::ZERO;
            self.trades_today = 0;
        }
    }
}

/// Tracks account equity
#[derive(Debug)]
pub struct EquityTracker {
    state: RwLock<AccountState>,
}

impl EquityTracker {
    pub fn new(initial_equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            state: RwLock::new(AccountState {
                equity: initial_equity,
                day_start_equity: initial_equity,
                daily_pnl: Decimal::ZERO,
                day: now.date_naive(),
                trades_today: 0,
            }),
        }
    }

    /// Rebuild from persisted history: equity from the last snapshot (or the
    /// configured initial equity), daily PnL from the trades closed on `now`'s day
    pub fn restore(
        initial_equity: Decimal,
        last_snapshot: Option<&EquitySnapshot>,
        trades: &[Trade],
        now: DateTime<Utc>,
    ) -> Self {
        let equity = last_snapshot.map(|s| s.equity).unwrap_or(initial_equity);
        let today = now.date_naive();
        let todays: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.closed_at.date_naive() == today)
            .collect();
        let daily_pnl: Decimal = todays.iter().map(|t| t.realized_pnl).sum();

        info!(
            equity = %equity,
            daily_pnl = %daily_pnl,
            trades_today = todays.len(),
            "Account restored"
        );
        Self {
            state: RwLock::new(AccountState {
                equity,
                day_start_equity: equity - daily_pnl,
                daily_pnl,
                day: today,
                trades_today: todays.len() as u32,
            }),
        }
    }

    pub async fn equity(&self) -> Decimal {
        self.state.read().await.equity
    }

    pub async fn state(&self) -> AccountState {
        self.state.read().await.clone()
    }

    /// Roll daily metrics if `now` is on a later UTC day
    pub async fn roll(&self, now: DateTime<Utc>) -> AccountState {
        let mut state = self.state.write().await;
        state.roll_to(now.date_naive());
        state.clone()
    }

    /// Book a closed trade's realized PnL
    pub async fn apply_trade(&self, trade: &Trade) -> AccountState {
        let mut state = self.state.write().await;
        state.roll_to(trade.closed_at.date_naive());
        state.equity += trade.realized_pnl;
        state.daily_pnl += trade.realized_pnl;
        state.trades_today += 1;
        state.clone()
    }

    /// Equity curve point
    pub async fn snapshot(&self, open_margin_used: Decimal, at: DateTime<Utc>) -> EquitySnapshot {
        EquitySnapshot {
            timestamp: at,
            equity: self.state.read().await.equity,
            open_margin_used,
        }
    }
}
