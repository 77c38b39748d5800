//! Risk Ledger
//!
//! Process-wide tally of committed margin and open-position counts. Every
//! read-modify-write goes through one mutex so that "check then reserve" and
//! "release on close" can never interleave.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{Direction, PositionId};

/// Budget held by one open (or opening) position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub position_id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub margin: Decimal,
    /// Loss at the stop, in account currency
    pub risk_amount: Decimal,
    /// `risk_amount` as a fraction of equity at reservation time
    pub risk_fraction: Decimal,
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub committed_margin: Decimal,
    pub open_long_count: u32,
    pub open_short_count: u32,
    pub allocated_risk_fraction: Decimal,
}

impl LedgerSnapshot {
    pub fn open_count(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Long => self.open_long_count,
            Direction::Short => self.open_short_count,
        }
    }
}

/// Ledger contents; only reachable inside the ledger's critical section
#[derive(Debug, Default)]
pub struct LedgerBook {
    reservations: HashMap<PositionId, Reservation>,
    totals: LedgerSnapshot,
}

impl LedgerBook {
    pub fn totals(&self) -> &LedgerSnapshot {
        &self.totals
    }

    pub fn contains(&self, id: &PositionId) -> bool {
        self.reservations.contains_key(id)
    }

    /// Add a reservation. Returns false if the position already holds one.
    pub fn insert(&mut self, reservation: Reservation) -> bool {
        if self.reservations.contains_key(&reservation.position_id) {
            return false;
        }
        self.totals.committed_margin += reservation.margin;
        self.totals.allocated_risk_fraction += reservation.risk_fraction;
        match reservation.direction {
            Direction::Long => self.totals.open_long_count += 1,
            Direction::Short => self.totals.open_short_count += 1,
        }
        self.reservations
            .insert(reservation.position_id, reservation);
        true
    }

    pub fn remove(&mut self, id: &PositionId) -> Option<Reservation> {
        let reservation = self.reservations.remove(id)?;
        self.totals.committed_margin -= reservation.margin;
        self.totals.allocated_risk_fraction -= reservation.risk_fraction;
        match reservation.direction {
            Direction::Long => {
                self.totals.open_long_count = self.totals.open_long_count.saturating_sub(1)
            }
            Direction::Short => {
                self.totals.open_short_count = self.totals.open_short_count.saturating_sub(1)
            }
        }
        Some(reservation)
    }

    /// Sum of reserved margins recomputed from the individual reservations
    pub fn recomputed_margin(&self) -> Decimal {
        self.reservations.values().map(|r| r.margin).sum()
    }
}

/// Shared risk ledger
#[derive(Debug, Default)]
pub struct RiskLedger {
    book: Mutex<LedgerBook>,
}

impl RiskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside the ledger's critical section
    pub async fn with_exclusive<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut LedgerBook) -> R,
    {
        let mut book = self.book.lock().await;
        f(&mut book)
    }

    /// Release the budget held by a position. Releasing twice is a no-op.
    pub async fn release(&self, id: &PositionId) -> Option<Reservation> {
        let mut book = self.book.lock().await;
        let released = book.remove(id);
        match &released {
            Some(r) => debug!(
                position_id = %id,
                margin = %r.margin,
                committed = %book.totals.committed_margin,
                "Released risk budget"
            ),
            None => debug!(position_id = %id, "No reservation to release"),
        }
        released
    }

    /// Re-bind a reservation to the authoritative fill values
    pub async fn adjust(&self, id: &PositionId, margin: Decimal, risk_amount: Decimal, equity: Decimal) {
        let mut book = self.book.lock().await;
        let Some(mut reservation) = book.remove(id) else {
            warn!(position_id = %id, "Adjust requested for unknown reservation");
            return;
        };
        reservation.margin = margin;
        reservation.risk_amount = risk_amount;
        if equity > Decimal::ZERO {
            reservation.risk_fraction = risk_amount / equity;
        }
        book.insert(reservation);
    }

    /// Re-install a reservation for a position recovered at startup. No limit checks:
    /// the position already exists on the exchange.
    pub async fn restore(&self, reservation: Reservation) {
        let mut book = self.book.lock().await;
        let id = reservation.position_id;
        if !book.insert(reservation) {
            warn!(position_id = %id, "Reservation already present during restore");
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.book.lock().await.totals.clone()
    }

    pub async fn reservation(&self, id: &PositionId) -> Option<Reservation> {
        self.book.lock().await.reservations.get(id).cloned()
    }

    pub async fn reservations(&self) -> Vec<Reservation> {
        self.book.lock().await.reservations.values().cloned().collect()
    }

    /// committed_margin equals the sum of the individual reservations
    pub async fn is_consistent(&self) -> bool {
        let book = self.book.lock().await;
        book.totals.committed_margin == book.recomputed_margin()
            && book.totals.open_long_count as usize
                == book
                    .reservations
                    .values()
                    .filter(|r| r.direction == Direction::Long)
                    .count()
            && book.totals.open_short_count as usize
                == book
                    .reservations
                    .values()
                    .filter(|r| r.direction == Direction::Short)
                    .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reservation(direction: Direction, margin: Decimal) -> Reservation {
        Reservation {
            position_id: PositionId::new(),
            symbol: "ETHUSDT".into(),
            direction,
            margin,
            risk_amount: dec!(100),
            risk_fraction: dec!(0.01),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_keep_totals_consistent() {
        let ledger = RiskLedger::new();
        let a = reservation(Direction::Long, dec!(400));
        let b = reservation(Direction::Short, dec!(250));
        let a_id = a.position_id;

        ledger.with_exclusive(|book| book.insert(a)).await;
        ledger.with_exclusive(|book| book.insert(b)).await;

        let snap = ledger.snapshot().await;
        assert_eq!(snap.committed_margin, dec!(650));
        assert_eq!(snap.open_long_count, 1);
        assert_eq!(snap.open_short_count, 1);
        assert_eq!(snap.allocated_risk_fraction, dec!(0.02));
        assert!(ledger.is_consistent().await);

        assert!(ledger.release(&a_id).await.is_some());
        assert!(ledger.release(&a_id).await.is_none());

        let snap = ledger.snapshot().await;
        assert_eq!(snap.committed_margin, dec!(250));
        assert_eq!(snap.open_long_count, 0);
        assert!(ledger.is_consistent().await);
    }

    #[tokio::test]
    async fn test_duplicate_insert_refused() {
        let ledger = RiskLedger::new();
        let a = reservation(Direction::Long, dec!(400));
        assert!(ledger.with_exclusive(|book| book.insert(a.clone())).await);
        assert!(!ledger.with_exclusive(|book| book.insert(a)).await);
        assert_eq!(ledger.snapshot().await.committed_margin, dec!(400));
    }

    #[tokio::test]
    async fn test_adjust_rebinds_margin() {
        let ledger = RiskLedger::new();
        let a = reservation(Direction::Long, dec!(400));
        let id = a.position_id;
        ledger.restore(a).await;

        ledger.adjust(&id, dec!(380), dec!(95), dec!(10000)).await;

        let r = ledger.reservation(&id).await.unwrap();
        assert_eq!(r.margin, dec!(380));
        assert_eq!(r.risk_fraction, dec!(0.0095));
        assert_eq!(ledger.snapshot().await.committed_margin, dec!(380));
        assert!(ledger.is_consistent().await);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let ledger = RiskLedger::new();
        tokio_test::block_on(async {
            ledger.restore(reservation(Direction::Short, dec!(300))).await;
            assert!(ledger.release(&PositionId::new()).await.is_none());
            assert_eq!(ledger.snapshot().await.committed_margin, dec!(300));
            assert_eq!(ledger.snapshot().await.open_short_count, 1);
        });
    }
}
