//! State Store
//!
//! Durable record of open positions, closed trades, equity history and
//! compliance entries. Every record carries a sequence number from one
//! process-wide monotonic counter so the logs can be replayed in order.
//!
//! File layout (one directory):
//! - `positions.json`: snapshot of all open positions, replaced atomically
//! - `trades.jsonl`, `equity.jsonl`, `compliance.jsonl`: append-only logs

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{ComplianceEntry, EquitySnapshot, Position, PositionId, Trade};
use crate::error::{Result, WardenError};

const POSITIONS_FILE: &str = "positions.json";
const TRADES_FILE: &str = "trades.jsonl";
const EQUITY_FILE: &str = "equity.jsonl";
const COMPLIANCE_FILE: &str = "compliance.jsonl";

/// A record with its replay sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced<T> {
    pub seq: u64,
    #[serde(flatten)]
    pub record: T,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PositionSnapshot {
    seq: u64,
    positions: Vec<Position>,
}

/// Everything read back at startup
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub open_positions: Vec<Position>,
    pub positions_seq: u64,
    pub trades: Vec<Sequenced<Trade>>,
    pub equity: Vec<Sequenced<EquitySnapshot>>,
    /// Highest sequence number seen in any file
    pub last_seq: u64,
}

impl PersistedState {
    pub fn last_equity(&self) -> Option<&EquitySnapshot> {
        self.equity.last().map(|s| &s.record)
    }

    /// Positions with a final trade. Partial closes do not count.
    pub fn closed_position_ids(&self) -> HashSet<PositionId> {
        self.trades
            .iter()
            .filter(|t| t.record.is_final())
            .map(|t| t.record.position_id())
            .collect()
    }

    /// Snapshot positions that have no final trade yet. A crash between appending
    /// the trade and rewriting the snapshot leaves the closed position in the
    /// snapshot; the trade log wins.
    pub fn live_positions(&self) -> Vec<Position> {
        let closed = self.closed_position_ids();
        self.open_positions
            .iter()
            .filter(|p| !closed.contains(&p.id))
            .cloned()
            .collect()
    }
}

/// Durable state storage. All writes must be durable when the call returns.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;

    /// Replace the open-position snapshot
    async fn save_open_positions(&self, positions: &[Position]) -> Result<u64>;

    async fn append_trade(&self, trade: &Trade) -> Result<u64>;

    async fn append_equity(&self, snapshot: &EquitySnapshot) -> Result<u64>;

    async fn append_compliance(&self, entry: &ComplianceEntry) -> Result<u64>;

    async fn flush(&self) -> Result<()>;
}

fn persistence_error(context: &str, path: &Path, err: impl std::fmt::Display) -> WardenError {
    WardenError::Persistence(format!("{} {}: {}", context, path.display(), err))
}

/// JSON file store
pub struct FileStateStore {
    dir: PathBuf,
    seq: Mutex<u64>,
}

impl FileStateStore {
    /// Open (creating if needed) a store directory and resume its sequence
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence_error("create", &dir, e))?;
        let store = Self {
            dir,
            seq: Mutex::new(0),
        };
        let state = store.load().await?;
        *store.seq.lock().await = state.last_seq;
        info!(
            dir = %store.dir.display(),
            last_seq = state.last_seq,
            open_positions = state.open_positions.len(),
            trades = state.trades.len(),
            "State store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<u64> {
        let mut seq = self.seq.lock().await;
        let next = *seq + 1;
        let line = serde_json::to_string(&Sequenced {
            seq: next,
            record,
        })?;

        let path = self.dir.join(file);
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| persistence_error("open", &path, e))?;
        handle
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| persistence_error("append", &path, e))?;
        handle
            .sync_data()
            .await
            .map_err(|e| persistence_error("sync", &path, e))?;

        *seq = next;
        debug!(file, seq = next, "Appended record");
        Ok(next)
    }

    async fn read_log<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<Sequenced<T>>> {
        let path = self.dir.join(file);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence_error("read", &path, e)),
        };

        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Sequenced<T>>(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind
                Err(e) if i + 1 == lines.len() => {
                    warn!(file, error = %e, "Ignoring incomplete trailing record");
                }
                Err(e) => return Err(persistence_error("parse", &path, e)),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PersistedState> {
        let path = self.dir.join(POSITIONS_FILE);
        let snapshot = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<PositionSnapshot>(&raw)
                .map_err(|e| persistence_error("parse", &path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PositionSnapshot::default(),
            Err(e) => return Err(persistence_error("read", &path, e)),
        };

        let trades = self.read_log::<Trade>(TRADES_FILE).await?;
        let equity = self.read_log::<EquitySnapshot>(EQUITY_FILE).await?;
        let compliance = self.read_log::<ComplianceEntry>(COMPLIANCE_FILE).await?;

        let last_seq = [
            snapshot.seq,
            trades.last().map(|r| r.seq).unwrap_or(0),
            equity.last().map(|r| r.seq).unwrap_or(0),
            compliance.last().map(|r| r.seq).unwrap_or(0),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        Ok(PersistedState {
            open_positions: snapshot.positions,
            positions_seq: snapshot.seq,
            trades,
            equity,
            last_seq,
        })
    }

    async fn save_open_positions(&self, positions: &[Position]) -> Result<u64> {
        let mut seq = self.seq.lock().await;
        let next = *seq + 1;
        let body = serde_json::to_vec_pretty(&PositionSnapshot {
            seq: next,
            positions: positions.to_vec(),
        })?;

        let path = self.dir.join(POSITIONS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", POSITIONS_FILE));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| persistence_error("create", &tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| persistence_error("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| persistence_error("sync", &tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence_error("rename", &path, e))?;

        *seq = next;
        debug!(seq = next, open_positions = positions.len(), "Saved position snapshot");
        Ok(next)
    }

    async fn append_trade(&self, trade: &Trade) -> Result<u64> {
        self.append_line(TRADES_FILE, trade).await
    }

    async fn append_equity(&self, snapshot: &EquitySnapshot) -> Result<u64> {
        self.append_line(EQUITY_FILE, snapshot).await
    }

    async fn append_compliance(&self, entry: &ComplianceEntry) -> Result<u64> {
        self.append_line(COMPLIANCE_FILE, entry).await
    }

    async fn flush(&self) -> Result<()> {
        // Every write is synced before it returns; flushing waits for in-progress writes
        let seq = self.seq.lock().await;
        debug!(seq = *seq, "State store flushed");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: PositionSnapshot,
    trades: Vec<Sequenced<Trade>>,
    equity: Vec<Sequenced<EquitySnapshot>>,
    compliance: Vec<Sequenced<ComplianceEntry>>,
    seq: u64,
    fail_writes: bool,
    fail_trade_appends: bool,
}

/// In-memory store with write-failure injection
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until reset
    pub async fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().await.fail_writes = fail;
    }

    /// Make only trade-log appends fail until reset
    pub async fn set_fail_trade_appends(&self, fail: bool) {
        self.inner.lock().await.fail_trade_appends = fail;
    }

    pub async fn compliance_entries(&self) -> Vec<ComplianceEntry> {
        self.inner
            .lock()
            .await
            .compliance
            .iter()
            .map(|r| r.record.clone())
            .collect()
    }

    fn next_seq(inner: &mut MemoryInner) -> Result<u64> {
        if inner.fail_writes {
            return Err(WardenError::Persistence("memory store: injected write failure".into()));
        }
        inner.seq += 1;
        Ok(inner.seq)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<PersistedState> {
        let inner = self.inner.lock().await;
        Ok(PersistedState {
            open_positions: inner.snapshot.positions.clone(),
            positions_seq: inner.snapshot.seq,
            trades: inner.trades.clone(),
            equity: inner.equity.clone(),
            last_seq: inner.seq,
        })
    }

    async fn save_open_positions(&self, positions: &[Position]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let seq = Self::next_seq(&mut inner)?;
        inner.snapshot = PositionSnapshot {
            seq,
            positions: positions.to_vec(),
        };
        Ok(seq)
    }

    async fn append_trade(&self, trade: &Trade) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.fail_trade_appends {
            return Err(WardenError::Persistence("memory store: injected trade log failure".into()));
        }
        let seq = Self::next_seq(&mut inner)?;
        inner.trades.push(Sequenced {
            seq,
            record: trade.clone(),
        });
        Ok(seq)
    }

    async fn append_equity(&self, snapshot: &EquitySnapshot) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let seq = Self::next_seq(&mut inner)?;
        inner.equity.push(Sequenced {
            seq,
            record: snapshot.clone(),
        });
        Ok(seq)
    }

    async fn append_compliance(&self, entry: &ComplianceEntry) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let seq = Self::next_seq(&mut inner)?;
        inner.compliance.push(Sequenced {
            seq,
            record: entry.clone(),
        });
        Ok(seq)
    }

    async fn flush(&self) -> Result<()> {
        if self.inner.lock().await.fail_writes {
            return Err(WardenError::Persistence("memory store: injected flush failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ClientRequestId, Direction, ExitPlan, ExitReason, Fill, PositionStatus, SignalProvenance,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        let id = PositionId::new();
        let plan = ExitPlan {
            stop_distance: dec!(50),
            target_distance: dec!(100),
            early_failure_distance: dec!(20),
            early_failure_window_secs: 1800,
            time_limit_secs: 10800,
        };
        Position {
            id,
            symbol: "ETHUSDT".into(),
            direction: Direction::Long,
            entry_price: dec!(1000),
            size: dec!(2),
            leverage: dec!(5),
            margin: dec!(400),
            stop_price: dec!(950),
            target_price: dec!(1100),
            exit_plan: plan,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            open_request_id: ClientRequestId::for_open(id),
            close_generation: 0,
            provenance: SignalProvenance {
                model_id: "m".into(),
                feature_snapshot_ref: "f".into(),
                confidence: dec!(0.8),
                generated_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let open = position();
        let closed = position();

        {
            let store = FileStateStore::open(dir.path()).await.unwrap();
            store
                .save_open_positions(&[open.clone(), closed.clone()])
                .await
                .unwrap();
            let trade = Trade::from_close(
                &closed,
                Fill {
                    price: dec!(1100),
                    size: dec!(2),
                },
                ExitReason::Target,
                Utc::now(),
            );
            store.append_trade(&trade).await.unwrap();
            store
                .append_equity(&EquitySnapshot {
                    timestamp: Utc::now(),
                    equity: dec!(10200),
                    open_margin_used: dec!(400),
                })
                .await
                .unwrap();
        }

        let store = FileStateStore::open(dir.path()).await.unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.last_seq, 3);
        assert_eq!(state.open_positions.len(), 2);
        // The closed position is superseded by its trade
        assert_eq!(state.live_positions(), vec![open]);
        assert_eq!(state.last_equity().unwrap().equity, dec!(10200));

        // Sequence continues after reopen
        let seq = store.save_open_positions(&[]).await.unwrap();
        assert_eq!(seq, 4);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_position_live() {
        let store = MemoryStateStore::new();
        let mut open = position();
        let partial = Trade::from_close(
            &open,
            Fill {
                price: dec!(940),
                size: dec!(0.5),
            },
            ExitReason::Stop,
            Utc::now(),
        );
        assert!(!partial.is_final());
        assert_eq!(partial.remaining_size(), dec!(1.5));
        store.append_trade(&partial).await.unwrap();
        open.size = dec!(1.5);
        store.save_open_positions(&[open.clone()]).await.unwrap();

        let state = store.load().await.unwrap();
        assert!(state.closed_position_ids().is_empty());
        assert_eq!(state.live_positions(), vec![open.clone()]);

        let rest = Trade::from_close(
            &open,
            Fill {
                price: dec!(930),
                size: dec!(1.5),
            },
            ExitReason::Stop,
            Utc::now(),
        );
        assert!(rest.is_final());
        store.append_trade(&rest).await.unwrap();
        assert!(store.load().await.unwrap().live_positions().is_empty());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        store
            .append_equity(&EquitySnapshot {
                timestamp: Utc::now(),
                equity: dec!(10000),
                open_margin_used: dec!(0),
            })
            .await
            .unwrap();
        drop(store);

        let path = dir.path().join(EQUITY_FILE);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"seq\":2,\"timest");
        std::fs::write(&path, raw).unwrap();

        let store = FileStateStore::open(dir.path()).await.unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.equity.len(), 1);
        assert_eq!(state.last_seq, 1);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let store = MemoryStateStore::new();
        store.save_open_positions(&[position()]).await.unwrap();
        store.set_fail_writes(true).await;
        assert!(matches!(
            store.save_open_positions(&[]).await,
            Err(WardenError::Persistence(_))
        ));
        // Failed write left the previous snapshot intact
        assert_eq!(store.load().await.unwrap().open_positions.len(), 1);
    }
}
