use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{ClientRequestId, Order};
use crate::error::{Result, WardenError};
use crate::exchange::OrderState;

/// Lifecycle of one client request id inside this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// A task is currently talking to the exchange under this id
    InFlight,
    Completed(OrderState),
    Failed(String),
    /// The task gave up without a confirmed outcome
    Unknown,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency registry for exchange requests
///
/// Client request ids are derived from the logical intent (open position P,
/// close position P generation N), so a retry naturally reuses the same id.
/// This registry adds two local guarantees on top of the exchange's own
/// deduplication:
/// 1. at most one task submits under a given id at any time
/// 2. an id is never reused for an order with different parameters
///
/// # Example
/// ```rust,ignore
/// let guard = registry.begin(&order)?;
/// let state = exchange.submit(&order).await?;
/// guard.complete(state);
/// ```
#[derive(Debug, Default)]
pub struct IdempotencyManager {
    records: DashMap<ClientRequestId, IdempotencyRecord>,
}

impl IdempotencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic hash of the order parameters that define the intent
    pub fn hash_request(order: &Order) -> String {
        let mut hasher = Sha256::new();
        hasher.update(order.symbol.as_bytes());
        hasher.update(order.side.to_string().as_bytes());
        hasher.update(order.size.normalize().to_string().as_bytes());
        hasher.update(order.leverage.normalize().to_string().as_bytes());
        hasher.update([order.reduce_only as u8]);
        if let Some(link) = &order.linked_request {
            hasher.update(link.as_str().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Claim the order's client request id for the calling task
    pub fn begin(&self, order: &Order) -> Result<InFlightGuard<'_>> {
        let fingerprint = Self::hash_request(order);
        let id = order.client_request_id.clone();
        let now = Utc::now();

        match self.records.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.fingerprint != fingerprint {
                    warn!(
                        client_request_id = %id,
                        "Client request id reused with different order parameters"
                    );
                    return Err(WardenError::DuplicateRequest(format!(
                        "{} reused with different parameters",
                        id
                    )));
                }
                if record.status == RequestStatus::InFlight {
                    return Err(WardenError::DuplicateRequest(format!(
                        "{} already in flight",
                        id
                    )));
                }
                debug!(client_request_id = %id, previous = ?record.status, "Resuming request");
                record.status = RequestStatus::InFlight;
                record.updated_at = now;
            }
            Entry::Vacant(entry) => {
                debug!(client_request_id = %id, "New client request id");
                entry.insert(IdempotencyRecord {
                    fingerprint,
                    status: RequestStatus::InFlight,
                    created_at: now,
                    updated_at: now,
                });
            }
        }

        Ok(InFlightGuard {
            manager: self,
            id,
            finished: false,
        })
    }

    pub fn status(&self, id: &ClientRequestId) -> Option<RequestStatus> {
        self.records.get(id).map(|r| r.status.clone())
    }

    /// Number of requests currently talking to the exchange
    pub fn in_flight_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == RequestStatus::InFlight)
            .count()
    }

    /// Number of ids this registry still remembers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop the records of ids whose intent is finished for good. An id still
    /// in flight is kept; its guard settles it later.
    pub fn forget<'a>(&self, ids: impl IntoIterator<Item = &'a ClientRequestId>) -> usize {
        let mut removed = 0;
        for id in ids {
            if self
                .records
                .remove_if(id, |_, r| r.status != RequestStatus::InFlight)
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Released settled request ids");
        }
        removed
    }

    fn settle(&self, id: &ClientRequestId, status: RequestStatus) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }
}

/// Exclusive claim on a client request id; releases it when dropped
pub struct InFlightGuard<'a> {
    manager: &'a IdempotencyManager,
    id: ClientRequestId,
    finished: bool,
}

impl InFlightGuard<'_> {
    pub fn id(&self) -> &ClientRequestId {
        &self.id
    }

    pub fn complete(mut self, state: OrderState) {
        self.finished = true;
        self.manager.settle(&self.id, RequestStatus::Completed(state));
    }

    pub fn fail(mut self, reason: impl Into<String>) {
        self.finished = true;
        self.manager.settle(&self.id, RequestStatus::Failed(reason.into()));
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.settle(&self.id, RequestStatus::Unknown);
        }
    }
}
