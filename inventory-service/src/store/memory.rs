use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::OutboxEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InventoryStore, ProcessedCommand};
use crate::error::LedgerError;
use crate::ledger::{
    self, Decision, HistoryEntry, InventoryRecord, Mutation, MutationOutcome, Reservation,
    Snapshot,
};

struct ProductEntry {
    record: InventoryRecord,
    history: Vec<HistoryEntry>,
    reservations: HashMap<Uuid, Reservation>,
}

/// Process-local store with one async mutex per product.
#[derive(Default)]
pub struct MemoryStore {
    products: DashMap<Uuid, Arc<Mutex<ProductEntry>>>,
    /// Unpublished events only, oldest first.
    outbox: Mutex<Vec<OutboxEvent>>,
    processed: DashMap<String, ProcessedCommand>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, product_id: Uuid) -> Option<Arc<Mutex<ProductEntry>>> {
        self.products.get(&product_id).map(|e| Arc::clone(e.value()))
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn create(&self, record: InventoryRecord) -> Result<InventoryRecord, LedgerError> {
        match self.products.entry(record.product_id) {
            Entry::Occupied(_) => Err(LedgerError::Conflict(format!(
                "inventory for product {} already exists",
                record.product_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(ProductEntry {
                    record: record.clone(),
                    history: Vec::new(),
                    reservations: HashMap::new(),
                })));
                Ok(record)
            }
        }
    }

    async fn get(&self, product_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError> {
        match self.entry(product_id) {
            Some(entry) => Ok(Some(entry.lock().await.record.clone())),
            None => Ok(None),
        }
    }

    async fn history(&self, product_id: Uuid, limit: i64) -> Result<Vec<HistoryEntry>, LedgerError> {
        let entry = self.entry(product_id).ok_or(LedgerError::NotFound(product_id))?;
        let product = entry.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(product.history.iter().rev().take(limit).cloned().collect())
    }

    async fn mutate(&self, product_id: Uuid, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let entry = self.entry(product_id).ok_or(LedgerError::NotFound(product_id))?;
        let mut product = entry.lock().await;

        let decision = {
            let current: &ProductEntry = &product;
            let prior = mutation.idempotency_key().and_then(|key| {
                current
                    .history
                    .iter()
                    .rev()
                    .find(|h| h.adjustment_id.as_deref() == Some(key))
            });
            let reservation = mutation
                .order_id()
                .and_then(|order_id| current.reservations.get(&order_id));
            let snapshot = Snapshot {
                record: &current.record,
                prior,
                reservation,
                now: Utc::now(),
            };
            ledger::decide(snapshot, &mutation)?
        };

        match decision {
            Decision::Replay(outcome) => Ok(outcome),
            Decision::Commit(commit) => {
                let commit = *commit;
                let events = commit
                    .events
                    .iter()
                    .map(OutboxEvent::from_event)
                    .collect::<Result<Vec<_>, _>>()?;

                product.record = commit.record;
                product.history.push(commit.history);
                if let Some(reservation) = commit.reservation {
                    product.reservations.insert(reservation.order_id, reservation);
                }
                self.outbox.lock().await.extend(events);

                Ok(commit.outcome)
            }
        }
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let entries: Vec<_> = self.products.iter().map(|e| Arc::clone(e.value())).collect();

        let mut expired = Vec::new();
        for entry in entries {
            let product = entry.lock().await;
            expired.extend(
                product
                    .reservations
                    .values()
                    .filter(|r| r.is_active() && r.expires_at.is_some_and(|at| at <= now))
                    .cloned(),
            );
        }

        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired)
    }

    async fn pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, LedgerError> {
        let outbox = self.outbox.lock().await;
        Ok(outbox
            .iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_event_processed(&self, event_id: Uuid) -> Result<(), LedgerError> {
        self.outbox.lock().await.retain(|e| e.id != event_id);
        Ok(())
    }

    async fn processed_command(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ProcessedCommand>, LedgerError> {
        Ok(self.processed.get(idempotency_key).map(|c| c.value().clone()))
    }

    async fn record_processed_command(&self, command: ProcessedCommand) -> Result<(), LedgerError> {
        self.processed
            .entry(command.idempotency_key.clone())
            .or_insert(command);
        Ok(())
    }
}
