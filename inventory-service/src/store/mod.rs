mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::OutboxEvent;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{HistoryEntry, InventoryRecord, Mutation, MutationOutcome, Reservation};

/// Persistence for the ledger.
///
/// `mutate` must run the ledger rules and write their result while holding
/// exclusive access to the one product; different products must not block
/// each other.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn create(&self, record: InventoryRecord) -> Result<InventoryRecord, LedgerError>;

    async fn get(&self, product_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError>;

    /// Newest first.
    async fn history(&self, product_id: Uuid, limit: i64) -> Result<Vec<HistoryEntry>, LedgerError>;

    async fn mutate(&self, product_id: Uuid, mutation: Mutation) -> Result<MutationOutcome, LedgerError>;

    /// Active reservations whose expiry is at or before `now`, oldest expiry first.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, LedgerError>;

    /// Unprocessed outbox events in creation order.
    async fn pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, LedgerError>;

    async fn mark_event_processed(&self, event_id: Uuid) -> Result<(), LedgerError>;

    /// Stored result of a command that was already handled, if any.
    async fn processed_command(&self, idempotency_key: &str)
        -> Result<Option<ProcessedCommand>, LedgerError>;

    async fn record_processed_command(&self, command: ProcessedCommand) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}
