use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::OutboxEvent;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{HistoryEntry, InventoryRecord, Reservation};
use crate::store::ProcessedCommand;

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(primary_key(product_id))]
#[diesel(treat_none_as_null = true)]
pub struct Inventory {
    pub product_id: Uuid,
    pub stock: i32,
    pub reserved: i32,
    pub reorder_threshold: Option<i32>,
    pub backorder_allowed: bool,
    pub last_adjustment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::inventory_history)]
pub struct InventoryHistory {
    pub id: Uuid,
    pub product_id: Uuid,
    pub operation: String,
    pub quantity: i32,
    pub previous_stock: i32,
    pub new_stock: i32,
    pub previous_reserved: i32,
    pub new_reserved: i32,
    pub adjustment_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub requested_reserved: Option<i32>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub actor: String,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
#[diesel(treat_none_as_null = true)]
pub struct DbReservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub backordered: i32,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct DbProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<InventoryRecord> for Inventory {
    fn from(record: InventoryRecord) -> Self {
        Self {
            product_id: record.product_id,
            stock: record.stock,
            reserved: record.reserved,
            reorder_threshold: record.reorder_threshold,
            backorder_allowed: record.backorder_allowed,
            last_adjustment_id: record.last_adjustment_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl From<Inventory> for InventoryRecord {
    fn from(row: Inventory) -> Self {
        Self {
            product_id: row.product_id,
            stock: row.stock,
            reserved: row.reserved,
            reorder_threshold: row.reorder_threshold,
            backorder_allowed: row.backorder_allowed,
            last_adjustment_id: row.last_adjustment_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<HistoryEntry> for InventoryHistory {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            id: entry.id,
            product_id: entry.product_id,
            operation: entry.operation,
            quantity: entry.quantity,
            previous_stock: entry.previous_stock,
            new_stock: entry.new_stock,
            previous_reserved: entry.previous_reserved,
            new_reserved: entry.new_reserved,
            adjustment_id: entry.adjustment_id,
            order_id: entry.order_id,
            requested_reserved: entry.requested_reserved,
            reason: entry.reason,
            notes: entry.notes,
            actor: entry.actor,
            response: entry.response,
            created_at: entry.created_at,
        }
    }
}

impl From<InventoryHistory> for HistoryEntry {
    fn from(row: InventoryHistory) -> Self {
        Self {
            id: row.id,
            product_id: row.product_id,
            operation: row.operation,
            quantity: row.quantity,
            previous_stock: row.previous_stock,
            new_stock: row.new_stock,
            previous_reserved: row.previous_reserved,
            new_reserved: row.new_reserved,
            adjustment_id: row.adjustment_id,
            order_id: row.order_id,
            requested_reserved: row.requested_reserved,
            reason: row.reason,
            notes: row.notes,
            actor: row.actor,
            response: row.response,
            created_at: row.created_at,
        }
    }
}

impl From<Reservation> for DbReservation {
    fn from(reservation: Reservation) -> Self {
        Self {
            id: reservation.id,
            product_id: reservation.product_id,
            order_id: reservation.order_id,
            quantity: reservation.quantity,
            backordered: reservation.backordered,
            status: reservation.status.as_str().to_string(),
            expires_at: reservation.expires_at,
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = LedgerError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            order_id: row.order_id,
            quantity: row.quantity,
            backordered: row.backordered,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            event_data: event.event_data,
            processed: Some(event.processed),
            created_at: Some(event.created_at),
        }
    }
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_data: row.event_data,
            processed: row.processed.unwrap_or(false),
            created_at: row.created_at.unwrap_or_else(Utc::now),
        }
    }
}

impl From<ProcessedCommand> for DbProcessedCommand {
    fn from(command: ProcessedCommand) -> Self {
        Self {
            idempotency_key: command.idempotency_key,
            command_id: command.command_id,
            result: command.result,
            error: command.error,
            processed_at: Some(command.processed_at),
        }
    }
}

impl From<DbProcessedCommand> for ProcessedCommand {
    fn from(row: DbProcessedCommand) -> Self {
        Self {
            idempotency_key: row.idempotency_key,
            command_id: row.command_id,
            result: row.result,
            error: row.error,
            processed_at: row.processed_at.unwrap_or_else(Utc::now),
        }
    }
}
