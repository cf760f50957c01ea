use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::OutboxEvent;
use uuid::Uuid;

use super::{InventoryStore, ProcessedCommand};
use crate::error::LedgerError;
use crate::ledger::{
    self, Decision, HistoryEntry, InventoryRecord, Mutation, MutationOutcome, Reservation,
    ReservationStatus, Snapshot,
};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

/// PostgreSQL store. Mutations lock the product's inventory row with
/// `SELECT ... FOR UPDATE` for the length of one transaction.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn create(&self, record: InventoryRecord) -> Result<InventoryRecord, LedgerError> {
        let mut conn = self.pool.get().await?;
        let product_id = record.product_id;

        let inserted = diesel::insert_into(inventory::table)
            .values(&Inventory::from(record.clone()))
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(LedgerError::Conflict(format!(
                "inventory for product {} already exists",
                product_id
            )));
        }
        Ok(record)
    }

    async fn get(&self, product_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let row = inventory::table
            .find(product_id)
            .first::<Inventory>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(InventoryRecord::from))
    }

    async fn history(&self, product_id: Uuid, limit: i64) -> Result<Vec<HistoryEntry>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let exists = inventory::table
            .find(product_id)
            .select(inventory::product_id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        if exists.is_none() {
            return Err(LedgerError::NotFound(product_id));
        }

        let rows = inventory_history::table
            .filter(inventory_history::product_id.eq(product_id))
            .order(inventory_history::created_at.desc())
            .limit(limit)
            .load::<InventoryHistory>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(HistoryEntry::from).collect())
    }

    async fn mutate(&self, product_id: Uuid, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let record = inventory::table
                    .find(product_id)
                    .for_update()
                    .first::<Inventory>(conn)
                    .await
                    .optional()?
                    .map(InventoryRecord::from)
                    .ok_or(LedgerError::NotFound(product_id))?;

                let prior = match mutation.idempotency_key() {
                    Some(key) => inventory_history::table
                        .filter(inventory_history::product_id.eq(product_id))
                        .filter(inventory_history::adjustment_id.eq(key))
                        .first::<InventoryHistory>(conn)
                        .await
                        .optional()?
                        .map(HistoryEntry::from),
                    None => None,
                };

                let reservation = match mutation.order_id() {
                    Some(order_id) => reservations::table
                        .filter(reservations::product_id.eq(product_id))
                        .filter(reservations::order_id.eq(order_id))
                        .for_update()
                        .first::<DbReservation>(conn)
                        .await
                        .optional()?
                        .map(Reservation::try_from)
                        .transpose()?,
                    None => None,
                };

                let snapshot = Snapshot {
                    record: &record,
                    prior: prior.as_ref(),
                    reservation: reservation.as_ref(),
                    now: Utc::now(),
                };

                let commit = match ledger::decide(snapshot, &mutation)? {
                    Decision::Replay(outcome) => return Ok(outcome),
                    Decision::Commit(commit) => *commit,
                };

                diesel::update(inventory::table.find(product_id))
                    .set(&Inventory::from(commit.record))
                    .execute(conn)
                    .await?;

                diesel::insert_into(inventory_history::table)
                    .values(&InventoryHistory::from(commit.history))
                    .execute(conn)
                    .await?;

                if let Some(reservation) = commit.reservation {
                    let row = DbReservation::from(reservation);
                    diesel::insert_into(reservations::table)
                        .values(&row)
                        .on_conflict(reservations::id)
                        .do_update()
                        .set(&row)
                        .execute(conn)
                        .await?;
                }

                for event in &commit.events {
                    diesel::insert_into(outbox_events::table)
                        .values(&DbOutboxEvent::from(OutboxEvent::from_event(event)?))
                        .execute(conn)
                        .await?;
                }

                Ok(commit.outcome)
            })
        })
        .await
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let rows = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .load::<DbReservation>(&mut conn)
            .await?;

        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_event_processed(&self, event_id: Uuid) -> Result<(), LedgerError> {
        let mut conn = self.pool.get().await?;

        diesel::update(outbox_events::table.filter(outbox_events::id.eq(event_id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn processed_command(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ProcessedCommand>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let row = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(idempotency_key))
            .first::<DbProcessedCommand>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(ProcessedCommand::from))
    }

    async fn record_processed_command(&self, command: ProcessedCommand) -> Result<(), LedgerError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(processed_commands::table)
            .values(&DbProcessedCommand::from(command))
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}
