use chrono::{Duration, Utc};
use shared::{
    AdjustInventoryRequest, AdjustmentResponse, InventoryPolicy, OrderQuantityRequest,
    ReserveRequest,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{
    positive, AdjustmentRequest, HistoryEntry, InventoryRecord, Mutation, MutationOutcome,
    ReleaseCommand, ReserveCommand, SaleCommand,
};
use crate::store::InventoryStore;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 500;

/// Entry point shared by the HTTP API, the command handler and the sweeper.
#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
    reservation_ttl: Duration,
}

impl InventoryService {
    pub fn new(store: Arc<dyn InventoryStore>, reservation_ttl: Duration) -> Self {
        Self {
            store,
            reservation_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    #[instrument(skip(self, policy))]
    pub async fn create(&self, product_id: Uuid, policy: InventoryPolicy) -> Result<InventoryRecord, LedgerError> {
        let record = InventoryRecord::new(product_id, &policy, Utc::now())?;
        let record = self.store.create(record).await?;
        info!("Created inventory record for product {}", product_id);
        Ok(record)
    }

    pub async fn get(&self, product_id: Uuid) -> Result<InventoryRecord, LedgerError> {
        self.store
            .get(product_id)
            .await?
            .ok_or(LedgerError::NotFound(product_id))
    }

    pub async fn history(&self, product_id: Uuid, limit: Option<i64>) -> Result<Vec<HistoryEntry>, LedgerError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        self.store.history(product_id, limit).await
    }

    #[instrument(skip(self, request), fields(adjustment_id = ?request.adjustment_id))]
    pub async fn apply_adjustment(
        &self,
        product_id: Uuid,
        request: AdjustInventoryRequest,
        actor: String,
    ) -> Result<AdjustmentResponse, LedgerError> {
        let request = AdjustmentRequest::from_wire(request, actor)?;
        let operation = request.operation;

        let outcome = self.run(product_id, Mutation::Adjust(request)).await?;
        let response = outcome.adjustment.ok_or_else(|| {
            LedgerError::Internal("adjustment produced no response".to_string())
        })?;

        if outcome.replayed {
            info!("Replayed adjustment for product {}", product_id);
        } else {
            info!(
                "Applied {} to product {}: stock {} -> {}",
                operation, product_id, response.previous_stock, response.stock
            );
        }
        Ok(response)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn reserve(
        &self,
        product_id: Uuid,
        request: ReserveRequest,
        actor: String,
    ) -> Result<MutationOutcome, LedgerError> {
        let quantity = positive("quantity", request.quantity)?;
        let ttl = match request.expiration_minutes {
            Some(minutes) => Duration::minutes(i64::from(positive("expiration_minutes", minutes)?)),
            None => self.reservation_ttl,
        };

        let outcome = self
            .run(
                product_id,
                Mutation::Reserve(ReserveCommand {
                    order_id: request.order_id,
                    quantity,
                    expires_at: Some(Utc::now() + ttl),
                    actor,
                }),
            )
            .await?;

        if outcome.backordered > 0 {
            warn!(
                "Order {} backordered {} units of product {}",
                request.order_id, outcome.backordered, product_id
            );
        }
        Ok(outcome)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn release(
        &self,
        product_id: Uuid,
        request: OrderQuantityRequest,
        actor: String,
    ) -> Result<MutationOutcome, LedgerError> {
        let quantity = positive("quantity", request.quantity)?;
        self.run(
            product_id,
            Mutation::Release(ReleaseCommand {
                order_id: request.order_id,
                quantity,
                reason: request.reason,
                actor,
            }),
        )
        .await
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn commit_sale(
        &self,
        product_id: Uuid,
        request: OrderQuantityRequest,
        actor: String,
    ) -> Result<MutationOutcome, LedgerError> {
        let quantity = positive("quantity", request.quantity)?;
        self.run(
            product_id,
            Mutation::CommitSale(SaleCommand {
                order_id: request.order_id,
                quantity,
                reason: request.reason,
                actor,
            }),
        )
        .await
    }

    /// Releases a reservation the sweeper found expired; it may hold zero units.
    pub async fn expire(&self, product_id: Uuid, order_id: Uuid, quantity: i32) -> Result<MutationOutcome, LedgerError> {
        self.run(
            product_id,
            Mutation::Release(ReleaseCommand {
                order_id,
                quantity,
                reason: Some("reservation expired".to_string()),
                actor: "reservation-sweeper".to_string(),
            }),
        )
        .await
    }

    async fn run(&self, product_id: Uuid, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
        let name = mutation.name();
        match self.store.mutate(product_id, mutation).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_internal() => Err(e),
            Err(e) => {
                info!("Rejected {} on product {}: {}", name, product_id, e);
                Err(e)
            }
        }
    }
}
