use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    CreateInventory,
    ReserveInventory,
    CompensateInventory,
    CommitInventory,
    AdjustInventory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub saga_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
    Compensated,
}

/// Payload of `ReserveInventory`, `CompensateInventory` and `CommitInventory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryData {
    pub product_id: Uuid,
    pub quantity: i32,
    pub order_id: Uuid,
}

/// Payload of `CreateInventory`, sent by the catalog when a product is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInventoryData {
    pub product_id: Uuid,
    #[serde(flatten)]
    pub policy: InventoryPolicy,
}

/// Payload of `AdjustInventory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustInventoryData {
    pub product_id: Uuid,
    #[serde(flatten)]
    pub request: AdjustInventoryRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryPolicy {
    #[serde(default)]
    pub backorder_allowed: Option<bool>,
    #[serde(default)]
    pub reorder_threshold: Option<i32>,
}

/// Body of `PATCH /products/{product_id}/inventory`.
///
/// Numeric fields are wide so that negative or out-of-range values reach
/// validation instead of failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdjustInventoryRequest {
    pub stock: i64,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub adjustment_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cost_per_unit: Option<BigDecimal>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reserved: Option<i64>,
    #[serde(default)]
    pub backorder_allowed: Option<bool>,
    #[serde(default)]
    pub reorder_threshold: Option<i64>,
    #[serde(default)]
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentMetadata {
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub cost_per_unit: Option<BigDecimal>,
    pub batch_number: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub adjustment_id: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentResponse {
    pub id: Uuid,
    pub stock: i32,
    pub available: i32,
    pub reserved: i32,
    pub previous_stock: i32,
    pub adjustment: i32,
    pub operation: String,
    pub updated_at: DateTime<Utc>,
    pub inventory_history_id: Uuid,
    pub metadata: AdjustmentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub id: Uuid,
    pub stock: i32,
    pub reserved: i32,
    pub available: i32,
    pub reorder_threshold: Option<i32>,
    pub backorder_allowed: bool,
    pub last_adjustment_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /products/{product_id}/inventory/reservations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub order_id: Uuid,
    pub quantity: i64,
    #[serde(default)]
    pub expiration_minutes: Option<i64>,
}

/// Body of the release and commit endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderQuantityRequest {
    pub order_id: Uuid,
    pub quantity: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationView {
    pub id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub backordered: i32,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub inventory: InventoryResponse,
    pub reservation: Option<ReservationView>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleResponse {
    pub inventory: InventoryResponse,
    pub sold: i32,
    pub backordered: i32,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntryResponse {
    pub id: Uuid,
    pub operation: String,
    pub quantity: i32,
    pub previous_stock: i32,
    pub new_stock: i32,
    pub previous_reserved: i32,
    pub new_reserved: i32,
    pub adjustment_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Signals raised by the ledger for external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InventoryEvent {
    LowStock {
        product_id: Uuid,
        stock: i32,
        reorder_threshold: i32,
    },
    Backordered {
        product_id: Uuid,
        order_id: Uuid,
        quantity: i32,
    },
}

impl InventoryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::LowStock { .. } => "LowStock",
            InventoryEvent::Backordered { .. } => "Backordered",
        }
    }

    pub fn product_id(&self) -> Uuid {
        match self {
            InventoryEvent::LowStock { product_id, .. } => *product_id,
            InventoryEvent::Backordered { product_id, .. } => *product_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl OutboxEvent {
    pub fn from_event(event: &InventoryEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: event.product_id(),
            event_type: event.event_type().to_string(),
            event_data: serde_json::to_value(event)?,
            processed: false,
            created_at: Utc::now(),
        })
    }
}

impl Command {
    pub fn new(saga_id: Uuid, command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_id,
            command_type,
            payload,
            idempotency_key: format!("{}_{}", saga_id, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, saga_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, saga_id: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_request_defaults_optional_fields() {
        let request: AdjustInventoryRequest =
            serde_json::from_value(serde_json::json!({ "stock": 12 })).unwrap();
        assert_eq!(request.stock, 12);
        assert!(request.operation.is_none());
        assert!(request.adjustment_id.is_none());
    }

    #[test]
    fn inventory_event_is_tagged_by_type() {
        let event = InventoryEvent::LowStock {
            product_id: Uuid::nil(),
            stock: 3,
            reorder_threshold: 5,
        };
        let outbox = OutboxEvent::from_event(&event).unwrap();
        assert_eq!(outbox.event_type, "LowStock");
        assert_eq!(outbox.event_data["type"], "LowStock");
        assert_eq!(outbox.aggregate_id, Uuid::nil());
    }

    #[test]
    fn adjust_command_payload_flattens_request() {
        let payload = serde_json::json!({
            "product_id": Uuid::nil(),
            "stock": 4,
            "operation": "increment",
            "adjustment_id": "adj-1"
        });
        let data: AdjustInventoryData = serde_json::from_value(payload).unwrap();
        assert_eq!(data.request.stock, 4);
        assert_eq!(data.request.operation.as_deref(), Some("increment"));
        assert_eq!(data.request.adjustment_id.as_deref(), Some("adj-1"));
    }
}
