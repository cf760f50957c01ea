//! Inventory ledger rules.
//!
//! Every operation is a pure decision over a snapshot of one product: the
//! current record, the history entry previously written under the request's
//! idempotency key and the order's reservation. A decision is either a replay
//! of an earlier result or a [`Commit`] that a store persists as one unit
//! inside its per-product critical section.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    AdjustInventoryRequest, AdjustmentMetadata, AdjustmentResponse, HistoryEntryResponse,
    InventoryEvent, InventoryPolicy, InventoryResponse, ReservationView,
};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

pub const DEFAULT_ACTOR: &str = "anonymous";

const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentOperation {
    Set,
    Increment,
    Decrement,
}

impl AdjustmentOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentOperation::Set => "set",
            AdjustmentOperation::Increment => "increment",
            AdjustmentOperation::Decrement => "decrement",
        }
    }
}

impl fmt::Display for AdjustmentOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdjustmentOperation {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "set" => Ok(AdjustmentOperation::Set),
            "increment" => Ok(AdjustmentOperation::Increment),
            "decrement" => Ok(AdjustmentOperation::Decrement),
            other => Err(LedgerError::InvalidArgument(format!(
                "unknown operation '{}', expected set, increment or decrement",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub product_id: Uuid,
    pub stock: i32,
    pub reserved: i32,
    pub reorder_threshold: Option<i32>,
    pub backorder_allowed: bool,
    pub last_adjustment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    /// The implicit zero-stock record of a newly created product.
    pub fn new(product_id: Uuid, policy: &InventoryPolicy, now: DateTime<Utc>) -> Result<Self, LedgerError> {
        let reorder_threshold = policy
            .reorder_threshold
            .map(|t| non_negative("reorder_threshold", i64::from(t)))
            .transpose()?;

        Ok(Self {
            product_id,
            stock: 0,
            reserved: 0,
            reorder_threshold,
            backorder_allowed: policy.backorder_allowed.unwrap_or(false),
            last_adjustment_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn available(&self) -> i32 {
        self.stock - self.reserved
    }

    fn low_stock_event(&self) -> Option<InventoryEvent> {
        match self.reorder_threshold {
            Some(threshold) if self.stock <= threshold => Some(InventoryEvent::LowStock {
                product_id: self.product_id,
                stock: self.stock,
                reorder_threshold: threshold,
            }),
            _ => None,
        }
    }

    pub fn to_response(&self) -> InventoryResponse {
        InventoryResponse {
            id: self.product_id,
            stock: self.stock,
            reserved: self.reserved,
            available: self.available(),
            reorder_threshold: self.reorder_threshold,
            backorder_allowed: self.backorder_allowed,
            last_adjustment_id: self.last_adjustment_id.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// A validated `PATCH /products/{id}/inventory` request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRequest {
    pub operation: AdjustmentOperation,
    pub quantity: i32,
    pub idempotency_key: Option<String>,
    pub reserved: Option<i32>,
    pub backorder_allowed: Option<bool>,
    pub reorder_threshold: Option<i32>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub cost_per_unit: Option<BigDecimal>,
    pub expires_at: Option<DateTime<Utc>>,
    pub batch_number: Option<String>,
    pub actor: String,
}

impl AdjustmentRequest {
    #[cfg(test)]
    pub fn new(operation: AdjustmentOperation, quantity: i32) -> Self {
        Self {
            operation,
            quantity,
            idempotency_key: None,
            reserved: None,
            backorder_allowed: None,
            reorder_threshold: None,
            reason: None,
            notes: None,
            location: None,
            cost_per_unit: None,
            expires_at: None,
            batch_number: None,
            actor: DEFAULT_ACTOR.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    pub fn from_wire(request: AdjustInventoryRequest, actor: String) -> Result<Self, LedgerError> {
        let operation = match request.operation.as_deref() {
            None => AdjustmentOperation::Set,
            Some(op) => op.parse()?,
        };
        let quantity = non_negative("stock", request.stock)?;
        let reserved = request
            .reserved
            .map(|r| non_negative("reserved", r))
            .transpose()?;
        let reorder_threshold = request
            .reorder_threshold
            .map(|t| non_negative("reorder_threshold", t))
            .transpose()?;

        let idempotency_key = match request.adjustment_id {
            Some(key) if key.trim().is_empty() => {
                return Err(LedgerError::InvalidArgument(
                    "adjustment_id must not be blank".to_string(),
                ))
            }
            Some(key) if key.len() > MAX_KEY_LEN => {
                return Err(LedgerError::InvalidArgument(format!(
                    "adjustment_id must be at most {} bytes",
                    MAX_KEY_LEN
                )))
            }
            other => other,
        };

        Ok(Self {
            operation,
            quantity,
            idempotency_key,
            reserved,
            backorder_allowed: request.backorder_allowed,
            reorder_threshold,
            reason: request.reason,
            notes: request.notes,
            location: request.location,
            cost_per_unit: request.cost_per_unit,
            expires_at: request.expires_at,
            batch_number: request.batch_number,
            actor,
        })
    }

    fn matches(&self, prior: &HistoryEntry) -> bool {
        prior.operation == self.operation.as_str()
            && prior.quantity == self.quantity
            && prior.requested_reserved == self.reserved
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReserveCommand {
    pub order_id: Uuid,
    pub quantity: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseCommand {
    pub order_id: Uuid,
    pub quantity: i32,
    pub reason: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleCommand {
    pub order_id: Uuid,
    pub quantity: i32,
    pub reason: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Adjust(AdjustmentRequest),
    Reserve(ReserveCommand),
    Release(ReleaseCommand),
    CommitSale(SaleCommand),
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Adjust(req) => req.operation.as_str(),
            Mutation::Reserve(_) => "reserve",
            Mutation::Release(_) => "release",
            Mutation::CommitSale(_) => "commit_sale",
        }
    }

    /// Key under which a store must look up the prior history entry.
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            Mutation::Adjust(req) => req.idempotency_key.as_deref(),
            _ => None,
        }
    }

    /// Order whose reservation a store must load.
    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            Mutation::Adjust(_) => None,
            Mutation::Reserve(cmd) => Some(cmd.order_id),
            Mutation::Release(cmd) => Some(cmd.order_id),
            Mutation::CommitSale(cmd) => Some(cmd.order_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
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

impl HistoryEntry {
    fn between(
        before: &InventoryRecord,
        after: &InventoryRecord,
        operation: &str,
        quantity: i32,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: after.product_id,
            operation: operation.to_string(),
            quantity,
            previous_stock: before.stock,
            new_stock: after.stock,
            previous_reserved: before.reserved,
            new_reserved: after.reserved,
            adjustment_id: None,
            order_id: None,
            requested_reserved: None,
            reason: None,
            notes: None,
            actor: actor.to_string(),
            response: None,
            created_at: now,
        }
    }

    pub fn to_response(&self) -> HistoryEntryResponse {
        HistoryEntryResponse {
            id: self.id,
            operation: self.operation.clone(),
            quantity: self.quantity,
            previous_stock: self.previous_stock,
            new_stock: self.new_stock,
            previous_reserved: self.previous_reserved,
            new_reserved: self.new_reserved,
            adjustment_id: self.adjustment_id.clone(),
            order_id: self.order_id,
            reason: self.reason.clone(),
            notes: self.notes.clone(),
            actor: self.actor.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Released,
    Committed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Released => "released",
            ReservationStatus::Committed => "committed",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "released" => Ok(ReservationStatus::Released),
            "committed" => Ok(ReservationStatus::Committed),
            other => Err(LedgerError::Internal(format!(
                "unknown reservation status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub backordered: i32,
    pub status: ReservationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    pub fn to_view(&self) -> ReservationView {
        ReservationView {
            id: self.id,
            order_id: self.order_id,
            quantity: self.quantity,
            backordered: self.backordered,
            status: self.status.as_str().to_string(),
            expires_at: self.expires_at,
        }
    }
}

/// What one product looked like when the store took its lock.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub record: &'a InventoryRecord,
    pub prior: Option<&'a HistoryEntry>,
    pub reservation: Option<&'a Reservation>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub record: InventoryRecord,
    pub adjustment: Option<AdjustmentResponse>,
    pub reservation: Option<Reservation>,
    pub sold: i32,
    pub backordered: i32,
    pub replayed: bool,
}

impl MutationOutcome {
    fn replay(record: &InventoryRecord) -> Self {
        Self {
            record: record.clone(),
            adjustment: None,
            reservation: None,
            sold: 0,
            backordered: 0,
            replayed: true,
        }
    }
}

/// Writes a store applies together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub record: InventoryRecord,
    pub history: HistoryEntry,
    pub reservation: Option<Reservation>,
    pub events: Vec<InventoryEvent>,
    pub outcome: MutationOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Replay(MutationOutcome),
    Commit(Box<Commit>),
}

pub fn decide(snapshot: Snapshot<'_>, mutation: &Mutation) -> Result<Decision, LedgerError> {
    match mutation {
        Mutation::Adjust(req) => apply_adjustment(snapshot, req),
        Mutation::Reserve(cmd) => reserve(snapshot, cmd),
        Mutation::Release(cmd) => release(snapshot, cmd),
        Mutation::CommitSale(cmd) => commit_sale(snapshot, cmd),
    }
}

fn apply_adjustment(snapshot: Snapshot<'_>, req: &AdjustmentRequest) -> Result<Decision, LedgerError> {
    let record = snapshot.record;

    if let (Some(key), Some(prior)) = (req.idempotency_key.as_deref(), snapshot.prior) {
        if !req.matches(prior) {
            return Err(LedgerError::Conflict(format!(
                "adjustment_id '{}' was already used with a different payload",
                key
            )));
        }
        let stored = prior.response.clone().ok_or_else(|| {
            LedgerError::Internal(format!("adjustment '{}' has no stored response", key))
        })?;
        let mut outcome = MutationOutcome::replay(record);
        outcome.adjustment = Some(serde_json::from_value(stored)?);
        return Ok(Decision::Replay(outcome));
    }

    let new_stock = match req.operation {
        AdjustmentOperation::Set => req.quantity,
        AdjustmentOperation::Increment => record.stock.checked_add(req.quantity).ok_or_else(|| {
            LedgerError::BusinessRuleViolation(format!(
                "incrementing stock {} by {} overflows",
                record.stock, req.quantity
            ))
        })?,
        AdjustmentOperation::Decrement => (record.stock - req.quantity).max(0),
    };
    let new_reserved = req.reserved.unwrap_or(record.reserved);

    if new_stock < new_reserved {
        return Err(LedgerError::BusinessRuleViolation(format!(
            "stock {} would fall below reserved {}",
            new_stock, new_reserved
        )));
    }

    let mut next = record.clone();
    next.stock = new_stock;
    next.reserved = new_reserved;
    if let Some(allowed) = req.backorder_allowed {
        next.backorder_allowed = allowed;
    }
    if let Some(threshold) = req.reorder_threshold {
        next.reorder_threshold = Some(threshold);
    }
    if let Some(key) = &req.idempotency_key {
        next.last_adjustment_id = Some(key.clone());
    }
    next.updated_at = snapshot.now;

    let mut history = HistoryEntry::between(
        record,
        &next,
        req.operation.as_str(),
        req.quantity,
        &req.actor,
        snapshot.now,
    );
    history.adjustment_id = req.idempotency_key.clone();
    history.requested_reserved = req.reserved;
    history.reason = req.reason.clone();
    history.notes = req.notes.clone();

    let response = AdjustmentResponse {
        id: next.product_id,
        stock: next.stock,
        available: next.available(),
        reserved: next.reserved,
        previous_stock: record.stock,
        adjustment: next.stock - record.stock,
        operation: req.operation.as_str().to_string(),
        updated_at: next.updated_at,
        inventory_history_id: history.id,
        metadata: AdjustmentMetadata {
            reason: req.reason.clone(),
            notes: req.notes.clone(),
            location: req.location.clone(),
            cost_per_unit: req.cost_per_unit.clone(),
            batch_number: req.batch_number.clone(),
            expires_at: req.expires_at,
            adjustment_id: req.idempotency_key.clone(),
            actor: req.actor.clone(),
        },
    };
    history.response = Some(serde_json::to_value(&response)?);

    let events = next.low_stock_event().into_iter().collect();
    let outcome = MutationOutcome {
        record: next.clone(),
        adjustment: Some(response),
        reservation: None,
        sold: 0,
        backordered: 0,
        replayed: false,
    };

    Ok(Decision::Commit(Box::new(Commit {
        record: next,
        history,
        reservation: None,
        events,
        outcome,
    })))
}

fn reserve(snapshot: Snapshot<'_>, cmd: &ReserveCommand) -> Result<Decision, LedgerError> {
    let record = snapshot.record;

    if let Some(existing) = snapshot.reservation.filter(|r| r.is_active()) {
        let requested = existing.quantity + existing.backordered;
        if cmd.quantity != requested {
            return Err(LedgerError::Conflict(format!(
                "order {} already holds a reservation for {} units",
                cmd.order_id, requested
            )));
        }
        let mut outcome = MutationOutcome::replay(record);
        outcome.backordered = existing.backordered;
        outcome.reservation = Some(existing.clone());
        return Ok(Decision::Replay(outcome));
    }

    let available = record.available();
    let (held, backordered) = if cmd.quantity <= available {
        (cmd.quantity, 0)
    } else if record.backorder_allowed {
        let held = available.max(0);
        (held, cmd.quantity - held)
    } else {
        return Err(LedgerError::InsufficientInventory {
            requested: cmd.quantity,
            available,
        });
    };

    let mut next = record.clone();
    next.reserved += held;
    next.updated_at = snapshot.now;

    let reservation = match snapshot.reservation {
        Some(previous) => Reservation {
            quantity: held,
            backordered,
            status: ReservationStatus::Reserved,
            expires_at: cmd.expires_at,
            updated_at: snapshot.now,
            ..previous.clone()
        },
        None => Reservation {
            id: Uuid::new_v4(),
            product_id: record.product_id,
            order_id: cmd.order_id,
            quantity: held,
            backordered,
            status: ReservationStatus::Reserved,
            expires_at: cmd.expires_at,
            created_at: snapshot.now,
            updated_at: snapshot.now,
        },
    };

    let mut history = HistoryEntry::between(record, &next, "reserve", cmd.quantity, &cmd.actor, snapshot.now);
    history.order_id = Some(cmd.order_id);

    let mut events = Vec::new();
    if backordered > 0 {
        events.push(InventoryEvent::Backordered {
            product_id: record.product_id,
            order_id: cmd.order_id,
            quantity: backordered,
        });
    }

    let outcome = MutationOutcome {
        record: next.clone(),
        adjustment: None,
        reservation: Some(reservation.clone()),
        sold: 0,
        backordered,
        replayed: false,
    };

    Ok(Decision::Commit(Box::new(Commit {
        record: next,
        history,
        reservation: Some(reservation),
        events,
        outcome,
    })))
}

fn release(snapshot: Snapshot<'_>, cmd: &ReleaseCommand) -> Result<Decision, LedgerError> {
    let record = snapshot.record;

    if let Some(existing) = snapshot.reservation.filter(|r| !r.is_active()) {
        let mut outcome = MutationOutcome::replay(record);
        outcome.reservation = Some(existing.clone());
        return Ok(Decision::Replay(outcome));
    }

    let mut released = cmd.quantity.min(record.reserved).max(0);
    if let Some(held) = snapshot.reservation {
        released = released.min(held.quantity);
    }

    let mut next = record.clone();
    next.reserved -= released;
    next.updated_at = snapshot.now;

    // A row can outlive the units it held when the aggregate was drained by
    // other orders or an explicit `reserved` override; close it once nothing is left.
    let reservation = snapshot.reservation.map(|held| {
        let remaining = (held.quantity - released).min(next.reserved);
        Reservation {
            quantity: remaining,
            status: if remaining == 0 {
                ReservationStatus::Released
            } else {
                ReservationStatus::Reserved
            },
            updated_at: snapshot.now,
            ..held.clone()
        }
    });

    let mut history = HistoryEntry::between(record, &next, "release", cmd.quantity, &cmd.actor, snapshot.now);
    history.order_id = Some(cmd.order_id);
    history.reason = cmd.reason.clone();

    let outcome = MutationOutcome {
        record: next.clone(),
        adjustment: None,
        reservation: reservation.clone(),
        sold: 0,
        backordered: 0,
        replayed: false,
    };

    Ok(Decision::Commit(Box::new(Commit {
        record: next,
        history,
        reservation,
        events: Vec::new(),
        outcome,
    })))
}

fn commit_sale(snapshot: Snapshot<'_>, cmd: &SaleCommand) -> Result<Decision, LedgerError> {
    let record = snapshot.record;

    if let Some(existing) = snapshot
        .reservation
        .filter(|r| r.status == ReservationStatus::Committed)
    {
        let mut outcome = MutationOutcome::replay(record);
        outcome.reservation = Some(existing.clone());
        return Ok(Decision::Replay(outcome));
    }

    let mut covered = cmd.quantity.min(record.reserved).max(0);
    if let Some(held) = snapshot.reservation {
        covered = if held.is_active() { covered.min(held.quantity) } else { 0 };
    }
    let uncovered = cmd.quantity - covered;
    let available = record.available();

    if uncovered > available && !record.backorder_allowed {
        return Err(LedgerError::InsufficientInventory {
            requested: cmd.quantity,
            available: available + covered,
        });
    }

    let sold = covered + uncovered.min(available);
    let backordered = cmd.quantity - sold;

    let mut next = record.clone();
    next.stock -= sold;
    next.reserved -= covered;
    next.updated_at = snapshot.now;

    let reservation = snapshot.reservation.map(|held| {
        let remaining = if held.is_active() {
            (held.quantity - covered).min(next.reserved)
        } else {
            0
        };
        Reservation {
            quantity: remaining,
            backordered: held.backordered + backordered,
            status: if remaining == 0 {
                ReservationStatus::Committed
            } else {
                ReservationStatus::Reserved
            },
            updated_at: snapshot.now,
            ..held.clone()
        }
    });

    let mut history = HistoryEntry::between(record, &next, "commit_sale", cmd.quantity, &cmd.actor, snapshot.now);
    history.order_id = Some(cmd.order_id);
    history.reason = cmd.reason.clone();

    let mut events = Vec::new();
    if backordered > 0 {
        events.push(InventoryEvent::Backordered {
            product_id: record.product_id,
            order_id: cmd.order_id,
            quantity: backordered,
        });
    }
    events.extend(next.low_stock_event());

    let outcome = MutationOutcome {
        record: next.clone(),
        adjustment: None,
        reservation: reservation.clone(),
        sold,
        backordered,
        replayed: false,
    };

    Ok(Decision::Commit(Box::new(Commit {
        record: next,
        history,
        reservation,
        events,
        outcome,
    })))
}

pub fn non_negative(field: &str, value: i64) -> Result<i32, LedgerError> {
    if value < 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "{} must be a non-negative integer",
            field
        )));
    }
    i32::try_from(value)
        .map_err(|_| LedgerError::InvalidArgument(format!("{} is out of range", field)))
}

pub fn positive(field: &str, value: i64) -> Result<i32, LedgerError> {
    if value <= 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "{} must be a positive integer",
            field
        )));
    }
    non_negative(field, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Applies decisions the way a store would, without any locking.
    struct Ledger {
        record: InventoryRecord,
        history: Vec<HistoryEntry>,
        reservations: HashMap<Uuid, Reservation>,
        events: Vec<InventoryEvent>,
    }

    impl Ledger {
        fn with(stock: i32, reserved: i32, backorder_allowed: bool) -> Self {
            let policy = InventoryPolicy {
                backorder_allowed: Some(backorder_allowed),
                reorder_threshold: None,
            };
            let mut record = InventoryRecord::new(Uuid::new_v4(), &policy, Utc::now()).unwrap();
            record.stock = stock;
            record.reserved = reserved;
            Self {
                record,
                history: Vec::new(),
                reservations: HashMap::new(),
                events: Vec::new(),
            }
        }

        fn run(&mut self, mutation: Mutation) -> Result<MutationOutcome, LedgerError> {
            let prior = mutation.idempotency_key().and_then(|key| {
                self.history
                    .iter()
                    .find(|h| h.adjustment_id.as_deref() == Some(key))
            });
            let reservation = mutation.order_id().and_then(|id| self.reservations.get(&id));
            let snapshot = Snapshot {
                record: &self.record,
                prior,
                reservation,
                now: Utc::now(),
            };

            match decide(snapshot, &mutation)? {
                Decision::Replay(outcome) => Ok(outcome),
                Decision::Commit(commit) => {
                    let commit = *commit;
                    self.record = commit.record;
                    self.history.push(commit.history);
                    if let Some(r) = commit.reservation {
                        self.reservations.insert(r.order_id, r);
                    }
                    self.events.extend(commit.events);
                    Ok(commit.outcome)
                }
            }
        }
    }

    fn adjust(op: AdjustmentOperation, quantity: i32) -> Mutation {
        Mutation::Adjust(AdjustmentRequest::new(op, quantity))
    }

    fn reserve_for(order_id: Uuid, quantity: i32) -> Mutation {
        Mutation::Reserve(ReserveCommand {
            order_id,
            quantity,
            expires_at: None,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    fn release_for(order_id: Uuid, quantity: i32) -> Mutation {
        Mutation::Release(ReleaseCommand {
            order_id,
            quantity,
            reason: None,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    fn sell_for(order_id: Uuid, quantity: i32) -> Mutation {
        Mutation::CommitSale(SaleCommand {
            order_id,
            quantity,
            reason: None,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    #[test]
    fn operations_compute_new_stock() {
        let mut ledger = Ledger::with(10, 0, false);

        ledger.run(adjust(AdjustmentOperation::Increment, 5)).unwrap();
        assert_eq!(ledger.record.stock, 15);

        ledger.run(adjust(AdjustmentOperation::Decrement, 4)).unwrap();
        assert_eq!(ledger.record.stock, 11);

        ledger.run(adjust(AdjustmentOperation::Set, 42)).unwrap();
        assert_eq!(ledger.record.stock, 42);
        assert_eq!(ledger.history.len(), 3);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let mut ledger = Ledger::with(3, 0, false);
        let outcome = ledger.run(adjust(AdjustmentOperation::Decrement, 10)).unwrap();

        let response = outcome.adjustment.unwrap();
        assert_eq!(response.stock, 0);
        assert_eq!(response.previous_stock, 3);
        assert_eq!(response.adjustment, -3);
    }

    #[test]
    fn set_below_reserved_is_rejected_without_changes() {
        let mut ledger = Ledger::with(10, 8, false);
        let before = ledger.record.clone();

        let err = ledger.run(adjust(AdjustmentOperation::Set, 5)).unwrap_err();

        assert!(matches!(err, LedgerError::BusinessRuleViolation(_)));
        assert_eq!(ledger.record, before);
        assert!(ledger.history.is_empty());
    }

    #[test]
    fn requested_reserved_is_validated_against_new_stock() {
        let mut ledger = Ledger::with(10, 8, false);

        let mut lowered = AdjustmentRequest::new(AdjustmentOperation::Set, 5);
        lowered.reserved = Some(2);
        let outcome = ledger.run(Mutation::Adjust(lowered)).unwrap();
        assert_eq!(outcome.record.stock, 5);
        assert_eq!(outcome.record.reserved, 2);

        let mut raised = AdjustmentRequest::new(AdjustmentOperation::Increment, 1);
        raised.reserved = Some(7);
        let err = ledger.run(Mutation::Adjust(raised)).unwrap_err();
        assert!(matches!(err, LedgerError::BusinessRuleViolation(_)));
        assert_eq!(ledger.record.reserved, 2);
    }

    #[test]
    fn increment_overflow_is_a_rule_violation() {
        let mut ledger = Ledger::with(i32::MAX - 1, 0, false);
        let err = ledger.run(adjust(AdjustmentOperation::Increment, 5)).unwrap_err();
        assert!(matches!(err, LedgerError::BusinessRuleViolation(_)));
    }

    #[test]
    fn repeated_key_replays_stored_response() {
        let mut ledger = Ledger::with(10, 0, false);
        let request = AdjustmentRequest::new(AdjustmentOperation::Increment, 5).with_key("adj-1");

        let first = ledger.run(Mutation::Adjust(request.clone())).unwrap();
        let second = ledger.run(Mutation::Adjust(request)).unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.adjustment, second.adjustment);
        assert_eq!(ledger.record.stock, 15);
        assert_eq!(ledger.record.last_adjustment_id.as_deref(), Some("adj-1"));
        assert_eq!(ledger.history.len(), 1);
    }

    #[test]
    fn older_keys_still_replay() {
        let mut ledger = Ledger::with(0, 0, false);
        let first = AdjustmentRequest::new(AdjustmentOperation::Increment, 5).with_key("adj-1");
        let second = AdjustmentRequest::new(AdjustmentOperation::Increment, 7).with_key("adj-2");

        ledger.run(Mutation::Adjust(first.clone())).unwrap();
        ledger.run(Mutation::Adjust(second)).unwrap();
        let replay = ledger.run(Mutation::Adjust(first)).unwrap();

        assert!(replay.replayed);
        assert_eq!(replay.adjustment.unwrap().stock, 5);
        assert_eq!(ledger.record.stock, 12);
    }

    #[test]
    fn reused_key_with_different_payload_conflicts() {
        let mut ledger = Ledger::with(10, 0, false);
        ledger
            .run(Mutation::Adjust(
                AdjustmentRequest::new(AdjustmentOperation::Increment, 5).with_key("adj-1"),
            ))
            .unwrap();

        let err = ledger
            .run(Mutation::Adjust(
                AdjustmentRequest::new(AdjustmentOperation::Increment, 6).with_key("adj-1"),
            ))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let err = ledger
            .run(Mutation::Adjust(
                AdjustmentRequest::new(AdjustmentOperation::Decrement, 5).with_key("adj-1"),
            ))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert_eq!(ledger.record.stock, 15);
    }

    #[test]
    fn low_stock_is_signalled_at_threshold() {
        let mut ledger = Ledger::with(20, 0, false);
        let mut request = AdjustmentRequest::new(AdjustmentOperation::Decrement, 10);
        request.reorder_threshold = Some(10);

        ledger.run(Mutation::Adjust(request)).unwrap();

        assert_eq!(
            ledger.events,
            vec![InventoryEvent::LowStock {
                product_id: ledger.record.product_id,
                stock: 10,
                reorder_threshold: 10,
            }]
        );

        ledger.run(adjust(AdjustmentOperation::Increment, 1)).unwrap();
        assert_eq!(ledger.events.len(), 1);
    }

    #[test]
    fn reserve_then_commit_sale() {
        let mut ledger = Ledger::with(100, 0, false);
        let order = Uuid::new_v4();

        let reserved = ledger.run(reserve_for(order, 30)).unwrap();
        assert_eq!(reserved.record.reserved, 30);
        assert_eq!(reserved.record.available(), 70);

        let sold = ledger.run(sell_for(order, 30)).unwrap();
        assert_eq!(sold.record.stock, 70);
        assert_eq!(sold.record.reserved, 0);
        assert_eq!(sold.record.available(), 70);
        assert_eq!(sold.sold, 30);
        assert_eq!(
            ledger.reservations[&order].status,
            ReservationStatus::Committed
        );
    }

    #[test]
    fn reserve_beyond_available_without_backorder_fails() {
        let mut ledger = Ledger::with(10, 2, false);

        let err = ledger.run(reserve_for(Uuid::new_v4(), 15)).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientInventory {
                requested: 15,
                available: 8
            }
        ));
        assert_eq!(ledger.record.stock, 10);
        assert_eq!(ledger.record.reserved, 2);
    }

    #[test]
    fn reserve_with_backorder_holds_what_is_available() {
        let mut ledger = Ledger::with(10, 2, true);
        let order = Uuid::new_v4();

        let outcome = ledger.run(reserve_for(order, 15)).unwrap();

        assert_eq!(outcome.record.reserved, 10);
        assert_eq!(outcome.backordered, 7);
        assert_eq!(outcome.reservation.unwrap().quantity, 8);
        assert_eq!(
            ledger.events,
            vec![InventoryEvent::Backordered {
                product_id: ledger.record.product_id,
                order_id: order,
                quantity: 7,
            }]
        );
    }

    #[test]
    fn repeated_reserve_for_same_order_is_a_replay() {
        let mut ledger = Ledger::with(10, 0, false);
        let order = Uuid::new_v4();

        ledger.run(reserve_for(order, 4)).unwrap();
        let again = ledger.run(reserve_for(order, 4)).unwrap();

        assert!(again.replayed);
        assert_eq!(ledger.record.reserved, 4);
        assert_eq!(ledger.history.len(), 1);
    }

    #[test]
    fn repeated_reserve_with_different_quantity_conflicts() {
        let mut ledger = Ledger::with(20, 0, false);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 4)).unwrap();

        let err = ledger.run(reserve_for(order, 10)).unwrap_err();

        assert!(matches!(err, LedgerError::Conflict(_)));
        assert_eq!(ledger.record.reserved, 4);
        assert_eq!(ledger.reservations[&order].quantity, 4);
        assert_eq!(ledger.history.len(), 1);
    }

    #[test]
    fn repeated_backordered_reserve_is_a_replay() {
        let mut ledger = Ledger::with(5, 0, true);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 8)).unwrap();

        let again = ledger.run(reserve_for(order, 8)).unwrap();

        assert!(again.replayed);
        assert_eq!(again.backordered, 3);
        assert_eq!(ledger.record.reserved, 5);
    }

    #[test]
    fn release_closes_row_drained_by_another_order() {
        let mut ledger = Ledger::with(10, 0, false);
        let holder = Uuid::new_v4();
        ledger.run(reserve_for(holder, 5)).unwrap();
        ledger.run(sell_for(Uuid::new_v4(), 5)).unwrap();
        assert_eq!(ledger.record.reserved, 0);

        let outcome = ledger.run(release_for(holder, 5)).unwrap();

        assert_eq!(outcome.record.reserved, 0);
        let reservation = &ledger.reservations[&holder];
        assert_eq!(reservation.quantity, 0);
        assert_eq!(reservation.status, ReservationStatus::Released);
    }

    #[test]
    fn release_closes_row_after_reserved_override() {
        let mut ledger = Ledger::with(10, 0, false);
        let holder = Uuid::new_v4();
        ledger.run(reserve_for(holder, 6)).unwrap();
        let mut lowered = AdjustmentRequest::new(AdjustmentOperation::Set, 10);
        lowered.reserved = Some(2);
        ledger.run(Mutation::Adjust(lowered)).unwrap();

        ledger.run(release_for(holder, 4)).unwrap();

        let reservation = &ledger.reservations[&holder];
        assert_eq!(ledger.record.reserved, 0);
        assert_eq!(reservation.status, ReservationStatus::Released);
    }

    #[test]
    fn release_clamps_and_is_idempotent() {
        let mut ledger = Ledger::with(10, 0, false);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 4)).unwrap();

        let released = ledger.run(release_for(order, 9)).unwrap();
        assert_eq!(released.record.reserved, 0);
        assert_eq!(ledger.reservations[&order].status, ReservationStatus::Released);

        let again = ledger.run(release_for(order, 9)).unwrap();
        assert!(again.replayed);
        assert_eq!(ledger.record.reserved, 0);
    }

    #[test]
    fn release_without_reservation_clamps_on_aggregate() {
        let mut ledger = Ledger::with(10, 3, false);
        let outcome = ledger.run(release_for(Uuid::new_v4(), 5)).unwrap();
        assert_eq!(outcome.record.reserved, 0);
        assert_eq!(outcome.record.stock, 10);
    }

    #[test]
    fn partial_release_keeps_reservation_active() {
        let mut ledger = Ledger::with(10, 0, false);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 6)).unwrap();

        ledger.run(release_for(order, 2)).unwrap();

        let reservation = &ledger.reservations[&order];
        assert_eq!(reservation.quantity, 4);
        assert!(reservation.is_active());
        assert_eq!(ledger.record.reserved, 4);
    }

    #[test]
    fn commit_sale_of_fully_reserved_stock() {
        let mut ledger = Ledger::with(30, 0, false);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 30)).unwrap();

        let outcome = ledger.run(sell_for(order, 30)).unwrap();

        assert_eq!(outcome.record.stock, 0);
        assert_eq!(outcome.record.reserved, 0);
    }

    #[test]
    fn direct_sale_beyond_available_fails_without_backorder() {
        let mut ledger = Ledger::with(10, 0, false);

        let err = ledger.run(sell_for(Uuid::new_v4(), 11)).unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientInventory { .. }));
        assert_eq!(ledger.record.stock, 10);
    }

    #[test]
    fn direct_sale_with_backorder_records_shortfall() {
        let mut ledger = Ledger::with(10, 0, true);
        let order = Uuid::new_v4();

        let outcome = ledger.run(sell_for(order, 14)).unwrap();

        assert_eq!(outcome.sold, 10);
        assert_eq!(outcome.backordered, 4);
        assert_eq!(outcome.record.stock, 0);
        assert!(ledger.events.contains(&InventoryEvent::Backordered {
            product_id: ledger.record.product_id,
            order_id: order,
            quantity: 4,
        }));
    }

    #[test]
    fn repeated_commit_for_same_order_is_a_replay() {
        let mut ledger = Ledger::with(10, 0, false);
        let order = Uuid::new_v4();
        ledger.run(reserve_for(order, 3)).unwrap();
        ledger.run(sell_for(order, 3)).unwrap();

        let again = ledger.run(sell_for(order, 3)).unwrap();

        assert!(again.replayed);
        assert_eq!(ledger.record.stock, 7);
    }

    #[test]
    fn wire_request_validation() {
        let ok = AdjustmentRequest::from_wire(
            AdjustInventoryRequest {
                stock: 5,
                operation: Some("Increment".to_string()),
                adjustment_id: Some("adj-9".to_string()),
                ..Default::default()
            },
            "tester".to_string(),
        )
        .unwrap();
        assert_eq!(ok.operation, AdjustmentOperation::Increment);
        assert_eq!(ok.quantity, 5);
        assert_eq!(ok.actor, "tester");

        let defaulted = AdjustmentRequest::from_wire(
            AdjustInventoryRequest {
                stock: 5,
                ..Default::default()
            },
            DEFAULT_ACTOR.to_string(),
        )
        .unwrap();
        assert_eq!(defaulted.operation, AdjustmentOperation::Set);

        for bad in [
            AdjustInventoryRequest {
                stock: -1,
                ..Default::default()
            },
            AdjustInventoryRequest {
                stock: 1,
                operation: Some("multiply".to_string()),
                ..Default::default()
            },
            AdjustInventoryRequest {
                stock: i64::from(i32::MAX) + 1,
                ..Default::default()
            },
            AdjustInventoryRequest {
                stock: 1,
                reserved: Some(-2),
                ..Default::default()
            },
            AdjustInventoryRequest {
                stock: 1,
                adjustment_id: Some("  ".to_string()),
                ..Default::default()
            },
        ] {
            let err = AdjustmentRequest::from_wire(bad, DEFAULT_ACTOR.to_string()).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidArgument(_)));
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Adjust(AdjustmentOperation, i32, Option<i32>),
        Reserve(usize, i32),
        Release(usize, i32),
        Sell(usize, i32),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        let op = prop_oneof![
            Just(AdjustmentOperation::Set),
            Just(AdjustmentOperation::Increment),
            Just(AdjustmentOperation::Decrement),
        ];
        prop_oneof![
            (op, 0i32..200, proptest::option::of(0i32..100))
                .prop_map(|(op, q, r)| Step::Adjust(op, q, r)),
            (0usize..4, 1i32..80).prop_map(|(o, q)| Step::Reserve(o, q)),
            (0usize..4, 1i32..80).prop_map(|(o, q)| Step::Release(o, q)),
            (0usize..4, 1i32..80).prop_map(|(o, q)| Step::Sell(o, q)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        #[test]
        fn reserved_never_exceeds_stock(
            backorder in any::<bool>(),
            steps in proptest::collection::vec(step_strategy(), 1..40),
        ) {
            let mut ledger = Ledger::with(50, 0, backorder);
            let orders: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

            for step in steps {
                let before = ledger.record.clone();
                let mutation = match step {
                    Step::Adjust(op, q, reserved) => {
                        let mut req = AdjustmentRequest::new(op, q);
                        req.reserved = reserved;
                        Mutation::Adjust(req)
                    }
                    Step::Reserve(o, q) => reserve_for(orders[o], q),
                    Step::Release(o, q) => release_for(orders[o], q),
                    Step::Sell(o, q) => sell_for(orders[o], q),
                };

                if ledger.run(mutation).is_err() {
                    prop_assert_eq!(&ledger.record, &before);
                }
                prop_assert!(ledger.record.reserved >= 0);
                prop_assert!(ledger.record.reserved <= ledger.record.stock);
            }
        }
    }
}
