use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset};
use serde::de::DeserializeOwned;
use shared::*;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::service::InventoryService;
use crate::store::ProcessedCommand;

/// Turns saga commands into ledger calls, at most once per idempotency key.
#[derive(Clone)]
pub struct CommandProcessor {
    service: InventoryService,
}

impl CommandProcessor {
    pub fn new(service: InventoryService) -> Self {
        Self { service }
    }

    /// Rule failures become `Failed` replies and are remembered; internal
    /// failures are returned so the message can be redelivered.
    pub async fn process(&self, command: &Command) -> Result<CommandReply> {
        let store = self.service.store();

        if let Some(existing) = store.processed_command(&command.idempotency_key).await? {
            info!("Command already processed, returning cached result");
            return Ok(match existing.error {
                Some(error) => CommandReply::failed(command.id, command.saga_id, error),
                None => CommandReply::success(command.id, command.saga_id, existing.result),
            });
        }

        let reply = match self.dispatch(command).await {
            Ok(result) => CommandReply::success(command.id, command.saga_id, Some(result)),
            Err(e) if e.is_internal() => return Err(e.into()),
            Err(e) => {
                warn!("Command {} rejected: {}", command.id, e);
                CommandReply::failed(command.id, command.saga_id, e.to_string())
            }
        };

        store
            .record_processed_command(ProcessedCommand {
                idempotency_key: command.idempotency_key.clone(),
                command_id: command.id,
                result: reply.result.clone(),
                error: reply.error.clone(),
                processed_at: Utc::now(),
            })
            .await?;

        Ok(reply)
    }

    async fn dispatch(&self, command: &Command) -> Result<serde_json::Value, LedgerError> {
        let actor = format!("saga:{}", command.saga_id);

        match command.command_type {
            CommandType::CreateInventory => {
                let data: CreateInventoryData = payload(command)?;
                let record = self.service.create(data.product_id, data.policy).await?;
                Ok(serde_json::to_value(record.to_response())?)
            }
            CommandType::ReserveInventory => {
                let data: InventoryData = payload(command)?;
                let request = ReserveRequest {
                    order_id: data.order_id,
                    quantity: i64::from(data.quantity),
                    expiration_minutes: None,
                };
                let outcome = self.service.reserve(data.product_id, request, actor).await?;
                let held = outcome.reservation.as_ref().map(|r| r.quantity).unwrap_or(0);
                Ok(serde_json::json!({
                    "reserved": true,
                    "quantity": held,
                    "backordered": outcome.backordered,
                    "reservation": outcome.reservation.map(|r| r.to_view()),
                }))
            }
            CommandType::CompensateInventory => {
                let data: InventoryData = payload(command)?;
                let request = OrderQuantityRequest {
                    order_id: data.order_id,
                    quantity: i64::from(data.quantity),
                    reason: Some("saga compensation".to_string()),
                };
                self.service.release(data.product_id, request, actor).await?;
                info!("Inventory reservation cancelled for order: {}", data.order_id);
                Ok(serde_json::json!({ "compensated": true }))
            }
            CommandType::CommitInventory => {
                let data: InventoryData = payload(command)?;
                let request = OrderQuantityRequest {
                    order_id: data.order_id,
                    quantity: i64::from(data.quantity),
                    reason: None,
                };
                let outcome = self.service.commit_sale(data.product_id, request, actor).await?;
                Ok(serde_json::json!({
                    "sold": outcome.sold,
                    "backordered": outcome.backordered,
                }))
            }
            CommandType::AdjustInventory => {
                let data: AdjustInventoryData = payload(command)?;
                let response = self
                    .service
                    .apply_adjustment(data.product_id, data.request, actor)
                    .await?;
                Ok(serde_json::to_value(response)?)
            }
        }
    }
}

fn payload<T: DeserializeOwned>(command: &Command) -> Result<T, LedgerError> {
    serde_json::from_value(command.payload.clone()).map_err(|e| {
        LedgerError::InvalidArgument(format!(
            "malformed {:?} payload: {}",
            command.command_type, e
        ))
    })
}

const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

/// What to do with a consumed message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    /// The offset is left uncommitted so the command is consumed again.
    Redeliver,
}

impl Disposition {
    /// Handled commands, including rejected and unparseable ones, are
    /// committed. Internal failures and lost replies are retried; the
    /// processed-command record makes the retry resend the stored reply.
    pub fn of(outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) => Disposition::Commit,
            Err(_) => Disposition::Redeliver,
        }
    }
}

pub struct CommandHandler {
    processor: CommandProcessor,
    producer: FutureProducer,
    reply_topic: String,
}

impl CommandHandler {
    pub fn new(processor: CommandProcessor, producer: FutureProducer, reply_topic: String) -> Self {
        Self {
            processor,
            producer,
            reply_topic,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let outcome = match m.payload_view::<str>() {
                        Some(Ok(json_str)) => match serde_json::from_str::<Command>(json_str) {
                            Ok(command) => self.handle_command(command).await,
                            Err(e) => {
                                warn!("Skipping unrecognized command: {}", e);
                                Ok(())
                            }
                        },
                        Some(Err(e)) => {
                            error!("Error parsing payload: {}", e);
                            Ok(())
                        }
                        None => Ok(()),
                    };

                    match Disposition::of(&outcome) {
                        Disposition::Commit => {
                            if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                                error!("Error committing message: {}", e);
                            }
                        }
                        Disposition::Redeliver => {
                            if let Err(e) = &outcome {
                                error!("Error handling command, redelivering: {}", e);
                            }
                            time::sleep(REDELIVERY_BACKOFF).await;
                            if let Err(e) = consumer.seek(
                                m.topic(),
                                m.partition(),
                                Offset::Offset(m.offset()),
                                Duration::from_secs(5),
                            ) {
                                error!("Error seeking back to offset {}: {}", m.offset(), e);
                            }
                        }
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_command(&self, command: Command) -> Result<()> {
        let reply = self.processor.process(&command).await?;
        self.send_reply(reply).await
    }

    async fn send_reply(&self, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.saga_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use uuid::Uuid;

    fn processor() -> CommandProcessor {
        let service = InventoryService::new(Arc::new(MemoryStore::new()), chrono::Duration::minutes(15));
        CommandProcessor::new(service)
    }

    fn command(command_type: CommandType, payload: serde_json::Value) -> Command {
        Command::new(Uuid::new_v4(), command_type, payload)
    }

    async fn stocked_product(processor: &CommandProcessor, stock: i64) -> Uuid {
        let product_id = Uuid::new_v4();
        let created = processor
            .process(&command(
                CommandType::CreateInventory,
                serde_json::json!({ "product_id": product_id }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status, CommandStatus::Success);

        let adjusted = processor
            .process(&command(
                CommandType::AdjustInventory,
                serde_json::json!({ "product_id": product_id, "stock": stock }),
            ))
            .await
            .unwrap();
        assert_eq!(adjusted.status, CommandStatus::Success);
        product_id
    }

    fn inventory_payload(product_id: Uuid, order_id: Uuid, quantity: i32) -> serde_json::Value {
        serde_json::to_value(InventoryData {
            product_id,
            quantity,
            order_id,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn redelivered_reserve_is_applied_once() {
        let processor = processor();
        let product_id = stocked_product(&processor, 10).await;
        let reserve = command(
            CommandType::ReserveInventory,
            inventory_payload(product_id, Uuid::new_v4(), 4),
        );

        let first = processor.process(&reserve).await.unwrap();
        let second = processor.process(&reserve).await.unwrap();

        assert_eq!(first.status, CommandStatus::Success);
        assert_eq!(second.result, first.result);
        let record = processor.service.get(product_id).await.unwrap();
        assert_eq!(record.reserved, 4);
    }

    #[tokio::test]
    async fn insufficient_inventory_fails_and_is_remembered() {
        let processor = processor();
        let product_id = stocked_product(&processor, 2).await;
        let reserve = command(
            CommandType::ReserveInventory,
            inventory_payload(product_id, Uuid::new_v4(), 5),
        );

        let first = processor.process(&reserve).await.unwrap();
        let second = processor.process(&reserve).await.unwrap();

        assert_eq!(first.status, CommandStatus::Failed);
        assert!(first.error.as_deref().unwrap().contains("insufficient inventory"));
        assert_eq!(second.status, CommandStatus::Failed);
        assert_eq!(second.error, first.error);
    }

    #[tokio::test]
    async fn compensation_releases_the_reservation() {
        let processor = processor();
        let product_id = stocked_product(&processor, 10).await;
        let order_id = Uuid::new_v4();

        processor
            .process(&command(
                CommandType::ReserveInventory,
                inventory_payload(product_id, order_id, 6),
            ))
            .await
            .unwrap();
        let reply = processor
            .process(&command(
                CommandType::CompensateInventory,
                inventory_payload(product_id, order_id, 6),
            ))
            .await
            .unwrap();

        assert_eq!(reply.status, CommandStatus::Success);
        assert_eq!(reply.result, Some(serde_json::json!({ "compensated": true })));
        assert_eq!(processor.service.get(product_id).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn commit_consumes_reserved_stock() {
        let processor = processor();
        let product_id = stocked_product(&processor, 10).await;
        let order_id = Uuid::new_v4();

        processor
            .process(&command(
                CommandType::ReserveInventory,
                inventory_payload(product_id, order_id, 3),
            ))
            .await
            .unwrap();
        let reply = processor
            .process(&command(
                CommandType::CommitInventory,
                inventory_payload(product_id, order_id, 3),
            ))
            .await
            .unwrap();

        assert_eq!(reply.status, CommandStatus::Success);
        let record = processor.service.get(product_id).await.unwrap();
        assert_eq!(record.stock, 7);
        assert_eq!(record.reserved, 0);
    }

    #[test]
    fn only_failed_handling_is_redelivered() {
        assert_eq!(Disposition::of(&Ok(())), Disposition::Commit);
        assert_eq!(
            Disposition::of(&Err(anyhow::anyhow!("Failed to send reply: timed out"))),
            Disposition::Redeliver
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_a_failed_reply() {
        let processor = processor();

        let reply = processor
            .process(&command(
                CommandType::ReserveInventory,
                serde_json::json!({ "product_id": "not-a-uuid" }),
            ))
            .await
            .unwrap();

        assert_eq!(reply.status, CommandStatus::Failed);
        assert!(reply.error.unwrap().contains("malformed"));
    }
}
