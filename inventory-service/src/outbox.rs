use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::OutboxEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::store::InventoryStore;

const BATCH_SIZE: i64 = 100;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

pub fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        "LowStock" => "inventory-alerts",
        "Backordered" => "backorder-events",
        _ => "inventory-events",
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(topic_for(&event.event_type))
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

/// Used when no brokers are configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        info!(
            topic = topic_for(&event.event_type),
            "[OUTBOX] {} {}", event.event_type, event.event_data
        );
        Ok(())
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn InventoryStore>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn InventoryStore>, publisher: Arc<dyn EventPublisher>, interval: Duration) -> Self {
        Self {
            store,
            publisher,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Returns how many events were published.
    pub async fn process_outbox_events(&self) -> Result<usize> {
        let unprocessed_events = self.store.pending_events(BATCH_SIZE).await?;
        let mut published = 0;

        for event in unprocessed_events {
            // Later events wait so consumers see them in creation order.
            if let Err(e) = self.publisher.publish(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                break;
            }

            self.store.mark_event_processed(event.id).await?;
            published += 1;

            info!("Published outbox event: {}", event.id);
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AdjustmentOperation, AdjustmentRequest, InventoryRecord, Mutation};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use shared::InventoryPolicy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingPublisher {
        seen: Mutex<Vec<String>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &OutboxEvent) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("broker unavailable");
            }
            self.seen.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    async fn store_with_low_stock_event() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let product_id = Uuid::new_v4();
        let policy = InventoryPolicy {
            backorder_allowed: None,
            reorder_threshold: Some(3),
        };
        store
            .create(InventoryRecord::new(product_id, &policy, Utc::now()).unwrap())
            .await
            .unwrap();
        store
            .mutate(
                product_id,
                Mutation::Adjust(AdjustmentRequest::new(AdjustmentOperation::Set, 2)),
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn events_route_to_topics() {
        assert_eq!(topic_for("LowStock"), "inventory-alerts");
        assert_eq!(topic_for("Backordered"), "backorder-events");
        assert_eq!(topic_for("Other"), "inventory-events");
    }

    #[tokio::test]
    async fn publishes_pending_events_once() {
        let store = store_with_low_stock_event().await;
        let publisher = Arc::new(RecordingPublisher::default());
        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), Duration::from_secs(5));

        assert_eq!(processor.process_outbox_events().await.unwrap(), 1);
        assert_eq!(processor.process_outbox_events().await.unwrap(), 0);
        assert_eq!(*publisher.seen.lock().unwrap(), vec!["LowStock".to_string()]);
    }

    /// Fails the first publish attempt only.
    #[derive(Default)]
    struct FlakyPublisher {
        attempts: Mutex<usize>,
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, event: &OutboxEvent) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if attempt == 1 {
                anyhow::bail!("broker unavailable");
            }
            self.seen.lock().unwrap().push(event.event_data["stock"].clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_publish_holds_back_later_events() {
        let store = store_with_low_stock_event().await;
        let product_id = store.pending_events(1).await.unwrap()[0].aggregate_id;
        store
            .mutate(
                product_id,
                Mutation::Adjust(AdjustmentRequest::new(AdjustmentOperation::Set, 1)),
            )
            .await
            .unwrap();
        let publisher = Arc::new(FlakyPublisher::default());
        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), Duration::from_secs(5));

        assert_eq!(processor.process_outbox_events().await.unwrap(), 0);
        assert_eq!(store.pending_events(10).await.unwrap().len(), 2);

        assert_eq!(processor.process_outbox_events().await.unwrap(), 2);
        assert_eq!(
            *publisher.seen.lock().unwrap(),
            vec![serde_json::json!(2), serde_json::json!(1)]
        );
    }

    #[tokio::test]
    async fn failed_publish_is_retried_next_tick() {
        let store = store_with_low_stock_event().await;
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.failing.store(true, Ordering::SeqCst);
        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), Duration::from_secs(5));

        assert_eq!(processor.process_outbox_events().await.unwrap(), 0);
        assert_eq!(store.pending_events(10).await.unwrap().len(), 1);

        publisher.failing.store(false, Ordering::SeqCst);
        assert_eq!(processor.process_outbox_events().await.unwrap(), 1);
        assert!(store.pending_events(10).await.unwrap().is_empty());
    }
}
