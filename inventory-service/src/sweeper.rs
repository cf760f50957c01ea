use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::service::InventoryService;

const BATCH_SIZE: i64 = 100;

/// Releases reservations whose expiry has passed.
pub struct ReservationSweeper {
    service: InventoryService,
    interval: Duration,
}

impl ReservationSweeper {
    pub fn new(service: InventoryService, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep().await {
                error!("Error sweeping expired reservations: {}", e);
            }
        }
    }

    /// Returns how many reservations were released.
    pub async fn sweep(&self) -> Result<usize> {
        let expired = self
            .service
            .store()
            .expired_reservations(Utc::now(), BATCH_SIZE)
            .await?;
        let mut released = 0;

        for reservation in expired {
            match self
                .service
                .expire(reservation.product_id, reservation.order_id, reservation.quantity)
                .await
            {
                Ok(_) => {
                    released += 1;
                    info!(
                        "Released expired reservation of order {} on product {}",
                        reservation.order_id, reservation.product_id
                    );
                }
                Err(e) => error!("Failed to release reservation {}: {}", reservation.id, e),
            }
        }

        Ok(released)
    }
}
