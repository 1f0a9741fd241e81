//! Delivery fulfillment: every PENDING delivery created by a finished
//! round transitions to DELIVERED a bounded delay later, the same
//! tick-and-reconcile shape `sync::BalanceSync` uses for the balance
//! mirror.

use std::sync::Arc;
use std::time::Duration;

use jiff::Span;
use payloads::DeliveryStatus;

use crate::store::durable::DurableStore;
use crate::telemetry::log_error;
use crate::time::TimeSource;

pub struct DeliveryFulfillment {
    durable: Arc<dyn DurableStore>,
    time: TimeSource,
    delay_ms: i64,
}

impl DeliveryFulfillment {
    pub fn new(durable: Arc<dyn DurableStore>, time: TimeSource, delay_ms: i64) -> Self {
        Self { durable, time, delay_ms }
    }

    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                log_error(e);
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = self.time.now();
        let auctions = self.durable.list_auctions().await?;
        for auction in auctions {
            for delivery in self.durable.list_deliveries(auction.id).await? {
                if delivery.status != DeliveryStatus::Pending {
                    continue;
                }
                let due = delivery.created_at + Span::new().milliseconds(self.delay_ms);
                if now >= due {
                    self.durable.mark_delivered(delivery.id).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::durable::{InMemoryDurableStore, NewAuction};
    use jiff::Timestamp;
    use payloads::UserId;

    #[tokio::test]
    async fn marks_pending_deliveries_delivered_after_delay() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let time = TimeSource::new(Timestamp::now());
        let auction = durable
            .create_auction(NewAuction {
                creator_id: UserId(1),
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 1,
                rounds_count: 1,
                first_round_duration_ms: None,
                round_duration_ms: 60_000,
                start_datetime: time.now(),
            })
            .await
            .unwrap();
        let round = durable
            .create_round(auction.id, 0, time.now(), time.now() + Span::new().milliseconds(60_000))
            .await
            .unwrap();
        durable
            .create_delivery(auction.id, round.id, UserId(7), "widget")
            .await
            .unwrap();

        let fulfillment = DeliveryFulfillment::new(durable.clone(), time.clone(), 5_000);
        fulfillment.tick().await.unwrap();
        let deliveries = durable.list_deliveries(auction.id).await.unwrap();
        assert_eq!(deliveries[0].status, DeliveryStatus::Pending);

        time.advance(Span::new().milliseconds(5_001));
        fulfillment.tick().await.unwrap();
        let deliveries = durable.list_deliveries(auction.id).await.unwrap();
        assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    }
}
