//! The round-carry worker. Drains
//! `bid_transfer_queue` one task at a time and merges each non-winning
//! bid from the finished round into the next round, using a deterministic
//! idempotency key so a requeued task (after a transient fault) has no
//! double effect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use payloads::IdempotencyKey;
use tokio::sync::Mutex;

use crate::store::hot::{CarryTask, HotStore};
use crate::telemetry::log_error;

pub struct CarryWorker {
    hot: Arc<dyn HotStore>,
    /// Guards a (current_round, next_round) pair against being drained
    /// twice concurrently.
    processing: Mutex<HashSet<(uuid::Uuid, uuid::Uuid)>>,
}

impl CarryWorker {
    pub fn new(hot: Arc<dyn HotStore>) -> Self {
        Self {
            hot,
            processing: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self) {
        loop {
            match self.hot.dequeue_carry_task().await {
                Ok(Some(task)) => {
                    let _ = self.process(task).await.map_err(log_error);
                }
                Ok(None) => continue,
                Err(e) => {
                    log_error(e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    #[tracing::instrument(skip(self, task), fields(auction_id = %task.auction_id))]
    async fn process(&self, task: CarryTask) -> anyhow::Result<()> {
        let dedup_key = (task.current_round_id.0, task.next_round_id.0);
        {
            let mut processing = self.processing.lock().await;
            if !processing.insert(dedup_key) {
                return Ok(());
            }
        }
        let result = self.process_inner(&task).await;
        self.processing.lock().await.remove(&dedup_key);
        result
    }

    async fn process_inner(&self, task: &CarryTask) -> anyhow::Result<()> {
        let ranked = self
            .hot
            .ranked_bids(task.auction_id, task.current_round_id)
            .await?;
        let losers = ranked.into_iter().skip(task.winners_per_round as usize);

        for bid in losers {
            let idempotency_key = IdempotencyKey(format!(
                "transfer-{}-{}-{}",
                task.current_round_id, bid.user_id, bid.updated_at_ms
            ));
            self.hot
                .merge_bid(
                    task.auction_id,
                    task.next_round_id,
                    bid.user_id,
                    bid.amount,
                    &idempotency_key,
                    bid.updated_at_ms,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hot::{HotStore, InMemoryHotStore, PlaceBidArgs};
    use payloads::{AuctionId, RoundId, UserId};

    fn bid_args(user_id: i64, amount: i64, key: &str) -> PlaceBidArgs {
        PlaceBidArgs {
            auction_id: AuctionId(uuid::Uuid::nil()),
            round_id: RoundId(uuid::Uuid::from_u128(1)),
            user_id: UserId(user_id),
            amount,
            idempotency_key: IdempotencyKey(key.to_string()),
            add_to_existing: false,
            min_bid_for_round: 100,
            winners_per_round: 1,
            is_first_round: true,
            effective_end_ms: 1_000_000,
            now_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn carries_non_winners_into_the_next_round() {
        let hot = Arc::new(InMemoryHotStore::new());
        hot.set_balance(UserId(1), 1_000).await.unwrap();
        hot.set_balance(UserId(2), 1_000).await.unwrap();
        hot.place_bid(bid_args(1, 100, "k1")).await.unwrap();
        hot.place_bid(bid_args(2, 200, "k2")).await.unwrap();

        let worker = CarryWorker::new(hot.clone());
        let task = CarryTask {
            auction_id: AuctionId(uuid::Uuid::nil()),
            current_round_id: RoundId(uuid::Uuid::from_u128(1)),
            next_round_id: RoundId(uuid::Uuid::from_u128(2)),
            winners_per_round: 1,
        };
        worker.process(task).await.unwrap();

        let carried = hot
            .get_bid(
                AuctionId(uuid::Uuid::nil()),
                RoundId(uuid::Uuid::from_u128(2)),
                UserId(1),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(carried.amount, 100);

        let winner_carried = hot
            .get_bid(
                AuctionId(uuid::Uuid::nil()),
                RoundId(uuid::Uuid::from_u128(2)),
                UserId(2),
            )
            .await
            .unwrap();
        assert!(winner_carried.is_none());
    }

    #[tokio::test]
    async fn replaying_a_carry_task_is_a_noop() {
        let hot = Arc::new(InMemoryHotStore::new());
        hot.set_balance(UserId(1), 1_000).await.unwrap();
        hot.place_bid(bid_args(1, 100, "k1")).await.unwrap();

        let worker = CarryWorker::new(hot.clone());
        let task = CarryTask {
            auction_id: AuctionId(uuid::Uuid::nil()),
            current_round_id: RoundId(uuid::Uuid::from_u128(1)),
            next_round_id: RoundId(uuid::Uuid::from_u128(2)),
            winners_per_round: 0,
        };
        worker.process_inner(&task).await.unwrap();
        worker.process_inner(&task).await.unwrap();

        let carried = hot
            .get_bid(
                AuctionId(uuid::Uuid::nil()),
                RoundId(uuid::Uuid::from_u128(2)),
                UserId(1),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(carried.amount, 100);
    }
}
