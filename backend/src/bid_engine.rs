//! `PlaceBid` and its read-side companions. The engine owns
//! the pre-script validation that needs the round/auction's durable state
//! (is the auction live, does the round exist, is the amount a positive
//! integer) and hands the rest to the hot store's atomic script; it then
//! turns the script's outcome into a `payloads::responses::BidPlaced` or a
//! typed `BidError`.

use std::sync::Arc;

use payloads::{responses::BidPlaced, AuctionId, AuctionStatus, IdempotencyKey, RoundId, UserId};

use crate::error::BidError;
use crate::lifecycle::LifecycleManager;
use crate::model::{Auction, Round};
use crate::store::durable::DurableStore;
use crate::store::hot::{HotStore, PlaceBidArgs, PlaceBidOutcome};
use crate::time::TimeSource;

pub struct BidEngine {
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn DurableStore>,
    time: TimeSource,
    lifecycle: Arc<LifecycleManager>,
}

impl BidEngine {
    pub fn new(
        hot: Arc<dyn HotStore>,
        durable: Arc<dyn DurableStore>,
        time: TimeSource,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            hot,
            durable,
            time,
            lifecycle,
        }
    }

    #[tracing::instrument(skip(self), fields(auction_id = %auction_id, user_id = %user_id))]
    pub async fn place_bid(
        &self,
        auction_id: AuctionId,
        user_id: UserId,
        amount: i64,
        idempotency_key: IdempotencyKey,
        add_to_existing: bool,
    ) -> Result<BidPlaced, BidError> {
        if amount <= 0 {
            return Err(BidError::InvalidAmount);
        }

        let auction = self
            .durable
            .get_auction(auction_id)
            .await?
            .ok_or(BidError::AuctionNotLive)?;
        if auction.status != AuctionStatus::Live {
            return Err(BidError::AuctionNotLive);
        }

        let round = self.current_round(&auction).await?;

        let now = self.time.now();
        let now_ms = now.as_millisecond();
        if now_ms >= round.effective_end().as_millisecond() {
            return Err(BidError::RoundEnded);
        }

        let min_bid = auction.min_bid_for_round(auction.current_round_idx);
        let winners_per_round = auction.winners_per_round();
        let is_first_round = auction.current_round_idx == 0;

        let outcome = self
            .hot
            .place_bid(PlaceBidArgs {
                auction_id,
                round_id: round.id,
                user_id,
                amount,
                idempotency_key,
                add_to_existing,
                min_bid_for_round: min_bid,
                winners_per_round,
                is_first_round,
                effective_end_ms: round.effective_end().as_millisecond(),
                now_ms,
            })
            .await?;

        let was_committed = matches!(outcome, PlaceBidOutcome::Committed { .. });
        let placed = self
            .outcome_to_result(auction_id, round.id, user_id, outcome)
            .await?;

        // Anti-sniping: a top-3 bid landing within the configured window
        // of an eligible round's end pushes the deadline back. Only a
        // genuine commit triggers this — a replayed idempotency key
        // already extended the round the first time.
        if was_committed
            && self.lifecycle.is_anti_sniping_round(auction.current_round_idx)
            && placed.place >= 1
            && placed.place <= 3
        {
            let remaining_ms = round.effective_end().as_millisecond() - now_ms;
            if remaining_ms <= self.lifecycle.anti_sniping_window_ms() {
                if let Err(e) = self.lifecycle.maybe_extend_round(auction_id).await {
                    crate::telemetry::log_error(e);
                }
            }
        }

        Ok(placed)
    }

    async fn outcome_to_result(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
        outcome: PlaceBidOutcome,
    ) -> Result<BidPlaced, BidError> {
        match outcome {
            PlaceBidOutcome::Committed { bid, new_balance }
            | PlaceBidOutcome::Replayed { bid, new_balance } => {
                let place = self
                    .hot
                    .rank(auction_id, round_id, user_id)
                    .await?
                    .map(|rank| rank + 1)
                    .unwrap_or(0);
                Ok(BidPlaced {
                    round_id,
                    amount: bid.amount,
                    place,
                    remaining_balance: new_balance,
                    is_top3_sniping_bid: place <= 3,
                })
            }
            PlaceBidOutcome::RoundEnded => Err(BidError::RoundEnded),
            PlaceBidOutcome::BelowMinBid { final_amount } => {
                let auction = self
                    .durable
                    .get_auction(auction_id)
                    .await?
                    .ok_or(BidError::AuctionNotLive)?;
                Err(BidError::BelowMinBid {
                    amount: final_amount,
                    min_bid: auction.min_bid_for_round(auction.current_round_idx),
                })
            }
            PlaceBidOutcome::NoExistingBid => Err(BidError::NoExistingBid),
            PlaceBidOutcome::AlreadyFirstPlace => Err(BidError::AlreadyFirstPlace),
            PlaceBidOutcome::AlreadyInWinningTop { .. } => Err(BidError::AlreadyInWinningTop),
            PlaceBidOutcome::InsufficientBalance { balance } => {
                Err(BidError::InsufficientBalance { balance, amount: 0 })
            }
        }
    }

    pub async fn top_bids(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        k: usize,
    ) -> Result<Vec<payloads::responses::BidView>, BidError> {
        let bids = self.hot.ranked_bids(auction_id, round_id).await?;
        Ok(bids
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(i, b)| payloads::responses::BidView {
                user_id: b.user_id,
                amount: b.amount,
                place: (i + 1) as u32,
            })
            .collect())
    }

    pub async fn user_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<payloads::responses::BidView>, BidError> {
        let bid = self.hot.get_bid(auction_id, round_id, user_id).await?;
        let Some(bid) = bid else { return Ok(None) };
        let place = self
            .hot
            .rank(auction_id, round_id, user_id)
            .await?
            .map(|r| r + 1)
            .unwrap_or(0);
        Ok(Some(payloads::responses::BidView {
            user_id: bid.user_id,
            amount: bid.amount,
            place,
        }))
    }

    pub fn min_bid_for_round(&self, auction: &Auction, idx: u32) -> i64 {
        auction.min_bid_for_round(idx)
    }

    async fn current_round(&self, auction: &Auction) -> Result<Round, BidError> {
        let rounds = self.durable.list_rounds(auction.id).await?;
        rounds
            .into_iter()
            .find(|r| r.idx == auction.current_round_idx)
            .ok_or(BidError::RoundNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::durable::{InMemoryDurableStore, NewAuction};
    use crate::store::hot::InMemoryHotStore;
    use jiff::{Span, Timestamp};

    async fn setup() -> (BidEngine, Arc<InMemoryDurableStore>, Arc<InMemoryHotStore>, TimeSource) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let hot = Arc::new(InMemoryHotStore::new());
        let time = TimeSource::new(Timestamp::now());
        let lifecycle = Arc::new(crate::lifecycle::LifecycleManager::new(
            durable.clone(),
            hot.clone(),
            time.clone(),
            crate::lifecycle::AntiSnipingConfig::default(),
        ));
        let engine = BidEngine::new(hot.clone(), durable.clone(), time.clone(), lifecycle);
        (engine, durable, hot, time)
    }

    async fn live_auction_with_round(
        durable: &InMemoryDurableStore,
        time: &TimeSource,
    ) -> (AuctionId, RoundId) {
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
        durable
            .update_auction_status(auction.id, AuctionStatus::Live)
            .await
            .unwrap();
        let round = durable
            .create_round(
                auction.id,
                0,
                time.now(),
                time.now() + Span::new().milliseconds(60_000),
            )
            .await
            .unwrap();
        (auction.id, round.id)
    }

    #[tokio::test]
    async fn rejects_non_positive_amount() {
        let (engine, _durable, _hot, _time) = setup().await;
        let err = engine
            .place_bid(
                AuctionId(uuid::Uuid::nil()),
                UserId(1),
                0,
                IdempotencyKey("k".into()),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BidError::InvalidAmount));
    }

    #[tokio::test]
    async fn places_a_winning_bid() {
        let (engine, durable, hot, time) = setup().await;
        let (auction_id, _round_id) = live_auction_with_round(&durable, &time).await;
        hot.set_balance(UserId(7), 1_000).await.unwrap();

        let placed = engine
            .place_bid(auction_id, UserId(7), 200, IdempotencyKey("k1".into()), false)
            .await
            .unwrap();
        assert_eq!(placed.place, 1);
        assert_eq!(placed.remaining_balance, 800);
    }

    #[tokio::test]
    async fn rejects_bid_below_minimum() {
        let (engine, durable, hot, time) = setup().await;
        let (auction_id, _round_id) = live_auction_with_round(&durable, &time).await;
        hot.set_balance(UserId(7), 1_000).await.unwrap();

        let err = engine
            .place_bid(auction_id, UserId(7), 10, IdempotencyKey("k1".into()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BidError::BelowMinBid { amount: 10, min_bid: 100 }));
    }
}
