//! The auction state machine: DRAFT → RELEASED → LIVE →
//! FINISHED, with DELETED as a soft-delete from DRAFT only. Round
//! boundaries, anti-sniping extension, and the final refund pass all live
//! here; round-carry itself is `lifecycle::carry`.
//!
//! A change-feed notification and a reconciler tick both resolve to the
//! same call, `handle_event(auction_id)`, which re-reads authoritative
//! state and acts idempotently. The periodic-tick-plus-reconcile shape
//! mirrors a simple polling scheduler, generalized here to also accept
//! externally-triggered events.

pub mod carry;
pub mod timers;

use std::sync::Arc;
use std::time::Duration;

use jiff::Span;
use payloads::{requests::AuctionParams, AuctionId, AuctionStatus, UserId};
use tokio::sync::broadcast;

use crate::error::LifecycleError;
use crate::model::{Auction, Round};
use crate::store::durable::{ChangeEvent, DurableStore, NewAuction};
use crate::store::hot::{CarryTask, HotStore};
use crate::telemetry::log_error;
use crate::time::TimeSource;
use timers::TimerRegistry;

/// Rounds anti-sniping applies to.
#[derive(Debug, Clone)]
pub struct AntiSnipingConfig {
    pub rounds: Vec<u32>,
    pub window_ms: i64,
    pub extension_ms: i64,
}

impl Default for AntiSnipingConfig {
    fn default() -> Self {
        Self {
            rounds: vec![0],
            window_ms: 60_000,
            extension_ms: 30_000,
        }
    }
}

pub struct LifecycleManager {
    durable: Arc<dyn DurableStore>,
    hot: Arc<dyn HotStore>,
    time: TimeSource,
    timers: TimerRegistry,
    pub anti_sniping: AntiSnipingConfig,
    /// Broadcasts an auction id whenever its state changed out from under
    /// a subscriber (round transition, anti-sniping extension, finish) so
    /// the fan-out can force an immediate re-snapshot.
    change_tx: broadcast::Sender<AuctionId>,
}

impl LifecycleManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        hot: Arc<dyn HotStore>,
        time: TimeSource,
        anti_sniping: AntiSnipingConfig,
    ) -> Self {
        let (change_tx, _) = broadcast::channel(1024);
        Self {
            durable,
            hot,
            time,
            timers: TimerRegistry::new(),
            anti_sniping,
            change_tx,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<AuctionId> {
        self.change_tx.subscribe()
    }

    fn notify_changed(&self, auction_id: AuctionId) {
        let _ = self.change_tx.send(auction_id);
    }

    #[tracing::instrument(skip(self, params), fields(creator_id = %creator_id))]
    pub async fn create_auction(
        &self,
        creator_id: UserId,
        params: AuctionParams,
    ) -> Result<Auction, LifecycleError> {
        if params.rounds_count == 0 || params.winners_count_total == 0 || params.min_bid < 1 {
            return Err(LifecycleError::WrongStatus);
        }
        if params.start_datetime <= self.time.now() {
            return Err(LifecycleError::StartNotInFuture);
        }
        let auction = self
            .durable
            .create_auction(NewAuction {
                creator_id,
                display_name: params.display_name,
                item_name: params.item_name,
                min_bid: params.min_bid,
                winners_count_total: params.winners_count_total,
                rounds_count: params.rounds_count,
                first_round_duration_ms: params.first_round_duration_ms,
                round_duration_ms: params.round_duration_ms,
                start_datetime: params.start_datetime,
            })
            .await?;
        Ok(auction)
    }

    #[tracing::instrument(skip(self))]
    pub async fn release_auction(
        &self,
        auction_id: AuctionId,
        caller_id: UserId,
    ) -> Result<(), LifecycleError> {
        let auction = self.get_auction(auction_id).await?;
        if auction.creator_id != caller_id {
            return Err(LifecycleError::NotCreator);
        }
        if auction.status != AuctionStatus::Draft {
            return Err(LifecycleError::WrongStatus);
        }
        if auction.start_datetime <= self.time.now() {
            return Err(LifecycleError::StartNotInFuture);
        }
        self.durable
            .update_auction_status(auction_id, AuctionStatus::Released)
            .await?;
        self.notify_changed(auction_id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_auction(
        &self,
        auction_id: AuctionId,
        caller_id: UserId,
    ) -> Result<(), LifecycleError> {
        let auction = self.get_auction(auction_id).await?;
        if auction.creator_id != caller_id {
            return Err(LifecycleError::NotCreator);
        }
        if auction.status != AuctionStatus::Draft {
            return Err(LifecycleError::WrongStatus);
        }
        self.durable.delete_draft_auction(auction_id).await?;
        Ok(())
    }

    pub async fn get_auction(&self, auction_id: AuctionId) -> Result<Auction, LifecycleError> {
        self.durable
            .get_auction(auction_id)
            .await?
            .ok_or(LifecycleError::AuctionNotFound)
    }

    pub async fn list_rounds(&self, auction_id: AuctionId) -> Result<Vec<Round>, LifecycleError> {
        Ok(self.durable.list_rounds(auction_id).await?)
    }

    async fn current_round(&self, auction: &Auction) -> Result<Option<Round>, LifecycleError> {
        let rounds = self.durable.list_rounds(auction.id).await?;
        Ok(rounds.into_iter().find(|r| r.idx == auction.current_round_idx))
    }

    /// Re-reads an auction's authoritative state and drives it forward if
    /// a transition is due. Safe to call redundantly (from a timer, a
    /// change-feed notification, or the reconciler tick) because every
    /// branch checks the precondition before acting.
    #[tracing::instrument(skip(self))]
    pub async fn handle_event(self: &Arc<Self>, auction_id: AuctionId) {
        if let Err(e) = self.handle_event_inner(auction_id).await {
            log_error(e);
        }
    }

    async fn handle_event_inner(self: &Arc<Self>, auction_id: AuctionId) -> Result<(), LifecycleError> {
        let auction = self.get_auction(auction_id).await?;
        let now = self.time.now();

        match auction.status {
            AuctionStatus::Released => {
                if now >= auction.start_datetime {
                    self.start_auction(&auction).await?;
                }
            }
            AuctionStatus::Live => {
                let Some(round) = self.current_round(&auction).await? else {
                    return Ok(());
                };
                if now.as_millisecond() >= round.effective_end().as_millisecond() {
                    self.advance_round(&auction, &round).await?;
                } else {
                    self.arm_round_timer(&auction, &round);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn start_auction(self: &Arc<Self>, auction: &Auction) -> Result<(), LifecycleError> {
        let duration_ms = auction.first_round_duration_ms.unwrap_or(auction.round_duration_ms);
        let round = self
            .durable
            .create_round(
                auction.id,
                0,
                auction.start_datetime,
                auction.start_datetime + Span::new().milliseconds(duration_ms),
            )
            .await?;
        self.durable
            .update_auction_status(auction.id, AuctionStatus::Live)
            .await?;
        self.notify_changed(auction.id);
        self.arm_round_timer(auction, &round);
        Ok(())
    }

    fn arm_round_timer(self: &Arc<Self>, auction: &Auction, round: &Round) {
        let now_ms = self.time.now().as_millisecond();
        let fire_ms = (round.effective_end().as_millisecond() - now_ms).max(0);
        let manager = self.clone();
        let auction_id = auction.id;
        let delay = Duration::from_millis(fire_ms as u64);
        tokio::spawn(async move {
            let handler = manager.clone();
            manager.timers.arm(auction_id, delay, handler).await;
        });
    }

    #[tracing::instrument(skip(self, auction, round))]
    async fn advance_round(self: &Arc<Self>, auction: &Auction, round: &Round) -> Result<(), LifecycleError> {
        let winner_ids = self.finish_round(auction, round).await?;
        let is_last_round = round.idx + 1 >= auction.rounds_count;

        if is_last_round {
            self.finish_auction(auction, &winner_ids).await?;
        } else {
            let next_idx = round.idx + 1;
            let next_round = self
                .durable
                .create_round(
                    auction.id,
                    next_idx,
                    round.effective_end(),
                    round.effective_end() + Span::new().milliseconds(auction.round_duration_ms),
                )
                .await?;
            let new_remaining =
                auction.remaining_items_count.saturating_sub(winner_ids.len() as u32);
            self.durable
                .advance_current_round(auction.id, next_idx, new_remaining)
                .await?;
            self.hot
                .enqueue_carry_task(&CarryTask {
                    auction_id: auction.id,
                    current_round_id: round.id,
                    next_round_id: next_round.id,
                    winners_per_round: auction.winners_per_round(),
                })
                .await?;
            self.notify_changed(auction.id);
            self.arm_round_timer(auction, &next_round);
        }
        Ok(())
    }

    /// Closes out a round: takes the top `winners_per_round` bids and
    /// creates their deliveries. Returns the winners for use by
    /// `finish_auction` when this was the final round.
    async fn finish_round(&self, auction: &Auction, round: &Round) -> Result<Vec<UserId>, LifecycleError> {
        let ranked = self.hot.ranked_bids(auction.id, round.id).await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let winners_per_round = auction.winners_per_round() as usize;
        let winners: Vec<_> = ranked.into_iter().take(winners_per_round).collect();

        for winner in &winners {
            self.durable
                .create_delivery(auction.id, round.id, winner.user_id, &auction.item_name)
                .await?;
        }
        self.durable
            .notify_change(ChangeEvent {
                auction_id: auction.id,
                hint: crate::store::durable::ChangeHint::DeliveryUpdated,
            })
            .await?;

        Ok(winners.into_iter().map(|b| b.user_id).collect())
    }

    /// Closes out the auction and refunds every non-winner's "new
    /// money": the sum of amounts actually debited via `PlaceBid`,
    /// excluding carried-forward merges. A non-winner is anyone who never
    /// won a delivery in *any* round, not just the final one — an
    /// earlier-round winner who stopped bidding keeps their stake.
    async fn finish_auction(
        &self,
        auction: &Auction,
        final_round_winners: &[UserId],
    ) -> Result<(), LifecycleError> {
        let all_winners: std::collections::HashSet<UserId> = self
            .durable
            .list_deliveries(auction.id)
            .await?
            .into_iter()
            .map(|d| d.winner_user_id)
            .collect();
        let contributions = self.hot.all_new_money(auction.id).await?;
        for (user_id, amount) in contributions {
            if amount <= 0 || all_winners.contains(&user_id) {
                continue;
            }
            if let Err(e) = self.hot.credit_balance(user_id, amount).await {
                log_error(e);
            }
        }
        let new_remaining = auction
            .remaining_items_count
            .saturating_sub(final_round_winners.len() as u32);
        self.durable
            .advance_current_round(auction.id, auction.current_round_idx, new_remaining)
            .await?;
        self.durable
            .update_auction_status(auction.id, AuctionStatus::Finished)
            .await?;
        self.timers.cancel(auction.id).await;
        self.notify_changed(auction.id);
        Ok(())
    }

    /// Anti-sniping extension: called by the bid engine post-commit when
    /// a top-3 bid lands within `window_ms` of an eligible round's end.
    #[tracing::instrument(skip(self))]
    pub async fn maybe_extend_round(
        self: &Arc<Self>,
        auction_id: AuctionId,
    ) -> Result<(), LifecycleError> {
        let auction = self.get_auction(auction_id).await?;
        let Some(round) = self.current_round(&auction).await? else {
            return Ok(());
        };
        let now = self.time.now();
        let new_extended_until = now + Span::new().milliseconds(self.anti_sniping.extension_ms);
        let extended_until = match round.extended_until {
            Some(existing) if existing >= new_extended_until => existing,
            _ => new_extended_until,
        };
        self.durable.extend_round(round.id, extended_until).await?;
        self.notify_changed(auction_id);

        let updated_round = Round {
            extended_until: Some(extended_until),
            ..round
        };
        self.arm_round_timer(&auction, &updated_round);
        Ok(())
    }

    /// Applies to a round just as the bid engine is about to check
    /// eligibility: is `idx` one of the configured anti-sniping rounds?
    pub fn is_anti_sniping_round(&self, idx: u32) -> bool {
        self.anti_sniping.rounds.contains(&idx)
    }

    pub fn anti_sniping_window_ms(&self) -> i64 {
        self.anti_sniping.window_ms
    }

    /// The 10-s reconciler fallback. Walks every
    /// non-finished auction and re-applies `handle_event`, catching up
    /// whatever a missed change-feed notification or a timer that never
    /// fired left behind.
    pub async fn reconcile_tick(self: &Arc<Self>) {
        let auctions = match self.durable.list_auctions().await {
            Ok(a) => a,
            Err(e) => {
                log_error(e);
                return;
            }
        };
        for auction in auctions {
            if matches!(auction.status, AuctionStatus::Released | AuctionStatus::Live) {
                self.handle_event(auction.id).await;
            }
        }
    }

    pub async fn run_reconciler(self: Arc<Self>, tick_interval: Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            self.reconcile_tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::hot::{HotStore, InMemoryHotStore, PlaceBidArgs};
    use jiff::Timestamp;
    use payloads::IdempotencyKey;

    fn params(start_in_ms: i64, now: Timestamp) -> AuctionParams {
        AuctionParams {
            display_name: None,
            item_name: "widget".into(),
            min_bid: 100,
            winners_count_total: 1,
            rounds_count: 2,
            first_round_duration_ms: Some(5_000),
            round_duration_ms: 5_000,
            start_datetime: now + Span::new().milliseconds(start_in_ms),
        }
    }

    fn manager(time: TimeSource) -> (Arc<LifecycleManager>, Arc<InMemoryDurableStore>, Arc<InMemoryHotStore>) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let hot = Arc::new(InMemoryHotStore::new());
        let manager = Arc::new(LifecycleManager::new(
            durable.clone(),
            hot.clone(),
            time,
            AntiSnipingConfig::default(),
        ));
        (manager, durable, hot)
    }

    #[tokio::test]
    async fn released_auction_goes_live_once_start_time_passes() {
        let time = TimeSource::new(Timestamp::now());
        let (manager, _durable, _hot) = manager(time.clone());
        let auction = manager
            .create_auction(UserId(1), params(1_000, time.now()))
            .await
            .unwrap();
        manager.release_auction(auction.id, UserId(1)).await.unwrap();

        time.advance(Span::new().milliseconds(1_001));
        manager.handle_event(auction.id).await;

        let updated = manager.get_auction(auction.id).await.unwrap();
        assert_eq!(updated.status, AuctionStatus::Live);
        assert_eq!(updated.current_round_idx, 0);
    }

    #[tokio::test]
    async fn round_boundary_carries_losers_and_finishes_last_round() {
        let time = TimeSource::new(Timestamp::now());
        let (manager, durable, hot) = manager(time.clone());
        let auction = manager
            .create_auction(UserId(1), params(0, time.now()))
            .await
            .unwrap();
        manager.release_auction(auction.id, UserId(1)).await.unwrap();
        time.advance(Span::new().milliseconds(1));
        manager.handle_event(auction.id).await;

        hot.set_balance(UserId(10), 1_000).await.unwrap();
        hot.set_balance(UserId(20), 1_000).await.unwrap();
        let live = manager.get_auction(auction.id).await.unwrap();
        let round0 = durable
            .list_rounds(auction.id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.idx == 0)
            .unwrap();
        hot.place_bid(PlaceBidArgs {
            auction_id: auction.id,
            round_id: round0.id,
            user_id: UserId(10),
            amount: 100,
            idempotency_key: IdempotencyKey("k1".into()),
            add_to_existing: false,
            min_bid_for_round: live.min_bid_for_round(0),
            winners_per_round: 1,
            is_first_round: true,
            effective_end_ms: round0.effective_end().as_millisecond(),
            now_ms: time.now().as_millisecond(),
        })
        .await
        .unwrap();
        hot.place_bid(PlaceBidArgs {
            auction_id: auction.id,
            round_id: round0.id,
            user_id: UserId(20),
            amount: 200,
            idempotency_key: IdempotencyKey("k2".into()),
            add_to_existing: false,
            min_bid_for_round: live.min_bid_for_round(0),
            winners_per_round: 1,
            is_first_round: true,
            effective_end_ms: round0.effective_end().as_millisecond(),
            now_ms: time.now().as_millisecond(),
        })
        .await
        .unwrap();

        time.advance(Span::new().milliseconds(5_001));
        manager.handle_event(auction.id).await;

        let advanced = manager.get_auction(auction.id).await.unwrap();
        assert_eq!(advanced.current_round_idx, 1);
        let deliveries = durable.list_deliveries(auction.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].winner_user_id, UserId(20));

        let task = hot.dequeue_carry_task().await.unwrap().unwrap();
        assert_eq!(task.winners_per_round, 1);
    }

    #[tokio::test]
    async fn rejects_start_datetime_not_in_future() {
        let time = TimeSource::new(Timestamp::now());
        let (manager, _durable, _hot) = manager(time.clone());
        let mut p = params(0, time.now());
        p.start_datetime = time.now();
        let err = manager.create_auction(UserId(1), p).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartNotInFuture));
    }
}
