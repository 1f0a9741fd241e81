//! Subscription fan-out. A subscriber gets an immediate
//! snapshot, then a lightweight time tick roughly every 100ms and a full
//! re-snapshot whenever the ranking actually changes (content-hash dedup
//! over the top-10 plus total bid count) or the lifecycle manager reports
//! a state change out-of-band (round boundary, anti-sniping extension,
//! finish).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use payloads::{
    responses::{AuctionSnapshot, RoundSnapshot, ServerMessage, TimeUpdate},
    AuctionId, AuctionStatus, UserId,
};
use tokio::sync::{broadcast, Mutex};

use crate::bid_engine::BidEngine;
use crate::lifecycle::LifecycleManager;
use crate::telemetry::log_error;
use crate::time::TimeSource;

const CHANNEL_CAPACITY: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_millis(100);

struct AuctionChannel {
    tx: broadcast::Sender<ServerMessage>,
    last_hash: Option<u64>,
}

pub struct Fanout {
    bid_engine: Arc<BidEngine>,
    lifecycle: Arc<LifecycleManager>,
    time: TimeSource,
    channels: Mutex<HashMap<AuctionId, AuctionChannel>>,
}

impl Fanout {
    pub fn new(bid_engine: Arc<BidEngine>, lifecycle: Arc<LifecycleManager>, time: TimeSource) -> Self {
        Self {
            bid_engine,
            lifecycle,
            time,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, auction_id: AuctionId) -> broadcast::Receiver<ServerMessage> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(auction_id)
            .or_insert_with(|| AuctionChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                last_hash: None,
            })
            .tx
            .subscribe()
    }

    fn send(&self, channels: &HashMap<AuctionId, AuctionChannel>, auction_id: AuctionId, msg: ServerMessage) {
        if let Some(chan) = channels.get(&auction_id) {
            let _ = chan.tx.send(msg);
        }
    }

    /// Computes the current snapshot for one subscriber. `user_id` fills in
    /// `your_bid` when present; otherwise it's omitted.
    pub async fn snapshot(
        &self,
        auction_id: AuctionId,
        user_id: Option<UserId>,
    ) -> Result<AuctionSnapshot, crate::error::LifecycleError> {
        let auction = self.lifecycle.get_auction(auction_id).await?;
        let now = self.time.now();

        let (round, top_bids, all_bids, your_bid) = if auction.status == AuctionStatus::Live {
            let rounds = self
                .lifecycle_rounds(auction_id)
                .await
                .unwrap_or_default();
            if let Some(r) = rounds.into_iter().find(|r| r.idx == auction.current_round_idx) {
                let top = self
                    .bid_engine
                    .top_bids(auction_id, r.id, 10)
                    .await
                    .unwrap_or_default();
                let all = self
                    .bid_engine
                    .top_bids(auction_id, r.id, usize::MAX)
                    .await
                    .unwrap_or_default();
                let yours = match user_id {
                    Some(uid) => self.bid_engine.user_bid(auction_id, r.id, uid).await.ok().flatten(),
                    None => None,
                };
                let remaining_ms = (r.effective_end().as_millisecond() - now.as_millisecond()).max(0);
                (
                    Some(RoundSnapshot {
                        idx: r.idx,
                        started_at: r.started_at,
                        ended_at: r.ended_at,
                        extended_until: r.extended_until,
                        time_remaining_ms: remaining_ms,
                    }),
                    top,
                    all,
                    yours,
                )
            } else {
                (None, Vec::new(), Vec::new(), None)
            }
        } else {
            (None, Vec::new(), Vec::new(), None)
        };

        let time_until_start_ms = if auction.status == AuctionStatus::Released {
            Some((auction.start_datetime.as_millisecond() - now.as_millisecond()).max(0))
        } else {
            None
        };

        Ok(AuctionSnapshot {
            auction_id,
            display_name: auction.display_name.clone(),
            item_name: auction.item_name.clone(),
            status: auction.status,
            current_round_idx: auction.current_round_idx,
            rounds_count: auction.rounds_count,
            remaining_items_count: auction.remaining_items_count,
            min_bid_for_round: auction.min_bid_for_round(auction.current_round_idx),
            base_min_bid: auction.min_bid,
            time_until_start_ms,
            round,
            top_bids,
            all_bids,
            your_bid,
        })
    }

    async fn lifecycle_rounds(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<crate::model::Round>, crate::error::LifecycleError> {
        // Reuses the durable store directly; the lifecycle manager doesn't
        // expose round listing since it's an implementation detail of its
        // own state machine, but the fan-out needs it for the snapshot.
        self.lifecycle.list_rounds(auction_id).await
    }

    fn content_hash(snapshot: &AuctionSnapshot) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        snapshot.current_round_idx.hash(&mut hasher);
        snapshot.status.hash_key().hash(&mut hasher);
        snapshot.all_bids.len().hash(&mut hasher);
        for bid in snapshot.top_bids.iter().take(10) {
            bid.user_id.0.hash(&mut hasher);
            bid.amount.hash(&mut hasher);
            bid.place.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Forces an immediate re-snapshot broadcast, bypassing the dedup hash.
    /// Called right after a REST `PlaceBid` commits so the bidder's own
    /// client doesn't have to wait for the next tick.
    pub async fn notify_bid(&self, auction_id: AuctionId) {
        self.broadcast_snapshot(auction_id, true).await;
    }

    async fn broadcast_snapshot(&self, auction_id: AuctionId, force: bool) {
        let snapshot = match self.snapshot(auction_id, None).await {
            Ok(s) => s,
            Err(e) => {
                log_error(e);
                return;
            }
        };
        let hash = Self::content_hash(&snapshot);
        let mut channels = self.channels.lock().await;
        let Some(chan) = channels.get_mut(&auction_id) else {
            return;
        };
        if !force && chan.last_hash == Some(hash) {
            return;
        }
        chan.last_hash = Some(hash);
        let _ = chan.tx.send(ServerMessage::Snapshot(snapshot));
    }

    async fn broadcast_time_update(&self, auction_id: AuctionId) {
        let auction = match self.lifecycle.get_auction(auction_id).await {
            Ok(a) => a,
            Err(_) => return,
        };
        let now = self.time.now();
        let (round_idx, time_remaining_ms, time_until_start_ms) = match auction.status {
            AuctionStatus::Live => {
                let rounds = self.lifecycle_rounds(auction_id).await.unwrap_or_default();
                let remaining = rounds
                    .into_iter()
                    .find(|r| r.idx == auction.current_round_idx)
                    .map(|r| (r.effective_end().as_millisecond() - now.as_millisecond()).max(0));
                (Some(auction.current_round_idx), remaining, None)
            }
            AuctionStatus::Released => (
                None,
                None,
                Some((auction.start_datetime.as_millisecond() - now.as_millisecond()).max(0)),
            ),
            _ => (None, None, None),
        };
        let channels = self.channels.lock().await;
        self.send(
            &channels,
            auction_id,
            ServerMessage::TimeUpdate(TimeUpdate {
                auction_id,
                round_idx,
                time_remaining_ms,
                time_until_start_ms,
            }),
        );
    }

    /// The two ~100ms tickers plus a listener
    /// on the lifecycle manager's change feed for out-of-band updates.
    pub async fn run(self: Arc<Self>) {
        let mut change_rx = self.lifecycle.subscribe_changes();
        let ticker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let auction_ids: Vec<AuctionId> = {
                    let channels = ticker.channels.lock().await;
                    channels.keys().copied().collect()
                };
                for auction_id in auction_ids {
                    ticker.broadcast_time_update(auction_id).await;
                    ticker.broadcast_snapshot(auction_id, false).await;
                }
            }
        });

        loop {
            match change_rx.recv().await {
                Ok(auction_id) => self.broadcast_snapshot(auction_id, true).await,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

trait StatusHashKey {
    fn hash_key(&self) -> u8;
}

impl StatusHashKey for AuctionStatus {
    fn hash_key(&self) -> u8 {
        match self {
            AuctionStatus::Draft => 0,
            AuctionStatus::Released => 1,
            AuctionStatus::Live => 2,
            AuctionStatus::Finished => 3,
            AuctionStatus::Deleted => 4,
        }
    }
}
