//! Hot -> durable balance mirroring.
//! The mirror exists so an operator dashboard or a restart-time priming
//! read can see balances without touching the hot store directly; nothing
//! in the bid-placement path depends on it.

use std::sync::Arc;
use std::time::Duration;

use payloads::AuctionStatus;

use crate::lifecycle::LifecycleManager;
use crate::store::durable::DurableStore;
use crate::store::hot::HotStore;
use crate::telemetry::log_error;

pub struct BalanceSync {
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn DurableStore>,
    lifecycle: Arc<LifecycleManager>,
}

impl BalanceSync {
    pub fn new(hot: Arc<dyn HotStore>, durable: Arc<dyn DurableStore>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { hot, durable, lifecycle }
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
        let auctions = self.durable.list_auctions().await?;
        for auction in auctions.into_iter().filter(|a| a.status == AuctionStatus::Live) {
            let rounds = self.lifecycle.list_rounds(auction.id).await?;
            let Some(round) = rounds.into_iter().find(|r| r.idx == auction.current_round_idx) else {
                continue;
            };
            let bids = self.hot.ranked_bids(auction.id, round.id).await?;
            for bid in bids {
                let balance = self.hot.get_balance(bid.user_id).await?.unwrap_or(0);
                self.durable.upsert_balance_mirror(bid.user_id, balance).await?;
            }
        }
        Ok(())
    }
}
