//! One pending timer per LIVE auction. Firing just nudges the reconciler to
//! re-read authoritative state for that auction rather than carrying any
//! payload itself, so a timer that fires slightly late or is superseded by
//! the 10-s reconciler tick never produces a wrong effect, only a
//! redundant one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use payloads::AuctionId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::LifecycleManager;

#[derive(Default)]
pub struct TimerRegistry {
    handles: Mutex<HashMap<AuctionId, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer that calls back into the manager after `delay`,
    /// aborting whatever timer was previously armed for this auction.
    pub async fn arm(&self, auction_id: AuctionId, delay: Duration, manager: Arc<LifecycleManager>) {
        let mut handles = self.handles.lock().await;
        if let Some(old) = handles.remove(&auction_id) {
            old.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.handle_event(auction_id).await;
        });
        handles.insert(auction_id, handle);
    }

    pub async fn cancel(&self, auction_id: AuctionId) {
        let mut handles = self.handles.lock().await;
        if let Some(old) = handles.remove(&auction_id) {
            old.abort();
        }
    }
}
