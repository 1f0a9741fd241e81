use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{AuctionId, AuctionStatus, DeliveryStatus, ErrorKind, RoundId, UserId};

/// Result of a successful `PlaceBid` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidPlaced {
    pub round_id: RoundId,
    pub amount: i64,
    pub place: u32,
    pub remaining_balance: i64,
    pub is_top3_sniping_bid: bool,
}

/// Structured context accompanying a rejected `PlaceBid` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidError {
    pub error: ErrorKind,
    pub place: Option<u32>,
    pub winners_per_round: Option<u32>,
}

impl BidError {
    pub fn simple(error: ErrorKind) -> Self {
        Self {
            error,
            place: None,
            winners_per_round: None,
        }
    }
}

/// One ranked bid entry as shown to subscribers. The user id is always the external (caller-supplied)
/// integer id, never an internal store id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidView {
    pub user_id: UserId,
    pub amount: i64,
    pub place: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub idx: u32,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub extended_until: Option<Timestamp>,
    pub time_remaining_ms: i64,
}

/// The full state snapshot sent to a subscriber immediately on `subscribe`
/// and again whenever the dedup hash changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub auction_id: AuctionId,
    pub display_name: Option<String>,
    pub item_name: String,
    pub status: AuctionStatus,
    pub current_round_idx: u32,
    pub rounds_count: u32,
    pub remaining_items_count: u32,
    pub min_bid_for_round: i64,
    pub base_min_bid: i64,
    pub time_until_start_ms: Option<i64>,
    pub round: Option<RoundSnapshot>,
    pub top_bids: Vec<BidView>,
    pub all_bids: Vec<BidView>,
    pub your_bid: Option<BidView>,
}

/// A lightweight tick broadcast every ~100ms carrying no ranking data,
/// so subscribers can animate a countdown without a full re-snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeUpdate {
    pub auction_id: AuctionId,
    pub round_idx: Option<u32>,
    pub time_remaining_ms: Option<i64>,
    pub time_until_start_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub winner_user_id: UserId,
    pub item_name: String,
    pub status: DeliveryStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Server -> client messages over the fan-out's bidirectional channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(AuctionSnapshot),
    TimeUpdate(TimeUpdate),
    Pong,
    BidSuccess(BidPlaced),
    BidError(BidError),
}
