use serde::{Deserialize, Serialize};

use crate::{AuctionId, IdempotencyKey, RoundId, UserId};

pub const DISPLAY_NAME_MAX_LEN: usize = 120;
pub const ITEM_NAME_MAX_LEN: usize = 120;

/// Parameters supplied by the collaborator surface when configuring an
/// auction at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionParams {
    pub display_name: Option<String>,
    pub item_name: String,
    pub min_bid: i64,
    pub winners_count_total: u32,
    pub rounds_count: u32,
    pub first_round_duration_ms: Option<i64>,
    pub round_duration_ms: i64,
    pub start_datetime: jiff::Timestamp,
}

/// Place or augment a bid. `add_to_existing = true` requires an existing
/// bid in the current round for this user; `false` creates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBid {
    pub auction_id: AuctionId,
    pub amount: i64,
    pub idempotency_key: IdempotencyKey,
    pub add_to_existing: bool,
}

/// Client -> server messages over the fan-out's bidirectional channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        auction_id: AuctionId,
        user_id: Option<UserId>,
    },
    Ping,
    Bid(PlaceBid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopBidsQuery {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub k: usize,
}
