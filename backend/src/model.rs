//! Domain types shared by the store layer, the bid engine, the lifecycle
//! manager, and the fan-out. These are the in-process representations;
//! `payloads::responses` holds the wire-shaped projections sent to
//! subscribers.

use jiff::Timestamp;
use payloads::{AuctionId, AuctionStatus, DeliveryId, DeliveryStatus, RoundId, UserId};

/// Immutable-after-release auction configuration plus the mutable fields
/// the lifecycle manager owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    pub id: AuctionId,
    pub creator_id: UserId,
    pub display_name: Option<String>,
    pub item_name: String,
    pub min_bid: i64,
    pub winners_count_total: u32,
    pub rounds_count: u32,
    pub first_round_duration_ms: Option<i64>,
    pub round_duration_ms: i64,
    pub start_datetime: Timestamp,
    pub status: AuctionStatus,
    pub current_round_idx: u32,
    pub remaining_items_count: u32,
}

impl Auction {
    pub fn winners_per_round(&self) -> u32 {
        round_div(self.winners_count_total, self.rounds_count)
    }

    pub fn planned_end_datetime(&self) -> Timestamp {
        let first = self.first_round_duration_ms.unwrap_or(self.round_duration_ms);
        let rest = self.round_duration_ms * i64::from(self.rounds_count.saturating_sub(1));
        self.start_datetime + jiff::Span::new().milliseconds(first + rest)
    }

    /// `min_bid_for_round(idx) = round(base_min_bid * (1 + 0.05 * idx))`.
    pub fn min_bid_for_round(&self, idx: u32) -> i64 {
        let factor = 1.0 + 0.05 * f64::from(idx);
        (self.min_bid as f64 * factor).round() as i64
    }
}

/// Integer division rounded to nearest, matching the glossary's
/// "winners-per-round = round(N/R)".
fn round_div(n: u32, d: u32) -> u32 {
    ((n as f64) / (d as f64)).round() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub auction_id: AuctionId,
    pub id: RoundId,
    pub idx: u32,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub extended_until: Option<Timestamp>,
}

impl Round {
    pub fn effective_end(&self) -> Timestamp {
        self.extended_until.unwrap_or(self.ended_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bid {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub amount: i64,
    pub is_top3_sniping_bid: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub winner_user_id: UserId,
    pub item_name: String,
    pub status: DeliveryStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
