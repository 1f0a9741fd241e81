//! Wire types shared between the auction core and anything that calls into
//! it (the collaborator-owned HTTP/WebSocket surface, tests, and the core's
//! own subscription channel).
//!
//! Id type wrappers help ensure we don't mix up ids for different entities
//! at a call site; each is a thin `Display`-able newtype, the same
//! convention the store layer uses for its own row ids.

pub mod requests;
pub mod responses;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct AuctionId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct RoundId(pub Uuid);

/// A per-user integer identifier, supplied by the collaborator-owned auth
/// layer on every authenticated call. Not a uuid.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct UserId(pub i64);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct DeliveryId(pub Uuid);

/// Globally unique key that dedupes retried bid submissions. A newtype
/// rather than a bare `String` so it can't be confused with other
/// caller-supplied strings at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct IdempotencyKey(pub String);

/// Auction lifecycle status. Transitions are monotonic; see
/// `backend::lifecycle` for the state machine that enforces this.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "auction_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum AuctionStatus {
    Draft,
    Released,
    Live,
    Finished,
    Deleted,
}

/// Delivery fulfillment status for a single winner/round/item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "delivery_status", rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// Stable error-kind strings returned to callers in the `{error: <kind>}`
/// envelope. Kept separate from the backend's internal
/// `thiserror` enums so the wire contract doesn't shift shape when
/// internal error handling is refactored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuctionNotLive,
    RoundEnded,
    RoundNotFound,
    BelowMinBid,
    NoExistingBid,
    AlreadyFirstPlace,
    AlreadyInWinningTop,
    InsufficientBalance,
    BidExists,
    AlreadyProcessed,
    Validation,
    Authorization,
    NotFound,
    Internal,
}
