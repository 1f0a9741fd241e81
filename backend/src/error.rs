//! Error taxonomy for the bid engine and lifecycle manager.
//!
//! Each layer gets its own `thiserror` enum, following the store module's
//! convention of one variant per failure mode with a short `#[error("...")]`
//! message. `kind()` maps a variant onto the stable wire string used in the
//! `{error: <kind>}` envelope; internal faults never leak past
//! `ErrorKind::Internal`.

use payloads::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum BidError {
    #[error("auction is not live")]
    AuctionNotLive,
    #[error("round has ended")]
    RoundEnded,
    #[error("round not found")]
    RoundNotFound,
    #[error("bid amount {amount} is below the minimum of {min_bid} for this round")]
    BelowMinBid { amount: i64, min_bid: i64 },
    #[error("no existing bid to augment")]
    NoExistingBid,
    #[error("already holds first place")]
    AlreadyFirstPlace,
    #[error("already in the winning top for this round")]
    AlreadyInWinningTop,
    #[error("insufficient balance: have {balance}, need {amount}")]
    InsufficientBalance { balance: i64, amount: i64 },
    #[error("a concurrent request already created this bid")]
    BidExists,
    #[error("amount must be a positive integer")]
    InvalidAmount,
    #[error("hot store unavailable")]
    Store(#[from] crate::store::StoreError),
}

impl BidError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuctionNotLive => ErrorKind::AuctionNotLive,
            Self::RoundEnded => ErrorKind::RoundEnded,
            Self::RoundNotFound => ErrorKind::RoundNotFound,
            Self::BelowMinBid { .. } => ErrorKind::BelowMinBid,
            Self::NoExistingBid => ErrorKind::NoExistingBid,
            Self::AlreadyFirstPlace => ErrorKind::AlreadyFirstPlace,
            Self::AlreadyInWinningTop => ErrorKind::AlreadyInWinningTop,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::BidExists => ErrorKind::BidExists,
            Self::InvalidAmount => ErrorKind::Validation,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("auction not found")]
    AuctionNotFound,
    #[error("wrong status for this operation")]
    WrongStatus,
    #[error("only the creator may perform this operation")]
    NotCreator,
    #[error("start_datetime must be in the future")]
    StartNotInFuture,
    #[error("round not found")]
    RoundNotFound,
    #[error("store error")]
    Store(#[from] crate::store::StoreError),
    #[error("unexpected error")]
    Unexpected(#[from] anyhow::Error),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuctionNotFound | Self::RoundNotFound => ErrorKind::NotFound,
            Self::WrongStatus => ErrorKind::Validation,
            Self::NotCreator => ErrorKind::Authorization,
            Self::StartNotInFuture => ErrorKind::Validation,
            Self::Store(_) | Self::Unexpected(_) => ErrorKind::Internal,
        }
    }
}
