//! The two stores backing the auction engine.
//!
//! `hot` is the fast KV store with scripting: authoritative for in-flight
//! bids and balances while an auction is LIVE. `durable` is the document
//! store of record for auctions, rounds, and deliveries, with an
//! eventually-consistent mirror of bids/balances and a change feed the
//! lifecycle manager subscribes to.

pub mod durable;
pub mod hot;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("hot store unavailable")]
    Hot(#[from] redis::RedisError),
    #[error("durable store unavailable")]
    Durable(#[from] sqlx::Error),
    #[error("malformed record in hot store: {0}")]
    Corrupt(String),
    #[error("auction not found")]
    AuctionNotFound,
    #[error("round not found")]
    RoundNotFound,
}
