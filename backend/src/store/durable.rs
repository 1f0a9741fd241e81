//! The document store of record: auctions, rounds, and
//! deliveries, plus an eventually-consistent mirror of bids/balances
//! written by `crate::sync`. Postgres's `LISTEN`/`NOTIFY` stands in for the
//! ordered, at-least-once change notifications — no document database
//! with a native change feed is available in this workspace's dependency
//! set, and `PgListener` is the idiomatic way to get the same property
//! out of the store the rest of the workspace already talks to.

use async_trait::async_trait;
use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use payloads::{AuctionId, AuctionStatus, DeliveryId, DeliveryStatus, RoundId, UserId};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::StoreError;
use crate::model::{Auction, Delivery, Round};

const CHANGE_CHANNEL: &str = "auction_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeHint {
    AuctionUpdated,
    RoundAdded,
    RoundUpdated,
    DeliveryUpdated,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent {
    pub auction_id: AuctionId,
    pub hint: ChangeHint,
}

#[derive(Debug, FromRow)]
struct AuctionRow {
    id: AuctionId,
    creator_id: UserId,
    display_name: Option<String>,
    item_name: String,
    min_bid: i64,
    winners_count_total: i32,
    rounds_count: i32,
    first_round_duration_ms: Option<i64>,
    round_duration_ms: i64,
    #[sqlx(try_from = "SqlxTs")]
    start_datetime: Timestamp,
    status: AuctionStatus,
    current_round_idx: i32,
    remaining_items_count: i32,
}

impl From<AuctionRow> for Auction {
    fn from(r: AuctionRow) -> Self {
        Auction {
            id: r.id,
            creator_id: r.creator_id,
            display_name: r.display_name,
            item_name: r.item_name,
            min_bid: r.min_bid,
            winners_count_total: r.winners_count_total as u32,
            rounds_count: r.rounds_count as u32,
            first_round_duration_ms: r.first_round_duration_ms,
            round_duration_ms: r.round_duration_ms,
            start_datetime: r.start_datetime,
            status: r.status,
            current_round_idx: r.current_round_idx as u32,
            remaining_items_count: r.remaining_items_count as u32,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoundRow {
    auction_id: AuctionId,
    id: RoundId,
    idx: i32,
    #[sqlx(try_from = "SqlxTs")]
    started_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    ended_at: Timestamp,
    extended_until: Option<SqlxTs>,
}

impl From<RoundRow> for Round {
    fn from(r: RoundRow) -> Self {
        Round {
            auction_id: r.auction_id,
            id: r.id,
            idx: r.idx as u32,
            started_at: r.started_at,
            ended_at: r.ended_at,
            extended_until: r.extended_until.map(|t| t.to_jiff()),
        }
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: DeliveryId,
    auction_id: AuctionId,
    round_id: RoundId,
    winner_user_id: UserId,
    item_name: String,
    status: DeliveryStatus,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl From<DeliveryRow> for Delivery {
    fn from(r: DeliveryRow) -> Self {
        Delivery {
            id: r.id,
            auction_id: r.auction_id,
            round_id: r.round_id,
            winner_user_id: r.winner_user_id,
            item_name: r.item_name,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BalanceRow {
    user_id: UserId,
    balance: i64,
}

#[derive(Debug, Clone)]
pub struct NewAuction {
    pub creator_id: UserId,
    pub display_name: Option<String>,
    pub item_name: String,
    pub min_bid: i64,
    pub winners_count_total: u32,
    pub rounds_count: u32,
    pub first_round_duration_ms: Option<i64>,
    pub round_duration_ms: i64,
    pub start_datetime: Timestamp,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_auction(&self, params: NewAuction) -> Result<Auction, StoreError>;
    async fn get_auction(&self, id: AuctionId) -> Result<Option<Auction>, StoreError>;
    async fn list_auctions(&self) -> Result<Vec<Auction>, StoreError>;
    async fn update_auction_status(
        &self,
        id: AuctionId,
        status: AuctionStatus,
    ) -> Result<(), StoreError>;
    async fn advance_current_round(
        &self,
        id: AuctionId,
        new_idx: u32,
        remaining_items_count: u32,
    ) -> Result<(), StoreError>;
    async fn delete_draft_auction(&self, id: AuctionId) -> Result<(), StoreError>;

    async fn create_round(
        &self,
        auction_id: AuctionId,
        idx: u32,
        started_at: Timestamp,
        ended_at: Timestamp,
    ) -> Result<Round, StoreError>;
    async fn get_round(&self, id: RoundId) -> Result<Option<Round>, StoreError>;
    async fn list_rounds(&self, auction_id: AuctionId) -> Result<Vec<Round>, StoreError>;
    async fn extend_round(&self, id: RoundId, extended_until: Timestamp) -> Result<(), StoreError>;

    async fn upsert_balance_mirror(
        &self,
        user_id: UserId,
        balance: i64,
    ) -> Result<(), StoreError>;
    async fn get_balance_mirror(&self, user_id: UserId) -> Result<Option<i64>, StoreError>;
    /// Every mirrored balance, for priming the hot store on startup.
    async fn list_balance_mirrors(&self) -> Result<Vec<(UserId, i64)>, StoreError>;

    async fn create_delivery(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        winner_user_id: UserId,
        item_name: &str,
    ) -> Result<DeliveryId, StoreError>;
    async fn list_deliveries(&self, auction_id: AuctionId) -> Result<Vec<Delivery>, StoreError>;
    async fn mark_delivered(&self, id: DeliveryId) -> Result<(), StoreError>;

    async fn notify_change(&self, event: ChangeEvent) -> Result<(), StoreError>;
}

pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Subscribes to the change channel, yielding decoded events as they
    /// arrive. Lives outside `DurableStore` because listening needs a
    /// dedicated connection, not the shared pool.
    pub async fn subscribe(&self) -> Result<sqlx::postgres::PgListener, StoreError> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        Ok(listener)
    }
}

fn decode_notification(payload: &str) -> Option<ChangeEvent> {
    let mut parts = payload.splitn(2, ':');
    let auction_id = parts.next()?.parse::<uuid::Uuid>().ok()?;
    let hint = match parts.next()? {
        "auction_updated" => ChangeHint::AuctionUpdated,
        "round_added" => ChangeHint::RoundAdded,
        "round_updated" => ChangeHint::RoundUpdated,
        "delivery_updated" => ChangeHint::DeliveryUpdated,
        _ => return None,
    };
    Some(ChangeEvent {
        auction_id: AuctionId(auction_id),
        hint,
    })
}

/// Reads the next decoded change event off a listener, skipping
/// malformed payloads rather than failing the subscriber loop.
pub async fn next_change(
    listener: &mut sqlx::postgres::PgListener,
) -> Result<ChangeEvent, StoreError> {
    loop {
        let notification = listener.try_recv().await?;
        let Some(notification) = notification else {
            // Connection recycled; caller's loop will call us again.
            continue;
        };
        if let Some(event) = decode_notification(notification.payload()) {
            return Ok(event);
        }
    }
}

fn encode_notification(event: ChangeEvent) -> String {
    let hint = match event.hint {
        ChangeHint::AuctionUpdated => "auction_updated",
        ChangeHint::RoundAdded => "round_added",
        ChangeHint::RoundUpdated => "round_updated",
        ChangeHint::DeliveryUpdated => "delivery_updated",
    };
    format!("{}:{}", event.auction_id.0, hint)
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn create_auction(&self, params: NewAuction) -> Result<Auction, StoreError> {
        let row = sqlx::query_as::<_, AuctionRow>(
            r#"
            INSERT INTO auctions (
                creator_id, display_name, item_name, min_bid,
                winners_count_total, rounds_count, first_round_duration_ms,
                round_duration_ms, start_datetime, status,
                current_round_idx, remaining_items_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'DRAFT', 0, $5)
            RETURNING *
            "#,
        )
        .bind(params.creator_id)
        .bind(params.display_name)
        .bind(params.item_name)
        .bind(params.min_bid)
        .bind(params.winners_count_total as i32)
        .bind(params.rounds_count as i32)
        .bind(params.first_round_duration_ms)
        .bind(params.round_duration_ms)
        .bind(params.start_datetime.to_sqlx())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_auction(&self, id: AuctionId) -> Result<Option<Auction>, StoreError> {
        let row = sqlx::query_as::<_, AuctionRow>("SELECT * FROM auctions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_auctions(&self) -> Result<Vec<Auction>, StoreError> {
        let rows = sqlx::query_as::<_, AuctionRow>(
            "SELECT * FROM auctions WHERE status != 'DELETED' ORDER BY start_datetime",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_auction_status(
        &self,
        id: AuctionId,
        status: AuctionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE auctions SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        self.notify_change(ChangeEvent {
            auction_id: id,
            hint: ChangeHint::AuctionUpdated,
        })
        .await?;
        Ok(())
    }

    async fn advance_current_round(
        &self,
        id: AuctionId,
        new_idx: u32,
        remaining_items_count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE auctions SET current_round_idx = $2, remaining_items_count = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(new_idx as i32)
        .bind(remaining_items_count as i32)
        .execute(&self.pool)
        .await?;
        self.notify_change(ChangeEvent {
            auction_id: id,
            hint: ChangeHint::RoundUpdated,
        })
        .await?;
        Ok(())
    }

    async fn delete_draft_auction(&self, id: AuctionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auctions WHERE id = $1 AND status = 'DRAFT'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_round(
        &self,
        auction_id: AuctionId,
        idx: u32,
        started_at: Timestamp,
        ended_at: Timestamp,
    ) -> Result<Round, StoreError> {
        let row = sqlx::query_as::<_, RoundRow>(
            r#"
            INSERT INTO auction_rounds (auction_id, idx, started_at, ended_at, extended_until)
            VALUES ($1, $2, $3, $4, NULL)
            RETURNING *
            "#,
        )
        .bind(auction_id)
        .bind(idx as i32)
        .bind(started_at.to_sqlx())
        .bind(ended_at.to_sqlx())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_round(&self, id: RoundId) -> Result<Option<Round>, StoreError> {
        let row = sqlx::query_as::<_, RoundRow>("SELECT * FROM auction_rounds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_rounds(&self, auction_id: AuctionId) -> Result<Vec<Round>, StoreError> {
        let rows = sqlx::query_as::<_, RoundRow>(
            "SELECT * FROM auction_rounds WHERE auction_id = $1 ORDER BY idx",
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn extend_round(&self, id: RoundId, extended_until: Timestamp) -> Result<(), StoreError> {
        sqlx::query("UPDATE auction_rounds SET extended_until = $2 WHERE id = $1")
            .bind(id)
            .bind(extended_until.to_sqlx())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_balance_mirror(
        &self,
        user_id: UserId,
        balance: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET balance = EXCLUDED.balance
            "#,
        )
        .bind(user_id)
        .bind(balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_balance_mirror(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM user_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance)
    }

    async fn list_balance_mirrors(&self) -> Result<Vec<(UserId, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, BalanceRow>("SELECT user_id, balance FROM user_balances")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.user_id, r.balance)).collect())
    }

    async fn create_delivery(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        winner_user_id: UserId,
        item_name: &str,
    ) -> Result<DeliveryId, StoreError> {
        let id: DeliveryId = sqlx::query_scalar(
            r#"
            INSERT INTO deliveries (auction_id, round_id, winner_user_id, item_name, status)
            VALUES ($1, $2, $3, $4, 'PENDING')
            RETURNING id
            "#,
        )
        .bind(auction_id)
        .bind(round_id)
        .bind(winner_user_id)
        .bind(item_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_deliveries(&self, auction_id: AuctionId) -> Result<Vec<Delivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM deliveries WHERE auction_id = $1 ORDER BY created_at",
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_delivered(&self, id: DeliveryId) -> Result<(), StoreError> {
        sqlx::query("UPDATE deliveries SET status = 'DELIVERED' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn notify_change(&self, event: ChangeEvent) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(encode_notification(event))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process double for the lifecycle manager's tests. `notify_change`
/// pushes onto an in-memory queue that `drain_events` lets a test poll,
/// instead of a real Postgres channel.
#[derive(Default)]
struct InMemoryState {
    auctions: HashMap<AuctionId, Auction>,
    rounds: HashMap<RoundId, Round>,
    balances: HashMap<UserId, i64>,
    deliveries: HashMap<DeliveryId, Delivery>,
    events: Vec<ChangeEvent>,
}

pub struct InMemoryDurableStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    pub async fn drain_events(&self) -> Vec<ChangeEvent> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.events)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_auction(&self, params: NewAuction) -> Result<Auction, StoreError> {
        let mut state = self.state.lock().await;
        let auction = Auction {
            id: AuctionId(uuid::Uuid::new_v4()),
            creator_id: params.creator_id,
            display_name: params.display_name,
            item_name: params.item_name,
            min_bid: params.min_bid,
            winners_count_total: params.winners_count_total,
            rounds_count: params.rounds_count,
            first_round_duration_ms: params.first_round_duration_ms,
            round_duration_ms: params.round_duration_ms,
            start_datetime: params.start_datetime,
            status: AuctionStatus::Draft,
            current_round_idx: 0,
            remaining_items_count: params.winners_count_total,
        };
        state.auctions.insert(auction.id, auction.clone());
        Ok(auction)
    }

    async fn get_auction(&self, id: AuctionId) -> Result<Option<Auction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.auctions.get(&id).cloned())
    }

    async fn list_auctions(&self) -> Result<Vec<Auction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .auctions
            .values()
            .filter(|a| a.status != AuctionStatus::Deleted)
            .cloned()
            .collect())
    }

    async fn update_auction_status(
        &self,
        id: AuctionId,
        status: AuctionStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let auction = state
            .auctions
            .get_mut(&id)
            .ok_or(StoreError::AuctionNotFound)?;
        auction.status = status;
        Ok(())
    }

    async fn advance_current_round(
        &self,
        id: AuctionId,
        new_idx: u32,
        remaining_items_count: u32,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let auction = state
            .auctions
            .get_mut(&id)
            .ok_or(StoreError::AuctionNotFound)?;
        auction.current_round_idx = new_idx;
        auction.remaining_items_count = remaining_items_count;
        Ok(())
    }

    async fn delete_draft_auction(&self, id: AuctionId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(auction) = state.auctions.get(&id) {
            if auction.status == AuctionStatus::Draft {
                state.auctions.remove(&id);
            }
        }
        Ok(())
    }

    async fn create_round(
        &self,
        auction_id: AuctionId,
        idx: u32,
        started_at: Timestamp,
        ended_at: Timestamp,
    ) -> Result<Round, StoreError> {
        let mut state = self.state.lock().await;
        let round = Round {
            auction_id,
            id: RoundId(uuid::Uuid::new_v4()),
            idx,
            started_at,
            ended_at,
            extended_until: None,
        };
        state.rounds.insert(round.id, round);
        Ok(round)
    }

    async fn get_round(&self, id: RoundId) -> Result<Option<Round>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rounds.get(&id).copied())
    }

    async fn list_rounds(&self, auction_id: AuctionId) -> Result<Vec<Round>, StoreError> {
        let state = self.state.lock().await;
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.auction_id == auction_id)
            .copied()
            .collect();
        rounds.sort_by_key(|r| r.idx);
        Ok(rounds)
    }

    async fn extend_round(&self, id: RoundId, extended_until: Timestamp) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let round = state.rounds.get_mut(&id).ok_or(StoreError::RoundNotFound)?;
        round.extended_until = Some(extended_until);
        Ok(())
    }

    async fn upsert_balance_mirror(
        &self,
        user_id: UserId,
        balance: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.balances.insert(user_id, balance);
        Ok(())
    }

    async fn get_balance_mirror(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&user_id).copied())
    }

    async fn list_balance_mirrors(&self) -> Result<Vec<(UserId, i64)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.balances.iter().map(|(u, b)| (*u, *b)).collect())
    }

    async fn create_delivery(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        winner_user_id: UserId,
        item_name: &str,
    ) -> Result<DeliveryId, StoreError> {
        let mut state = self.state.lock().await;
        let id = DeliveryId(uuid::Uuid::new_v4());
        let now = Timestamp::now();
        state.deliveries.insert(
            id,
            Delivery {
                id,
                auction_id,
                round_id,
                winner_user_id,
                item_name: item_name.to_string(),
                status: DeliveryStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn list_deliveries(&self, auction_id: AuctionId) -> Result<Vec<Delivery>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .values()
            .filter(|d| d.auction_id == auction_id)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: DeliveryId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let delivery = state
            .deliveries
            .get_mut(&id)
            .ok_or(StoreError::RoundNotFound)?;
        delivery.status = DeliveryStatus::Delivered;
        Ok(())
    }

    async fn notify_change(&self, event: ChangeEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_auction_round_trip() {
        let store = InMemoryDurableStore::new();
        let auction = store
            .create_auction(NewAuction {
                creator_id: UserId(1),
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 3,
                rounds_count: 2,
                first_round_duration_ms: None,
                round_duration_ms: 60_000,
                start_datetime: Timestamp::now(),
            })
            .await
            .unwrap();

        let fetched = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AuctionStatus::Draft);
        assert_eq!(fetched.winners_count_total, 3);
    }

    #[tokio::test]
    async fn notify_change_is_observable_by_drain() {
        let store = InMemoryDurableStore::new();
        let event = ChangeEvent {
            auction_id: AuctionId(uuid::Uuid::nil()),
            hint: ChangeHint::AuctionUpdated,
        };
        store.notify_change(event).await.unwrap();
        let drained = store.drain_events().await;
        assert_eq!(drained.len(), 1);
    }
}
