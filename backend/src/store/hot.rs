//! The fast KV store with scripting. `RedisHotStore` is the production backend; `InMemoryHotStore`
//! is a test double implementing the same trait so the bid engine and
//! lifecycle manager can be exercised without a live Redis, the same
//! store-as-a-trait pattern used for `TimeSource` injection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use payloads::{AuctionId, IdempotencyKey, RoundId, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::StoreError;

pub const BID_TTL_SECS: i64 = 24 * 60 * 60;
pub const IDEMPOTENCY_TTL_SECS: i64 = 60 * 60;
pub const TOP_BIDS_CACHE_TTL_SECS: i64 = 5;

/// Encodes `-(amount * 10^12) + timestamp_ms`: ascending order
/// by this score ranks higher amount first, earlier timestamp breaking
/// ties, because rank 0 (the ZRANK-ascending winner) has the most negative
/// score.
pub fn ranking_score(amount: i64, timestamp_ms: i64) -> f64 {
    -(amount as f64) * 1e12 + timestamp_ms as f64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRecord {
    pub user_id: UserId,
    pub amount: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PlaceBidArgs {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub amount: i64,
    pub idempotency_key: IdempotencyKey,
    pub add_to_existing: bool,
    pub min_bid_for_round: i64,
    pub winners_per_round: u32,
    pub is_first_round: bool,
    pub effective_end_ms: i64,
    pub now_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceBidOutcome {
    Committed { bid: BidRecord, new_balance: i64 },
    Replayed { bid: BidRecord, new_balance: i64 },
    RoundEnded,
    BelowMinBid { final_amount: i64 },
    NoExistingBid,
    AlreadyFirstPlace,
    AlreadyInWinningTop { place: u32 },
    InsufficientBalance { balance: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarryTask {
    pub auction_id: AuctionId,
    pub current_round_id: RoundId,
    pub next_round_id: RoundId,
    pub winners_per_round: u32,
}

#[async_trait]
pub trait HotStore: Send + Sync {
    async fn place_bid(
        &self,
        args: PlaceBidArgs,
    ) -> Result<PlaceBidOutcome, StoreError>;

    /// 0-based ascending rank (rank 0 == place 1) within a round's ranking
    /// set, or `None` if the user has no bid in that round.
    async fn rank(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<u32>, StoreError>;

    /// All bids in a round in place order (ascending score).
    async fn ranked_bids(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
    ) -> Result<Vec<BidRecord>, StoreError>;

    async fn get_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<BidRecord>, StoreError>;

    async fn get_balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError>;

    async fn set_balance(&self, user_id: UserId, balance: i64) -> Result<(), StoreError>;

    async fn credit_balance(&self, user_id: UserId, amount: i64) -> Result<i64, StoreError>;

    /// Merge `add_amount` into the bid a user holds in `round_id` (creating
    /// it if absent), updating the ranking set. Used by round-carry
    /// processing, which is idempotent via `idempotency_key`
    /// just like `place_bid`.
    async fn merge_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
        add_amount: i64,
        idempotency_key: &IdempotencyKey,
        now_ms: i64,
    ) -> Result<BidRecord, StoreError>;

    async fn enqueue_carry_task(&self, task: &CarryTask) -> Result<(), StoreError>;

    async fn dequeue_carry_task(&self) -> Result<Option<CarryTask>, StoreError>;

    async fn cache_set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError>;

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// All per-user "new money" totals recorded for an auction: the sum
    /// of every amount a user actually debited via `place_bid`, excluding
    /// carried-forward merges which never touch balance.
    async fn all_new_money(&self, auction_id: AuctionId) -> Result<Vec<(UserId, i64)>, StoreError>;
}

/// The single atomic script backing `PlaceBid`.
/// KEYS: 1=idempotency marker, 2=user balance, 3=bid record, 4=ranking set,
/// 5=new-money hash.
/// ARGV: 1=amount, 2=now_ms, 3=min_bid_for_round, 4=add_to_existing(0/1),
///       5=winners_per_round, 6=is_first_round(0/1), 7=user_id,
///       8=effective_end_ms, 9=bid_ttl_secs, 10=idempotency_ttl_secs.
const PLACE_BID_SCRIPT: &str = r#"
local idem_key = KEYS[1]
local balance_key = KEYS[2]
local bid_key = KEYS[3]
local ranking_key = KEYS[4]
local new_money_key = KEYS[5]

local amount = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local min_bid = tonumber(ARGV[3])
local add_to_existing = ARGV[4] == "1"
local winners_per_round = tonumber(ARGV[5])
local is_first_round = ARGV[6] == "1"
local user_id = ARGV[7]
local effective_end_ms = tonumber(ARGV[8])
local bid_ttl = tonumber(ARGV[9])
local idem_ttl = tonumber(ARGV[10])

local existing_idem = redis.call("GET", idem_key)
if existing_idem then
    local bal = redis.call("GET", balance_key)
    return {"REPLAYED", existing_idem, bal}
end

if now_ms >= effective_end_ms then
    return {"ROUND_ENDED"}
end

local existing_bid_json = redis.call("GET", bid_key)
local existing_amount = 0
if existing_bid_json then
    local existing = cjson.decode(existing_bid_json)
    existing_amount = existing.amount
elseif add_to_existing then
    return {"NO_EXISTING_BID"}
end

if existing_bid_json then
    local rank = redis.call("ZRANK", ranking_key, user_id)
    if rank then
        local place = rank + 1
        if place == 1 then
            return {"ALREADY_FIRST_PLACE"}
        end
        if place <= winners_per_round then
            local exempt = is_first_round and place <= 3
            if not exempt then
                return {"ALREADY_IN_WINNING_TOP", tostring(place)}
            end
        end
    end
end

local final_amount = existing_amount + amount
if final_amount < min_bid then
    return {"BELOW_MIN_BID", tostring(final_amount)}
end

local balance = tonumber(redis.call("GET", balance_key) or "0")
if balance < amount then
    return {"INSUFFICIENT_BALANCE", tostring(balance)}
end

redis.call("DECRBY", balance_key, amount)
local new_balance = balance - amount

local created_at = now_ms
if existing_bid_json then
    local existing = cjson.decode(existing_bid_json)
    created_at = existing.created_at_ms
end

local bid_json = cjson.encode({
    user_id = user_id,
    amount = final_amount,
    created_at_ms = created_at,
    updated_at_ms = now_ms,
})
redis.call("SET", bid_key, bid_json, "EX", bid_ttl)

local score = -(final_amount * 1000000000000) + now_ms
redis.call("ZADD", ranking_key, score, user_id)
redis.call("EXPIRE", ranking_key, bid_ttl)

redis.call("SET", idem_key, bid_json, "EX", idem_ttl)
redis.call("HINCRBY", new_money_key, user_id, amount)

return {"OK", bid_json, tostring(new_balance)}
"#;

/// KEYS: 1=idempotency marker, 2=bid record, 3=ranking set.
/// ARGV: 1=add_amount, 2=now_ms, 3=user_id, 4=bid_ttl_secs, 5=idempotency_ttl_secs.
const MERGE_BID_SCRIPT: &str = r#"
local idem_key = KEYS[1]
local bid_key = KEYS[2]
local ranking_key = KEYS[3]

local add_amount = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local user_id = ARGV[3]
local bid_ttl = tonumber(ARGV[4])
local idem_ttl = tonumber(ARGV[5])

local existing_idem = redis.call("GET", idem_key)
if existing_idem then
    return existing_idem
end

local existing_bid_json = redis.call("GET", bid_key)
local existing_amount = 0
local created_at = now_ms
if existing_bid_json then
    local existing = cjson.decode(existing_bid_json)
    existing_amount = existing.amount
    created_at = existing.created_at_ms
end

local final_amount = existing_amount + add_amount
local bid_json = cjson.encode({
    user_id = user_id,
    amount = final_amount,
    created_at_ms = created_at,
    updated_at_ms = now_ms,
})
redis.call("SET", bid_key, bid_json, "EX", bid_ttl)

local score = -(final_amount * 1000000000000) + now_ms
redis.call("ZADD", ranking_key, score, user_id)
redis.call("EXPIRE", ranking_key, bid_ttl)

redis.call("SET", idem_key, bid_json, "EX", idem_ttl)

return bid_json
"#;

pub struct RedisHotStore {
    conn: ConnectionManager,
    place_bid_script: redis::Script,
    merge_bid_script: redis::Script,
}

impl RedisHotStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            place_bid_script: redis::Script::new(PLACE_BID_SCRIPT),
            merge_bid_script: redis::Script::new(MERGE_BID_SCRIPT),
        })
    }

    fn balance_key(user_id: UserId) -> String {
        format!("user_balance:{user_id}")
    }

    fn bid_key(auction_id: AuctionId, round_id: RoundId, user_id: UserId) -> String {
        format!("bid:{auction_id}:{round_id}:{user_id}")
    }

    fn ranking_key(auction_id: AuctionId, round_id: RoundId) -> String {
        format!("round_bids:{auction_id}:{round_id}")
    }

    fn idempotency_key(key: &IdempotencyKey) -> String {
        format!("idempotency:{}", key.0)
    }

    fn queue_key() -> &'static str {
        "bid_transfer_queue"
    }

    fn new_money_key(auction_id: AuctionId) -> String {
        format!("new_money:{auction_id}")
    }
}

fn parse_bid_record(json: &str) -> Result<BidRecord, StoreError> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::Corrupt(format!("bid record: {e}")))
}

#[async_trait]
impl HotStore for RedisHotStore {
    async fn place_bid(
        &self,
        args: PlaceBidArgs,
    ) -> Result<PlaceBidOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let result: Vec<String> = self
            .place_bid_script
            .key(Self::idempotency_key(&args.idempotency_key))
            .key(Self::balance_key(args.user_id))
            .key(Self::bid_key(args.auction_id, args.round_id, args.user_id))
            .key(Self::ranking_key(args.auction_id, args.round_id))
            .key(Self::new_money_key(args.auction_id))
            .arg(args.amount)
            .arg(args.now_ms)
            .arg(args.min_bid_for_round)
            .arg(if args.add_to_existing { "1" } else { "0" })
            .arg(args.winners_per_round)
            .arg(if args.is_first_round { "1" } else { "0" })
            .arg(args.user_id.0)
            .arg(args.effective_end_ms)
            .arg(BID_TTL_SECS)
            .arg(IDEMPOTENCY_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(String::as_str) {
            Some("OK") => {
                let bid = parse_bid_record(&result[1])?;
                let new_balance = result[2]
                    .parse()
                    .map_err(|_| StoreError::Corrupt("new_balance".into()))?;
                Ok(PlaceBidOutcome::Committed { bid, new_balance })
            }
            Some("REPLAYED") => {
                let bid = parse_bid_record(&result[1])?;
                let new_balance = result
                    .get(2)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(bid.amount);
                Ok(PlaceBidOutcome::Replayed { bid, new_balance })
            }
            Some("ROUND_ENDED") => Ok(PlaceBidOutcome::RoundEnded),
            Some("BELOW_MIN_BID") => Ok(PlaceBidOutcome::BelowMinBid {
                final_amount: result[1]
                    .parse()
                    .map_err(|_| StoreError::Corrupt("final_amount".into()))?,
            }),
            Some("NO_EXISTING_BID") => Ok(PlaceBidOutcome::NoExistingBid),
            Some("ALREADY_FIRST_PLACE") => Ok(PlaceBidOutcome::AlreadyFirstPlace),
            Some("ALREADY_IN_WINNING_TOP") => Ok(PlaceBidOutcome::AlreadyInWinningTop {
                place: result[1]
                    .parse()
                    .map_err(|_| StoreError::Corrupt("place".into()))?,
            }),
            Some("INSUFFICIENT_BALANCE") => Ok(PlaceBidOutcome::InsufficientBalance {
                balance: result[1]
                    .parse()
                    .map_err(|_| StoreError::Corrupt("balance".into()))?,
            }),
            other => Err(StoreError::Corrupt(format!(
                "unexpected place_bid script result: {other:?}"
            ))),
        }
    }

    async fn rank(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<u32>, StoreError> {
        let mut conn = self.conn.clone();
        let rank: Option<u64> = conn
            .zrank(Self::ranking_key(auction_id, round_id), user_id.0)
            .await?;
        Ok(rank.map(|r| r as u32))
    }

    async fn ranked_bids(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
    ) -> Result<Vec<BidRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let user_ids: Vec<i64> = conn
            .zrange(Self::ranking_key(auction_id, round_id), 0, -1)
            .await?;
        let mut bids = Vec::with_capacity(user_ids.len());
        for uid in user_ids {
            if let Some(bid) = self
                .get_bid(auction_id, round_id, UserId(uid))
                .await?
            {
                bids.push(bid);
            }
        }
        Ok(bids)
    }

    async fn get_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<BidRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(Self::bid_key(auction_id, round_id, user_id))
            .await?;
        json.map(|j| parse_bid_record(&j)).transpose()
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let v: Option<i64> = conn.get(Self::balance_key(user_id)).await?;
        Ok(v)
    }

    async fn set_balance(&self, user_id: UserId, balance: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::balance_key(user_id), balance).await?;
        Ok(())
    }

    async fn credit_balance(&self, user_id: UserId, amount: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let new_balance: i64 = conn.incr(Self::balance_key(user_id), amount).await?;
        Ok(new_balance)
    }

    async fn merge_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
        add_amount: i64,
        idempotency_key: &IdempotencyKey,
        now_ms: i64,
    ) -> Result<BidRecord, StoreError> {
        let mut conn = self.conn.clone();
        let json: String = self
            .merge_bid_script
            .key(Self::idempotency_key(idempotency_key))
            .key(Self::bid_key(auction_id, round_id, user_id))
            .key(Self::ranking_key(auction_id, round_id))
            .arg(add_amount)
            .arg(now_ms)
            .arg(user_id.0)
            .arg(BID_TTL_SECS)
            .arg(IDEMPOTENCY_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        parse_bid_record(&json)
    }

    async fn enqueue_carry_task(&self, task: &CarryTask) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(task)
            .map_err(|e| StoreError::Corrupt(format!("carry task: {e}")))?;
        conn.lpush::<_, _, ()>(Self::queue_key(), json).await?;
        Ok(())
    }

    async fn dequeue_carry_task(&self) -> Result<Option<CarryTask>, StoreError> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> =
            conn.brpop(Self::queue_key(), 1.0).await?;
        result
            .map(|(_, json)| {
                serde_json::from_str(&json)
                    .map_err(|e| StoreError::Corrupt(format!("carry task: {e}")))
            })
            .transpose()
    }

    async fn cache_set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs as u64).await?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(key).await?;
        Ok(v)
    }

    async fn all_new_money(&self, auction_id: AuctionId) -> Result<Vec<(UserId, i64)>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: HashMap<i64, i64> = conn.hgetall(Self::new_money_key(auction_id)).await?;
        Ok(entries.into_iter().map(|(uid, amt)| (UserId(uid), amt)).collect())
    }
}

/// In-process double used by tests. Mirrors the same ranking semantics
/// as the Redis backend, minus TTL expiry, so unit tests can drive the
/// bid engine and lifecycle manager without a live Redis.
#[derive(Default)]
struct InMemoryState {
    balances: HashMap<UserId, i64>,
    bids: HashMap<(AuctionId, RoundId, UserId), BidRecord>,
    idempotency: HashMap<String, BidRecord>,
    queue: VecDeque<CarryTask>,
    caches: HashMap<String, String>,
    new_money: HashMap<(AuctionId, UserId), i64>,
}

pub struct InMemoryHotStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryHotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHotStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    fn ranked_locked(
        state: &InMemoryState,
        auction_id: AuctionId,
        round_id: RoundId,
    ) -> Vec<BidRecord> {
        let mut bids: Vec<BidRecord> = state
            .bids
            .iter()
            .filter(|((a, r, _), _)| *a == auction_id && *r == round_id)
            .map(|(_, b)| b.clone())
            .collect();
        bids.sort_by(|a, b| {
            ranking_score(a.amount, a.created_at_ms)
                .partial_cmp(&ranking_score(b.amount, b.created_at_ms))
                .unwrap()
        });
        bids
    }
}

#[async_trait]
impl HotStore for InMemoryHotStore {
    async fn place_bid(
        &self,
        args: PlaceBidArgs,
    ) -> Result<PlaceBidOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(bid) = state.idempotency.get(&args.idempotency_key.0).cloned() {
            let balance = *state.balances.get(&args.user_id).unwrap_or(&0);
            return Ok(PlaceBidOutcome::Replayed {
                bid,
                new_balance: balance,
            });
        }

        if args.now_ms >= args.effective_end_ms {
            return Ok(PlaceBidOutcome::RoundEnded);
        }

        let key = (args.auction_id, args.round_id, args.user_id);
        let existing = state.bids.get(&key).cloned();
        let existing_amount = match &existing {
            Some(b) => b.amount,
            None if args.add_to_existing => return Ok(PlaceBidOutcome::NoExistingBid),
            None => 0,
        };

        if existing.is_some() {
            let ranked = Self::ranked_locked(&state, args.auction_id, args.round_id);
            if let Some(pos) = ranked.iter().position(|b| b.user_id == args.user_id) {
                let place = (pos + 1) as u32;
                if place == 1 {
                    return Ok(PlaceBidOutcome::AlreadyFirstPlace);
                }
                if place <= args.winners_per_round {
                    let exempt = args.is_first_round && place <= 3;
                    if !exempt {
                        return Ok(PlaceBidOutcome::AlreadyInWinningTop { place });
                    }
                }
            }
        }

        let final_amount = existing_amount + args.amount;
        if final_amount < args.min_bid_for_round {
            return Ok(PlaceBidOutcome::BelowMinBid { final_amount });
        }

        let balance = *state.balances.get(&args.user_id).unwrap_or(&0);
        if balance < args.amount {
            return Ok(PlaceBidOutcome::InsufficientBalance { balance });
        }

        let new_balance = balance - args.amount;
        state.balances.insert(args.user_id, new_balance);

        let created_at_ms = existing.map(|b| b.created_at_ms).unwrap_or(args.now_ms);
        let bid = BidRecord {
            user_id: args.user_id,
            amount: final_amount,
            created_at_ms,
            updated_at_ms: args.now_ms,
        };
        state.bids.insert(key, bid.clone());
        state
            .idempotency
            .insert(args.idempotency_key.0.clone(), bid.clone());
        *state
            .new_money
            .entry((args.auction_id, args.user_id))
            .or_insert(0) += args.amount;

        Ok(PlaceBidOutcome::Committed { bid, new_balance })
    }

    async fn rank(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<u32>, StoreError> {
        let state = self.state.lock().await;
        let ranked = Self::ranked_locked(&state, auction_id, round_id);
        Ok(ranked
            .iter()
            .position(|b| b.user_id == user_id)
            .map(|p| p as u32))
    }

    async fn ranked_bids(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
    ) -> Result<Vec<BidRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(Self::ranked_locked(&state, auction_id, round_id))
    }

    async fn get_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
    ) -> Result<Option<BidRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.bids.get(&(auction_id, round_id, user_id)).cloned())
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&user_id).copied())
    }

    async fn set_balance(&self, user_id: UserId, balance: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.balances.insert(user_id, balance);
        Ok(())
    }

    async fn credit_balance(&self, user_id: UserId, amount: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let entry = state.balances.entry(user_id).or_insert(0);
        *entry += amount;
        Ok(*entry)
    }

    async fn merge_bid(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
        user_id: UserId,
        add_amount: i64,
        idempotency_key: &IdempotencyKey,
        now_ms: i64,
    ) -> Result<BidRecord, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(bid) = state.idempotency.get(&idempotency_key.0).cloned() {
            return Ok(bid);
        }
        let key = (auction_id, round_id, user_id);
        let existing = state.bids.get(&key).cloned();
        let existing_amount = existing.as_ref().map(|b| b.amount).unwrap_or(0);
        let created_at_ms = existing.map(|b| b.created_at_ms).unwrap_or(now_ms);
        let bid = BidRecord {
            user_id,
            amount: existing_amount + add_amount,
            created_at_ms,
            updated_at_ms: now_ms,
        };
        state.bids.insert(key, bid.clone());
        state
            .idempotency
            .insert(idempotency_key.0.clone(), bid.clone());
        Ok(bid)
    }

    async fn enqueue_carry_task(&self, task: &CarryTask) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.queue.push_back(task.clone());
        Ok(())
    }

    async fn dequeue_carry_task(&self) -> Result<Option<CarryTask>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.queue.pop_front())
    }

    async fn cache_set(&self, key: &str, value: &str, _ttl_secs: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.caches.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.caches.get(key).cloned())
    }

    async fn all_new_money(&self, auction_id: AuctionId) -> Result<Vec<(UserId, i64)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .new_money
            .iter()
            .filter(|((a, _), _)| *a == auction_id)
            .map(|((_, u), amt)| (*u, *amt))
            .collect())
    }
}
