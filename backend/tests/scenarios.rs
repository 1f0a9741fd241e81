//! End-to-end scenarios against the in-memory store doubles, one per
//! documented walkthrough: a single-round auction running to completion,
//! carry-over between rounds, anti-sniping stacking, idempotent replay,
//! first-place lockout, and below-minimum augmentation.

use std::sync::Arc;

use backend::bid_engine::BidEngine;
use backend::lifecycle::{AntiSnipingConfig, LifecycleManager};
use backend::store::durable::{DurableStore, InMemoryDurableStore, NewAuction};
use backend::store::hot::{HotStore, InMemoryHotStore};
use backend::time::TimeSource;
use jiff::{Span, Timestamp};
use payloads::{AuctionId, AuctionStatus, IdempotencyKey, RoundId, UserId};

struct Harness {
    engine: BidEngine,
    lifecycle: Arc<LifecycleManager>,
    durable: Arc<InMemoryDurableStore>,
    hot: Arc<InMemoryHotStore>,
    time: TimeSource,
}

fn harness_with(anti_sniping: AntiSnipingConfig) -> Harness {
    let durable = Arc::new(InMemoryDurableStore::new());
    let hot = Arc::new(InMemoryHotStore::new());
    let time = TimeSource::new(Timestamp::now());
    let lifecycle = Arc::new(LifecycleManager::new(
        durable.clone(),
        hot.clone(),
        time.clone(),
        anti_sniping,
    ));
    let engine = BidEngine::new(hot.clone(), durable.clone(), time.clone(), lifecycle.clone());
    Harness {
        engine,
        lifecycle,
        durable,
        hot,
        time,
    }
}

fn harness() -> Harness {
    harness_with(AntiSnipingConfig::default())
}

async fn release_and_start(h: &Harness, auction_id: AuctionId, creator: UserId, delay_ms: i64) {
    h.lifecycle.release_auction(auction_id, creator).await.unwrap();
    h.time.advance(Span::new().milliseconds(delay_ms));
    h.lifecycle.handle_event(auction_id).await;
}

async fn current_round(h: &Harness, auction_id: AuctionId) -> RoundId {
    let auction = h.durable.get_auction(auction_id).await.unwrap().unwrap();
    h.durable
        .list_rounds(auction_id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.idx == auction.current_round_idx)
        .unwrap()
        .id
}

/// Drains the round-carry queue, merging every queued task into the next
/// round the same way the background worker would.
async fn drain_carry_queue(hot: &InMemoryHotStore) {
    while let Some(task) = hot.dequeue_carry_task().await.unwrap() {
        let ranked = hot.ranked_bids(task.auction_id, task.current_round_id).await.unwrap();
        for bid in ranked.into_iter().skip(task.winners_per_round as usize) {
            let key = IdempotencyKey(format!(
                "transfer-{}-{}-{}",
                task.current_round_id, bid.user_id, bid.updated_at_ms
            ));
            hot.merge_bid(
                task.auction_id,
                task.next_round_id,
                bid.user_id,
                bid.amount,
                &key,
                bid.updated_at_ms,
            )
            .await
            .unwrap();
        }
    }
}

// Scenario A — basic single-round happy path.
#[tokio::test]
async fn scenario_a_single_round_happy_path() {
    let h = harness();
    let creator = UserId(1);
    let (u1, u2, u3) = (UserId(101), UserId(102), UserId(103));
    for u in [u1, u2, u3] {
        h.hot.set_balance(u, 10_000).await.unwrap();
    }

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 2,
                rounds_count: 1,
                first_round_duration_ms: Some(10_000),
                round_duration_ms: 10_000,
                start_datetime: h.time.now() + Span::new().milliseconds(2_000),
            },
        )
        .await
        .unwrap();

    release_and_start(&h, auction.id, creator, 2_001).await;
    let updated = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(updated.status, AuctionStatus::Live);

    h.engine
        .place_bid(auction.id, u1, 100, IdempotencyKey("a1".into()), false)
        .await
        .unwrap();
    h.engine
        .place_bid(auction.id, u2, 200, IdempotencyKey("a2".into()), false)
        .await
        .unwrap();
    h.engine
        .place_bid(auction.id, u3, 150, IdempotencyKey("a3".into()), false)
        .await
        .unwrap();

    let round_id = current_round(&h, auction.id).await;
    let top = h.engine.top_bids(auction.id, round_id, 10).await.unwrap();
    assert_eq!(top[0].user_id, u2);
    assert_eq!(top[0].place, 1);
    assert_eq!(top[1].user_id, u3);
    assert_eq!(top[1].place, 2);
    assert_eq!(top[2].user_id, u1);
    assert_eq!(top[2].place, 3);

    h.time.advance(Span::new().milliseconds(10_001));
    h.lifecycle.handle_event(auction.id).await;

    let finished = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(finished.status, AuctionStatus::Finished);
    assert_eq!(finished.remaining_items_count, 0);

    let deliveries = h.durable.list_deliveries(auction.id).await.unwrap();
    let winners: Vec<_> = deliveries.iter().map(|d| d.winner_user_id).collect();
    assert!(winners.contains(&u2));
    assert!(winners.contains(&u3));

    assert_eq!(h.hot.get_balance(u1).await.unwrap(), Some(10_000));
    assert_eq!(h.hot.get_balance(u2).await.unwrap(), Some(9_800));
    assert_eq!(h.hot.get_balance(u3).await.unwrap(), Some(9_850));
}

// Scenario B — carry between rounds.
#[tokio::test]
async fn scenario_b_carry_between_rounds() {
    let h = harness();
    let creator = UserId(1);
    let (u1, u2, u3) = (UserId(201), UserId(202), UserId(203));
    for u in [u1, u2, u3] {
        h.hot.set_balance(u, 10_000).await.unwrap();
    }

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 2,
                rounds_count: 2,
                first_round_duration_ms: Some(5_000),
                round_duration_ms: 5_000,
                start_datetime: h.time.now() + Span::new().milliseconds(1_000),
            },
        )
        .await
        .unwrap();

    release_and_start(&h, auction.id, creator, 1_001).await;

    h.engine
        .place_bid(auction.id, u1, 100, IdempotencyKey("b1".into()), false)
        .await
        .unwrap();
    h.engine
        .place_bid(auction.id, u2, 150, IdempotencyKey("b2".into()), false)
        .await
        .unwrap();

    h.time.advance(Span::new().milliseconds(5_001));
    h.lifecycle.handle_event(auction.id).await;
    drain_carry_queue(&h.hot).await;

    let round1 = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(round1.current_round_idx, 1);
    assert_eq!(round1.min_bid_for_round(1), 105);

    // u1's carried 100 sits below round 1's minimum but carry is
    // unconditional; it never competed for a fresh balance debit.
    let round1_id = current_round(&h, auction.id).await;
    let carried = h.engine.user_bid(auction.id, round1_id, u1).await.unwrap().unwrap();
    assert_eq!(carried.amount, 100);

    h.engine
        .place_bid(auction.id, u3, 110, IdempotencyKey("b3".into()), false)
        .await
        .unwrap();

    h.time.advance(Span::new().milliseconds(5_001));
    h.lifecycle.handle_event(auction.id).await;

    let finished = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(finished.status, AuctionStatus::Finished);

    assert_eq!(h.hot.get_balance(u1).await.unwrap(), Some(10_000));
    assert_eq!(h.hot.get_balance(u2).await.unwrap(), Some(9_850));
    assert_eq!(h.hot.get_balance(u3).await.unwrap(), Some(9_890));
}

// Scenario C — anti-sniping stacking extends the round twice.
#[tokio::test]
async fn scenario_c_anti_sniping_stacks_extensions() {
    let h = harness();
    let creator = UserId(1);
    let (u1, u2, u3) = (UserId(301), UserId(302), UserId(303));
    for u in [u1, u2, u3] {
        h.hot.set_balance(u, 10_000).await.unwrap();
    }

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 1,
                rounds_count: 2,
                first_round_duration_ms: Some(30_000),
                round_duration_ms: 30_000,
                start_datetime: h.time.now() + Span::new().milliseconds(1_000),
            },
        )
        .await
        .unwrap();
    release_and_start(&h, auction.id, creator, 1_001).await;
    let round0 = current_round(&h, auction.id).await;

    h.engine
        .place_bid(auction.id, u1, 200, IdempotencyKey("c1".into()), false)
        .await
        .unwrap();
    h.engine
        .place_bid(auction.id, u2, 300, IdempotencyKey("c2".into()), false)
        .await
        .unwrap();
    h.engine
        .place_bid(auction.id, u3, 250, IdempotencyKey("c3".into()), false)
        .await
        .unwrap();

    // t = 25s: 5s before the original 30s end, inside the 60s window.
    h.time.advance(Span::new().milliseconds(24_000));
    h.engine
        .place_bid(auction.id, u1, 200, IdempotencyKey("c4".into()), true)
        .await
        .unwrap();

    let round_after_first_extension = h.durable.list_rounds(auction.id).await.unwrap().into_iter().find(|r| r.id == round0).unwrap();
    assert!(round_after_first_extension.extended_until.is_some());

    // t = 54s total: another top-3 bid pushes the deadline further out,
    // just shy of the first extension's deadline so the round is still open.
    h.time.advance(Span::new().milliseconds(29_999));
    h.engine
        .place_bid(auction.id, u2, 500, IdempotencyKey("c5".into()), true)
        .await
        .unwrap();

    let round_after_second_extension = h.durable.list_rounds(auction.id).await.unwrap().into_iter().find(|r| r.id == round0).unwrap();
    let first_extended = round_after_first_extension.extended_until.unwrap();
    let second_extended = round_after_second_extension.extended_until.unwrap();
    assert!(second_extended > first_extended);

    // Before the (extended) end, the round must still be open.
    h.time.set(second_extended - Span::new().milliseconds(1));
    h.lifecycle.handle_event(auction.id).await;
    let still_live = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(still_live.current_round_idx, 0);

    h.time.set(second_extended + Span::new().milliseconds(1));
    h.lifecycle.handle_event(auction.id).await;
    let advanced = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(advanced.current_round_idx, 1);
}

// Scenario D — idempotent replay returns the same result without a
// second debit.
#[tokio::test]
async fn scenario_d_idempotent_replay() {
    let h = harness();
    let creator = UserId(1);
    let u1 = UserId(401);
    h.hot.set_balance(u1, 10_000).await.unwrap();

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 1,
                rounds_count: 1,
                first_round_duration_ms: Some(60_000),
                round_duration_ms: 60_000,
                start_datetime: h.time.now() + Span::new().milliseconds(1_000),
            },
        )
        .await
        .unwrap();
    release_and_start(&h, auction.id, creator, 1_001).await;

    let key = IdempotencyKey("replay-key".into());
    let first = h
        .engine
        .place_bid(auction.id, u1, 200, key.clone(), false)
        .await
        .unwrap();
    assert_eq!(h.hot.get_balance(u1).await.unwrap(), Some(9_800));

    let second = h.engine.place_bid(auction.id, u1, 200, key, false).await.unwrap();
    assert_eq!(second.amount, first.amount);
    assert_eq!(second.place, first.place);
    assert_eq!(second.remaining_balance, first.remaining_balance);
    assert_eq!(h.hot.get_balance(u1).await.unwrap(), Some(9_800));
}

// Scenario E — first-place lockout rejects a no-op augmentation.
#[tokio::test]
async fn scenario_e_first_place_lockout() {
    let h = harness();
    let creator = UserId(1);
    let u1 = UserId(501);
    h.hot.set_balance(u1, 10_000).await.unwrap();

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 1,
                rounds_count: 1,
                first_round_duration_ms: Some(60_000),
                round_duration_ms: 60_000,
                start_datetime: h.time.now() + Span::new().milliseconds(1_000),
            },
        )
        .await
        .unwrap();
    release_and_start(&h, auction.id, creator, 1_001).await;

    h.engine
        .place_bid(auction.id, u1, 500, IdempotencyKey("e1".into()), false)
        .await
        .unwrap();

    let err = h
        .engine
        .place_bid(auction.id, u1, 50, IdempotencyKey("e2".into()), true)
        .await
        .unwrap_err();
    assert!(matches!(err, backend::error::BidError::AlreadyFirstPlace));
    assert_eq!(h.hot.get_balance(u1).await.unwrap(), Some(9_500));
}

// Scenario F — below-minimum augmentation is rejected, a sufficient one
// is accepted.
#[tokio::test]
async fn scenario_f_below_min_augmentation() {
    let h = harness();
    let creator = UserId(1);
    let u1 = UserId(601);
    let u_filler = UserId(602);
    h.hot.set_balance(u1, 10_000).await.unwrap();
    h.hot.set_balance(u_filler, 10_000).await.unwrap();

    let auction = h
        .lifecycle
        .create_auction(
            creator,
            payloads::requests::AuctionParams {
                display_name: None,
                item_name: "widget".into(),
                min_bid: 100,
                winners_count_total: 4,
                rounds_count: 4,
                first_round_duration_ms: Some(1_000),
                round_duration_ms: 1_000,
                start_datetime: h.time.now() + Span::new().milliseconds(1_000),
            },
        )
        .await
        .unwrap();
    release_and_start(&h, auction.id, creator, 1_001).await;

    // Seed u1 with a raw 50-unit bid the way a carry would: merge_bid
    // bypasses the minimum-bid gate, just like an actual round-carry does.
    let round0_id = current_round(&h, auction.id).await;
    h.hot
        .merge_bid(
            auction.id,
            round0_id,
            u1,
            50,
            &IdempotencyKey("f-seed".into()),
            h.time.now().as_millisecond(),
        )
        .await
        .unwrap();

    // Fast-forward three rounds so round idx becomes 3 (min_bid 115),
    // carrying u1's 50 along via the queue each time.
    for _ in 0..3 {
        let round_id = current_round(&h, auction.id).await;
        // Someone else always wins so u1 keeps losing and carrying.
        h.engine
            .place_bid(auction.id, u_filler, 10_000, IdempotencyKey(format!("f-filler-{round_id}")), false)
            .await
            .unwrap_or_else(|_| panic!("filler bid should succeed in round {round_id}"));
        h.time.advance(Span::new().milliseconds(1_001));
        h.lifecycle.handle_event(auction.id).await;
        drain_carry_queue(&h.hot).await;
        h.hot.set_balance(u_filler, 10_000).await.unwrap();
    }

    let live = h.durable.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(live.current_round_idx, 3);
    assert_eq!(live.min_bid_for_round(3), 115);

    let round3_id = current_round(&h, auction.id).await;
    let carried = h.engine.user_bid(auction.id, round3_id, u1).await.unwrap().unwrap();
    assert_eq!(carried.amount, 50);

    let err = h
        .engine
        .place_bid(auction.id, u1, 50, IdempotencyKey("f-below".into()), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        backend::error::BidError::BelowMinBid { amount: 100, min_bid: 115 }
    ));

    let ok = h
        .engine
        .place_bid(auction.id, u1, 100, IdempotencyKey("f-above".into()), true)
        .await
        .unwrap();
    assert_eq!(ok.amount, 150);
}
