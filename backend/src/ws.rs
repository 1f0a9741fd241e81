//! The websocket transport for the fan-out. A connection sends `{type: "subscribe", ...}` to start
//! receiving `Snapshot`/`TimeUpdate` messages for an auction, `{type:
//! "bid", ...}` to place a bid over the same socket instead of the REST
//! endpoint, and `{type: "ping"}` for a liveness check.

use std::time::{Duration, Instant};

use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use payloads::requests::ClientMessage;
use payloads::responses::{BidError as WireBidError, ServerMessage};
use payloads::{AuctionId, UserId};

use crate::telemetry::log_error;
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn subscribe(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let state = state.into_inner();

    actix_web::rt::spawn(async move {
        let mut subscribed: Option<AuctionId> = None;
        let mut user_id: Option<UserId> = None;
        let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;
        let mut last_activity = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > CLIENT_TIMEOUT {
                        break;
                    }
                    if session.ping(b"").await.is_err() {
                        break;
                    }
                }
                msg = msg_stream.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    last_activity = Instant::now();
                    match msg {
                        actix_ws::Message::Text(text) => {
                            let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                                continue;
                            };
                            match client_msg {
                                ClientMessage::Subscribe { auction_id, user_id: uid } => {
                                    subscribed = Some(auction_id);
                                    user_id = uid;
                                    if let Some(old) = forwarder.take() {
                                        old.abort();
                                    }
                                    if let Ok(snapshot) = state.fanout.snapshot(auction_id, uid).await {
                                        let payload = ServerMessage::Snapshot(snapshot);
                                        if let Ok(json) = serde_json::to_string(&payload) {
                                            let _ = session.text(json).await;
                                        }
                                    }
                                    let mut rx = state.fanout.subscribe(auction_id).await;
                                    let mut forward_session = session.clone();
                                    forwarder = Some(actix_web::rt::spawn(async move {
                                        while let Ok(msg) = rx.recv().await {
                                            if let Ok(json) = serde_json::to_string(&msg) {
                                                if forward_session.text(json).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }));
                                }
                                ClientMessage::Ping => {
                                    if let Ok(json) = serde_json::to_string(&ServerMessage::Pong) {
                                        let _ = session.text(json).await;
                                    }
                                }
                                ClientMessage::Bid(place_bid) => {
                                    let Some(uid) = user_id else { continue };
                                    let result = state
                                        .bid_engine
                                        .place_bid(
                                            place_bid.auction_id,
                                            uid,
                                            place_bid.amount,
                                            place_bid.idempotency_key,
                                            place_bid.add_to_existing,
                                        )
                                        .await;
                                    let reply = match result {
                                        Ok(placed) => {
                                            state.fanout.notify_bid(place_bid.auction_id).await;
                                            ServerMessage::BidSuccess(placed)
                                        }
                                        Err(e) => ServerMessage::BidError(WireBidError::simple(e.kind())),
                                    };
                                    if let Ok(json) = serde_json::to_string(&reply) {
                                        let _ = session.text(json).await;
                                    }
                                }
                            }
                        }
                        actix_ws::Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        actix_ws::Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        if let Some(handle) = forwarder {
            handle.abort();
        }
        let _ = subscribed;
        if let Err(e) = session.close(None).await {
            log_error(anyhow::anyhow!("{e}"));
        }
    });

    Ok(response)
}
