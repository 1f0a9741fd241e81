//! HTTP surface. Most of the action happens over the fan-out's
//! websocket (`ws.rs`); these routes cover operations that don't need a
//! live subscription: health, auction management, and a REST fallback for
//! placing bids and reading ranked state.

use actix_web::{HttpResponse, ResponseError, Responder, body::BoxBody, dev::HttpServiceFactory, web};
use payloads::{
    requests::{AuctionParams, PlaceBid, TopBidsQuery},
    AuctionId, ErrorKind, UserId,
};

use crate::AppState;

pub fn api_services() -> impl HttpServiceFactory {
    web::scope("/api")
        .route("/health_check", web::get().to(health_check))
        .route("/auctions", web::post().to(create_auction))
        .route("/auctions/{auction_id}", web::get().to(get_auction))
        .route("/auctions/{auction_id}", web::delete().to(delete_auction))
        .route("/auctions/{auction_id}/release", web::post().to(release_auction))
        .route("/bids", web::post().to(place_bid))
        .route("/top_bids", web::get().to(top_bids))
}

pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

/// Identifies the caller for routes without a live subscription. There's
/// no authentication layer in this workspace; this header stands in for it.
fn caller_id(req: &actix_web::HttpRequest) -> Result<UserId, ApiError> {
    let raw = req
        .headers()
        .get("x-user-id")
        .ok_or(ApiError::BadRequest("missing x-user-id header"))?
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid x-user-id header"))?;
    raw.parse::<i64>()
        .map(UserId)
        .map_err(|_| ApiError::BadRequest("x-user-id must be an integer"))
}

fn auction_json(a: &crate::model::Auction) -> serde_json::Value {
    serde_json::json!({
        "id": a.id,
        "creator_id": a.creator_id,
        "display_name": a.display_name,
        "item_name": a.item_name,
        "min_bid": a.min_bid,
        "winners_count_total": a.winners_count_total,
        "rounds_count": a.rounds_count,
        "round_duration_ms": a.round_duration_ms,
        "start_datetime": a.start_datetime,
        "status": a.status,
        "current_round_idx": a.current_round_idx,
        "remaining_items_count": a.remaining_items_count,
    })
}

async fn create_auction(
    state: web::Data<AppState>,
    req: actix_web::HttpRequest,
    body: web::Json<AuctionParams>,
) -> Result<HttpResponse, ApiError> {
    let creator_id = caller_id(&req)?;
    let auction = state.lifecycle.create_auction(creator_id, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(auction_json(&auction)))
}

async fn release_auction(
    state: web::Data<AppState>,
    req: actix_web::HttpRequest,
    path: web::Path<AuctionId>,
) -> Result<HttpResponse, ApiError> {
    let caller_id = caller_id(&req)?;
    state.lifecycle.release_auction(path.into_inner(), caller_id).await?;
    Ok(HttpResponse::Ok().finish())
}

async fn delete_auction(
    state: web::Data<AppState>,
    req: actix_web::HttpRequest,
    path: web::Path<AuctionId>,
) -> Result<HttpResponse, ApiError> {
    let caller_id = caller_id(&req)?;
    state.lifecycle.delete_auction(path.into_inner(), caller_id).await?;
    Ok(HttpResponse::Ok().finish())
}

async fn get_auction(
    state: web::Data<AppState>,
    path: web::Path<AuctionId>,
) -> Result<HttpResponse, ApiError> {
    let auction = state.lifecycle.get_auction(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(auction_json(&auction)))
}

async fn place_bid(
    state: web::Data<AppState>,
    req: actix_web::HttpRequest,
    body: web::Json<PlaceBid>,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let body = body.into_inner();
    let auction_id = body.auction_id;
    let placed = state
        .bid_engine
        .place_bid(auction_id, user_id, body.amount, body.idempotency_key, body.add_to_existing)
        .await?;
    state.fanout.notify_bid(auction_id).await;
    Ok(HttpResponse::Ok().json(placed))
}

async fn top_bids(
    state: web::Data<AppState>,
    query: web::Query<TopBidsQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let bids = state.bid_engine.top_bids(q.auction_id, q.round_id, q.k).await?;
    Ok(HttpResponse::Ok().json(bids))
}

/// The HTTP-facing error envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Bid(#[from] crate::error::BidError),
    #[error(transparent)]
    Lifecycle(#[from] crate::error::LifecycleError),
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::Validation,
            Self::Bid(e) => e.kind(),
            Self::Lifecycle(e) => e.kind(),
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse<BoxBody> {
        let status = match self.kind() {
            ErrorKind::Validation => actix_web::http::StatusCode::BAD_REQUEST,
            ErrorKind::Authorization => actix_web::http::StatusCode::FORBIDDEN,
            ErrorKind::NotFound => actix_web::http::StatusCode::NOT_FOUND,
            ErrorKind::Internal => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            _ => actix_web::http::StatusCode::CONFLICT,
        };
        HttpResponse::build(status).json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }))
    }
}
