pub mod bid_engine;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod model;
pub mod routes;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod time;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use sqlx::PgPool;

use bid_engine::BidEngine;
use fanout::Fanout;
use lifecycle::{AntiSnipingConfig, LifecycleManager};
use store::durable::{DurableStore, PgDurableStore};
use store::hot::{HotStore, RedisHotStore};
use time::TimeSource;

pub struct AppState {
    pub bid_engine: Arc<BidEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    pub fanout: Arc<Fanout>,
}

pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub ip: String,
    pub port: u16,
    pub reconciler_tick_ms: u64,
    pub balance_sync_tick_ms: u64,
    pub delivery_fulfillment_tick_ms: u64,
    pub delivery_fulfillment_delay_ms: i64,
    pub anti_sniping_rounds: Vec<u32>,
    pub anti_sniping_window_ms: i64,
    pub anti_sniping_extension_ms: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            database_url: std::env::var("DATABASE_URL").unwrap(),
            redis_url: std::env::var("REDIS_URL").unwrap(),
            ip: std::env::var("IP_ADDRESS").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8081),
            reconciler_tick_ms: std::env::var("RECONCILER_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            balance_sync_tick_ms: std::env::var("BALANCE_SYNC_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            delivery_fulfillment_tick_ms: std::env::var("DELIVERY_FULFILLMENT_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            delivery_fulfillment_delay_ms: std::env::var("DELIVERY_FULFILLMENT_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            anti_sniping_rounds: std::env::var("ANTI_SNIPING_ROUNDS")
                .ok()
                .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
                .unwrap_or_else(|| vec![0]),
            anti_sniping_window_ms: std::env::var("ANTI_SNIPING_WINDOW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60_000),
            anti_sniping_extension_ms: std::env::var("ANTI_SNIPING_EXTENSION_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
        }
    }
}

/// Assembles the stores, the bid engine, the lifecycle manager, and the
/// fan-out, spawns the background workers (carry worker, reconciler,
/// balance sync, fan-out tickers), and returns a bound but not-yet-running
/// `actix-web` server, keeping build and run separate so integration
/// tests can start a server on an ephemeral port.
pub async fn build(config: &mut Config, time: TimeSource) -> std::io::Result<Server> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .expect("failed to connect to durable store");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run durable store migrations");
    let durable = Arc::new(PgDurableStore::new(pool));
    let hot = Arc::new(
        RedisHotStore::connect(&config.redis_url)
            .await
            .expect("failed to connect to hot store"),
    );

    // Prime the hot store from the durable mirror so a restart during a
    // LIVE auction doesn't leave it without balances. Only fills gaps;
    // a balance Redis already holds is more current than the mirror.
    for (user_id, balance) in durable.list_balance_mirrors().await.unwrap_or_default() {
        match hot.get_balance(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = hot.set_balance(user_id, balance).await {
                    telemetry::log_error(e);
                }
            }
            Err(e) => telemetry::log_error(e),
        }
    }

    let anti_sniping = AntiSnipingConfig {
        rounds: config.anti_sniping_rounds.clone(),
        window_ms: config.anti_sniping_window_ms,
        extension_ms: config.anti_sniping_extension_ms,
    };
    let lifecycle = Arc::new(LifecycleManager::new(
        durable.clone(),
        hot.clone(),
        time.clone(),
        anti_sniping,
    ));
    let bid_engine = Arc::new(BidEngine::new(
        hot.clone(),
        durable.clone(),
        time.clone(),
        lifecycle.clone(),
    ));
    let fanout = Arc::new(Fanout::new(bid_engine.clone(), lifecycle.clone(), time.clone()));

    tokio::spawn({
        let worker = lifecycle::carry::CarryWorker::new(hot.clone());
        async move { worker.run().await }
    });
    tokio::spawn({
        let lifecycle = lifecycle.clone();
        let interval = Duration::from_millis(config.reconciler_tick_ms);
        async move { lifecycle.run_reconciler(interval).await }
    });
    tokio::spawn({
        let sync = sync::BalanceSync::new(hot.clone(), durable.clone(), lifecycle.clone());
        let interval = Duration::from_millis(config.balance_sync_tick_ms);
        async move { sync.run(interval).await }
    });
    tokio::spawn({
        let fulfillment = delivery::DeliveryFulfillment::new(
            durable.clone(),
            time.clone(),
            config.delivery_fulfillment_delay_ms,
        );
        let interval = Duration::from_millis(config.delivery_fulfillment_tick_ms);
        async move { fulfillment.run(interval).await }
    });
    tokio::spawn({
        let fanout = fanout.clone();
        async move { fanout.run().await }
    });
    tokio::spawn({
        let durable = durable.clone();
        let lifecycle = lifecycle.clone();
        async move { run_change_feed(durable, lifecycle).await }
    });

    let app_state = web::Data::new(AppState {
        bid_engine,
        lifecycle,
        fanout,
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .service(routes::api_services())
            .route("/ws", web::get().to(ws::subscribe))
    })
    .bind((config.ip.as_str(), config.port))?
    .run();

    Ok(server)
}

/// Decodes Postgres's `LISTEN`/`NOTIFY` change feed into lifecycle events.
/// Reconnects and re-subscribes on a dropped listener rather than dying,
/// since the reconciler tick covers the gap until it does.
async fn run_change_feed(durable: Arc<PgDurableStore>, lifecycle: Arc<LifecycleManager>) {
    loop {
        let mut listener = match durable.subscribe().await {
            Ok(listener) => listener,
            Err(e) => {
                telemetry::log_error(e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        loop {
            match store::durable::next_change(&mut listener).await {
                Ok(event) => lifecycle.handle_event(event.auction_id).await,
                Err(e) => {
                    telemetry::log_error(e);
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
