use backend::{
    build,
    telemetry::{get_subscriber, init_subscriber},
    time::TimeSource,
    Config,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = get_subscriber("info".into());
    init_subscriber(subscriber);

    #[cfg(not(feature = "test-utils"))]
    let time = TimeSource::new();
    #[cfg(feature = "test-utils")]
    let time = TimeSource::new(jiff::Timestamp::now());

    let mut config = Config::from_env();
    let server = build(&mut config, time).await?;
    server.await
}
