use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use diesel::PgConnection;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stock_service::api::{self, AppState};
use stock_service::handlers::RollbackConsumer;
use stock_service::{
    CompensationHandler, Config, LockClient, PgStockStore, RedisLockBackend, ReservationEngine,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = Config::parse();

    // Run migrations first
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;
    let store = PgStockStore::new(pool);

    let lock_backend = RedisLockBackend::new(&config.redis_url).await?;
    let locks = LockClient::new(Arc::new(lock_backend), config.lock_options());

    let engine = ReservationEngine::new(store.clone(), locks.clone());
    let compensation = CompensationHandler::new(store, locks);

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &config.consumer_group)
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .create()?;

    consumer.subscribe(&[&config.rollback_topic])?;

    let rollback_consumer = RollbackConsumer::new(
        compensation.clone(),
        producer,
        config.reply_topic.clone(),
        config.rollback_max_retries,
    );

    tokio::spawn(async move {
        rollback_consumer.run(consumer).await;
    });

    let app = api::create_router(AppState {
        engine,
        compensation,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Stock service started on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stock service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
