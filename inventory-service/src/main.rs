mod api;
mod error;
mod handlers;
mod ledger;
mod models;
mod outbox;
mod schema;
mod service;
mod store;
mod sweeper;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use diesel::Connection;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::outbox::{EventPublisher, KafkaPublisher, LogPublisher, OutboxProcessor};
use crate::service::InventoryService;
use crate::store::{InventoryStore, MemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "inventory-service")]
struct Args {
    /// Runs on a process-local store when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disables the command consumer and logs outbox events when unset.
    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    #[arg(long, default_value = "inventory-service-commands")]
    command_topic: String,

    #[arg(long, default_value = "order-replies")]
    reply_topic: String,

    #[arg(long, env = "PORT", default_value = "3003")]
    port: u16,

    #[arg(long, env = "RESERVATION_TTL_MINUTES", default_value = "15", value_parser = clap::value_parser!(i64).range(1..))]
    reservation_ttl_minutes: i64,

    #[arg(long, default_value = "5")]
    outbox_interval_secs: u64,

    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let store: Arc<dyn InventoryStore> = match &args.database_url {
        Some(database_url) => {
            // Run migrations first
            info!("Running database migrations...");
            let mut conn = PgConnection::establish(database_url)?;
            conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
            info!("Migrations completed successfully");

            let config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
            let pool = Pool::builder().build(config).await?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, inventory is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let service = InventoryService::new(
        store.clone(),
        chrono::Duration::minutes(args.reservation_ttl_minutes),
    );

    let publisher: Arc<dyn EventPublisher> = match &args.kafka_brokers {
        Some(kafka_brokers) => {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", kafka_brokers)
                .set("message.timeout.ms", "5000")
                .create()?;

            let consumer: StreamConsumer = ClientConfig::new()
                .set("group.id", "inventory-service")
                .set("bootstrap.servers", kafka_brokers)
                .set("enable.partition.eof", "false")
                .set("session.timeout.ms", "6000")
                .set("enable.auto.commit", "false")
                .create()?;

            consumer.subscribe(&[&args.command_topic])?;

            let command_handler = handlers::CommandHandler::new(
                handlers::CommandProcessor::new(service.clone()),
                producer.clone(),
                args.reply_topic.clone(),
            );

            tokio::spawn(async move {
                command_handler.run(consumer).await;
            });

            info!("Consuming commands from {}", args.command_topic);
            Arc::new(KafkaPublisher::new(producer))
        }
        None => {
            warn!("KAFKA_BROKERS not set, command consumer disabled and outbox events are logged");
            Arc::new(LogPublisher)
        }
    };

    let outbox_processor = OutboxProcessor::new(
        store.clone(),
        publisher,
        Duration::from_secs(args.outbox_interval_secs),
    );
    let reservation_sweeper = sweeper::ReservationSweeper::new(
        service.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    );

    tokio::spawn(async move {
        outbox_processor.run().await;
    });

    tokio::spawn(async move {
        reservation_sweeper.run().await;
    });

    // Start the web server
    let app = api::create_router(api::AppState { service });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Inventory service web server started on port {}", args.port);
    info!("Inventory service ready to accept HTTP requests at http://0.0.0.0:{}/products/{{product_id}}/inventory", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
