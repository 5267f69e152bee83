use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use credit_ledger::{
    cache,
    config::Config,
    handlers,
    service::{CreditService, ServiceSettings},
    store::{LedgerStore, PgLedgerStore},
    sweeper::ExpirySweeper,
};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    info!("Starting Credit Ledger on port {}", config.server.port);

    let pg_store = PgLedgerStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    pg_store
        .ensure_schema()
        .await
        .context("Failed to prepare ledger schema")?;
    let store: Arc<dyn LedgerStore> = Arc::new(pg_store);

    cache::install(
        cache::from_config(&config.cache)
            .await
            .context("Failed to create activity cache")?,
    )?;
    let activity_cache = cache::installed().context("Activity cache not installed")?;

    let settings = ServiceSettings::from_config(&config).map_err(anyhow::Error::msg)?;
    let credit_service = Arc::new(CreditService::new(store.clone(), activity_cache, settings));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = Arc::new(ExpirySweeper::new(store, config.sweeper.interval()));
        Some(sweeper.spawn(shutdown_rx))
    } else {
        info!("Expiry sweeper disabled");
        None
    };

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(credit_service.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run();

    let served = server.await;

    info!("HTTP server stopped, shutting down background work");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Expiry sweeper task failed");
        }
    }

    if let Err(e) = cache::teardown().await {
        error!(error = %e, "Failed to tear down activity cache");
    }

    served.context("HTTP server error")
}
