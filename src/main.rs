use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shipping_service::cart_forwarder::CartForwarder;
use shipping_service::city_store::DbCityStore;
use shipping_service::cli_args::Cli;
use shipping_service::configuration::ShippingConfiguration;
use shipping_service::db::ConnectionPool;
use shipping_service::distance::ORIGIN;
use shipping_service::query_service::QueryService;
use shipping_service::reqwest_helpers::create_client;
use shipping_service::retry::RetryExecutor;
use shipping_service::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ShippingConfiguration::from_cli(args)?;
    event!(Level::INFO, "Shipping config: {:?}", cfg);

    let shutdown = CancellationToken::new();
    let retry = RetryExecutor::with_shutdown(cfg.retry_policy, shutdown.clone());

    let pool = match ConnectionPool::initialize(&cfg.connection, &retry).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            event!(Level::ERROR, "Fatal: cannot serve without the cities database: {:#}", e);
            return Err(e).context("database initialization failed");
        }
    };

    let city_store = DbCityStore::new(QueryService::new(Arc::clone(&pool), retry.clone()));
    let client = create_client(cfg.cart_connect_timeout).context("failed to build http client")?;
    let cart = CartForwarder::new(client, cfg.cart_url.clone(), retry.clone());

    let app = router(AppState {
        city_store: Arc::new(city_store),
        cart: Arc::new(cart),
        origin: ORIGIN,
    });

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    event!(Level::INFO, "Ready on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    pool.close().await;
    event!(Level::INFO, "Shut down");

    Ok(())
}

/// Cancelling the token also aborts retry waits still in flight.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        event!(Level::ERROR, "Failed to listen for ctrl-c, running until killed: {}", e);
        std::future::pending::<()>().await;
    }
    event!(Level::INFO, "Shutting down");
    shutdown.cancel();
}
