use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use price_index::config::ServiceConfig;
use price_index::http::{create_router, AppState};
use price_index::logging::init_logging;
use price_index::service::PriceIndexService;

#[derive(Debug, Parser)]
#[command(name = "price-index", version, about = "Card price index service")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PRICE_INDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.bind`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let mut config = ServiceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    init_logging(&config.logging.level, config.logging.format).map_err(anyhow::Error::msg)?;
    tracing::info!(version = price_index::SERVICE_VERSION, "Starting price index service");

    let bind = config.server.bind.clone();
    let service = PriceIndexService::start(config).await?;
    let app = create_router(AppState::new(service.components().clone()));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!("Listening on {}", bind);

    let shutdown = service.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    service.shutdown().await;
    Ok(())
}
