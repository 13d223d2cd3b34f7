use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use susu_ledger::{
    api::{self, AppState},
    config::{CliArgs, Config},
    storage, Ledger, LedgerSettings, TimeSource,
};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Server stopped");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics exporter not installed");
            None
        }
    };

    let backend = storage::open_backend(&config.storage)?;
    let settings = LedgerSettings {
        page_size: config.ledger.page_size,
    };
    let ledger = Arc::new(Ledger::new(backend, settings, TimeSource::system())?);

    let app = api::router(AppState { ledger, metrics });
    let addr = config.listen_addr()?;
    tracing::info!(%addr, "susu-ledger listening");

    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
