use market_ingest::IngestConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    init_tracing();

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Err(error) = market_ingest::run(config).await {
        tracing::error!(%error, class = ?error.class(), "market ingestion failed");
        std::process::exit(1);
    }
}
