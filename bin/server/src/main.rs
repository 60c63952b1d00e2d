use botwright_server::{config::ServerConfig, error::StartupError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            let error = StartupError::Config {
                details: error.to_string(),
            };
            tracing::error!(error = %error, "failed to start");
            std::process::exit(1);
        }
    };
    tracing::info!("Loaded configuration");

    if let Err(report) = botwright_server::run(config).await {
        tracing::error!(error = %report, "server stopped");
        std::process::exit(1);
    }
}
