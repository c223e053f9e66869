use anyhow::Result;
use clap::Parser;
use ninja_throttle::app::AppContext;
use ninja_throttle::config::Settings;
use ninja_throttle::server::{create_api, Server};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ninja-throttle", version, about = "Throttled axum API server")]
struct Args {
    /// Address to bind, overrides BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level, overrides LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ninja_throttle={},tower_http=debug", settings.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ninja-throttle");
    tracing::info!(
        bind_addr = %settings.bind_addr,
        redis = settings.redis_url.is_some(),
        throttle_classes = %settings.throttle_classes,
        "Configuration loaded"
    );

    let app = AppContext::from_settings(&settings)
        .map_err(|e| anyhow::anyhow!("Failed to install throttling: {}", e))?;
    let api = create_api(&app).map_err(|e| anyhow::anyhow!("Failed to build api: {}", e))?;

    Server::new(api, settings.bind_addr)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
