use anyhow::Result;
use tracing_subscriber::EnvFilter;

use agora_control_service::build_router;
use agora_control_service::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    let env_filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .init();

    let bind_addr = config.bind_addr;
    let router = build_router(config);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(
        target: "agora.service",
        addr = %bind_addr,
        "agora control service listening",
    );
    axum::serve(listener, router).await?;

    Ok(())
}
