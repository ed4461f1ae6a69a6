use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waf_gateway::app::{router, AppState};
use waf_gateway::config::WafConfig;
use waf_gateway::kv::{KvStore, RedisKv};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(WafConfig::from_env()?);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(&config.kv_store_url)
            .await
            .context("Failed to connect to the KV store")?,
    );
    info!("KV store connected");

    let state = AppState::new(config, kv)?;
    let app = router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Starting waf-gateway");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
