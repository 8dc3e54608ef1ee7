use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use weir_common::config::AppConfig;
use weir_common::telemetry::init_telemetry;
use weir_core::{Gateway, PolicyStore};
use weir_server::api::{create_router, AppState};
use weir_server::auth::TokenAuthenticator;
use weir_server::load_connectors;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("WEIR_CONFIG").unwrap_or_else(|_| "configs/weir.yaml".to_string());
    let config = AppConfig::from_file(&config_path)?;

    let telemetry_layer = if config.telemetry.enabled {
        Some(init_telemetry(
            &config.telemetry.service_name,
            &config.telemetry.endpoint,
        )?)
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    info!(name = %config.server.name, "starting weir gateway");

    let registry = load_connectors(Path::new(&config.server.manifest_dir))?;
    let policies = Arc::new(
        PolicyStore::load_dir(Path::new(&config.server.policy_dir))
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let auth = Arc::new(TokenAuthenticator::new(
        &config.server.token_file,
        &config.server.auth,
    ));

    let gateway = Arc::new(Gateway::new(
        registry,
        config.query_limits,
        config.cache.clone(),
    ));

    // Periodic TTL sweep keeps expired entries from pinning memory between
    // touches of their keys.
    {
        let cache = gateway.cache().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        });
    }

    let app = create_router(AppState {
        gateway,
        policies,
        auth,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "listening");
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
