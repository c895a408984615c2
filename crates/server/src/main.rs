//! prerender server entry point.
//!
//! Boots the HTTP server in front of the headless renderer and snapshot cache.
//! Logging goes to stderr as JSON, filtered by `RUST_LOG`.

use std::sync::Arc;

use anyhow::Result;
use prerender_client::{HealthCheckNotifier, Renderer, UrlGuard};
use prerender_core::{AppConfig, SnapshotStore};
use tracing_subscriber::EnvFilter;

mod error;
mod orchestrator;
mod routes;
#[cfg(test)]
mod testing;

use orchestrator::CacheOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;

    let store = if config.cache_enabled() {
        let store = SnapshotStore::open(
            config.snapshot_dir.clone(),
            config.cache_duration_minutes,
            config.cache_max_entries,
        )
        .await?;
        tracing::info!(
            dir = %config.snapshot_dir.display(),
            ttl_minutes = config.cache_duration_minutes,
            max_entries = config.cache_max_entries,
            "snapshot cache enabled"
        );
        Some(Arc::new(store))
    } else {
        tracing::info!("snapshot cache disabled");
        None
    };

    let guard = UrlGuard::new(config.render_only.clone(), config.restricted_url_pattern.as_deref())?;
    let renderer = build_renderer(&config, guard.clone()).await?;

    let mut orchestrator = CacheOrchestrator::new(renderer, store, guard, &config);
    if let Some(key) = config.alert_key() {
        let notifier = HealthCheckNotifier::new(&config.health_check_url, key)?;
        tracing::info!(endpoint = %notifier.endpoint(), "failure alerts enabled");
        orchestrator = orchestrator.with_notifier(Arc::new(notifier));
    }

    let app = routes::build_router(Arc::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!(addr = %config.bind_addr(), "Starting prerender server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "render")]
async fn build_renderer(config: &AppConfig, guard: UrlGuard) -> Result<Arc<dyn Renderer>> {
    use prerender_client::{HeadlessConfig, HeadlessRenderer};

    let renderer = HeadlessRenderer::new(HeadlessConfig::from(config), guard).await?;
    Ok(Arc::new(renderer))
}

#[cfg(not(feature = "render"))]
async fn build_renderer(_config: &AppConfig, _guard: UrlGuard) -> Result<Arc<dyn Renderer>> {
    anyhow::bail!("prerender was built without the `render` feature; no renderer is available")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutting down");
}
