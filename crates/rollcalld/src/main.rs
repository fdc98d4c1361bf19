use anyhow::{Context, Result};
use rollcall_core::{AttendanceService, Stores, SystemClock};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod extractor;

use config::Config;
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use extractor::ExtractorProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    let engine_config = config.engine_config()?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path, config.storage_timeout())
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    let engine = Arc::new(AttendanceService::new(
        engine_config,
        Stores::shared(store),
        Arc::new(SystemClock),
    )?);

    let provider = ExtractorProvider::from_command_line(&config.extractor_cmd)
        .context("extractor_cmd is empty")?;
    tracing::info!(
        extractor = provider.program(),
        timeout_ms = config.provider_timeout_ms,
        "face extractor configured"
    );

    let service = RollcallService::new(engine.clone(), provider, config.provider_timeout());
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let sweeper = tokio::spawn(sweep_cache(engine, config.sweep_interval()));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    sweeper.abort();
    tracing::info!("rollcalld shutting down");

    Ok(())
}

/// Periodically evict idle faces from the confirmation cache.
async fn sweep_cache(engine: Arc<AttendanceService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let evicted = engine.sweep();
        if evicted > 0 {
            tracing::debug!(evicted, "confirmation cache swept");
        }
    }
}
