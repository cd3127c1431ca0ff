//! Service entry: configuration, logging, store, engine, shutdown.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use runlet_config::Settings;
use runlet_engine::Engine;
use runlet_store::Store;

/// Initialize tracing. RUST_LOG wins when set; otherwise the configured
/// level applies to the runlet crates and warnings to everything else.
fn init_tracing(settings: &Settings) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        let level = &settings.log_level;
        tracing_subscriber::EnvFilter::new(format!(
            "runlet={level},runlet_config={level},runlet_store={level},\
             runlet_env={level},runlet_runner={level},runlet_engine={level},warn"
        ))
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);
    settings.ensure_dirs()?;
    if let Some(database_path) = settings.database_path() {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let store = Store::connect(&settings.database_url)
        .await
        .with_context(|| format!("failed to open database {}", settings.database_url))?;
    let engine = Engine::start(settings, store).await?;
    info!("runlet engine ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    engine.shutdown().await?;
    Ok(())
}
