use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livepool::db::{PgBackend, SqlxMigrator};
use livepool::{Key, LiveConfig, PgDataSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livepool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting livepool...");

    let namespace = std::env::var("LIVEPOOL_NAMESPACE").unwrap_or_else(|_| "db".to_string());
    let migrations_dir = std::env::var("MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrations_found = Path::new(&migrations_dir).is_dir();
    if !migrations_found {
        // Set in the environment so a later reload keeps it
        tracing::warn!(%migrations_dir, "Migrations directory not found, bypassing migrations");
        std::env::set_var(bypass_variable(&namespace), "true");
    }

    // Load configuration
    let config = Arc::new(LiveConfig::from_env()?);
    tracing::info!(%namespace, %migrations_dir, "Configuration loaded successfully");

    // Create the data source; start() builds the first pool and migrates it
    let source = if migrations_found {
        PgDataSource::postgres(config.clone(), Some(&namespace), &migrations_dir)
            .await
            .with_context(|| format!("loading migrations from {}", migrations_dir))?
    } else {
        PgDataSource::new(
            config.clone(),
            Some(&namespace),
            PgBackend,
            SqlxMigrator::new(sqlx::migrate::Migrator::DEFAULT),
        )
    };
    source.start().await?;

    let status = source.status()?;
    tracing::info!(
        generation = status.generation,
        size = status.size,
        idle = status.idle,
        healthy = source.is_running().await,
        "Data source ready"
    );

    // SIGHUP re-reads the environment and .env; Ctrl-C shuts down
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                match config.reload_from_env() {
                    Ok(changed) => tracing::info!(changed = changed.len(), "Configuration reloaded"),
                    Err(e) => tracing::error!(error = %e, "Configuration reload failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, cleaning up...");
                break;
            }
        }
    }

    source.stop().await;
    Ok(())
}

/// Environment variable for the migration bypass key under `namespace`.
fn bypass_variable(namespace: &str) -> String {
    let key = match namespace.trim() {
        "" => Key::MigrationBypass.to_string(),
        prefix => format!("{}.{}", prefix, Key::MigrationBypass),
    };
    key.to_ascii_uppercase().replace('.', "__")
}
