//! Schema migrations run against a freshly built pool.

use std::path::Path;

use async_trait::async_trait;
use sqlx::migrate::{Migrate, MigrateError};
use thiserror::Error;

use crate::db::pool::ManagedPool;
use crate::db::postgres::PgManagedPool;
use crate::params::MigrationPolicy;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("{0}")]
    Migrate(#[from] MigrateError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid baseline version '{0}' (expected an integer migration version)")]
    InvalidBaseline(String),
}

/// Brings the database behind a pool up to the expected schema version.
#[async_trait]
pub trait Migrator<P: ManagedPool>: Send + Sync + 'static {
    /// Applies pending migrations. With a baseline, a database that has never
    /// been migrated is first stamped as being at that version.
    async fn apply(&self, pool: &P, baseline: Option<&str>) -> Result<(), MigrationError>;
}

/// Runs `migrator` against `pool` unless the policy bypasses migrations.
pub async fn migrate<P, M>(migrator: &M, pool: &P, policy: &MigrationPolicy) -> Result<(), MigrationError>
where
    P: ManagedPool,
    M: Migrator<P>,
{
    if policy.bypass {
        tracing::info!("Migrations bypassed by configuration");
        return Ok(());
    }

    migrator
        .apply(pool, policy.baseline_version.as_deref())
        .await?;

    tracing::info!(
        baseline = policy.baseline_version.as_deref().unwrap_or("none"),
        "Database migrations completed"
    );
    Ok(())
}

/// Migrator backed by `sqlx::migrate`.
pub struct SqlxMigrator {
    inner: sqlx::migrate::Migrator,
}

impl SqlxMigrator {
    pub fn new(inner: sqlx::migrate::Migrator) -> Self {
        Self { inner }
    }

    /// Loads migrations from a directory of `<version>_<description>.sql` files.
    pub async fn from_dir(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let inner = sqlx::migrate::Migrator::new(path.as_ref()).await?;
        Ok(Self { inner })
    }

    async fn stamp_baseline(&self, pool: &sqlx::PgPool, baseline: &str) -> Result<(), MigrationError> {
        let version: i64 = baseline
            .trim()
            .parse()
            .map_err(|_| MigrationError::InvalidBaseline(baseline.to_string()))?;

        let mut conn = pool.acquire().await?;
        conn.lock().await?;

        let stamped = self.stamp_if_unversioned(&mut conn, version).await;
        // Release the advisory lock whether or not stamping worked.
        let unlocked = conn.unlock().await;

        let stamped = stamped?;
        unlocked?;

        if stamped > 0 {
            tracing::info!(
                baseline = version,
                stamped,
                "Unversioned database baselined"
            );
        }
        Ok(())
    }

    async fn stamp_if_unversioned(
        &self,
        conn: &mut sqlx::PgConnection,
        version: i64,
    ) -> Result<usize, MigrationError> {
        conn.ensure_migrations_table().await?;
        if !conn.list_applied_migrations().await?.is_empty() {
            return Ok(0);
        }

        let mut stamped = 0;
        for migration in self.inner.iter() {
            if migration.migration_type.is_down_migration() || migration.version > version {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
                VALUES ($1, $2, TRUE, $3, 0)
                "#,
            )
            .bind(migration.version)
            .bind(&*migration.description)
            .bind(&*migration.checksum)
            .execute(&mut *conn)
            .await?;

            stamped += 1;
        }

        Ok(stamped)
    }
}

#[async_trait]
impl Migrator<PgManagedPool> for SqlxMigrator {
    async fn apply(&self, pool: &PgManagedPool, baseline: Option<&str>) -> Result<(), MigrationError> {
        if let Some(baseline) = baseline {
            self.stamp_baseline(pool.inner(), baseline).await?;
        }

        self.inner.run(pool.inner()).await?;
        Ok(())
    }
}
