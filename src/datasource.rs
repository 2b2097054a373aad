//! The connection source applications hold on to.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::config::{ConfigChange, LiveConfig};
use crate::db::factory::{ActivePool, PoolFactory};
use crate::db::migrate::{Migrator, SqlxMigrator};
use crate::db::pool::{ManagedPool, PoolBackend};
use crate::db::postgres::PgBackend;
use crate::error::{Error, Result};
use crate::params::{ParameterReader, PoolParameters};
use crate::reconfigure::Reconfigurator;

/// PostgreSQL data source migrated with `sqlx::migrate`.
pub type PgDataSource = DataSource<PgBackend, SqlxMigrator>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub generation: u64,
    pub size: u32,
    pub idle: usize,
}

/// A dynamically reconfigurable, migrated connection pool.
///
/// `start` builds the first pool and follows the configuration from then on:
/// hot-swappable settings are applied to the running pool, anything else
/// builds a replacement pool which is published before the old one is closed.
pub struct DataSource<B: PoolBackend, M> {
    controller: Arc<Reconfigurator<B, M>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<B, M> DataSource<B, M>
where
    B: PoolBackend,
    M: Migrator<B::Pool>,
{
    /// Reads its settings from `config`, below `namespace` if given.
    pub fn new(config: Arc<LiveConfig>, namespace: Option<&str>, backend: B, migrator: M) -> Self {
        let reader = ParameterReader::new(config, namespace);
        Self {
            controller: Arc::new(Reconfigurator::new(
                PoolFactory::new(backend, migrator),
                reader,
            )),
            listener: Mutex::new(None),
        }
    }

    /// Builds the initial pool, runs migrations and starts following
    /// configuration changes. Errors here are fatal: there is no previous
    /// pool to fall back to.
    pub async fn start(&self) -> Result<()> {
        // Subscribe first so changes made while the pool is being built are
        // not missed.
        let changes = self.controller.reader().config().subscribe();
        let generation = self.controller.initialize().await?;

        let mut listener = self.listener.lock();
        if listener.is_none() {
            *listener = Some(tokio::spawn(dispatch(self.controller.clone(), changes)));
        }

        tracing::info!(generation, "Data source started");
        Ok(())
    }

    /// Stops following configuration changes and closes the current pool,
    /// waiting a bounded time for leased connections to be returned.
    pub async fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.controller.shutdown().await;
        tracing::info!("Data source stopped");
    }

    /// Leases a connection from the current pool.
    pub async fn get_connection(&self) -> Result<<B::Pool as ManagedPool>::Connection> {
        let active = self.active()?;
        match active.pool().acquire().await {
            Err(e) if e.is_pool_closed() => self.retry_on_successor(&active, e).await,
            leased => leased,
        }
    }

    /// Opens a connection with explicit credentials, where the backend
    /// supports it.
    pub async fn get_connection_with(
        &self,
        username: &str,
        password: &str,
    ) -> Result<<B::Pool as ManagedPool>::Connection> {
        self.active()?.pool().acquire_with(username, password).await
    }

    /// Health probe: leases and returns one connection. Never fails.
    pub async fn is_running(&self) -> bool {
        match self.get_connection().await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "Data source health probe failed");
                false
            }
        }
    }

    /// How long `get_connection` waits for a connection.
    pub fn login_timeout(&self) -> Result<Duration> {
        Ok(self.active()?.parameters().connection_timeout)
    }

    /// Parameters the current pool was built from.
    pub fn parameters(&self) -> Result<Arc<PoolParameters>> {
        Ok(self.active()?.parameters().clone())
    }

    pub fn status(&self) -> Result<PoolStatus> {
        let active = self.active()?;
        Ok(PoolStatus {
            generation: active.generation(),
            size: active.pool().size(),
            idle: active.pool().num_idle(),
        })
    }

    /// Manually triggers a rebuild from the current configuration.
    pub async fn reload(&self) -> Result<()> {
        self.controller.rebuild().await.map(|_| ())
    }

    fn active(&self) -> Result<Arc<ActivePool<B::Pool>>> {
        self.controller.current().ok_or(Error::NotStarted)
    }

    /// The pool was retired between loading and leasing. Try once more on
    /// whatever replaced it.
    async fn retry_on_successor(
        &self,
        retired: &ActivePool<B::Pool>,
        error: Error,
    ) -> Result<<B::Pool as ManagedPool>::Connection> {
        match self.controller.current() {
            Some(successor) if successor.generation() != retired.generation() => {
                tracing::debug!(
                    retired = retired.generation(),
                    successor = successor.generation(),
                    "Pool retired during lease, retrying on its successor"
                );
                successor.pool().acquire().await
            }
            Some(_) => Err(error),
            None => Err(Error::NotStarted),
        }
    }
}

impl PgDataSource {
    /// A PostgreSQL data source running migrations from `migrations_dir`.
    pub async fn postgres(
        config: Arc<LiveConfig>,
        namespace: Option<&str>,
        migrations_dir: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        let migrator = SqlxMigrator::from_dir(migrations_dir).await?;
        Ok(Self::new(config, namespace, PgBackend, migrator))
    }
}

impl<B: PoolBackend, M> Drop for DataSource<B, M> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Forwards configuration changes to the controller, one task per change.
async fn dispatch<B, M>(
    controller: Arc<Reconfigurator<B, M>>,
    mut changes: broadcast::Receiver<ConfigChange>,
) where
    B: PoolBackend,
    M: Migrator<B::Pool>,
{
    loop {
        match changes.recv().await {
            Ok(change) => {
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.on_change(&change).await {
                        tracing::error!(key = %change.key, error = %e, "Reconfiguration failed");
                    }
                });
            }
            Err(RecvError::Lagged(missed)) => {
                // Which keys changed is unknown, so rebuild from scratch.
                tracing::warn!(missed, "Configuration changes missed, rebuilding pool");
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.rebuild().await {
                        tracing::error!(error = %e, "Reconfiguration failed");
                    }
                });
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeMigrator};

    struct Harness {
        config: Arc<LiveConfig>,
        backend: FakeBackend,
        migrator: FakeMigrator,
        source: DataSource<FakeBackend, FakeMigrator>,
    }

    fn harness() -> Harness {
        let config = Arc::new(LiveConfig::empty());
        config.set("jdbc.jdbcUrl", "postgres://primary/app");

        let backend = FakeBackend::default();
        let migrator = FakeMigrator::default();
        let source = DataSource::new(config.clone(), Some("jdbc"), backend.clone(), migrator.clone());

        Harness {
            config,
            backend,
            migrator,
            source,
        }
    }

    async fn wait_for_generation(source: &DataSource<FakeBackend, FakeMigrator>, generation: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.status().map(|s| s.generation).ok() != Some(generation) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("generation was never published");
    }

    #[tokio::test]
    async fn test_not_started() {
        let h = harness();

        assert!(matches!(h.source.get_connection().await, Err(Error::NotStarted)));
        assert!(matches!(h.source.login_timeout(), Err(Error::NotStarted)));
        assert!(!h.source.is_running().await);
        assert!(h.backend.pools().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_connect() {
        let h = harness();
        h.source.start().await.unwrap();

        let conn = h.source.get_connection().await.unwrap();
        assert_eq!(conn.url(), "postgres://primary/app");
        assert!(h.source.is_running().await);
        assert_eq!(h.source.login_timeout().unwrap(), Duration::from_millis(30_000));
        assert_eq!(h.migrator.run_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let h = harness();
        h.migrator.fail_for("postgres://primary/app");

        assert!(matches!(h.source.start().await, Err(Error::Migration(_))));
        assert!(matches!(h.source.get_connection().await, Err(Error::NotStarted)));
        assert!(h.backend.pools()[0].is_closed());
    }

    #[tokio::test]
    async fn test_stop_then_connect_fails() {
        let h = harness();
        h.source.start().await.unwrap();
        h.source.stop().await;

        assert!(matches!(h.source.get_connection().await, Err(Error::NotStarted)));
        assert!(h.backend.pools()[0].is_closed());
    }

    #[tokio::test]
    async fn test_per_call_credentials_unsupported_by_backend() {
        let h = harness();
        h.source.start().await.unwrap();

        assert!(matches!(
            h.source.get_connection_with("app", "secret").await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_follows_restart_change_through_channel() {
        let h = harness();
        h.source.start().await.unwrap();

        h.config.set("jdbc.jdbcUrl", "postgres://replica/app");
        wait_for_generation(&h.source, 1).await;

        let conn = h.source.get_connection().await.unwrap();
        assert_eq!(conn.url(), "postgres://replica/app");
        assert!(h.backend.pools()[0].is_closed());
        assert_eq!(h.migrator.runs()[1].url, "postgres://replica/app");
    }

    #[tokio::test]
    async fn test_follows_hot_change_through_channel() {
        let h = harness();
        h.source.start().await.unwrap();

        h.config.set("jdbc.maximumPoolSize", 20);
        let pool = h.backend.pools()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.maximum_pool_size() != 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.source.status().unwrap().generation, 0);
        assert_eq!(h.backend.pools().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_change_keeps_serving() {
        let h = harness();
        h.source.start().await.unwrap();
        h.backend.make_unreachable("postgres://down/app");

        h.config.set("jdbc.jdbcUrl", "postgres://down/app");
        assert!(h.source.reload().await.is_err());

        let conn = h.source.get_connection().await.unwrap();
        assert_eq!(conn.url(), "postgres://primary/app");
        assert_eq!(h.source.status().unwrap().generation, 0);
    }

    #[tokio::test]
    async fn test_lease_on_retired_pool_moves_to_successor() {
        let h = harness();
        h.source.start().await.unwrap();
        let retired = h.source.controller.current().unwrap();

        h.config.set("jdbc.jdbcUrl", "postgres://replica/app");
        h.source.reload().await.unwrap();

        let closed = retired.pool().acquire().await.unwrap_err();
        let conn = h.source.retry_on_successor(&retired, closed).await.unwrap();
        assert_eq!(conn.url(), "postgres://replica/app");
    }

    #[tokio::test]
    async fn test_reload_returns_while_old_lease_is_held() {
        let h = harness();
        h.source.start().await.unwrap();
        let held = h.source.get_connection().await.unwrap();

        h.config.set("jdbc.jdbcUrl", "postgres://replica/app");
        tokio::time::timeout(Duration::from_secs(2), h.source.reload())
            .await
            .expect("reload blocked on the retired pool")
            .unwrap();

        let conn = h.source.get_connection().await.unwrap();
        assert_eq!(conn.url(), "postgres://replica/app");
        assert_eq!(held.url(), "postgres://primary/app");
        assert!(h.backend.pools()[0].is_closed());
    }

    #[tokio::test]
    async fn test_stop_ignores_later_changes() {
        let h = harness();
        h.source.start().await.unwrap();
        h.source.stop().await;

        h.config.set("jdbc.jdbcUrl", "postgres://replica/app");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.backend.pools().len(), 1);
        assert!(matches!(h.source.status(), Err(Error::NotStarted)));
    }

    #[tokio::test]
    #[ignore] // Requires a running PostgreSQL at DATABASE_URL
    async fn test_postgres_data_source() {
        let config = Arc::new(LiveConfig::empty());
        config.set("db.jdbcUrl", std::env::var("DATABASE_URL").unwrap());
        config.set("db.flyway.bypass", true);

        let source = PgDataSource::new(
            config.clone(),
            Some("db"),
            PgBackend,
            SqlxMigrator::new(sqlx::migrate::Migrator::DEFAULT),
        );
        source.start().await.unwrap();
        assert!(source.is_running().await);

        config.set("db.poolName", "reporting");
        source.reload().await.unwrap();

        let mut conn = source.get_connection().await.unwrap();
        let name: String = sqlx::query_scalar("SELECT current_setting('application_name')")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(name, "reporting");
        drop(conn);

        source.stop().await;
    }
}
