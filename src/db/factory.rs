use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::migrate::{self, Migrator};
use crate::db::pool::{ManagedPool, PoolBackend};
use crate::error::Result;
use crate::params::{LiveSetting, MigrationPolicy, PoolParameters};

/// How long a retired pool waits for leased connections before it stops
/// waiting. Connections returned later are closed on return.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// A physical pool together with the parameters it was built from.
pub struct ActivePool<P> {
    generation: u64,
    parameters: Arc<PoolParameters>,
    pool: P,
}

impl<P: ManagedPool> ActivePool<P> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Parameters at construction time; hot-swapped tunables are not
    /// reflected here.
    pub fn parameters(&self) -> &Arc<PoolParameters> {
        &self.parameters
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Pushes one tunable into the live pool.
    pub async fn apply_live(&self, setting: LiveSetting) {
        match setting {
            LiveSetting::MaximumPoolSize(size) => self.pool.set_maximum_pool_size(size),
            LiveSetting::MinimumIdle(idle) => self.pool.set_minimum_idle(idle).await,
            LiveSetting::IdleTimeout(timeout) => self.pool.set_idle_timeout(timeout),
            LiveSetting::MaxLifetime(lifetime) => self.pool.set_max_lifetime(lifetime),
            LiveSetting::ValidationTimeout(timeout) => self.pool.set_validation_timeout(timeout),
        }
    }

    /// Stops new leases now and drains the pool in the background.
    pub fn retire(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!(generation = self.generation, "Closing pool");
        self.pool.begin_close();
        tokio::spawn(async move { self.drain(DRAIN_GRACE).await })
    }

    pub(crate) async fn drain(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.pool.close()).await {
            Ok(()) => tracing::info!(generation = self.generation, "Pool drained and closed"),
            Err(_) => tracing::warn!(
                generation = self.generation,
                grace_ms = grace.as_millis() as u64,
                size = self.pool.size(),
                "Connections still leased from retired pool, they will be closed when returned"
            ),
        }
    }
}

/// Builds pools and migrates them before handing them out.
pub struct PoolFactory<B, M> {
    backend: B,
    migrator: M,
}

impl<B, M> PoolFactory<B, M>
where
    B: PoolBackend,
    M: Migrator<B::Pool>,
{
    pub fn new(backend: B, migrator: M) -> Self {
        Self { backend, migrator }
    }

    /// Connects a new pool and migrates it. A pool whose migration fails is
    /// closed before the error is returned.
    pub async fn build(
        &self,
        parameters: PoolParameters,
        policy: MigrationPolicy,
        generation: u64,
    ) -> Result<ActivePool<B::Pool>> {
        let pool = self.backend.connect(&parameters).await?;

        if let Err(e) = migrate::migrate(&self.migrator, &pool, &policy).await {
            tracing::warn!(generation, error = %e, "Closing pool after failed migration");
            pool.close().await;
            return Err(e.into());
        }

        tracing::info!(generation, "Pool ready");
        Ok(ActivePool {
            generation,
            parameters: Arc::new(parameters),
            pool,
        })
    }
}
