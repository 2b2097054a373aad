//! In-memory pool backend and migrator for exercising the reconfiguration
//! logic without a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::db::migrate::{MigrationError, Migrator};
use crate::db::pool::{ManagedPool, PoolBackend};
use crate::error::{Error, Result};
use crate::params::PoolParameters;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub fn params_for(url: &str) -> PoolParameters {
    PoolParameters {
        url: Some(url.to_string()),
        ..PoolParameters::default()
    }
}

#[derive(Debug, Clone)]
pub struct FakePool {
    state: Arc<FakePoolState>,
}

#[derive(Debug)]
struct FakePoolState {
    id: u64,
    url: String,
    connection_timeout: Duration,
    closed: AtomicBool,
    leased: AtomicU32,
    returned: Notify,
    maximum_pool_size: AtomicU32,
    minimum_idle: AtomicU32,
    idle_timeout_ms: AtomicU64,
    max_lifetime_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
}

impl FakePool {
    pub fn new(params: &PoolParameters) -> Self {
        Self {
            state: Arc::new(FakePoolState {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst),
                url: params.url.clone().unwrap_or_default(),
                connection_timeout: params.connection_timeout,
                closed: AtomicBool::new(false),
                leased: AtomicU32::new(0),
                returned: Notify::new(),
                maximum_pool_size: AtomicU32::new(params.maximum_pool_size),
                minimum_idle: AtomicU32::new(params.minimum_idle),
                idle_timeout_ms: AtomicU64::new(params.idle_timeout.as_millis() as u64),
                max_lifetime_ms: AtomicU64::new(params.max_lifetime.as_millis() as u64),
                validation_timeout_ms: AtomicU64::new(params.validation_timeout.as_millis() as u64),
            }),
        }
    }

    /// A pool not tracked by any backend.
    pub fn detached(url: &str) -> Self {
        Self::new(&params_for(url))
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn url(&self) -> &str {
        &self.state.url
    }

    pub fn leased(&self) -> u32 {
        self.state.leased.load(Ordering::SeqCst)
    }

    pub fn maximum_pool_size(&self) -> u32 {
        self.state.maximum_pool_size.load(Ordering::SeqCst)
    }

    pub fn minimum_idle(&self) -> u32 {
        self.state.minimum_idle.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.state.idle_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.state.max_lifetime_ms.load(Ordering::SeqCst))
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.state.validation_timeout_ms.load(Ordering::SeqCst))
    }

    fn unavailable(&self, source: sqlx::Error) -> Error {
        Error::ConnectionUnavailable {
            timeout: self.state.connection_timeout,
            source,
        }
    }
}

/// A leased fake connection; remembers which pool it came from.
#[derive(Debug)]
pub struct FakeConnection {
    pool: Arc<FakePoolState>,
}

impl FakeConnection {
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    pub fn url(&self) -> &str {
        &self.pool.url
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.pool.leased.fetch_sub(1, Ordering::SeqCst);
        self.pool.returned.notify_waiters();
    }
}

#[async_trait]
impl ManagedPool for FakePool {
    type Connection = FakeConnection;

    async fn acquire(&self) -> Result<FakeConnection> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(self.unavailable(sqlx::Error::PoolClosed));
        }

        let limit = self.maximum_pool_size();
        let claimed = self
            .state
            .leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |leased| {
                (leased < limit).then_some(leased + 1)
            });
        if claimed.is_err() {
            return Err(self.unavailable(sqlx::Error::PoolTimedOut));
        }

        Ok(FakeConnection {
            pool: self.state.clone(),
        })
    }

    fn set_maximum_pool_size(&self, size: u32) {
        self.state.maximum_pool_size.store(size, Ordering::SeqCst);
    }

    async fn set_minimum_idle(&self, idle: u32) {
        self.state.minimum_idle.store(idle, Ordering::SeqCst);
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        self.state
            .idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    fn set_max_lifetime(&self, lifetime: Duration) {
        self.state
            .max_lifetime_ms
            .store(lifetime.as_millis() as u64, Ordering::SeqCst);
    }

    fn set_validation_timeout(&self, timeout: Duration) {
        self.state
            .validation_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    fn size(&self) -> u32 {
        self.leased().max(self.minimum_idle())
    }

    fn num_idle(&self) -> usize {
        self.minimum_idle().saturating_sub(self.leased()) as usize
    }

    fn begin_close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.begin_close();
        loop {
            let returned = self.state.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();
            if self.leased() == 0 {
                return;
            }
            returned.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<BackendState>,
}

#[derive(Default)]
struct BackendState {
    pools: Mutex<Vec<FakePool>>,
    unreachable: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn make_unreachable(&self, url: &str) {
        self.state.unreachable.lock().insert(url.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Every pool this backend created, oldest first.
    pub fn pools(&self) -> Vec<FakePool> {
        self.state.pools.lock().clone()
    }
}

#[async_trait]
impl PoolBackend for FakeBackend {
    type Pool = FakePool;

    async fn connect(&self, params: &PoolParameters) -> Result<FakePool> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let url = params.url.clone().unwrap_or_default();
        if self.state.unreachable.lock().contains(&url) {
            return Err(Error::PoolConstruction(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused connection", url),
            ))));
        }

        let pool = FakePool::new(params);
        self.state.pools.lock().push(pool.clone());
        Ok(pool)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub pool_id: u64,
    pub url: String,
    pub baseline: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakeMigrator {
    state: Arc<MigratorState>,
}

#[derive(Default)]
struct MigratorState {
    runs: Mutex<Vec<MigrationRun>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeMigrator {
    pub fn fail_for(&self, url: &str) {
        self.state.failing.lock().insert(url.to_string());
    }

    pub fn runs(&self) -> Vec<MigrationRun> {
        self.state.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.state.runs.lock().len()
    }
}

#[async_trait]
impl Migrator<FakePool> for FakeMigrator {
    async fn apply(&self, pool: &FakePool, baseline: Option<&str>) -> std::result::Result<(), MigrationError> {
        self.state.runs.lock().push(MigrationRun {
            pool_id: pool.id(),
            url: pool.url().to_string(),
            baseline: baseline.map(str::to_string),
        });

        if self.state.failing.lock().contains(pool.url()) {
            return Err(MigrationError::Database(sqlx::Error::Protocol(
                "migration 2 failed".to_string(),
            )));
        }
        Ok(())
    }
}
