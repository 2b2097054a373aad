//! PostgreSQL pools built on `sqlx`.
//!
//! `sqlx` fixes most pool options at construction, so the tunables that must
//! change on a live pool are enforced here instead:
//! - the maximum size by a [`LeaseGate`] in front of `PgPool::acquire`,
//! - idle timeout, max lifetime and validation timeout by a `before_acquire`
//!   hook reading atomics, so stale connections are dropped on reuse,
//! - the minimum idle count by a keeper task that tops the pool up.
//!
//! The `sqlx` reaper still closes idle and expired connections in the
//! background, using the values the pool was built with.

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::pool::{PoolConnection, PoolConnectionMetadata};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::db::pool::{ManagedPool, PoolBackend};
use crate::error::{Error, Result};
use crate::keys::Key;
use crate::params::PoolParameters;

/// Physical connections the underlying `sqlx` pool may open, unless the
/// initial maximum is larger. The live maximum is enforced by the lease gate
/// below this ceiling.
const PHYSICAL_CEILING: u32 = 100;

const DEFAULT_POOL_NAME: &str = "livepool";

/// How often the keeper checks the live minimum idle count.
const KEEPER_INTERVAL: Duration = Duration::from_secs(30);

/// Builds [`PgManagedPool`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgBackend;

#[async_trait]
impl PoolBackend for PgBackend {
    type Pool = PgManagedPool;

    async fn connect(&self, params: &PoolParameters) -> Result<PgManagedPool> {
        PgManagedPool::connect(params).await
    }
}

pub struct PgManagedPool {
    pool: PgPool,
    gate: Arc<LeaseGate>,
    tunables: Arc<Tunables>,
    session: Arc<SessionSetup>,
    connect_options: PgConnectOptions,
    connection_timeout: Duration,
    leak_threshold: Option<Duration>,
    ceiling: u32,
    keeper: JoinHandle<()>,
    name: Arc<str>,
}

impl PgManagedPool {
    pub async fn connect(params: &PoolParameters) -> Result<Self> {
        check_driver(params)?;
        let connect_options = connect_options(params)?;
        let session = Arc::new(SessionSetup::from_params(params)?);
        let tunables = Arc::new(Tunables::from_params(params));
        let name: Arc<str> = params
            .pool_name
            .as_deref()
            .unwrap_or(DEFAULT_POOL_NAME)
            .into();

        if params.allow_pool_suspension || params.register_mbeans {
            tracing::debug!(
                pool = %name,
                allow_pool_suspension = params.allow_pool_suspension,
                register_mbeans = params.register_mbeans,
                "Settings without a PostgreSQL counterpart are ignored"
            );
        }

        let ceiling = params.maximum_pool_size.max(PHYSICAL_CEILING);
        let after_connect_session = session.clone();
        let before_acquire_tunables = tunables.clone();
        let pool_options = PgPoolOptions::new()
            .max_connections(ceiling)
            .min_connections(params.minimum_idle.min(params.maximum_pool_size))
            .acquire_timeout(params.connection_timeout)
            .idle_timeout(enabled(params.idle_timeout))
            .max_lifetime(enabled(params.max_lifetime))
            .test_before_acquire(false)
            .after_connect(move |conn, _meta| {
                let session = after_connect_session.clone();
                Box::pin(async move { session.run(conn).await })
            })
            .before_acquire(move |conn, meta| {
                let tunables = before_acquire_tunables.clone();
                Box::pin(async move { Ok::<_, sqlx::Error>(tunables.still_usable(conn, meta).await) })
            });

        let pool = if params.initialization_fail_fast {
            pool_options
                .connect_with(connect_options.clone())
                .await
                .map_err(Error::PoolConstruction)?
        } else {
            pool_options.connect_lazy_with(connect_options.clone())
        };

        let gate = LeaseGate::new(params.maximum_pool_size);
        let keeper = tokio::spawn(keep_idle(
            pool.clone(),
            gate.clone(),
            tunables.clone(),
            name.clone(),
        ));

        tracing::info!(
            pool = %name,
            maximum_pool_size = params.maximum_pool_size,
            minimum_idle = params.minimum_idle,
            eager = params.initialization_fail_fast,
            "PostgreSQL pool created"
        );

        Ok(Self {
            pool,
            gate,
            tunables,
            session,
            connect_options,
            connection_timeout: params.connection_timeout,
            leak_threshold: enabled(params.leak_detection_threshold),
            ceiling,
            keeper,
            name,
        })
    }

    /// The wrapped `sqlx` pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    fn unavailable(&self, source: sqlx::Error) -> Error {
        Error::ConnectionUnavailable {
            timeout: self.connection_timeout,
            source,
        }
    }

    fn lease(&self, conn: LeasedConnection, pass: Option<GatePass>) -> PgLease {
        PgLease {
            conn,
            _pass: pass,
            _leak_watch: self
                .leak_threshold
                .map(|threshold| LeakWatch::start(threshold, self.name.clone())),
        }
    }
}

#[async_trait]
impl ManagedPool for PgManagedPool {
    type Connection = PgLease;

    async fn acquire(&self) -> Result<PgLease> {
        let leased = tokio::time::timeout(self.connection_timeout, async {
            let pass = self.gate.enter().await.map_err(|_| sqlx::Error::PoolClosed)?;
            let conn = self.pool.acquire().await?;
            Ok::<_, sqlx::Error>((pass, conn))
        })
        .await;

        match leased {
            Ok(Ok((pass, conn))) => Ok(self.lease(LeasedConnection::Pooled(conn), Some(pass))),
            Ok(Err(e)) => Err(self.unavailable(e)),
            Err(_) => Err(self.unavailable(sqlx::Error::PoolTimedOut)),
        }
    }

    /// Opens a dedicated connection outside the pool with the pool's connect
    /// options and the given credentials.
    async fn acquire_with(&self, username: &str, password: &str) -> Result<PgLease> {
        if self.pool.is_closed() {
            return Err(self.unavailable(sqlx::Error::PoolClosed));
        }

        let options = self
            .connect_options
            .clone()
            .username(username)
            .password(password);

        let connected = tokio::time::timeout(self.connection_timeout, async {
            let mut conn = PgConnection::connect_with(&options).await?;
            self.session.run(&mut conn).await?;
            Ok::<_, sqlx::Error>(conn)
        })
        .await;

        match connected {
            Ok(Ok(conn)) => Ok(self.lease(LeasedConnection::Dedicated(conn), None)),
            Ok(Err(e)) => Err(self.unavailable(e)),
            Err(_) => Err(self.unavailable(sqlx::Error::PoolTimedOut)),
        }
    }

    fn set_maximum_pool_size(&self, size: u32) {
        if size > self.ceiling {
            tracing::warn!(
                pool = %self.name,
                size,
                ceiling = self.ceiling,
                "Maximum pool size above the physical ceiling of this pool"
            );
        }
        self.gate.resize(size);
    }

    async fn set_minimum_idle(&self, idle: u32) {
        self.tunables.minimum_idle.store(idle, Ordering::SeqCst);
        fill_idle(&self.pool, idle.min(self.gate.limit()), &self.name).await;
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        store_millis(&self.tunables.idle_timeout_ms, timeout);
    }

    fn set_max_lifetime(&self, lifetime: Duration) {
        store_millis(&self.tunables.max_lifetime_ms, lifetime);
    }

    fn set_validation_timeout(&self, timeout: Duration) {
        store_millis(&self.tunables.validation_timeout_ms, timeout);
    }

    fn size(&self) -> u32 {
        self.pool.size()
    }

    fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    fn begin_close(&self) {
        self.gate.close();
        self.keeper.abort();
    }

    async fn close(&self) {
        self.begin_close();
        self.pool.close().await;
        tracing::info!(pool = %self.name, "PostgreSQL pool closed");
    }

    fn is_closed(&self) -> bool {
        self.gate.is_closed() || self.pool.is_closed()
    }
}

impl Drop for PgManagedPool {
    fn drop(&mut self) {
        self.keeper.abort();
    }
}

/// Holds enough connections at once that returning them leaves `target` of
/// them idle in the pool.
async fn fill_idle(pool: &PgPool, target: u32, name: &str) {
    let target = target as usize;
    let mut held = Vec::with_capacity(target);
    while pool.num_idle() + held.len() < target {
        match pool.acquire().await {
            Ok(conn) => held.push(conn),
            Err(e) => {
                tracing::warn!(pool = %name, error = %e, "Could not open idle connection");
                break;
            }
        }
    }
}

/// Restores the live minimum idle count after the reaper or the
/// `before_acquire` hook closed connections. Runs until the pool closes.
async fn keep_idle(pool: PgPool, gate: Arc<LeaseGate>, tunables: Arc<Tunables>, name: Arc<str>) {
    loop {
        tokio::time::sleep(KEEPER_INTERVAL).await;
        if pool.is_closed() || gate.is_closed() {
            break;
        }

        let target = tunables.minimum_idle.load(Ordering::SeqCst).min(gate.limit());
        if (pool.num_idle() as u32) < target {
            tracing::debug!(pool = %name, target, idle = pool.num_idle(), "Topping up idle connections");
            fill_idle(&pool, target, &name).await;
        }
    }
}

/// A connection leased from a [`PgManagedPool`].
///
/// Dereferences to `PgConnection`, so it can be passed as `&mut *lease` to
/// any `sqlx` executor.
pub struct PgLease {
    conn: LeasedConnection,
    // Dropped after `conn`, so a waiter woken by the permit finds the
    // connection already back in the pool.
    _pass: Option<GatePass>,
    _leak_watch: Option<LeakWatch>,
}

enum LeasedConnection {
    Pooled(PoolConnection<Postgres>),
    Dedicated(PgConnection),
}

impl Deref for PgLease {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match &self.conn {
            LeasedConnection::Pooled(conn) => conn,
            LeasedConnection::Dedicated(conn) => conn,
        }
    }
}

impl DerefMut for PgLease {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            LeasedConnection::Pooled(conn) => conn,
            LeasedConnection::Dedicated(conn) => conn,
        }
    }
}

/// Warns once a lease has been held past the leak detection threshold,
/// while it is still held.
struct LeakWatch {
    leased_at: Instant,
    reported: Arc<AtomicBool>,
    timer: JoinHandle<()>,
    pool_name: Arc<str>,
}

impl LeakWatch {
    fn start(threshold: Duration, pool_name: Arc<str>) -> Self {
        let reported = Arc::new(AtomicBool::new(false));
        let timer = tokio::spawn({
            let reported = reported.clone();
            let pool_name = pool_name.clone();
            async move {
                tokio::time::sleep(threshold).await;
                reported.store(true, Ordering::SeqCst);
                tracing::warn!(
                    pool = %pool_name,
                    threshold_ms = threshold.as_millis() as u64,
                    "Connection leak detection triggered, connection is still leased"
                );
            }
        });

        Self {
            leased_at: Instant::now(),
            reported,
            timer,
            pool_name,
        }
    }

    fn reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }
}

impl Drop for LeakWatch {
    fn drop(&mut self) {
        self.timer.abort();
        if self.reported() {
            tracing::info!(
                pool = %self.pool_name,
                held_ms = self.leased_at.elapsed().as_millis() as u64,
                "Previously reported leaked connection returned"
            );
        }
    }
}

/// Bounds concurrent leases to a limit that can change while leases are out.
///
/// Shrinking below the number of outstanding leases records the difference
/// as debt; each returned lease pays one unit by forgetting its permit.
pub(crate) struct LeaseGate {
    permits: Arc<Semaphore>,
    limit: AtomicU32,
    debt: AtomicU32,
}

impl LeaseGate {
    pub(crate) fn new(limit: u32) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit: AtomicU32::new(limit),
            debt: AtomicU32::new(0),
        })
    }

    pub(crate) async fn enter(self: &Arc<Self>) -> std::result::Result<GatePass, AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        Ok(GatePass {
            permit: Some(permit),
            gate: self.clone(),
        })
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn resize(&self, limit: u32) {
        let previous = self.limit.swap(limit, Ordering::SeqCst);

        if limit > previous {
            let grow = limit - previous;
            let owed = self
                .debt
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| {
                    Some(debt.saturating_sub(grow))
                })
                .unwrap_or(0);
            let forgiven = owed.min(grow);
            self.permits.add_permits((grow - forgiven) as usize);
        } else if limit < previous {
            let shrink = previous - limit;
            let forgotten = self.permits.forget_permits(shrink as usize) as u32;
            self.debt.fetch_add(shrink - forgotten, Ordering::SeqCst);
        }
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    fn take_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| debt.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct GatePass {
    permit: Option<OwnedSemaphorePermit>,
    gate: Arc<LeaseGate>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.gate.take_debt() {
                permit.forget();
            }
        }
    }
}

struct Tunables {
    minimum_idle: AtomicU32,
    idle_timeout_ms: AtomicU64,
    max_lifetime_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    test_query: Option<String>,
}

impl Tunables {
    fn from_params(params: &PoolParameters) -> Self {
        Self {
            minimum_idle: AtomicU32::new(params.minimum_idle),
            idle_timeout_ms: AtomicU64::new(params.idle_timeout.as_millis() as u64),
            max_lifetime_ms: AtomicU64::new(params.max_lifetime.as_millis() as u64),
            validation_timeout_ms: AtomicU64::new(params.validation_timeout.as_millis() as u64),
            test_query: params.connection_test_query.clone(),
        }
    }

    /// Decides whether an idle connection may be handed out again.
    async fn still_usable(&self, conn: &mut PgConnection, meta: PoolConnectionMetadata) -> bool {
        if exceeded(meta.age, load_millis(&self.max_lifetime_ms)) {
            tracing::debug!(age_ms = meta.age.as_millis() as u64, "Retiring connection past max lifetime");
            return false;
        }
        if exceeded(meta.idle_for, load_millis(&self.idle_timeout_ms)) {
            tracing::debug!(idle_ms = meta.idle_for.as_millis() as u64, "Retiring connection past idle timeout");
            return false;
        }

        let validation = load_millis(&self.validation_timeout_ms);
        let check = async {
            match self.test_query.as_deref() {
                Some(query) => (&mut *conn).execute(query).await.map(|_| ()),
                None => conn.ping().await,
            }
        };

        match tokio::time::timeout(validation, check).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Connection failed validation");
                false
            }
            Err(_) => {
                tracing::debug!(timeout_ms = validation.as_millis() as u64, "Connection validation timed out");
                false
            }
        }
    }
}

/// Zero disables a limit.
fn enabled(limit: Duration) -> Option<Duration> {
    Some(limit).filter(|limit| !limit.is_zero())
}

fn exceeded(elapsed: Duration, limit: Duration) -> bool {
    !limit.is_zero() && elapsed >= limit
}

fn store_millis(slot: &AtomicU64, value: Duration) {
    slot.store(value.as_millis() as u64, Ordering::SeqCst);
}

fn load_millis(slot: &AtomicU64) -> Duration {
    Duration::from_millis(slot.load(Ordering::SeqCst))
}

/// Statements run on every new physical connection.
#[derive(Debug, Default)]
struct SessionSetup {
    statements: Vec<String>,
    isolated: bool,
}

impl SessionSetup {
    fn from_params(params: &PoolParameters) -> Result<Self> {
        let mut statements = Vec::new();

        if let Some(level) = params.transaction_isolation.as_deref() {
            statements.push(format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                isolation_level(level)?
            ));
        }
        if params.read_only {
            statements.push("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY".to_string());
        }
        if let Some(sql) = params.connection_init_sql.as_deref() {
            statements.push(sql.to_string());
        }

        Ok(Self {
            statements,
            isolated: params.isolate_internal_queries,
        })
    }

    async fn run(&self, conn: &mut PgConnection) -> std::result::Result<(), sqlx::Error> {
        if self.statements.is_empty() {
            return Ok(());
        }

        if self.isolated {
            let mut tx = conn.begin().await?;
            for statement in &self.statements {
                (&mut *tx).execute(statement.as_str()).await?;
            }
            tx.commit().await
        } else {
            for statement in &self.statements {
                (&mut *conn).execute(statement.as_str()).await?;
            }
            Ok(())
        }
    }
}

/// Accepts SQL (`READ COMMITTED`) and JDBC (`TRANSACTION_READ_COMMITTED`)
/// spellings.
fn isolation_level(raw: &str) -> Result<&'static str> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = upper
        .strip_prefix("TRANSACTION_")
        .unwrap_or(&upper)
        .replace('_', " ");

    match name.as_str() {
        "READ UNCOMMITTED" => Ok("READ UNCOMMITTED"),
        "READ COMMITTED" => Ok("READ COMMITTED"),
        "REPEATABLE READ" => Ok("REPEATABLE READ"),
        "SERIALIZABLE" => Ok("SERIALIZABLE"),
        _ => Err(Error::configuration(format!(
            "{}: unsupported isolation level '{}'",
            Key::TransactionIsolation,
            raw
        ))),
    }
}

fn check_driver(params: &PoolParameters) -> Result<()> {
    let named = [
        (Key::DriverClassName, params.driver_class_name.as_deref()),
        (Key::DataSourceClassName, params.data_source_class_name.as_deref()),
    ];

    for (key, value) in named {
        if let Some(name) = value {
            if !name.to_ascii_lowercase().contains("postgres") {
                return Err(Error::configuration(format!(
                    "{}: '{}' is not a PostgreSQL driver",
                    key, name
                )));
            }
        }
    }
    Ok(())
}

fn normalize_url(url: &str) -> &str {
    let url = url.trim();
    url.strip_prefix("jdbc:").unwrap_or(url)
}

fn connect_options(params: &PoolParameters) -> Result<PgConnectOptions> {
    let url = params
        .url
        .as_deref()
        .ok_or_else(|| Error::configuration(format!("{} is required", Key::JdbcUrl)))?;

    let mut options = PgConnectOptions::from_str(normalize_url(url))
        .map_err(|e| Error::configuration(format!("{}: {}", Key::JdbcUrl, e)))?;

    if let Some(username) = params.username.as_deref() {
        options = options.username(username);
    }
    if let Some(password) = params.password.as_ref() {
        options = options.password(password.expose_secret());
    }
    if let Some(catalog) = params.catalog.as_deref() {
        options = options.database(catalog);
    }
    if let Some(name) = params.pool_name.as_deref() {
        options = options.application_name(name);
    }

    Ok(options)
}
