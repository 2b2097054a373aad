//! Typed pool parameters read from the live configuration.

use std::sync::Arc;
use std::time::Duration;

use secrecy::Secret;
use serde::de::DeserializeOwned;

use crate::config::{LiveConfig, Snapshot};
use crate::error::{Error, Result};
use crate::keys::Key;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(600_000);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_millis(1_800_000);
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MINIMUM_IDLE: u32 = 1;
pub const DEFAULT_MAXIMUM_POOL_SIZE: u32 = 10;

/// Everything needed to construct a physical pool.
///
/// Built fresh on every read of the configuration and never mutated; a
/// change produces a new instance.
#[derive(Debug, Clone)]
pub struct PoolParameters {
    pub data_source_class_name: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
    pub auto_commit: bool,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub connection_test_query: Option<String>,
    pub minimum_idle: u32,
    pub maximum_pool_size: u32,
    pub pool_name: Option<String>,
    pub initialization_fail_fast: bool,
    pub isolate_internal_queries: bool,
    pub allow_pool_suspension: bool,
    pub read_only: bool,
    pub register_mbeans: bool,
    pub catalog: Option<String>,
    pub connection_init_sql: Option<String>,
    pub driver_class_name: Option<String>,
    pub transaction_isolation: Option<String>,
    pub validation_timeout: Duration,
    /// Zero disables leak detection.
    pub leak_detection_threshold: Duration,
}

impl Default for PoolParameters {
    fn default() -> Self {
        Self {
            data_source_class_name: None,
            url: None,
            username: None,
            password: None,
            auto_commit: false,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            connection_test_query: None,
            minimum_idle: DEFAULT_MINIMUM_IDLE,
            maximum_pool_size: DEFAULT_MAXIMUM_POOL_SIZE,
            pool_name: None,
            initialization_fail_fast: true,
            isolate_internal_queries: false,
            allow_pool_suspension: false,
            read_only: false,
            register_mbeans: false,
            catalog: None,
            connection_init_sql: None,
            driver_class_name: None,
            transaction_isolation: None,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            leak_detection_threshold: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPolicy {
    pub bypass: bool,
    pub baseline_version: Option<String>,
}

/// One hot-swappable tunable, read on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSetting {
    MaximumPoolSize(u32),
    MinimumIdle(u32),
    IdleTimeout(Duration),
    MaxLifetime(Duration),
    ValidationTimeout(Duration),
}

impl LiveSetting {
    pub fn key(&self) -> Key {
        match self {
            LiveSetting::MaximumPoolSize(_) => Key::MaximumPoolSize,
            LiveSetting::MinimumIdle(_) => Key::MinimumIdle,
            LiveSetting::IdleTimeout(_) => Key::IdleTimeout,
            LiveSetting::MaxLifetime(_) => Key::MaxLifetime,
            LiveSetting::ValidationTimeout(_) => Key::ValidationTimeout,
        }
    }
}

/// Reads [`PoolParameters`] and [`MigrationPolicy`] from a [`LiveConfig`],
/// optionally below a namespace (`db` reads `db.jdbcUrl`, `db.flyway.bypass`).
#[derive(Clone)]
pub struct ParameterReader {
    config: Arc<LiveConfig>,
    namespace: Option<String>,
}

impl ParameterReader {
    pub fn new(config: Arc<LiveConfig>, namespace: Option<&str>) -> Self {
        let namespace = namespace
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(|ns| ns.trim_end_matches('.').to_ascii_lowercase());

        Self { config, namespace }
    }

    pub fn config(&self) -> &Arc<LiveConfig> {
        &self.config
    }

    /// Absolute key for `key` under this reader's namespace.
    pub fn full_key(&self, key: Key) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, key.name()),
            None => key.name().to_string(),
        }
    }

    /// Maps an absolute key back to a known [`Key`], `None` for keys outside
    /// the namespace or not recognized.
    pub fn resolve(&self, full_key: &str) -> Option<Key> {
        let relative = match &self.namespace {
            Some(ns) => {
                let head = full_key.get(..ns.len())?;
                let rest = full_key.get(ns.len()..)?;
                if !head.eq_ignore_ascii_case(ns) {
                    return None;
                }
                rest.strip_prefix('.')?
            }
            None => full_key,
        };
        Key::from_name(relative)
    }

    pub fn read_parameters(&self) -> Result<PoolParameters> {
        self.fields(&self.config.snapshot()).parameters()
    }

    pub fn read_migration_policy(&self) -> Result<MigrationPolicy> {
        self.fields(&self.config.snapshot()).migration_policy()
    }

    /// Reads only `key`, so a malformed value elsewhere does not get in the
    /// way. `None` when `key` cannot be applied to a live pool.
    pub fn read_live_setting(&self, key: Key) -> Result<Option<LiveSetting>> {
        self.fields(&self.config.snapshot()).live_setting(key)
    }

    /// Reads both records from the same snapshot.
    pub fn read(&self) -> Result<(PoolParameters, MigrationPolicy)> {
        let snapshot = self.config.snapshot();
        let fields = self.fields(&snapshot);
        Ok((fields.parameters()?, fields.migration_policy()?))
    }

    fn fields<'a>(&'a self, snapshot: &'a Snapshot) -> Fields<'a> {
        Fields {
            reader: self,
            snapshot,
        }
    }
}

struct Fields<'a> {
    reader: &'a ParameterReader,
    snapshot: &'a Snapshot,
}

impl Fields<'_> {
    fn parameters(&self) -> Result<PoolParameters> {
        let defaults = PoolParameters::default();

        Ok(PoolParameters {
            data_source_class_name: self.string(Key::DataSourceClassName)?,
            url: self.string(Key::JdbcUrl)?,
            username: self.string(Key::Username)?,
            password: self.string(Key::Password)?.map(Secret::new),
            auto_commit: self.flag(Key::AutoCommit, defaults.auto_commit)?,
            connection_timeout: self.millis(Key::ConnectionTimeout, defaults.connection_timeout)?,
            idle_timeout: self.millis(Key::IdleTimeout, defaults.idle_timeout)?,
            max_lifetime: self.millis(Key::MaxLifetime, defaults.max_lifetime)?,
            connection_test_query: self.string(Key::ConnectionTestQuery)?,
            minimum_idle: self.count(Key::MinimumIdle, defaults.minimum_idle)?,
            maximum_pool_size: self.count(Key::MaximumPoolSize, defaults.maximum_pool_size)?,
            pool_name: self.string(Key::PoolName)?,
            initialization_fail_fast: self
                .flag(Key::InitializationFailFast, defaults.initialization_fail_fast)?,
            isolate_internal_queries: self
                .flag(Key::IsolateInternalQueries, defaults.isolate_internal_queries)?,
            allow_pool_suspension: self
                .flag(Key::AllowPoolSuspension, defaults.allow_pool_suspension)?,
            read_only: self.flag(Key::ReadOnly, defaults.read_only)?,
            register_mbeans: self.flag(Key::RegisterMbeans, defaults.register_mbeans)?,
            catalog: self.string(Key::Catalog)?,
            connection_init_sql: self.string(Key::ConnectionInitSql)?,
            driver_class_name: self.string(Key::DriverClassName)?,
            transaction_isolation: self.string(Key::TransactionIsolation)?,
            validation_timeout: self.millis(Key::ValidationTimeout, defaults.validation_timeout)?,
            leak_detection_threshold: self
                .millis(Key::LeakDetectionThreshold, defaults.leak_detection_threshold)?,
        })
    }

    fn live_setting(&self, key: Key) -> Result<Option<LiveSetting>> {
        let defaults = PoolParameters::default();

        let setting = match key {
            Key::MaximumPoolSize => {
                LiveSetting::MaximumPoolSize(self.count(key, defaults.maximum_pool_size)?)
            }
            Key::MinimumIdle => LiveSetting::MinimumIdle(self.count(key, defaults.minimum_idle)?),
            Key::IdleTimeout => LiveSetting::IdleTimeout(self.millis(key, defaults.idle_timeout)?),
            Key::MaxLifetime => LiveSetting::MaxLifetime(self.millis(key, defaults.max_lifetime)?),
            Key::ValidationTimeout => {
                LiveSetting::ValidationTimeout(self.millis(key, defaults.validation_timeout)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(setting))
    }

    fn migration_policy(&self) -> Result<MigrationPolicy> {
        Ok(MigrationPolicy {
            bypass: self.flag(Key::MigrationBypass, false)?,
            baseline_version: self.string(Key::MigrationBaselineVersion)?,
        })
    }

    fn get<T: DeserializeOwned>(&self, key: Key) -> Result<Option<T>> {
        let full_key = self.reader.full_key(key);
        self.snapshot
            .get(&full_key)
            .map_err(|e| Error::configuration(format!("{}: {}", full_key, e)))
    }

    // Blank strings count as unset.
    fn string(&self, key: Key) -> Result<Option<String>> {
        Ok(self
            .get::<String>(key)?
            .filter(|value| !value.trim().is_empty()))
    }

    fn flag(&self, key: Key, default: bool) -> Result<bool> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    fn count(&self, key: Key, default: u32) -> Result<u32> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    fn millis(&self, key: Key, default: Duration) -> Result<Duration> {
        Ok(self
            .get::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }
}
