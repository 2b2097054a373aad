/// How a change to a key reaches the running pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// Applied to the live pool through one of its setters.
    HotSwap,
    /// Requires building a new pool and retiring the current one.
    Restart,
}

/// Every configuration key the data source understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    DataSourceClassName,
    JdbcUrl,
    Username,
    Password,
    AutoCommit,
    ConnectionTimeout,
    IdleTimeout,
    MaxLifetime,
    ConnectionTestQuery,
    MinimumIdle,
    MaximumPoolSize,
    PoolName,
    InitializationFailFast,
    IsolateInternalQueries,
    AllowPoolSuspension,
    ReadOnly,
    RegisterMbeans,
    Catalog,
    ConnectionInitSql,
    DriverClassName,
    TransactionIsolation,
    ValidationTimeout,
    LeakDetectionThreshold,
    MigrationBypass,
    MigrationBaselineVersion,
}

impl Key {
    pub const ALL: [Key; 25] = [
        Key::DataSourceClassName,
        Key::JdbcUrl,
        Key::Username,
        Key::Password,
        Key::AutoCommit,
        Key::ConnectionTimeout,
        Key::IdleTimeout,
        Key::MaxLifetime,
        Key::ConnectionTestQuery,
        Key::MinimumIdle,
        Key::MaximumPoolSize,
        Key::PoolName,
        Key::InitializationFailFast,
        Key::IsolateInternalQueries,
        Key::AllowPoolSuspension,
        Key::ReadOnly,
        Key::RegisterMbeans,
        Key::Catalog,
        Key::ConnectionInitSql,
        Key::DriverClassName,
        Key::TransactionIsolation,
        Key::ValidationTimeout,
        Key::LeakDetectionThreshold,
        Key::MigrationBypass,
        Key::MigrationBaselineVersion,
    ];

    /// Key name relative to the configured namespace.
    pub const fn name(self) -> &'static str {
        match self {
            Key::DataSourceClassName => "dataSourceClassName",
            Key::JdbcUrl => "jdbcUrl",
            Key::Username => "username",
            Key::Password => "password",
            Key::AutoCommit => "autoCommit",
            Key::ConnectionTimeout => "connectionTimeout",
            Key::IdleTimeout => "idleTimeout",
            Key::MaxLifetime => "maxLifetime",
            Key::ConnectionTestQuery => "connectionTestQuery",
            Key::MinimumIdle => "minimumIdle",
            Key::MaximumPoolSize => "maximumPoolSize",
            Key::PoolName => "poolName",
            Key::InitializationFailFast => "initializationFailFast",
            Key::IsolateInternalQueries => "isolateInternalQueries",
            Key::AllowPoolSuspension => "allowPoolSuspension",
            Key::ReadOnly => "readOnly",
            Key::RegisterMbeans => "registerMbeans",
            Key::Catalog => "catalog",
            Key::ConnectionInitSql => "connectionInitSql",
            Key::DriverClassName => "driverClassName",
            Key::TransactionIsolation => "transactionIsolation",
            Key::ValidationTimeout => "validationTimeout",
            Key::LeakDetectionThreshold => "leakDetectionThreshold",
            Key::MigrationBypass => "flyway.bypass",
            Key::MigrationBaselineVersion => "flyway.baselineVersion",
        }
    }

    /// Case-insensitive lookup by relative name.
    pub fn from_name(name: &str) -> Option<Key> {
        Key::ALL
            .into_iter()
            .find(|key| key.name().eq_ignore_ascii_case(name))
    }

    pub const fn reload_kind(self) -> ReloadKind {
        match self {
            Key::MaximumPoolSize
            | Key::MinimumIdle
            | Key::IdleTimeout
            | Key::MaxLifetime
            | Key::ValidationTimeout => ReloadKind::HotSwap,
            _ => ReloadKind::Restart,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
