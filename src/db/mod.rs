pub mod factory;
pub mod migrate;
pub mod pool;
pub mod postgres;

pub use factory::{ActivePool, PoolFactory};
pub use migrate::{migrate, MigrationError, Migrator, SqlxMigrator};
pub use pool::{ManagedPool, PoolBackend};
pub use postgres::{PgBackend, PgLease, PgManagedPool};
