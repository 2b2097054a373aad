// Library exports for embedding and testing

pub mod config;
pub mod datasource;
pub mod db;
pub mod error;
pub mod keys;
pub mod params;
pub mod reconfigure;

#[cfg(test)]
mod testing;

pub use config::{ConfigChange, LiveConfig};
pub use datasource::{DataSource, PgDataSource, PoolStatus};
pub use error::{Error, Result};
pub use keys::{Key, ReloadKind};
pub use params::{MigrationPolicy, ParameterReader, PoolParameters};
pub use reconfigure::{Reconfiguration, Reconfigurator};
