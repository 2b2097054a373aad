//! Seam between the data source and a physical connection pool.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::params::PoolParameters;

/// A live physical pool.
///
/// Setters adjust tunables on the running pool and must be safe to call while
/// connections are checked out. `begin_close` stops new leases without
/// waiting. `close` does the same and then resolves once every outstanding
/// lease has been returned.
#[async_trait]
pub trait ManagedPool: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Leases a connection, waiting at most the pool's connection timeout.
    async fn acquire(&self) -> Result<Self::Connection>;

    /// Opens a connection with explicit credentials.
    async fn acquire_with(&self, _username: &str, _password: &str) -> Result<Self::Connection> {
        Err(Error::Unsupported("per-call credentials"))
    }

    fn set_maximum_pool_size(&self, size: u32);
    async fn set_minimum_idle(&self, idle: u32);
    fn set_idle_timeout(&self, timeout: Duration);
    fn set_max_lifetime(&self, lifetime: Duration);
    fn set_validation_timeout(&self, timeout: Duration);

    /// Total physical connections, leased or idle.
    fn size(&self) -> u32;
    fn num_idle(&self) -> usize;

    fn begin_close(&self);
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Builds physical pools from parameters.
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Pool: ManagedPool;

    async fn connect(&self, params: &PoolParameters) -> Result<Self::Pool>;
}
