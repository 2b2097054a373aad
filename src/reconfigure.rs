//! Reacts to configuration changes by tuning or replacing the current pool.
//!
//! The current pool is a single atomically swappable handle. Readers load it
//! without locking; every mutation goes through the swap lock, so at most one
//! rebuild runs at a time and a new pool is always published before the old
//! one is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

use crate::config::ConfigChange;
use crate::db::factory::{ActivePool, PoolFactory};
use crate::db::migrate::Migrator;
use crate::db::pool::PoolBackend;
use crate::error::Result;
use crate::keys::{Key, ReloadKind};
use crate::params::ParameterReader;

/// What handling one configuration change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfiguration {
    /// Key not ours, or no pool to reconfigure.
    Ignored,
    /// A tunable was applied to the current pool.
    Tuned { key: Key },
    /// A new pool was built and published.
    Rebuilt { generation: u64 },
    /// A swap that read the configuration after this change already ran.
    Coalesced,
}

struct SwapState {
    /// Highest restart ticket covered by a completed or running rebuild.
    covered: u64,
    next_generation: u64,
}

pub struct Reconfigurator<B: PoolBackend, M> {
    factory: PoolFactory<B, M>,
    reader: ParameterReader,
    current: ArcSwapOption<ActivePool<B::Pool>>,
    swap: Mutex<SwapState>,
    tickets: AtomicU64,
}

impl<B, M> Reconfigurator<B, M>
where
    B: PoolBackend,
    M: Migrator<B::Pool>,
{
    pub fn new(factory: PoolFactory<B, M>, reader: ParameterReader) -> Self {
        Self {
            factory,
            reader,
            current: ArcSwapOption::empty(),
            swap: Mutex::new(SwapState {
                covered: 0,
                next_generation: 0,
            }),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn reader(&self) -> &ParameterReader {
        &self.reader
    }

    /// The pool new connection requests should use.
    pub fn current(&self) -> Option<Arc<ActivePool<B::Pool>>> {
        self.current.load_full()
    }

    /// Builds and publishes the first pool. Does nothing if a pool is
    /// already published.
    pub async fn initialize(&self) -> Result<u64> {
        let mut swap = self.swap.lock().await;
        if let Some(active) = self.current.load_full() {
            return Ok(active.generation());
        }

        swap.covered = self.tickets.load(Ordering::SeqCst);
        let (parameters, policy) = self.reader.read()?;
        let generation = swap.next_generation;
        let active = self.factory.build(parameters, policy, generation).await?;

        swap.next_generation += 1;
        self.current.store(Some(Arc::new(active)));
        tracing::info!(generation, "Data source pool published");
        Ok(generation)
    }

    /// Unpublishes the current pool and closes it.
    pub async fn shutdown(&self) {
        let retired = {
            let _swap = self.swap.lock().await;
            self.current.swap(None)
        };

        if let Some(retired) = retired {
            if let Err(e) = retired.retire().await {
                tracing::error!(error = %e, "Pool drain task failed");
            }
        }
    }

    pub async fn on_change(&self, change: &ConfigChange) -> Result<Reconfiguration> {
        let Some(key) = self.reader.resolve(&change.key) else {
            tracing::trace!(key = %change.key, "Ignoring unrelated configuration key");
            return Ok(Reconfiguration::Ignored);
        };

        match key.reload_kind() {
            ReloadKind::HotSwap => self.hot_swap(key).await,
            ReloadKind::Restart => {
                tracing::info!(%key, "Data source configuration changed, creating new pool");
                self.rebuild().await
            }
        }
    }

    async fn hot_swap(&self, key: Key) -> Result<Reconfiguration> {
        let _swap = self.swap.lock().await;
        let Some(active) = self.current.load_full() else {
            return Ok(Reconfiguration::Ignored);
        };

        let setting = match self.reader.read_live_setting(key) {
            Ok(Some(setting)) => setting,
            Ok(None) => return Ok(Reconfiguration::Ignored),
            Err(e) => {
                tracing::error!(%key, error = %e, "Could not read changed pool setting");
                return Err(e);
            }
        };

        active.apply_live(setting).await;
        tracing::info!(
            %key,
            generation = active.generation(),
            "Pool setting applied live"
        );
        Ok(Reconfiguration::Tuned { key })
    }

    /// Builds a replacement pool from the current configuration and swaps it
    /// in. On failure the current pool keeps serving.
    pub async fn rebuild(&self) -> Result<Reconfiguration> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;

        let mut swap = self.swap.lock().await;
        if swap.covered >= ticket {
            tracing::debug!(ticket, "Rebuild already covered by a later swap");
            return Ok(Reconfiguration::Coalesced);
        }
        if self.current.load().is_none() {
            return Ok(Reconfiguration::Ignored);
        }

        // Everything issued so far is covered by the snapshot read below.
        swap.covered = self.tickets.load(Ordering::SeqCst);
        let generation = swap.next_generation;

        let built = match self.reader.read() {
            Ok((parameters, policy)) => self.factory.build(parameters, policy, generation).await,
            Err(e) => Err(e),
        };

        let active = match built {
            Ok(active) => Arc::new(active),
            Err(e) => {
                tracing::error!(
                    generation,
                    error = %e,
                    "Error initializing new pool, keeping the current one"
                );
                return Err(e);
            }
        };

        swap.next_generation += 1;
        let retired = self.current.swap(Some(active));
        drop(swap);
        tracing::info!(generation, "Data source pool published");

        // Drains in the background.
        if let Some(retired) = retired {
            drop(retired.retire());
        }
        Ok(Reconfiguration::Rebuilt { generation })
    }
}
