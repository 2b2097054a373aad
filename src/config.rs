//! Live configuration source.
//!
//! Wraps `config::Config` snapshots so they can be replaced at runtime. Every
//! replacement is diffed against the previous snapshot and each key whose
//! value was added, removed or changed is announced on a broadcast channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{Source, Value};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Notification that a single configuration key changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    /// Full dotted key, lowercase (e.g. `db.jdbcurl`).
    pub key: String,
}

/// Flattened, immutable view of a configuration at one instant.
///
/// Keys are dotted paths, lowercased, so that lookups work the same for
/// file sources (which keep case) and environment sources (which don't).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn from_config(config: &config::Config) -> Result<Self, config::ConfigError> {
        let mut values = BTreeMap::new();
        for (key, value) in config.collect()? {
            flatten(&mut values, &key, value);
        }
        Ok(Self { values })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    /// Reads `key` coerced to `T`, `None` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, config::ConfigError> {
        match self.values.get(&key.to_ascii_lowercase()) {
            Some(value) => value.clone().try_deserialize().map(Some),
            None => Ok(None),
        }
    }

    fn insert(&mut self, key: &str, value: Value) {
        flatten(&mut self.values, key, value);
    }

    fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        let nested = format!("{}.", key);
        self.values
            .retain(|existing, _| existing != &key && !existing.starts_with(&nested));
    }

    /// Keys whose rendered value differs between `self` and `next`.
    fn changed_keys(&self, next: &Snapshot) -> Vec<String> {
        let keys: BTreeSet<&String> = self.values.keys().chain(next.values.keys()).collect();
        keys.into_iter()
            .filter(|key| {
                let before = self.values.get(*key).map(ToString::to_string);
                let after = next.values.get(*key).map(ToString::to_string);
                before != after
            })
            .cloned()
            .collect()
    }
}

fn flatten(into: &mut BTreeMap<String, Value>, prefix: &str, value: Value) {
    match value.clone().into_table() {
        Ok(table) => {
            for (key, nested) in table {
                flatten(into, &format!("{}.{}", prefix, key), nested);
            }
        }
        Err(_) => {
            into.insert(prefix.to_ascii_lowercase(), value);
        }
    }
}

/// A configuration that can be swapped while readers hold older snapshots.
pub struct LiveConfig {
    current: ArcSwap<Snapshot>,
    changes: broadcast::Sender<ConfigChange>,
    update: Mutex<()>,
}

impl LiveConfig {
    pub fn new(config: config::Config) -> Result<Self, config::ConfigError> {
        Ok(Self::from_snapshot(Snapshot::from_config(&config)?))
    }

    pub fn empty() -> Self {
        Self::from_snapshot(Snapshot::default())
    }

    /// Loads from the process environment (and `.env` if present), using `__`
    /// as the nesting separator: `DB__JDBCURL` becomes `db.jdbcurl`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();
        Self::new(env_config()?)
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            current: ArcSwap::from_pointee(snapshot),
            changes,
            update: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// Replaces the whole configuration and returns the keys that changed.
    pub fn apply(&self, config: config::Config) -> Result<Vec<String>, config::ConfigError> {
        let next = Snapshot::from_config(&config)?;
        let _guard = self.update.lock();
        Ok(self.publish(next))
    }

    /// Re-reads the environment; values in `.env` replace ones loaded earlier.
    pub fn reload_from_env(&self) -> Result<Vec<String>, config::ConfigError> {
        let _ = dotenvy::dotenv_override();
        self.apply(env_config()?)
    }

    /// Overrides a single key.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Vec<String> {
        let _guard = self.update.lock();
        let mut next = Snapshot::clone(&self.current.load());
        next.remove(key);
        next.insert(key, value.into());
        self.publish(next)
    }

    /// Removes a key so readers fall back to its default.
    pub fn unset(&self, key: &str) -> Vec<String> {
        let _guard = self.update.lock();
        let mut next = Snapshot::clone(&self.current.load());
        next.remove(key);
        self.publish(next)
    }

    // Caller holds `update`.
    fn publish(&self, next: Snapshot) -> Vec<String> {
        let changed = self.current.load().changed_keys(&next);
        self.current.store(Arc::new(next));

        for key in &changed {
            tracing::debug!(key = %key, "Configuration key changed");
            // No subscribers is fine.
            let _ = self.changes.send(ConfigChange { key: key.clone() });
        }

        changed
    }
}

fn env_config() -> Result<config::Config, config::ConfigError> {
    config::Config::builder()
        .add_source(config::Environment::default().separator("__"))
        .build()
}
